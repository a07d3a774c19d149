// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-connection loop: construct `InputSide`/`OutputSide` once, run the
//! user handler for as many requests as the peer keeps the connection
//! alive for, and close cleanly on any error.

use crate::{config::ServerConfig, error::FcgiError, input::InputSide, output::OutputSide};
use futures_util::FutureExt;
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpStream,
};
use tracing::{debug, warn};

/// Drives one accepted TCP connection through `BEGIN_REQUEST -> ... ->
/// END_REQUEST`, looping while the peer asks to keep the connection alive.
pub struct ConnectionWorker<H> {
    config: ServerConfig,
    handler: Arc<H>,
}

impl<H> ConnectionWorker<H>
where
    H: AsyncFn(&mut InputSide<OwnedReadHalf>, &mut OutputSide<OwnedWriteHalf>),
{
    /// Creates a worker for one connection, sharing `handler` with every
    /// other worker via the `Arc`.
    pub fn new(config: ServerConfig, handler: Arc<H>) -> Self {
        Self { config, handler }
    }

    /// Consumes the connection, serving requests until the peer closes it,
    /// asks not to keep it alive, or a protocol/IO error occurs.
    ///
    /// Every individual record read/write is bounded by
    /// `self.config.connection_timeout` inside `InputSide`/`OutputSide`
    /// themselves (spec §5: the connection timeout is the only timer), not
    /// just the two calls this loop makes directly — a peer that stalls
    /// mid-`STDIN` or stops reading `STDOUT` while the handler is running
    /// still trips a deadline instead of holding the worker's pool slot
    /// forever.
    pub async fn run(self, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let mut input = InputSide::new(read_half, self.config.max_header_size, self.config.connection_timeout);
        let mut output = OutputSide::new(write_half, self.config.connection_timeout);

        loop {
            match input.initialize().await {
                Ok(()) => {}
                Err(FcgiError::UnknownRole(id)) => {
                    output.reset(id);
                    if let Err(err) = output.reject_unknown_role().await {
                        warn!(error = %err, "failed to reject unsupported role");
                    }
                    return;
                }
                Err(FcgiError::PeerClosed) => {
                    debug!("peer closed connection");
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "failed to initialize request");
                    return;
                }
            }

            output.reset(input.request_id());
            let keep_connection = input.keep_connection();

            let outcome = AssertUnwindSafe((self.handler)(&mut input, &mut output))
                .catch_unwind()
                .await;

            let handler_panicked = outcome.is_err();
            if let Err(payload) = outcome {
                let message = panic_message(&*payload);
                warn!(error = %FcgiError::HandlerFailed(message), "handler panicked");
            }

            if !output.ended() {
                if !output.headers_sent() {
                    output.set_status(500);
                }
                if let Err(err) = output.end(&mut input).await {
                    warn!(error = %err, "failed to finalize response after handler returned");
                    return;
                }
            }

            if handler_panicked || !keep_connection {
                return;
            }

            input.reset();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{self, Role};
    use tokio::net::TcpListener;

    async fn connect_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (client, (server, _)) = tokio::join!(connect, accept);
        (client.unwrap(), server)
    }

    async fn write_minimal_request(mut writer: impl tokio::io::AsyncWrite + Unpin + Send, id: u16, keep_alive: bool) {
        record::write_record(
            &mut writer,
            record::RequestType::BeginRequest,
            id,
            &record::begin_request_body(Role::Responder, keep_alive),
        )
        .await
        .unwrap();
        record::write_record(&mut writer, record::RequestType::Params, id, &[])
            .await
            .unwrap();
        record::write_record(&mut writer, record::RequestType::Stdin, id, &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn handler_is_invoked_and_end_is_forced_when_missing() {
        let (mut client, server) = connect_pair().await;
        write_minimal_request(&mut client, 1, false).await;

        let config = ServerConfig::default();
        let handler = Arc::new(
            |_input: &mut InputSide<OwnedReadHalf>, _output: &mut OutputSide<OwnedWriteHalf>| async move {
                // Deliberately does not call `end()`.
            },
        );
        let worker = ConnectionWorker::new(config, handler);
        worker.run(server).await;

        let mut buf = Vec::new();
        use tokio::io::AsyncReadExt;
        client.read_to_end(&mut buf).await.unwrap();
        assert!(!buf.is_empty(), "worker must have sent an implicit response");
    }

    #[tokio::test]
    async fn unknown_role_closes_without_invoking_handler() {
        let (mut client, server) = connect_pair().await;
        record::write_record(
            &mut client,
            record::RequestType::BeginRequest,
            3,
            &record::begin_request_body(Role::Filter, false),
        )
        .await
        .unwrap();

        let invoked = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let invoked_clone = Arc::clone(&invoked);
        let handler = Arc::new(move |_input: &mut InputSide<OwnedReadHalf>, _output: &mut OutputSide<OwnedWriteHalf>| {
            let invoked = Arc::clone(&invoked_clone);
            async move {
                invoked.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        });
        let worker = ConnectionWorker::new(ServerConfig::default(), handler);
        worker.run(server).await;

        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));

        let mut decoder = record::RecordDecoder::new();
        let record = decoder.decode_next(&mut client).await.unwrap();
        assert_eq!(record.r#type as u8, record::RequestType::EndRequest as u8);
        let (_, protocol_status) = record.end_request_status();
        assert_eq!(protocol_status, 3); // UNKNOWN_ROLE
    }

    #[tokio::test]
    async fn keep_alive_serves_a_second_request_on_the_same_connection() {
        let (mut client, server) = connect_pair().await;
        write_minimal_request(&mut client, 1, true).await;

        let handler = Arc::new(
            |input: &mut InputSide<OwnedReadHalf>, output: &mut OutputSide<OwnedWriteHalf>| async move {
                output.write(input, "a").await.unwrap();
            },
        );

        let worker_task = tokio::spawn(async move {
            ConnectionWorker::new(ServerConfig::default(), handler).run(server).await;
        });

        let mut decoder = record::RecordDecoder::new();
        // Drain the first response's records up to and including END_REQUEST.
        loop {
            let record = decoder.decode_next(&mut client).await.unwrap();
            if record.r#type as u8 == record::RequestType::EndRequest as u8 {
                break;
            }
        }

        write_minimal_request(&mut client, 2, false).await;
        loop {
            let record = decoder.decode_next(&mut client).await.unwrap();
            if record.r#type as u8 == record::RequestType::EndRequest as u8 {
                break;
            }
        }

        drop(client);
        worker_task.await.unwrap();
    }
}
