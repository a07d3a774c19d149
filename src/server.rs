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

//! Listener, acceptor, and the bounded-concurrency connection pool.

use crate::{
    conn::ConnectionWorker,
    config::ServerConfig,
    error::{FcgiError, FcgiResult},
    input::InputSide,
    output::OutputSide,
};
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc};
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpSocket, TcpStream,
};
use tracing::{debug, info};

/// A bound FastCGI responder: a validated [`ServerConfig`] plus the
/// handler invoked for every request.
///
/// Generic over the handler rather than boxed behind a trait object —
/// `handler` is a plain async function value, per the single-method
/// callback contract this crate exposes.
pub struct Server<H> {
    config: ServerConfig,
    handler: Arc<H>,
}

impl<H> Server<H>
where
    H: AsyncFn(&mut InputSide<OwnedReadHalf>, &mut OutputSide<OwnedWriteHalf>) + Send + Sync + 'static,
{
    /// Validates `config` and pairs it with `handler`. The handler is
    /// mandatory here, by construction — there's no way to obtain a
    /// `Server` without one.
    pub fn new(config: ServerConfig, handler: H) -> FcgiResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            handler: Arc::new(handler),
        })
    }

    /// Binds the configured address and serves connections forever. Only
    /// returns on a fatal startup or listener error.
    pub async fn run(self) -> FcgiResult<Infallible> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|err| FcgiError::InvalidConfig(format!("invalid bind address: {err}")))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let backlog = (self.config.max_concurrent as u32).saturating_mul(2).max(1);
        let listener = socket.listen(backlog)?;

        info!(
            %addr,
            max_concurrent = self.config.max_concurrent,
            "fastcgi responder listening"
        );

        // Pre-allocated rotation pool: `max_concurrent` in-flight connection
        // futures, polled together on this one task. A slot frees the moment
        // its future resolves; the loop below immediately refills it with a
        // freshly accepted connection. No task is ever spawned per
        // connection — everything interleaves cooperatively here.
        let mut pending = FuturesUnordered::new();
        for _ in 0..self.config.max_concurrent {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "accepted connection");
            pending.push(self.dispatch(stream));
        }

        loop {
            pending.next().await;
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "accepted connection");
            pending.push(self.dispatch(stream));
        }
    }

    fn dispatch(&self, stream: TcpStream) -> impl Future<Output = ()> + Send + 'static {
        ConnectionWorker::new(self.config.clone(), Arc::clone(&self.handler)).run(stream)
    }
}
