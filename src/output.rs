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

//! Per-request encoder: builds the HTTP status/header prefix, fragments
//! the response body into `STDOUT` records, and finalizes with
//! `END_REQUEST`.

use crate::{
    byte_queue::ByteQueue,
    error::{FcgiError, FcgiResult},
    input::InputSide,
    record::{self, ProtocolStatus, MAX_CONTENT_LENGTH},
    status::{DefaultStatusText, StatusText},
};
use bytes::Bytes;
use chrono::Utc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

const SERVER_BANNER: &str = concat!("fastcgi-responder/", env!("CARGO_PKG_VERSION"));

/// The encoding half of one FastCGI request.
pub struct OutputSide<W, T = DefaultStatusText> {
    writer: W,
    status_text: T,
    timeout: Duration,
    request_id: u16,
    status_code: u16,
    headers: Vec<(String, String)>,
    buffer: ByteQueue,
    started: bool,
    ended: bool,
}

impl<W: AsyncWrite + Unpin> OutputSide<W, DefaultStatusText> {
    /// Creates an `OutputSide` over `writer`, with the default status-text
    /// table and the default header set (Content-Type, Cache-Control,
    /// Date, Server). `timeout` bounds every individual record write, per
    /// the connection-level deadline in `ServerConfig::connection_timeout`.
    pub fn new(writer: W, timeout: Duration) -> Self {
        Self::with_status_text(writer, DefaultStatusText, timeout)
    }
}

impl<W: AsyncWrite + Unpin, T: StatusText> OutputSide<W, T> {
    /// Creates an `OutputSide` with a custom [`StatusText`] implementor,
    /// for embedders with a fuller reason-phrase table than
    /// [`DefaultStatusText`].
    pub fn with_status_text(writer: W, status_text: T, timeout: Duration) -> Self {
        let mut side = Self {
            writer,
            status_text,
            timeout,
            request_id: 0,
            status_code: 200,
            headers: Vec::new(),
            buffer: ByteQueue::new(),
            started: false,
            ended: false,
        };
        side.reset(0);
        side
    }

    /// Resets per-request state for `request_id`, reseeding the default
    /// header set (including a freshly-stamped `Date`). Used between
    /// keep-alive requests on the same connection.
    pub fn reset(&mut self, request_id: u16) {
        self.request_id = request_id;
        self.status_code = 200;
        self.buffer.reset();
        self.started = false;
        self.ended = false;
        self.headers = vec![
            ("Content-Type".to_string(), "text/html; charset=utf-8".to_string()),
            ("Cache-Control".to_string(), "no-cache".to_string()),
            ("Date".to_string(), rfc1123_now()),
            ("Server".to_string(), SERVER_BANNER.to_string()),
        ];
    }

    /// Sets the HTTP status code. A no-op once headers have already been
    /// sent.
    pub fn set_status(&mut self, code: u16) {
        if !self.started {
            self.status_code = code;
        }
    }

    /// Sets (or overwrites) a response header. Last call wins. A no-op
    /// once headers have already been sent.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.started {
            return;
        }
        let name = name.into();
        let value = value.into();
        if let Some(existing) = self.headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            existing.1 = value;
        } else {
            self.headers.push((name, value));
        }
    }

    /// Whether the header prefix has already been emitted.
    pub fn headers_sent(&self) -> bool {
        self.started
    }

    /// Whether `end()` has already run for this request.
    pub fn ended(&self) -> bool {
        self.ended
    }

    /// Appends UTF-8 text to the response body, flushing the header prefix
    /// first on the first call.
    pub async fn write<R: AsyncRead + Unpin>(
        &mut self, input: &mut InputSide<R>, text: &str,
    ) -> FcgiResult<()> {
        self.write_binary(input, text.as_bytes()).await
    }

    /// Appends raw bytes to the response body, flushing the header prefix
    /// first on the first call, and emitting full 65,535-byte `STDOUT`
    /// records as the buffer fills.
    pub async fn write_binary<R: AsyncRead + Unpin>(
        &mut self, input: &mut InputSide<R>, bytes: &[u8],
    ) -> FcgiResult<()> {
        self.ensure_started(input).await?;
        self.buffer.append(Bytes::copy_from_slice(bytes));
        self.flush_full_records().await
    }

    /// Flushes any remaining buffered bytes, sends the `STDOUT`
    /// end-of-stream marker, and emits `END_REQUEST`.
    pub async fn end<R: AsyncRead + Unpin>(&mut self, input: &mut InputSide<R>) -> FcgiResult<()> {
        if self.ended {
            return Ok(());
        }
        self.ensure_started(input).await?;
        loop {
            let consumed = self.emit_stdout_timed().await?;
            if consumed == 0 {
                break;
            }
        }
        self.emit_end_request_timed(ProtocolStatus::RequestComplete).await?;
        self.ended = true;
        debug!(id = self.request_id, "request ended");
        Ok(())
    }

    /// On first call: drains any unread stdin (back-pressure for peers
    /// that won't read a response until they've finished sending the
    /// request) and buffers the `HTTP/1.1 ...` status/header prefix ahead
    /// of the body bytes about to be appended.
    async fn ensure_started<R: AsyncRead + Unpin>(&mut self, input: &mut InputSide<R>) -> FcgiResult<()> {
        if self.started {
            return Ok(());
        }
        if !input.stdin_complete() {
            input.read_all_and_discard().await?;
        }

        let mut prefix = String::new();
        let reason = self.status_text.reason_phrase(self.status_code);
        match reason {
            Some(reason) => prefix.push_str(&format!("HTTP/1.1 {} {}\r\n", self.status_code, reason)),
            None => prefix.push_str(&format!("HTTP/1.1 {}\r\n", self.status_code)),
        }
        for (name, value) in &self.headers {
            prefix.push_str(&format!("{name}: {value}\r\n"));
        }
        prefix.push_str("\r\n");

        self.buffer.append(Bytes::from(prefix.into_bytes()));
        self.started = true;
        debug!(id = self.request_id, status = self.status_code, "headers sent");
        self.flush_full_records().await
    }

    async fn flush_full_records(&mut self) -> FcgiResult<()> {
        while self.buffer.length() >= MAX_CONTENT_LENGTH {
            self.emit_stdout_timed().await?;
        }
        Ok(())
    }

    /// Drains up to 65,535 bytes out of `self.buffer` into one `STDOUT`
    /// record, bounded by the connection timeout so a peer that stops
    /// reading `STDOUT` can't hang this worker forever.
    async fn emit_stdout_timed(&mut self) -> FcgiResult<usize> {
        tokio::time::timeout(
            self.timeout,
            record::emit_stdout(&mut self.writer, self.request_id, &mut self.buffer),
        )
        .await
        .map_err(|_| FcgiError::IoTimeout(self.timeout))?
    }

    async fn emit_end_request_timed(&mut self, protocol_status: ProtocolStatus) -> FcgiResult<()> {
        tokio::time::timeout(
            self.timeout,
            record::emit_end_request(&mut self.writer, self.request_id, 0, protocol_status),
        )
        .await
        .map_err(|_| FcgiError::IoTimeout(self.timeout))?
    }

    /// Rejects a non-`Responder` `BEGIN_REQUEST`: emits `END_REQUEST` with
    /// `UNKNOWN_ROLE` directly, bypassing the HTTP prefix and the handler
    /// entirely.
    pub async fn reject_unknown_role(&mut self) -> FcgiResult<()> {
        debug!(id = self.request_id, "rejecting unsupported role");
        self.emit_end_request_timed(ProtocolStatus::UnknownRole).await?;
        self.ended = true;
        Ok(())
    }
}

fn rfc1123_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, RecordDecoder, RequestType};
    use tokio::io::duplex;

    async fn read_all_records(reader: &mut (impl AsyncRead + Unpin)) -> Vec<Record> {
        let mut decoder = RecordDecoder::new();
        let mut records = Vec::new();
        loop {
            match decoder.decode_next(reader).await {
                Ok(record) => {
                    let is_end = record.r#type as u8 == RequestType::EndRequest as u8;
                    records.push(record);
                    if is_end {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        records
    }

    #[tokio::test]
    async fn write_then_end_emits_prefix_body_and_end_request() {
        let (mut stdin_client, stdin_server) = duplex(64);
        crate::record::write_record(&mut stdin_client, RequestType::Stdin, 1, &[])
            .await
            .unwrap();
        let mut input = InputSide::new(stdin_server, 16 * 1024, Duration::from_secs(5));

        let (out_writer, mut out_reader) = duplex(1 << 20);
        let mut output = OutputSide::new(out_writer, Duration::from_secs(5));
        output.reset(1);

        output.set_status(200);
        output.write(&mut input, "ok").await.unwrap();
        output.end(&mut input).await.unwrap();

        let records = read_all_records(&mut out_reader).await;
        assert!(records.len() >= 2);
        let stdout_bytes: Vec<u8> = records
            .iter()
            .filter(|r| r.r#type as u8 == RequestType::Stdout as u8)
            .flat_map(|r| r.content.to_vec())
            .collect();
        let text = String::from_utf8(stdout_bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/html; charset=utf-8\r\n"));
        assert!(text.ends_with("\r\n\r\nok"));

        let last = records.last().unwrap();
        assert_eq!(last.r#type as u8, RequestType::EndRequest as u8);
    }

    #[tokio::test]
    async fn headers_are_sent_exactly_once() {
        let (mut stdin_client, stdin_server) = duplex(64);
        crate::record::write_record(&mut stdin_client, RequestType::Stdin, 1, &[])
            .await
            .unwrap();
        let mut input = InputSide::new(stdin_server, 16 * 1024, Duration::from_secs(5));

        let (out_writer, _out_reader) = duplex(1 << 20);
        let mut output = OutputSide::new(out_writer, Duration::from_secs(5));
        output.reset(1);

        output.set_status(404);
        output.write(&mut input, "a").await.unwrap();
        output.set_status(500); // must be ignored, headers already sent
        output.write(&mut input, "b").await.unwrap();

        assert!(output.headers_sent());
        assert_eq!(output.status_code, 404);
    }

    #[tokio::test]
    async fn stalled_peer_times_out_on_write_instead_of_hanging() {
        let (mut stdin_client, stdin_server) = duplex(64);
        crate::record::write_record(&mut stdin_client, RequestType::Stdin, 1, &[])
            .await
            .unwrap();
        let mut input = InputSide::new(stdin_server, 16 * 1024, Duration::from_secs(5));

        // A tiny duplex with nobody reading the other end: once the
        // response prefix fills it, the next write blocks forever without
        // the per-write timeout.
        let (out_writer, _out_reader) = duplex(8);
        let mut output = OutputSide::new(out_writer, Duration::from_millis(20));
        output.reset(1);

        output.write(&mut input, "ok").await.unwrap();
        let err = output.end(&mut input).await.unwrap_err();
        assert!(matches!(err, FcgiError::IoTimeout(_)));
    }
}
