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

//! Internal FastCGI protocol metadata structures and parsing.
//!
//! This module contains the wire-level record framer: the 8-byte header
//! codec, the closed set of record/role/protocol-status enums, and a
//! rolling decoder that reassembles records out of however the underlying
//! stream happens to deliver bytes.

use crate::{
    byte_queue::ByteQueue,
    error::{FcgiError, FcgiResult},
};
use bytes::{Buf, Bytes, BytesMut};
use std::fmt::{self, Display};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// FastCGI protocol version 1.
pub(crate) const VERSION_1: u8 = 1;
/// Maximum content length of a single record.
pub const MAX_CONTENT_LENGTH: usize = 0xffff;
/// Length of the FastCGI record header in bytes.
pub const HEADER_LEN: usize = 8;

/// FastCGI record types, as defined in the protocol specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    /// Begin request record type.
    BeginRequest = 1,
    /// Abort request record type.
    AbortRequest = 2,
    /// End request record type.
    EndRequest = 3,
    /// Parameters record type.
    Params = 4,
    /// Stdin record type.
    Stdin = 5,
    /// Stdout record type.
    Stdout = 6,
    /// Stderr record type.
    Stderr = 7,
    /// Data record type.
    Data = 8,
    /// Get values record type.
    GetValues = 9,
    /// Get values result record type.
    GetValuesResult = 10,
    /// Unknown type record type.
    UnknownType = 11,
}

impl RequestType {
    fn from_u8(u: u8) -> Self {
        match u {
            1 => RequestType::BeginRequest,
            2 => RequestType::AbortRequest,
            3 => RequestType::EndRequest,
            4 => RequestType::Params,
            5 => RequestType::Stdin,
            6 => RequestType::Stdout,
            7 => RequestType::Stderr,
            8 => RequestType::Data,
            9 => RequestType::GetValues,
            10 => RequestType::GetValuesResult,
            _ => RequestType::UnknownType,
        }
    }
}

impl Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&(*self as u8), f)
    }
}

/// FastCGI application roles. This server only implements `Responder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Role {
    /// Responder role - handles requests and returns responses.
    Responder = 1,
    /// Authorizer role - performs authorization checks.
    Authorizer = 2,
    /// Filter role - filters data between web server and application.
    Filter = 3,
}

impl Role {
    fn from_u16(u: u16) -> Self {
        match u {
            1 => Role::Responder,
            2 => Role::Authorizer,
            _ => Role::Filter,
        }
    }
}

/// FastCGI protocol status codes carried in `END_REQUEST`.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum ProtocolStatus {
    /// Request completed successfully.
    RequestComplete = 0,
    /// This app can't multiplex connections.
    CantMpxConn = 1,
    /// New request rejected; too busy.
    Overloaded = 2,
    /// Role value not known.
    UnknownRole = 3,
}

/// A decoded record header plus its content bytes.
#[derive(Debug, Clone)]
pub struct Record {
    /// FastCGI protocol version, always 1 once validated.
    pub version: u8,
    /// Type of the record.
    pub r#type: RequestType,
    /// Request id this record belongs to (0 for management records).
    pub request_id: u16,
    /// Raw content bytes, excluding header and padding.
    pub content: Bytes,
}

impl Record {
    /// The role encoded in a `BEGIN_REQUEST` body, 2 big-endian bytes at
    /// content offset 0.
    pub fn role(&self) -> Role {
        Role::from_u16(u16::from_be_bytes([self.content[0], self.content[1]]))
    }

    /// The `KEEP_CONN` bit (bit 0) of a `BEGIN_REQUEST` body's flags byte,
    /// at content offset 2.
    pub fn keep_connection(&self) -> bool {
        self.content[2] & 0x1 != 0
    }

    /// The `appStatus`/`protocolStatus` body of an `END_REQUEST` record,
    /// mostly useful for tests that act as a FastCGI peer.
    pub fn end_request_status(&self) -> (u32, u8) {
        let app_status = u32::from_be_bytes([
            self.content[0],
            self.content[1],
            self.content[2],
            self.content[3],
        ]);
        (app_status, self.content[4])
    }
}

/// Reassembles FastCGI records out of a duplex byte stream.
///
/// The decoder owns a rolling buffer sized for the worst-case record
/// (`8 + 65535 + 255` bytes) so that a `BEGIN_REQUEST` for the next request
/// on a keep-alive connection can start filling the buffer while the tail
/// of a previous read is still being drained; callers just keep calling
/// [`RecordDecoder::decode_next`] and get one record per call, regardless
/// of how the underlying reads happened to chunk the bytes.
pub struct RecordDecoder {
    buf: BytesMut,
}

impl RecordDecoder {
    /// Creates a decoder with an empty rolling buffer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(HEADER_LEN + MAX_CONTENT_LENGTH + 255),
        }
    }

    /// Empties the rolling buffer, preserving its allocated capacity. Used
    /// between keep-alive requests; a half-consumed trailing record never
    /// straddles a request boundary since `STDIN`'s empty record always
    /// ends a request cleanly, so this is a plain clear rather than a
    /// partial compaction.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Reads from `reader` until one full record is buffered, then returns
    /// it. A read returning zero bytes with nothing buffered is reported as
    /// [`FcgiError::PeerClosed`]; zero bytes with a partial record already
    /// buffered is [`FcgiError::Truncated`].
    pub async fn decode_next<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> FcgiResult<Record> {
        while self.buf.len() < HEADER_LEN {
            self.fill(reader).await?;
        }

        let content_length = u16::from_be_bytes([self.buf[4], self.buf[5]]) as usize;
        let padding_length = self.buf[6] as usize;
        let frame_len = HEADER_LEN + content_length + padding_length;

        while self.buf.len() < frame_len {
            self.fill(reader).await?;
        }

        let mut frame = self.buf.split_to(frame_len);
        let version = frame[0];
        let r#type = RequestType::from_u8(frame[1]);
        let request_id = u16::from_be_bytes([frame[2], frame[3]]);

        if version != VERSION_1 {
            return Err(FcgiError::protocol(format!(
                "unsupported FastCGI version {version}"
            )));
        }

        frame.advance(HEADER_LEN);
        let content = frame.split_to(content_length).freeze();

        Ok(Record {
            version,
            r#type,
            request_id,
            content,
        })
    }

    async fn fill<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> FcgiResult<()> {
        let mut chunk = [0u8; 4096];
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(if self.buf.is_empty() {
                FcgiError::PeerClosed
            } else {
                FcgiError::Truncated
            });
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}

impl Default for RecordDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn padding_for(content_length: usize) -> u8 {
    (-(content_length as i64) & 7) as u8
}

async fn write_header<W: AsyncWrite + Unpin>(
    writer: &mut W, r#type: RequestType, request_id: u16, content_length: usize, padding_length: u8,
) -> FcgiResult<()> {
    let mut header = [0u8; HEADER_LEN];
    header[0] = VERSION_1;
    header[1] = r#type as u8;
    header[2..4].copy_from_slice(&request_id.to_be_bytes());
    header[4..6].copy_from_slice(&(content_length as u16).to_be_bytes());
    header[6] = padding_length;
    header[7] = 0;
    writer.write_all(&header).await?;
    Ok(())
}

/// Writes one `STDOUT` record carrying up to 65,535 bytes drained from
/// `source`, with zero padding. Returns the number of bytes consumed,
/// which is zero exactly when `source` was already empty (the end-of-
/// stream marker the peer expects).
pub async fn emit_stdout<W: AsyncWrite + Unpin>(
    writer: &mut W, request_id: u16, source: &mut ByteQueue,
) -> FcgiResult<usize> {
    let take = source.length().min(MAX_CONTENT_LENGTH);
    let mut content = vec![0u8; take];
    let consumed = source.read(take, &mut content, 0);
    content.truncate(consumed);

    write_header(writer, RequestType::Stdout, request_id, consumed, 0).await?;
    writer.write_all(&content).await?;
    Ok(consumed)
}

/// Writes the terminating `END_REQUEST` record for `request_id`.
pub async fn emit_end_request<W: AsyncWrite + Unpin>(
    writer: &mut W, request_id: u16, app_status: u32, protocol_status: ProtocolStatus,
) -> FcgiResult<()> {
    let mut content = [0u8; 8];
    content[0..4].copy_from_slice(&app_status.to_be_bytes());
    content[4] = protocol_status as u8;
    write_header(writer, RequestType::EndRequest, request_id, content.len(), 0).await?;
    writer.write_all(&content).await?;
    Ok(())
}

/// Writes an arbitrary record, used by tests acting as a FastCGI peer and
/// by the `UNKNOWN_ROLE` rejection path.
pub async fn write_record<W: AsyncWrite + Unpin>(
    writer: &mut W, r#type: RequestType, request_id: u16, content: &[u8],
) -> FcgiResult<()> {
    let padding_length = padding_for(content.len());
    write_header(writer, r#type, request_id, content.len(), padding_length).await?;
    writer.write_all(content).await?;
    if padding_length > 0 {
        writer.write_all(&[0u8; 7][..padding_length as usize]).await?;
    }
    Ok(())
}

/// Encodes a `BEGIN_REQUEST` body, used by tests acting as a FastCGI peer.
pub fn begin_request_body(role: Role, keep_alive: bool) -> [u8; 8] {
    let mut body = [0u8; 8];
    body[0..2].copy_from_slice(&(role as u16).to_be_bytes());
    body[2] = keep_alive as u8;
    body
}
