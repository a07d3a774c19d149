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

//! Error types and result type aliases for FastCGI server operations.
//!
//! This module defines the error taxonomy that can occur while framing
//! FastCGI records, driving the per-request state machine, or running the
//! connection pool, and provides a convenient result alias.

/// Result type alias for FastCGI server operations.
pub type FcgiResult<T> = Result<T, FcgiError>;

/// Error types that can occur during FastCGI communication.
#[derive(Debug, thiserror::Error)]
pub enum FcgiError {
    /// Wrapper of `tokio::io::Error`.
    #[error(transparent)]
    Io(#[from] tokio::io::Error),

    /// A read or write did not complete within the connection timeout.
    #[error("io timed out after {0:?}")]
    IoTimeout(std::time::Duration),

    /// The peer closed the connection cleanly between records.
    #[error("peer closed the connection")]
    PeerClosed,

    /// The peer closed the connection in the middle of a record.
    #[error("connection truncated mid-record")]
    Truncated,

    /// A record was malformed, arrived out of order, or named an
    /// unsupported role/request id.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// `PARAMS` content accumulated past the configured maximum.
    #[error("accumulated header size {size} exceeds the {limit} byte limit")]
    HeaderTooLarge {
        /// Bytes accumulated so far.
        size: usize,
        /// The configured `max_header_size`.
        limit: usize,
    },

    /// A name/value pair declared a length that runs past the buffered
    /// content.
    #[error("name/value pair length {declared} exceeds {available} buffered bytes")]
    EncodingError {
        /// The length the pair claimed.
        declared: usize,
        /// The bytes actually remaining in the buffer.
        available: usize,
    },

    /// `BEGIN_REQUEST` named a role other than `Responder`.
    #[error("unsupported role for request {0}")]
    UnknownRole(u16),

    /// The peer sent `ABORT_REQUEST`.
    #[error("request {0} aborted by peer")]
    Aborted(u16),

    /// The peer sent a management record (`GET_VALUES`); this server does
    /// not answer them.
    #[error("unsupported management request")]
    UnsupportedManagementRequest,

    /// A parameter the handler looked up was not present in the request.
    #[error("missing parameter `{0}`")]
    MissingParameter(String),

    /// The user handler returned without ending the response, or panicked.
    #[error("handler failed: {0}")]
    HandlerFailed(String),

    /// `ServerConfig` failed validation.
    #[error("invalid server configuration: {0}")]
    InvalidConfig(String),
}

impl FcgiError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        FcgiError::ProtocolError(message.into())
    }
}
