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

//! Per-request decoder: drives the `BEGIN_REQUEST -> PARAMS* -> STDIN*`
//! state machine and exposes the decoded parameters and stdin to the
//! handler.

use crate::{
    byte_queue::ByteQueue,
    error::{FcgiError, FcgiResult},
    record::{Record, RecordDecoder, RequestType, Role},
};
use std::{collections::HashMap, time::Duration};
use tokio::io::AsyncRead;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ExpectBegin,
    ExpectParams,
    ExpectStdin,
    Closed,
}

/// The decoding half of one FastCGI request. Owns the connection's read
/// half and record decoder so the handler can call `get_content()` and
/// friends without threading a stream through every call.
pub struct InputSide<R> {
    reader: R,
    decoder: RecordDecoder,
    max_header_size: usize,
    timeout: Duration,
    state: State,
    request_id: u16,
    keep_connection: bool,
    params: HashMap<String, String>,
    params_accum: ByteQueue,
    stdin: ByteQueue,
    stdin_complete: bool,
}

impl<R: AsyncRead + Unpin> InputSide<R> {
    /// Creates an `InputSide` over `reader`, not yet having seen
    /// `BEGIN_REQUEST`. `timeout` bounds every individual record read, per
    /// the connection-level deadline in `ServerConfig::connection_timeout`.
    pub fn new(reader: R, max_header_size: usize, timeout: Duration) -> Self {
        Self {
            reader,
            decoder: RecordDecoder::new(),
            max_header_size,
            timeout,
            state: State::ExpectBegin,
            request_id: 0,
            keep_connection: false,
            params: HashMap::new(),
            params_accum: ByteQueue::new(),
            stdin: ByteQueue::new(),
            stdin_complete: false,
        }
    }

    /// Resets all per-request state so the same `InputSide` can be reused
    /// for the next request on a keep-alive connection, without
    /// reallocating its buffers.
    pub fn reset(&mut self) {
        self.decoder.reset();
        self.state = State::ExpectBegin;
        self.request_id = 0;
        self.keep_connection = false;
        self.params.clear();
        self.params_accum.reset();
        self.stdin.reset();
        self.stdin_complete = false;
    }

    /// The request id the peer chose for this request.
    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    /// Whether the peer asked to keep the connection open (`KEEP_CONN`).
    pub fn keep_connection(&self) -> bool {
        self.keep_connection
    }

    /// Drives the state machine from `Expect-Begin` through `Expect-Params`
    /// until the parameter map is complete, at which point the handler can
    /// be invoked. Leaves the `InputSide` positioned at `Expect-Stdin`.
    pub async fn initialize(&mut self) -> FcgiResult<()> {
        loop {
            match self.state {
                State::ExpectBegin => {
                    let record = self.decode_timed().await?;
                    match record.r#type {
                        RequestType::AbortRequest => return Err(FcgiError::Aborted(record.request_id)),
                        RequestType::GetValues => return Err(FcgiError::UnsupportedManagementRequest),
                        RequestType::BeginRequest => {}
                        other => {
                            return Err(FcgiError::protocol(format!("expected BEGIN_REQUEST, got {other}")));
                        }
                    }
                    self.request_id = record.request_id;
                    self.keep_connection = record.keep_connection();
                    debug!(
                        id = self.request_id,
                        keep_connection = self.keep_connection,
                        "begin request"
                    );
                    if record.role() != Role::Responder {
                        return Err(FcgiError::UnknownRole(self.request_id));
                    }
                    self.state = State::ExpectParams;
                }
                State::ExpectParams => {
                    let record = self.next_for_current_request().await?;
                    match record.r#type {
                        RequestType::Params if !record.content.is_empty() => {
                            let new_len = self.params_accum.length() + record.content.len();
                            if new_len > self.max_header_size {
                                return Err(FcgiError::HeaderTooLarge {
                                    size: new_len,
                                    limit: self.max_header_size,
                                });
                            }
                            self.params_accum.append(record.content);
                        }
                        RequestType::Params => {
                            self.params = self.params_accum.decode_name_value_pairs()?;
                            debug!(id = self.request_id, count = self.params.len(), "params complete");
                            self.state = State::ExpectStdin;
                            return Ok(());
                        }
                        other => return Err(self.unexpected(other)),
                    }
                }
                State::ExpectStdin | State::Closed => return Ok(()),
            }
        }
    }

    /// Decodes the next record off the wire, bounded by the connection
    /// timeout so a peer that stalls mid-record can't hang this worker
    /// forever.
    async fn decode_timed(&mut self) -> FcgiResult<Record> {
        tokio::time::timeout(self.timeout, self.decoder.decode_next(&mut self.reader))
            .await
            .map_err(|_| FcgiError::IoTimeout(self.timeout))?
    }

    /// Reads and classifies one record belonging to the current request,
    /// surfacing `ABORT_REQUEST`/`GET_VALUES`/foreign-request-id records as
    /// errors per spec.
    async fn next_for_current_request(&mut self) -> FcgiResult<Record> {
        let record = self.decode_timed().await?;
        if record.request_id != self.request_id && record.request_id != 0 {
            return Err(FcgiError::protocol(format!(
                "record for request {} received while serving request {}",
                record.request_id, self.request_id
            )));
        }
        match record.r#type {
            RequestType::AbortRequest => Err(FcgiError::Aborted(self.request_id)),
            RequestType::GetValues => Err(FcgiError::UnsupportedManagementRequest),
            _ => Ok(record),
        }
    }

    fn unexpected(&self, got: RequestType) -> FcgiError {
        FcgiError::protocol(format!(
            "unexpected record type {got} in state {:?} for request {}",
            self.state, self.request_id
        ))
    }

    /// Looks up one decoded parameter. Missing keys are reported through
    /// the error taxonomy rather than returning an empty string.
    pub fn get_parameter(&self, name: &str) -> FcgiResult<&str> {
        self.params
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| FcgiError::MissingParameter(name.to_string()))
    }

    /// All decoded parameters.
    pub fn all_parameters(&self) -> &HashMap<String, String> {
        &self.params
    }

    /// Reads one more `STDIN` record, appending to the stdin buffer or
    /// marking input complete on the empty terminator. Returns `true` while
    /// there may be more stdin to come.
    pub async fn pump_stdin(&mut self) -> FcgiResult<bool> {
        if self.stdin_complete {
            return Ok(false);
        }
        let record = self.next_for_current_request().await?;
        match record.r#type {
            RequestType::Stdin if !record.content.is_empty() => {
                self.stdin.append(record.content);
                Ok(true)
            }
            RequestType::Stdin => {
                self.stdin_complete = true;
                self.state = State::Closed;
                Ok(false)
            }
            other => Err(self.unexpected(other)),
        }
    }

    /// Drains stdin to completion and returns a contiguous copy of the
    /// whole body.
    pub async fn get_binary_content(&mut self) -> FcgiResult<Vec<u8>> {
        while self.pump_stdin().await? {}
        Ok(self.stdin.snapshot_copy())
    }

    /// Like [`InputSide::get_binary_content`], decoded as UTF-8 (lossily,
    /// consistent with the parameter decoder).
    pub async fn get_content(&mut self) -> FcgiResult<String> {
        let bytes = self.get_binary_content().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Drains any remaining stdin without retaining it. Needed before
    /// writing a response early, since some peers refuse to read a
    /// response until they've finished sending the request.
    pub async fn read_all_and_discard(&mut self) -> FcgiResult<()> {
        while self.pump_stdin().await? {
            self.stdin.reset();
        }
        self.stdin.reset();
        Ok(())
    }

    /// Whether `STDIN`'s empty terminator has already been seen.
    pub fn stdin_complete(&self) -> bool {
        self.stdin_complete
    }
}
