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

//! HTTP status reason-phrase lookup.
//!
//! A full status-code table is out of this crate's scope — it's plain
//! static data an embedder almost certainly already has (e.g. via the
//! `http` crate's `StatusCode::canonical_reason`). [`StatusText`] is the
//! seam; [`DefaultStatusText`] only carries the handful of codes this
//! crate's own tests and its implicit `500` fallback need.

/// Looks up the reason phrase for an HTTP status code.
pub trait StatusText {
    /// Returns the reason phrase for `code`, if known.
    fn reason_phrase(&self, code: u16) -> Option<&str>;
}

/// A minimal built-in [`StatusText`] covering common codes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStatusText;

impl StatusText for DefaultStatusText {
    fn reason_phrase(&self, code: u16) -> Option<&str> {
        Some(match code {
            200 => "OK",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            400 => "Bad Request",
            403 => "Forbidden",
            404 => "Not Found",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            _ => return None,
        })
    }
}
