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

//! A segment-owning FIFO byte buffer.
//!
//! `ByteQueue` is the accumulation buffer behind `PARAMS`/`STDIN`
//! reassembly and `STDOUT` framing. Appended segments are taken by
//! ownership (`bytes::Bytes`, so appends are a refcount bump, not a copy)
//! and reads drain from the front, splitting the first segment in place
//! rather than defragmenting the whole buffer.

use crate::error::{FcgiError, FcgiResult};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};

/// FIFO queue of owned byte segments.
#[derive(Debug, Default)]
pub struct ByteQueue {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl ByteQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an owned segment to the tail. Zero-copy: `Bytes` is
    /// reference counted.
    pub fn append(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.segments.push_back(bytes);
    }

    /// Total pending bytes across all segments.
    pub fn length(&self) -> usize {
        self.len
    }

    /// Copies at most `n` bytes into `dest[offset..]`, removing them from
    /// the queue. Returns the number of bytes actually copied:
    /// `min(n, length(), dest.len() - offset)`.
    pub fn read(&mut self, n: usize, dest: &mut [u8], offset: usize) -> usize {
        let capacity = dest.len().saturating_sub(offset);
        let consumed = n.min(self.len).min(capacity);
        if consumed == 0 {
            return 0;
        }
        let data = self.take_exact(consumed).expect("checked against self.len above");
        dest[offset..offset + consumed].copy_from_slice(&data);
        consumed
    }

    /// Returns a contiguous copy of everything pending, without consuming
    /// it.
    pub fn snapshot_copy(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for segment in &self.segments {
            out.extend_from_slice(segment);
        }
        out
    }

    /// Drains the queue, decoding it as back-to-back FastCGI name/value
    /// pairs.
    pub fn decode_name_value_pairs(&mut self) -> FcgiResult<HashMap<String, String>> {
        let mut map = HashMap::new();
        while self.len > 0 {
            let name_len = self.read_length()?;
            let value_len = self.read_length()?;
            let name = self.take_exact(name_len).ok_or(FcgiError::EncodingError {
                declared: name_len,
                available: self.len,
            })?;
            let value = self.take_exact(value_len).ok_or(FcgiError::EncodingError {
                declared: value_len,
                available: self.len,
            })?;
            map.insert(
                String::from_utf8_lossy(&name).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            );
        }
        Ok(map)
    }

    /// Empties the queue, dropping all segments.
    pub fn reset(&mut self) {
        self.segments.clear();
        self.len = 0;
    }

    /// Reads one FastCGI length field: a single byte `0..127`, or four
    /// bytes with the high bit of the first set giving a big-endian 31-bit
    /// length.
    fn read_length(&mut self) -> FcgiResult<usize> {
        let first = *self
            .take_exact(1)
            .ok_or(FcgiError::EncodingError {
                declared: 1,
                available: self.len,
            })?
            .first()
            .expect("take_exact(1) yields exactly one byte");

        if first & 0x80 == 0 {
            return Ok(first as usize);
        }

        let rest = self.take_exact(3).ok_or(FcgiError::EncodingError {
            declared: 3,
            available: self.len,
        })?;
        let len = ((first & 0x7f) as u32) << 24
            | (rest[0] as u32) << 16
            | (rest[1] as u32) << 8
            | rest[2] as u32;
        Ok(len as usize)
    }

    /// Removes and returns exactly `n` bytes from the front of the queue,
    /// or `None` if fewer than `n` bytes are buffered. The common case —
    /// the whole span lives in the first segment — just slices that
    /// segment; only a span crossing a segment boundary pays for a copy.
    fn take_exact(&mut self, n: usize) -> Option<Bytes> {
        if n > self.len {
            return None;
        }
        if n == 0 {
            return Some(Bytes::new());
        }

        if let Some(front) = self.segments.front_mut() {
            if front.len() >= n {
                let out = front.split_to(n);
                self.len -= n;
                if front.is_empty() {
                    self.segments.pop_front();
                }
                return Some(out);
            }
        }

        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let segment = self.segments.front_mut().expect("length invariant holds");
            let take = remaining.min(segment.len());
            out.extend_from_slice(&segment[..take]);
            segment.advance(take);
            self.len -= take;
            remaining -= take;
            if segment.is_empty() {
                self.segments.pop_front();
            }
        }
        Some(out.freeze())
    }
}
