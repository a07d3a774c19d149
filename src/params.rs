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

//! FastCGI name/value pair encoding.
//!
//! The decode half lives on [`crate::byte_queue::ByteQueue`], since it has
//! to drain a live accumulation buffer; this module holds the encode half,
//! used by anything constructing `PARAMS` content — today that's just the
//! test suite acting as a FastCGI peer, since this crate only receives
//! parameters, but the codec is kept symmetric with the decoder on
//! purpose.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// Encoding for one FastCGI name or value length.
#[derive(Debug, Clone, Copy)]
enum ParamLength {
    Short(u8),
    Long(u32),
}

impl ParamLength {
    fn new(length: usize) -> Self {
        if length < 128 {
            ParamLength::Short(length as u8)
        } else {
            ParamLength::Long(length as u32 | (1 << 31))
        }
    }

    fn write(self, buf: &mut BytesMut) {
        match self {
            ParamLength::Short(l) => buf.put_u8(l),
            ParamLength::Long(l) => buf.put_u32(l),
        }
    }
}

/// Encodes `params` as back-to-back FastCGI name/value pairs, suitable for
/// `PARAMS` record content.
pub fn encode_name_value_pairs(params: &HashMap<String, String>) -> Bytes {
    let mut buf = BytesMut::new();
    for (name, value) in params {
        ParamLength::new(name.len()).write(&mut buf);
        ParamLength::new(value.len()).write(&mut buf);
        buf.put_slice(name.as_bytes());
        buf.put_slice(value.as_bytes());
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_queue::ByteQueue;

    #[test]
    fn encode_then_decode_is_identity() {
        let mut params = HashMap::new();
        params.insert("REQUEST_METHOD".to_string(), "GET".to_string());
        params.insert("SCRIPT_NAME".to_string(), "/index.php".to_string());
        params.insert("LONG_VALUE".to_string(), "x".repeat(300));

        let encoded = encode_name_value_pairs(&params);

        let mut queue = ByteQueue::new();
        queue.append(encoded);
        let decoded = queue.decode_name_value_pairs().unwrap();

        assert_eq!(decoded, params);
    }
}
