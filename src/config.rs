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

//! Startup configuration for [`crate::Server`].

use crate::error::{FcgiError, FcgiResult};
use std::time::Duration;

/// Validated startup configuration: bind address, pool size, timeouts, and
/// the `PARAMS` accumulation cap.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// IP address to bind, e.g. `"0.0.0.0"` or `"127.0.0.1"`.
    pub bind_address: String,
    /// TCP port in `1..=65535`.
    pub port: u16,
    /// Maximum number of connections served concurrently.
    pub max_concurrent: usize,
    /// Per-record read/write deadline.
    pub connection_timeout: Duration,
    /// Cap on accumulated `PARAMS` content per request, in bytes.
    pub max_header_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            max_concurrent: 256,
            connection_timeout: Duration::from_millis(5000),
            max_header_size: 16 * 1024,
        }
    }
}

impl ServerConfig {
    /// Checks the fields a [`crate::Server`] can't recover from at runtime.
    /// A zero port or an empty pool are rejected here rather than at bind
    /// time, so misconfiguration fails fast.
    pub fn validate(&self) -> FcgiResult<()> {
        if self.port == 0 {
            return Err(FcgiError::InvalidConfig(
                "port must be in 1..=65535, got 0".to_string(),
            ));
        }
        if self.max_concurrent == 0 {
            return Err(FcgiError::InvalidConfig(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.max_header_size == 0 {
            return Err(FcgiError::InvalidConfig(
                "max_header_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
