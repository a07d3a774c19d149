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

//! Minimal standalone FastCGI responder, for use behind an Nginx
//! `fastcgi_pass` pointed at `127.0.0.1:9000`.

use fastcgi_responder::{Server, ServerConfig};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let config = ServerConfig {
        port: 9000,
        ..ServerConfig::default()
    };

    let server = match Server::new(
        config,
        handle::<tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf>,
    ) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = server.run().await {
        eprintln!("fastcgi responder exited: {err}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn handle<R, W>(
    input: &mut fastcgi_responder::InputSide<R>, output: &mut fastcgi_responder::OutputSide<W>,
) where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let method = input.get_parameter("REQUEST_METHOD").unwrap_or("GET");
    let path = input.get_parameter("DOCUMENT_URI").unwrap_or("/");

    output.set_status(200);
    output
        .write(input, &format!("hello from fastcgi-responder: {method} {path}\n"))
        .await
        .unwrap();
    output.end(input).await.unwrap();
}
