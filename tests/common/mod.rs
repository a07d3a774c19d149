//! Shared helpers for the scenario integration tests: stand up a real
//! `Server` on a loopback port, and act as a minimal FastCGI peer against
//! it.

use fastcgi_responder::{
    input::InputSide,
    output::OutputSide,
    params::encode_name_value_pairs,
    record::{self, begin_request_body, Role, RecordDecoder, RequestType},
    server::Server,
    ServerConfig,
};
use std::{collections::HashMap, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    task::JoinHandle,
};

/// Binds an OS-assigned loopback port long enough to learn its number,
/// then releases it. Good enough for tests; a small bind race is
/// acceptable here.
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Starts a `Server` with `handler` on a fresh loopback port and gives it
/// a moment to start listening before returning.
pub async fn spawn_server<H>(handler: H) -> (u16, JoinHandle<()>)
where
    H: AsyncFn(&mut InputSide<OwnedReadHalf>, &mut OutputSide<OwnedWriteHalf>) + Send + Sync + 'static,
{
    spawn_server_with_config(ServerConfig::default(), handler).await
}

/// Like [`spawn_server`], with a caller-supplied base config (bind
/// address and port are always overridden to a fresh loopback port).
pub async fn spawn_server_with_config<H>(base: ServerConfig, handler: H) -> (u16, JoinHandle<()>)
where
    H: AsyncFn(&mut InputSide<OwnedReadHalf>, &mut OutputSide<OwnedWriteHalf>) + Send + Sync + 'static,
{
    let port = free_port();
    let config = ServerConfig {
        bind_address: "127.0.0.1".to_string(),
        port,
        ..base
    };
    let server = Server::new(config, handler).expect("valid test config");
    let task = tokio::spawn(async move {
        let _ = server.run().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, task)
}

pub async fn connect(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).await.unwrap()
}

/// Writes `BEGIN_REQUEST`, a single `PARAMS` record carrying `params`
/// followed by its terminator, for `id`.
pub async fn send_begin_and_params(
    mut writer: impl AsyncWrite + Unpin, id: u16, keep_alive: bool, params: &HashMap<String, String>,
) {
    record::write_record(
        &mut writer,
        RequestType::BeginRequest,
        id,
        &begin_request_body(Role::Responder, keep_alive),
    )
    .await
    .unwrap();
    let content = encode_name_value_pairs(params);
    if !content.is_empty() {
        record::write_record(&mut writer, RequestType::Params, id, &content)
            .await
            .unwrap();
    }
    record::write_record(&mut writer, RequestType::Params, id, &[])
        .await
        .unwrap();
}

/// Writes one or more `STDIN` records carrying `body`, followed by the
/// empty terminator.
pub async fn send_stdin(mut writer: impl AsyncWrite + Unpin, id: u16, body: &[u8]) {
    if !body.is_empty() {
        record::write_record(&mut writer, RequestType::Stdin, id, body)
            .await
            .unwrap();
    }
    record::write_record(&mut writer, RequestType::Stdin, id, &[]).await.unwrap();
}

/// Reads records until (and including) `END_REQUEST`, returning the
/// concatenated `STDOUT` content bytes.
pub async fn read_response(mut reader: impl AsyncRead + Unpin) -> Vec<u8> {
    let mut decoder = RecordDecoder::new();
    let mut stdout = Vec::new();
    loop {
        let record = decoder.decode_next(&mut reader).await.unwrap();
        match record.r#type {
            RequestType::Stdout => stdout.extend_from_slice(&record.content),
            RequestType::EndRequest => break,
            _ => {}
        }
    }
    stdout
}

pub fn minimal_params() -> HashMap<String, String> {
    let mut params = HashMap::new();
    params.insert("REQUEST_METHOD".to_string(), "GET".to_string());
    params.insert("DOCUMENT_URI".to_string(), "/".to_string());
    params
}
