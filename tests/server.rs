// Copyright 2025 jonefeewang@gmail.com
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

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use wirehub::service::{upgrade_echo_registry, UpgradeEchoHandler};
use wirehub::{serve, AppResult, ConnectionContext, InMemoryMetrics, ServerConfig};

const UPGRADE: &str = "GET /echo HTTP/1.1\r\n\
                       Host: localhost\r\n\
                       Upgrade: websocket\r\n\
                       Connection: Upgrade\r\n\
                       Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                       Sec-WebSocket-Version: 13\r\n\
                       \r\n";

struct TestServer {
    address: SocketAddr,
    metrics: Arc<InMemoryMetrics>,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<AppResult<()>>,
}

async fn start_server(idle_timeout: u64) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    let mut config = ServerConfig::default();
    config.connection.idle_timeout = idle_timeout;
    config.connection.shutdown_timeout = 2;
    config.task.num_workers = 2;

    let metrics = Arc::new(InMemoryMetrics::default());
    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(serve(
        listener,
        config,
        upgrade_echo_registry().unwrap(),
        |_ctx: &ConnectionContext| UpgradeEchoHandler::default(),
        metrics.clone(),
        async {
            let _ = stopped.await;
        },
    ));
    TestServer {
        address,
        metrics,
        stop,
        handle,
    }
}

/// Client-to-server frames must be masked.
fn masked_frame(first_byte: u8, payload: &[u8]) -> Vec<u8> {
    let mask = [0x37u8, 0xfa, 0x21, 0x3d];
    assert!(payload.len() <= 125);
    let mut frame = vec![first_byte, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    frame
}

async fn upgraded_client(address: SocketAddr) -> TcpStream {
    let mut client = TcpStream::connect(address).await.unwrap();
    client.write_all(UPGRADE.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    while !response.ends_with(b"\r\n\r\n") {
        let mut byte = [0u8; 1];
        timeout(Duration::from_secs(5), client.read_exact(&mut byte))
            .await
            .expect("handshake timed out")
            .unwrap();
        response.push(byte[0]);
    }
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    client
}

async fn stop_server(server: TestServer) {
    server.stop.send(()).unwrap();
    timeout(Duration::from_secs(10), server.handle)
        .await
        .expect("server did not shut down")
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upgrade_echo_and_close() {
    let server = start_server(60).await;
    let mut client = upgraded_client(server.address).await;

    client.write_all(&masked_frame(0x81, b"hello")).await.unwrap();
    let mut echoed = [0u8; 7];
    timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"\x81\x05hello");

    // close is answered with close, then the socket is shut
    client.write_all(&masked_frame(0x88, b"")).await.unwrap();
    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rest, vec![0x88, 0x00]);

    stop_server(server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_connection_is_reaped() {
    let server = start_server(1).await;
    let mut client = upgraded_client(server.address).await;

    // say nothing; the watchdog closes the connection with a close frame
    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .expect("idle connection was not reaped")
        .unwrap();
    assert_eq!(rest, vec![0x88, 0x00]);

    let snapshot = server.metrics.snapshot();
    assert_eq!(snapshot.connections_registered, 1);
    assert_eq!(snapshot.connections_timed_out, 1);

    stop_server(server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_signal_closes_open_connections() {
    let server = start_server(60).await;
    let mut client = upgraded_client(server.address).await;

    server.stop.send(()).unwrap();
    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rest, vec![0x88, 0x00]);

    timeout(Duration::from_secs(10), server.handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_without_key_gets_400() {
    let server = start_server(60).await;
    let mut client = TcpStream::connect(server.address).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(String::from_utf8(rest)
        .unwrap()
        .starts_with("HTTP/1.1 400 Bad Request\r\n"));

    stop_server(server).await;
}
