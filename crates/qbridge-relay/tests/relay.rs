//! Relay behaviour against a raw QUIC client speaking the header protocol.

use qbridge_core::certs::{generate_pki, PkiPaths};
use qbridge_core::{quic, tls, ClientTls, QuicSettings};
use qbridge_relay::config::{ConfigFile, Overrides};
use qbridge_relay::{RelayConfig, RelayServer};
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Harness {
    _dir: TempDir,
    _endpoint: quinn::Endpoint,
    conn: quinn::Connection,
    shutdown: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start(overrides: Overrides) -> Harness {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let paths: PkiPaths = generate_pki(&["localhost".to_string()], "test-client")
        .unwrap()
        .write_to(dir.path(), false)
        .unwrap();

    let overrides = Overrides {
        listen: Some("127.0.0.1:0".into()),
        cert: Some(paths.server_cert.to_string_lossy().into_owned()),
        key: Some(paths.server_key.to_string_lossy().into_owned()),
        handshake_timeout: Some(2),
        dial_timeout: Some(2),
        ..overrides
    };
    let config = RelayConfig::resolve(ConfigFile::default(), overrides).unwrap();
    let server = RelayServer::bind(config).unwrap();
    let relay_addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));

    let crypto = tls::client_crypto(&ClientTls {
        ca: Some(paths.ca_cert.clone()),
        ..ClientTls::default()
    })
    .unwrap();
    let mut endpoint = quinn::Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
    endpoint.set_default_client_config(
        quic::client_config(crypto, &QuicSettings::default()).unwrap(),
    );
    let conn = endpoint
        .connect(relay_addr, "localhost")
        .unwrap()
        .await
        .unwrap();

    Harness {
        _dir: dir,
        _endpoint: endpoint,
        conn,
        shutdown,
    }
}

async fn target() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Asserts nobody connects to `listener` for a short while.
async fn assert_not_dialed(listener: &TcpListener) {
    let accepted = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(accepted.is_err(), "target was dialed");
}

fn connect_line(addr: SocketAddr) -> Vec<u8> {
    format!("CONNECT 127.0.0.1 {}\n", addr.port()).into_bytes()
}

#[tokio::test]
async fn bytes_after_header_reach_target_exactly() {
    let harness = start(Overrides::default()).await;
    let (listener, addr) = target().await;
    let request = b"GET / HTTP/1.0\r\n\r\n";

    let (mut send, mut recv) = harness.conn.open_bi().await.unwrap();
    let mut first_write = connect_line(addr);
    first_write.extend_from_slice(request);
    send.write_all(&first_write).await.unwrap();
    send.finish().unwrap();

    let (mut socket, _) = listener.accept().await.unwrap();
    let mut received = Vec::new();
    socket.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, request);

    // Client end closed first, so the relay finishes its side too.
    let rest = recv.read_to_end(1024).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn relays_both_directions() {
    let harness = start(Overrides::default()).await;
    let (listener, addr) = target().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let (mut read, mut write) = socket.split();
        tokio::io::copy(&mut read, &mut write).await.unwrap();
    });

    let (mut send, mut recv) = harness.conn.open_bi().await.unwrap();
    send.write_all(&connect_line(addr)).await.unwrap();

    let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i * 7 % 256) as u8).collect();
    send.write_all(&payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    recv.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);
}

#[tokio::test]
async fn target_close_finishes_stream() {
    let harness = start(Overrides::default()).await;
    let (listener, addr) = target().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(b"bye").await.unwrap();
    });

    let (mut send, mut recv) = harness.conn.open_bi().await.unwrap();
    send.write_all(&connect_line(addr)).await.unwrap();
    let received = recv.read_to_end(1024).await.unwrap();
    assert_eq!(received, b"bye");
}

#[tokio::test]
async fn malformed_header_resets_without_dialing() {
    let harness = start(Overrides::default()).await;
    let (listener, addr) = target().await;

    for line in [
        format!("HELLO 127.0.0.1 {}\n", addr.port()),
        "CONNECT 127.0.0.1\n".to_string(),
        "CONNECT 127.0.0.1 http\n".to_string(),
        "CONNECT 127.0.0.1 0\n".to_string(),
    ] {
        let (mut send, mut recv) = harness.conn.open_bi().await.unwrap();
        send.write_all(line.as_bytes()).await.unwrap();
        assert!(recv.read_to_end(1024).await.is_err(), "{line:?} accepted");
    }
    assert_not_dialed(&listener).await;

    // The transport is still usable.
    let (mut send, _recv) = harness.conn.open_bi().await.unwrap();
    send.write_all(&connect_line(addr)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn oversized_header_is_rejected() {
    let harness = start(Overrides::default()).await;
    let (listener, _) = target().await;

    let (mut send, mut recv) = harness.conn.open_bi().await.unwrap();
    // No newline anywhere; the relay gives up at its cap.
    let _ = send.write_all(&[b'A'; 4096]).await;
    assert!(recv.read_to_end(1024).await.is_err());
    assert_not_dialed(&listener).await;
}

#[tokio::test]
async fn incomplete_header_times_out() {
    let harness = start(Overrides::default()).await;
    let (mut send, mut recv) = harness.conn.open_bi().await.unwrap();
    send.write_all(b"CONNECT 127.0.0.1").await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), recv.read_to_end(1024))
        .await
        .unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn denied_target_is_reset() {
    let harness = start(Overrides {
        allow: vec!["only.example".into()],
        ..Overrides::default()
    })
    .await;
    let (listener, addr) = target().await;

    let (mut send, mut recv) = harness.conn.open_bi().await.unwrap();
    send.write_all(&connect_line(addr)).await.unwrap();
    assert!(recv.read_to_end(1024).await.is_err());
    assert_not_dialed(&listener).await;
}

#[tokio::test]
async fn unreachable_target_is_reset() {
    let harness = start(Overrides::default()).await;
    let (listener, addr) = target().await;
    drop(listener);

    let (mut send, mut recv) = harness.conn.open_bi().await.unwrap();
    send.write_all(&connect_line(addr)).await.unwrap();
    assert!(recv.read_to_end(1024).await.is_err());
}
