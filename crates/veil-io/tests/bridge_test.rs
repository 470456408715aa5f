//! Integration tests for the ciphered bridge over real loopback sockets

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use veil_io::{bridge, virtual_pair, IoConfig, TokenBucket, WsMode};
use veil_proto::Cipher;

/// Start a TCP echo server and return its address
async fn start_echo() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });

    addr
}

/// Accept one client connection and bridge it to `upstream_addr`
async fn start_bridge(ioc: IoConfig, cipher: Cipher, iv: [u8; 16]) -> std::net::SocketAddr {
    let upstream_addr = start_echo().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (downstream, _) = listener.accept().await.unwrap();
        let upstream = TcpStream::connect(upstream_addr).await.unwrap();
        let _ = bridge(downstream, upstream, &cipher, &iv, &ioc).await;
    });

    addr
}

#[tokio::test]
async fn test_bridge_raw_echo() {
    let cipher = Cipher::new("bridge-key");
    let iv = [11u8; 16];
    let addr = start_bridge(IoConfig::new(), cipher.clone(), iv).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut send = cipher.stream(&iv);
    let mut recv = cipher.stream(&iv);

    for chunk in [&b"PING"[..], &b"second message"[..]] {
        let mut out = chunk.to_vec();
        send.apply(&mut out);
        client.write_all(&out).await.unwrap();

        let mut back = vec![0u8; chunk.len()];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut back))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(&back[..], chunk);

        recv.apply(&mut back);
        assert_eq!(&back[..], chunk);
    }
}

#[tokio::test]
async fn test_bridge_with_throttle() {
    let cipher = Cipher::new("bridge-key");
    let iv = [12u8; 16];
    let bucket = TokenBucket::new(64 * 1024, 0).unwrap();
    let ioc = IoConfig::new()
        .with_bucket(std::sync::Arc::new(bucket))
        .with_partial(true);
    let addr = start_bridge(ioc, cipher.clone(), iv).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let payload: Vec<u8> = (0..16 * 1024).map(|i| (i % 251) as u8).collect();

    let mut out = payload.clone();
    cipher.stream(&iv).apply(&mut out);
    client.write_all(&out).await.unwrap();

    let mut back = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut back))
        .await
        .unwrap()
        .unwrap();
    cipher.stream(&iv).apply(&mut back);
    assert_eq!(back, payload);
}

#[tokio::test]
async fn test_bridge_websocket_mode() {
    let cipher = Cipher::new("bridge-key");
    let iv = [13u8; 16];
    let ioc = IoConfig::new().with_ws(WsMode::Server);
    let addr = start_bridge(ioc, cipher.clone(), iv).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut ws = WebSocketStream::from_raw_socket(stream, Role::Client, None).await;

    let mut out = b"PING".to_vec();
    cipher.stream(&iv).apply(&mut out);
    ws.send(Message::Binary(out)).await.unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let mut data = match msg {
        Message::Binary(data) => data,
        other => panic!("unexpected message: {:?}", other),
    };
    cipher.stream(&iv).apply(&mut data);
    assert_eq!(&data[..], b"PING");
}

#[tokio::test]
async fn test_bridge_to_virtual_conn() {
    let cipher = Cipher::new("bridge-key");
    let iv = [14u8; 16];
    let (handle, conn) = virtual_pair();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let bridge_cipher = cipher.clone();
    let task = tokio::spawn(async move {
        let (downstream, _) = listener.accept().await.unwrap();
        let _ = bridge(downstream, conn, &bridge_cipher, &iv, &IoConfig::new()).await;
    });

    let mut agent = TcpStream::connect(addr).await.unwrap();
    handle.write_all(&[0u8; 16]).await.unwrap();

    let mut ping = [0u8; 16];
    agent.read_exact(&mut ping).await.unwrap();
    cipher.stream(&iv).apply(&mut ping);
    assert_eq!(ping, [0u8; 16]);

    let mut pong = [1u8; 16];
    cipher.stream(&iv).apply(&mut pong);
    agent.write_all(&pong).await.unwrap();

    let mut got = [0u8; 16];
    handle.read_exact(&mut got).await.unwrap();
    assert_eq!(got, [1u8; 16]);

    // closing the handle ends the bridge and the agent sees EOF
    handle.close().await;
    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(2), agent.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
    let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
}
