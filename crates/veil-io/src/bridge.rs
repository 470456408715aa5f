//! Ciphered relay between a client-facing stream and a plain stream

use crate::config::{IoConfig, WsMode};
use futures_util::{SinkExt, StreamExt};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};
use veil_proto::{Cipher, CipherStream, Iv};

/// Bridge errors
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Relay bytes between `downstream` (ciphered, client-facing) and `upstream`
/// (plain) until either direction ends.
///
/// Each direction runs its own keystream of `iv` from offset zero: bytes from
/// downstream are decrypted before reaching upstream, bytes from upstream are
/// encrypted before reaching downstream.
pub async fn bridge<D, U>(
    downstream: D,
    upstream: U,
    cipher: &Cipher,
    iv: &Iv,
    ioc: &IoConfig,
) -> Result<(), BridgeError>
where
    D: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    match ioc.ws {
        WsMode::None => bridge_raw(downstream, upstream, cipher, iv, ioc).await,
        WsMode::Server => bridge_ws(downstream, upstream, cipher, iv, ioc).await,
    }
}

async fn bridge_raw<D, U>(
    downstream: D,
    upstream: U,
    cipher: &Cipher,
    iv: &Iv,
    ioc: &IoConfig,
) -> Result<(), BridgeError>
where
    D: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut down_read, mut down_write) = tokio::io::split(downstream);
    let (mut up_read, mut up_write) = tokio::io::split(upstream);

    let inbound = copy(&mut up_write, &mut down_read, cipher.stream(iv), ioc);
    let outbound = copy(&mut down_write, &mut up_read, cipher.stream(iv), ioc);

    tokio::select! {
        result = inbound => {
            trace!("Bridge downstream -> upstream ended: {:?}", result);
            result?;
        }
        result = outbound => {
            trace!("Bridge upstream -> downstream ended: {:?}", result);
            result?;
        }
    }

    Ok(())
}

async fn bridge_ws<D, U>(
    downstream: D,
    upstream: U,
    cipher: &Cipher,
    iv: &Iv,
    ioc: &IoConfig,
) -> Result<(), BridgeError>
where
    D: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let ws = WebSocketStream::from_raw_socket(downstream, Role::Server, None).await;
    let (mut ws_sink, mut ws_stream) = ws.split();
    let (mut up_read, mut up_write) = tokio::io::split(upstream);

    let inbound = async {
        let mut keystream = cipher.stream(iv);
        while let Some(msg) = ws_stream.next().await {
            let mut data = match msg? {
                Message::Binary(data) => data,
                Message::Text(text) => text.into_bytes(),
                Message::Close(_) => break,
                _ => continue,
            };

            keystream.apply(&mut data);
            ioc.throttle(data.len()).await;
            up_write.write_all(&data).await?;
            up_write.flush().await?;
        }
        Ok::<(), BridgeError>(())
    };

    let outbound = async {
        let mut keystream = cipher.stream(iv);
        let mut buf = vec![0u8; ioc.chunk_size()];
        loop {
            let n = up_read.read(&mut buf).await?;
            if n == 0 {
                let _ = ws_sink.send(Message::Close(None)).await;
                break;
            }

            let mut data = buf[..n].to_vec();
            keystream.apply(&mut data);
            ioc.throttle(n).await;
            ws_sink.send(Message::Binary(data)).await?;
        }
        Ok::<(), BridgeError>(())
    };

    tokio::select! {
        result = inbound => result?,
        result = outbound => result?,
    }

    debug!("WebSocket bridge closed");
    Ok(())
}

/// Copy `src` to `dst` through `stream` until EOF, returning the byte count
pub async fn copy<W, R>(
    dst: &mut W,
    src: &mut R,
    mut stream: CipherStream,
    ioc: &IoConfig,
) -> io::Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; ioc.chunk_size()];
    let mut total = 0u64;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        stream.apply(&mut buf[..n]);
        ioc.throttle(n).await;
        dst.write_all(&buf[..n]).await?;
        if ioc.partial {
            dst.flush().await?;
        }
        total += n as u64;
    }

    dst.flush().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_encrypts() {
        let cipher = Cipher::new("key");
        let iv = [2u8; 16];
        let ioc = IoConfig::new();

        let mut src: &[u8] = b"plain text";
        let mut dst = Vec::new();
        let n = copy(&mut dst, &mut src, cipher.stream(&iv), &ioc)
            .await
            .unwrap();

        assert_eq!(n, 10);
        assert_ne!(&dst[..], b"plain text");

        cipher.stream(&iv).apply(&mut dst);
        assert_eq!(&dst[..], b"plain text");
    }

    #[tokio::test]
    async fn test_copy_partial_chunks() {
        let cipher = Cipher::new("key");
        let iv = [4u8; 16];
        let ioc = IoConfig::new().with_partial(true);

        let data = vec![7u8; 10_000];
        let mut src: &[u8] = &data;
        let mut dst = Vec::new();
        let n = copy(&mut dst, &mut src, cipher.stream(&iv), &ioc)
            .await
            .unwrap();

        assert_eq!(n, 10_000);
        cipher.stream(&iv).apply(&mut dst);
        assert_eq!(dst, data);
    }
}
