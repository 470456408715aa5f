//! Datagram socket exposed as a byte stream
//!
//! Each datagram travels as `len u16 BE || payload`, so UDP relay can reuse
//! the byte-oriented bridge.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;

const MAX_DATAGRAM: usize = 65535;

/// A connected UDP socket speaking length-prefixed frames
#[derive(Debug)]
pub struct UdpRelayConn {
    socket: UdpSocket,
    /// Framed datagrams waiting to be read
    read_buf: BytesMut,
    /// Frame bytes written but not yet sent
    write_buf: BytesMut,
    recv_scratch: Vec<u8>,
}

impl UdpRelayConn {
    /// Wrap a socket already connected to its peer
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            recv_scratch: vec![0u8; MAX_DATAGRAM],
        }
    }

    /// Bind an ephemeral socket and connect it to `addr`
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let target = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved"))?;

        let local = if target.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        Ok(Self::new(socket))
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Send every complete frame in the write buffer
    fn poll_send_frames(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            if self.write_buf.len() < 2 {
                return Poll::Ready(Ok(()));
            }

            let len = u16::from_be_bytes([self.write_buf[0], self.write_buf[1]]) as usize;
            if self.write_buf.len() < 2 + len {
                return Poll::Ready(Ok(()));
            }

            ready!(self.socket.poll_send(cx, &self.write_buf[2..2 + len]))?;
            self.write_buf.advance(2 + len);
        }
    }
}

impl AsyncRead for UdpRelayConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.read_buf.is_empty() {
            let mut scratch = ReadBuf::new(&mut this.recv_scratch);
            ready!(this.socket.poll_recv(cx, &mut scratch))?;

            let datagram = scratch.filled();
            this.read_buf.put_u16(datagram.len() as u16);
            this.read_buf.put_slice(datagram);
        }

        let n = this.read_buf.len().min(buf.remaining());
        buf.put_slice(&this.read_buf[..n]);
        this.read_buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for UdpRelayConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;

        // Drain frames accepted earlier before taking more bytes
        ready!(this.poll_send_frames(cx))?;

        this.write_buf.extend_from_slice(buf);
        if let Poll::Ready(Err(e)) = this.poll_send_frames(cx) {
            return Poll::Ready(Err(e));
        }

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_send_frames(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_send_frames(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_frames_round_trip_through_echo() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (n, peer) = echo.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"PING");
            echo.send_to(b"PONG!", peer).await.unwrap();
        });

        let mut conn = UdpRelayConn::connect(&echo_addr.to_string()).await.unwrap();

        // split one frame across two writes
        conn.write_all(&[0, 4, b'P', b'I']).await.unwrap();
        conn.write_all(b"NG").await.unwrap();
        conn.flush().await.unwrap();

        let mut frame = [0u8; 7];
        tokio::time::timeout(Duration::from_secs(2), conn.read_exact(&mut frame))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&frame, &[0, 5, b'P', b'O', b'N', b'G', b'!']);
    }
}
