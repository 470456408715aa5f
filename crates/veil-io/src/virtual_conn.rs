//! In-process duplex connection
//!
//! The LocalRP controller talks to an agent through a [`VirtualHandle`] while
//! the paired [`VirtualConn`] is bridged to the agent's real socket, so control
//! messages take the same ciphered path as relayed data.

use std::io;
use tokio::io::{
    AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Buffer size of the in-memory pipe
const PIPE_CAPACITY: usize = 64 * 1024;

/// Bridge-facing side of a virtual pair
pub type VirtualConn = DuplexStream;

/// Process-local side of a virtual pair, shared between tasks
#[derive(Debug)]
pub struct VirtualHandle {
    reader: Mutex<ReadHalf<DuplexStream>>,
    writer: Mutex<Option<WriteHalf<DuplexStream>>>,
    closed: CancellationToken,
}

/// Create a connected handle/conn pair
pub fn virtual_pair() -> (VirtualHandle, VirtualConn) {
    let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
    let (reader, writer) = tokio::io::split(local);

    let handle = VirtualHandle {
        reader: Mutex::new(reader),
        writer: Mutex::new(Some(writer)),
        closed: CancellationToken::new(),
    };

    (handle, remote)
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "virtual connection closed")
}

impl VirtualHandle {
    /// Write the whole buffer to the peer
    pub async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut guard = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = self.closed.cancelled() => return Err(closed_error()),
        };
        let writer = guard.as_mut().ok_or_else(closed_error)?;

        tokio::select! {
            result = async {
                writer.write_all(buf).await?;
                writer.flush().await
            } => result,
            _ = self.closed.cancelled() => Err(closed_error()),
        }
    }

    /// Fill the buffer from the peer
    pub async fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut reader = tokio::select! {
            guard = self.reader.lock() => guard,
            _ = self.closed.cancelled() => return Err(closed_error()),
        };

        tokio::select! {
            result = reader.read_exact(buf) => result.map(|_| ()),
            _ = self.closed.cancelled() => Err(closed_error()),
        }
    }

    /// Unblock pending operations and deliver EOF to the peer
    pub async fn close(&self) {
        self.closed.cancel();

        let mut writer = self.writer.lock().await;
        if let Some(mut w) = writer.take() {
            let _ = w.shutdown().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_handle_to_conn() {
        let (handle, mut conn) = virtual_pair();

        handle.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        conn.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 5];
        handle.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (handle, _conn) = virtual_pair();
        let handle = Arc::new(handle);

        let reader = handle.clone();
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            reader.read_exact(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
        assert!(handle.is_closed());
        assert!(handle.write_all(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_close_delivers_eof() {
        let (handle, mut conn) = virtual_pair();
        handle.close().await;

        let mut buf = Vec::new();
        let n = conn.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
