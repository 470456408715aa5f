//! Mux framing for upgraded connections
//!
//! ```text
//! stream_id u32 BE || type u8 || flags u8 || length u32 BE || payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Stream identifier
pub type StreamId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Open = 0,
    Data = 1,
    Close = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Open),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            _ => Err(MuxError::InvalidFrameType(value)),
        }
    }
}

/// One mux frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    /// Reserved; written as zero and ignored on read
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub const HEADER_SIZE: usize = 10;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: 0,
            payload,
        }
    }

    pub fn open(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Open, Bytes::new())
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
    }

    /// Wire bytes of this frame
    pub fn encode(&self) -> Result<Bytes, MuxError> {
        let len = self.payload.len();
        if len > crate::MAX_FRAME_SIZE as usize {
            return Err(MuxError::FrameTooLarge(len));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + len);
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags);
        buf.put_u32(len as u32);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Read one frame; a clean end of stream surfaces as `UnexpectedEof`
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, MuxError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; Self::HEADER_SIZE];
        reader.read_exact(&mut header).await?;

        let mut head = &header[..];
        let stream_id = head.get_u32();
        let frame_type = FrameType::try_from(head.get_u8())?;
        let flags = head.get_u8();
        let length = head.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(MuxError::FrameTooLarge(length as usize));
        }

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload).await?;

        trace!(stream_id, ?frame_type, length, "mux frame read");

        Ok(Self {
            stream_id,
            frame_type,
            flags,
            payload: Bytes::from(payload),
        })
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), MuxError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode()?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Stream already open: {0}")]
    StreamAlreadyOpen(StreamId),
}

/// Open sub-streams of one mux session.
///
/// Each open gets a fresh generation, so a stream id reused after a peer
/// close is never released by the task that served its previous use.
#[derive(Default)]
pub struct Multiplexer {
    inner: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    next_generation: u64,
    open: HashMap<StreamId, u64>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a stream opened by the peer and return its generation
    pub fn open(&self, stream_id: StreamId) -> Result<u64, MuxError> {
        let mut registry = self.registry();
        if registry.open.contains_key(&stream_id) {
            return Err(MuxError::StreamAlreadyOpen(stream_id));
        }

        registry.next_generation += 1;
        let generation = registry.next_generation;
        registry.open.insert(stream_id, generation);
        Ok(generation)
    }

    /// Forget a stream the peer closed; its id may be opened again
    pub fn release(&self, stream_id: StreamId) {
        self.registry().open.remove(&stream_id);
    }

    /// Forget a stream whose local side ended, unless the id was reused
    pub fn finish(&self, stream_id: StreamId, generation: u64) {
        let mut registry = self.registry();
        if registry.open.get(&stream_id) == Some(&generation) {
            registry.open.remove(&stream_id);
        }
    }

    pub fn active_streams(&self) -> usize {
        self.registry().open.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_stream_io() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        Frame::open(7).write_to(&mut a).await.unwrap();
        Frame::data(7, Bytes::from_static(b"PING"))
            .write_to(&mut a)
            .await
            .unwrap();

        let open = Frame::read_from(&mut b).await.unwrap();
        assert_eq!(open.frame_type, FrameType::Open);
        assert_eq!(open.stream_id, 7);

        let data = Frame::read_from(&mut b).await.unwrap();
        assert_eq!(data.frame_type, FrameType::Data);
        assert_eq!(&data.payload[..], b"PING");
    }

    #[tokio::test]
    async fn test_frame_rejects_unknown_type() {
        let mut raw = Frame::open(1).encode().unwrap().to_vec();
        raw[4] = 9;

        let mut reader = &raw[..];
        assert!(matches!(
            Frame::read_from(&mut reader).await,
            Err(MuxError::InvalidFrameType(9))
        ));
    }

    #[tokio::test]
    async fn test_frame_rejects_oversized_length() {
        let mut raw = Frame::data(1, Bytes::new()).encode().unwrap().to_vec();
        raw[6..10].copy_from_slice(&(crate::MAX_FRAME_SIZE + 1).to_be_bytes());

        let mut reader = &raw[..];
        assert!(matches!(
            Frame::read_from(&mut reader).await,
            Err(MuxError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_open_twice_is_refused() {
        let mux = Multiplexer::new();

        mux.open(1).unwrap();
        mux.open(3).unwrap();
        assert!(matches!(mux.open(1), Err(MuxError::StreamAlreadyOpen(1))));
        assert_eq!(mux.active_streams(), 2);
    }

    #[test]
    fn test_stale_finish_keeps_reopened_stream() {
        let mux = Multiplexer::new();

        let first = mux.open(5).unwrap();
        mux.release(5);
        let second = mux.open(5).unwrap();
        assert_ne!(first, second);

        mux.finish(5, first);
        assert_eq!(mux.active_streams(), 1);
        assert!(mux.open(5).is_err());

        mux.finish(5, second);
        assert_eq!(mux.active_streams(), 0);
    }
}
