//! Mux sessions on upgraded connections
//!
//! A Connect request carrying the MuxUpgrade option turns its connection into
//! a frame multiplexer. Each sub-stream opened by the peer is handed to the
//! server's accept queue and dispatched like a freshly accepted connection.

use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};
use veil_io::{BoxedStream, COPY_CHUNK};
use veil_proto::{Frame, FrameType, MuxError, Multiplexer, StreamId};

/// A sub-stream waiting to be dispatched, with the parent's peer address
pub type Accepted = (BoxedStream, SocketAddr);

/// Outgoing frames buffered per session
const FRAME_QUEUE: usize = 256;

/// Incoming data frames buffered per sub-stream before it is reset
const STREAM_BUFFER: usize = 64;

/// Serve one mux session until the parent connection ends
pub async fn serve_mux(
    stream: BoxedStream,
    peer: SocketAddr,
    accept_tx: mpsc::Sender<Accepted>,
) -> Result<(), MuxError> {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(FRAME_QUEUE);
    let mux = Arc::new(Multiplexer::new());

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if let Err(e) = frame.write_to(&mut writer).await {
                debug!("Mux writer stopped: {}", e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut streams: HashMap<StreamId, mpsc::Sender<Bytes>> = HashMap::new();

    let result = loop {
        let frame = match Frame::read_from(&mut reader).await {
            Ok(frame) => frame,
            Err(MuxError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break Ok(()),
            Err(e) => break Err(e),
        };
        let stream_id = frame.stream_id;

        match frame.frame_type {
            FrameType::Open => {
                let generation = match mux.open(stream_id) {
                    Ok(generation) => generation,
                    Err(e) => {
                        debug!(peer = %peer, "Ignoring mux open: {}", e);
                        continue;
                    }
                };

                let (local, remote) = tokio::io::duplex(COPY_CHUNK * 2);
                let (local_read, local_write) = tokio::io::split(local);
                let (data_tx, data_rx) = mpsc::channel(STREAM_BUFFER);
                streams.insert(stream_id, data_tx);

                tokio::spawn(feed(data_rx, local_write));
                tokio::spawn(pump(
                    stream_id,
                    generation,
                    local_read,
                    frame_tx.clone(),
                    mux.clone(),
                ));

                if accept_tx.send((Box::new(remote), peer)).await.is_err() {
                    debug!("Accept queue closed, ending mux session");
                    break Ok(());
                }
                trace!(stream_id, peer = %peer, "Mux stream opened");
            }
            FrameType::Data => {
                let Some(sub) = streams.get(&stream_id) else {
                    trace!(stream_id, "Data for unknown mux stream");
                    continue;
                };
                match sub.try_send(frame.payload) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        debug!(stream_id, peer = %peer, "Mux stream overrun, resetting");
                        streams.remove(&stream_id);
                        mux.release(stream_id);
                        let _ = frame_tx.send(Frame::close(stream_id)).await;
                    }
                    Err(TrySendError::Closed(_)) => {
                        streams.remove(&stream_id);
                        let _ = frame_tx.send(Frame::close(stream_id)).await;
                    }
                }
            }
            FrameType::Close => {
                streams.remove(&stream_id);
                mux.release(stream_id);
            }
        }
    };

    debug!(
        peer = %peer,
        open_streams = mux.active_streams(),
        "Mux session ended"
    );
    drop(streams);
    drop(frame_tx);
    let _ = writer_task.await;
    result
}

/// Deliver the peer's data to a sub-stream, then end its input
async fn feed(mut data: mpsc::Receiver<Bytes>, mut sink: WriteHalf<DuplexStream>) {
    while let Some(chunk) = data.recv().await {
        if sink.write_all(&chunk).await.is_err() {
            break;
        }
    }
    let _ = sink.shutdown().await;
}

/// Frame everything a sub-stream writes, then close it
async fn pump(
    stream_id: StreamId,
    generation: u64,
    mut source: ReadHalf<DuplexStream>,
    frames: mpsc::Sender<Frame>,
    mux: Arc<Multiplexer>,
) {
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        match source.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let frame = Frame::data(stream_id, Bytes::copy_from_slice(&buf[..n]));
                if frames.send(frame).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = frames.send(Frame::close(stream_id)).await;
    mux.finish(stream_id, generation);
    trace!(stream_id, generation, "Mux stream closed");
}
