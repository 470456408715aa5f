//! Veil Protocol Definitions
//!
//! This crate defines the request envelope, option flags, per-request cipher,
//! the LocalRP control framing and the stream multiplexing frame codec shared
//! by the server crates and by agents.

pub mod cipher;
pub mod control;
pub mod envelope;
pub mod mux;
pub mod options;
pub mod request;

pub use cipher::{Cipher, CipherStream};
pub use control::{
    ControlError, ControlFrame, ControlMessage, CorrelationToken, HEARTBEAT_LEN,
    LOCALRP_DESTINATION, MAX_DESTINATION_LEN, TOKEN_LEN,
};
pub use envelope::{strip_uri, EnvelopeCodec, EnvelopeError, SealedEnvelope, SEALED_HEADER};
pub use mux::{Frame, FrameType, MuxError, Multiplexer, StreamId};
pub use options::RequestOptions;
pub use request::{ClientRequest, Iv};

/// Length of the per-request initialization vector
pub const IV_LEN: usize = 16;

/// Maximum mux frame payload size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Response header carrying the base64 IPv4 answer of a DNS-over-tunnel request
pub const DNS_ANSWER_HEADER: &str = "ETag";
