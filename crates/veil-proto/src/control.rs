//! LocalRP control channel framing
//!
//! The server writes two kinds of frames to a registered agent:
//!
//! - heartbeat ping: 16 zero bytes, answered by the agent with any 16 bytes
//! - request notification: `token(16) || u32 BE len(raw) || raw`
//!
//! The agent answers a notification by opening a new connection whose
//! destination is the lowercase hex of the token.

use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Destination that marks an agent registration
pub const LOCALRP_DESTINATION: &str = "localrp";

/// Length of a correlation token in bytes
pub const TOKEN_LEN: usize = 16;

/// Length of heartbeat ping and pong frames
pub const HEARTBEAT_LEN: usize = 16;

/// Destinations of this length or more are refused by the routing loop
pub const MAX_DESTINATION_LEN: usize = 65535;

/// Control framing errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request too large: {0} bytes")]
    RequestTooLarge(usize),

    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

/// Random key correlating a queued request with the agent's follow-up connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationToken([u8; TOKEN_LEN]);

impl CorrelationToken {
    /// Mint a token from the OS RNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ControlError> {
        let decoded = hex::decode(s).map_err(|_| ControlError::InvalidToken(s.to_string()))?;
        let bytes: [u8; TOKEN_LEN] = decoded
            .try_into()
            .map_err(|_| ControlError::InvalidToken(s.to_string()))?;
        Ok(Self(bytes))
    }

    /// The all-zero value is reserved for heartbeat pings
    pub fn is_ping(&self) -> bool {
        self.0 == [0u8; TOKEN_LEN]
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Notification of one queued request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub token: CorrelationToken,
    pub raw_request: Bytes,
}

impl ControlMessage {
    pub fn new(token: CorrelationToken, raw_request: Bytes) -> Self {
        Self { token, raw_request }
    }

    pub fn encode(&self) -> Result<Bytes, ControlError> {
        let len = self.raw_request.len();
        if len > u32::MAX as usize {
            return Err(ControlError::RequestTooLarge(len));
        }

        let mut buf = BytesMut::with_capacity(TOKEN_LEN + 4 + len);
        buf.put_slice(self.token.as_bytes());
        buf.put_u32(len as u32);
        buf.put_slice(&self.raw_request);
        Ok(buf.freeze())
    }

    /// Read the length-prefixed body that follows an already-read token
    async fn read_body<R>(token: CorrelationToken, reader: &mut R) -> Result<Self, ControlError>
    where
        R: AsyncRead + Unpin,
    {
        let len = reader.read_u32().await? as usize;
        let mut raw = vec![0u8; len];
        reader.read_exact(&mut raw).await?;
        Ok(Self::new(token, Bytes::from(raw)))
    }
}

/// A frame as seen by the agent side of the control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    Ping,
    Request(ControlMessage),
}

impl ControlFrame {
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ControlError>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; TOKEN_LEN];
        reader.read_exact(&mut head).await?;

        let token = CorrelationToken::from_bytes(head);
        if token.is_ping() {
            return Ok(ControlFrame::Ping);
        }

        Ok(ControlFrame::Request(
            ControlMessage::read_body(token, reader).await?,
        ))
    }
}
