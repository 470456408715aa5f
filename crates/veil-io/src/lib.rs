//! Veil relay I/O
//!
//! Per-request I/O settings, the ciphered bidirectional bridge, the
//! encrypting one-way copy, the in-process virtual duplex used by the LocalRP
//! control channel, and the datagram adapter for UDP relay.

pub mod bridge;
pub mod config;
pub mod stream;
pub mod throttle;
pub mod udp;
pub mod virtual_conn;

pub use bridge::{bridge, copy, BridgeError};
pub use config::{IoConfig, WsMode};
pub use stream::{AsyncStream, BoxedStream, PrefixedStream};
pub use throttle::TokenBucket;
pub use udp::UdpRelayConn;
pub use virtual_conn::{virtual_pair, VirtualConn, VirtualHandle};

/// Read chunk size of a regular copy
pub const COPY_CHUNK: usize = 32 * 1024;

/// Read chunk size of a copy in partial mode
pub const PARTIAL_CHUNK: usize = 4 * 1024;
