//! Per-request I/O settings from server-wide limits

use std::sync::Arc;
use veil_io::{IoConfig, TokenBucket, WsMode};
use veil_proto::{ClientRequest, RequestOptions};

/// Builds the `IoConfig` of each request
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleFactory {
    rate: u32,
    burst: u32,
}

impl ThrottleFactory {
    /// `rate` bytes per second (0 disables) with a burst of `burst` bytes
    pub fn new(rate: u32, burst: u32) -> Self {
        Self { rate, burst }
    }

    pub fn io_config(&self, request: &ClientRequest) -> IoConfig {
        IoConfig {
            bucket: TokenBucket::new(self.rate, self.burst).map(Arc::new),
            partial: request.is_set(RequestOptions::PARTIAL),
            ws: WsMode::None,
        }
    }
}
