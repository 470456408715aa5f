//! Per-request I/O settings

use crate::throttle::TokenBucket;
use std::sync::Arc;

/// How the downstream side of a bridge is framed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WsMode {
    /// Raw bytes
    #[default]
    None,
    /// WebSocket binary messages, server role
    Server,
}

/// I/O settings built fresh for every request
#[derive(Debug, Clone, Default)]
pub struct IoConfig {
    pub bucket: Option<Arc<TokenBucket>>,
    /// Small chunks, flushed one by one
    pub partial: bool,
    pub ws: WsMode,
}

impl IoConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(mut self, bucket: Arc<TokenBucket>) -> Self {
        self.bucket = Some(bucket);
        self
    }

    pub fn with_partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    pub fn with_ws(mut self, ws: WsMode) -> Self {
        self.ws = ws;
        self
    }

    /// Read chunk size of copies under this config
    pub fn chunk_size(&self) -> usize {
        if self.partial {
            crate::PARTIAL_CHUNK
        } else {
            crate::COPY_CHUNK
        }
    }

    /// Wait until `n` bytes may pass the token bucket, if any
    pub async fn throttle(&self, n: usize) {
        if let Some(bucket) = &self.bucket {
            bucket.consume(n).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let ioc = IoConfig::new();
        assert!(ioc.bucket.is_none());
        assert!(!ioc.partial);
        assert_eq!(ioc.ws, WsMode::None);
        assert_eq!(ioc.chunk_size(), crate::COPY_CHUNK);
    }

    #[test]
    fn test_partial_chunk() {
        let ioc = IoConfig::new().with_partial(true).with_ws(WsMode::Server);
        assert_eq!(ioc.chunk_size(), crate::PARTIAL_CHUNK);
        assert_eq!(ioc.ws, WsMode::Server);
    }
}
