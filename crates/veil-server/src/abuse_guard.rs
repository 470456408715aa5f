//! Invalid-request accounting per client address

use lru::LruCache;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Mutex;

const DEFAULT_CAPACITY: usize = 128;

/// Bounded address -> hit count map with LRU eviction
pub struct AbuseGuard {
    hits: Mutex<LruCache<IpAddr, u32>>,
}

impl AbuseGuard {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity
        };
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            hits: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Count one invalid request from `addr`
    pub fn record(&self, addr: IpAddr) {
        if let Ok(mut hits) = self.hits.lock() {
            match hits.get_mut(&addr) {
                Some(count) => *count = count.saturating_add(1),
                None => {
                    hits.put(addr, 1);
                }
            }
        }
    }

    /// Invalid requests seen from `addr`, 0 when unknown
    pub fn hits(&self, addr: IpAddr) -> u32 {
        self.hits
            .lock()
            .ok()
            .and_then(|hits| hits.peek(&addr).copied())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.hits.lock().map(|hits| hits.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AbuseGuard {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn test_record_and_hits() {
        let guard = AbuseGuard::new(4);
        assert_eq!(guard.hits(ip(1)), 0);

        guard.record(ip(1));
        guard.record(ip(1));
        guard.record(ip(2));

        assert_eq!(guard.hits(ip(1)), 2);
        assert_eq!(guard.hits(ip(2)), 1);
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn test_evicts_least_recent() {
        let guard = AbuseGuard::new(2);
        guard.record(ip(1));
        guard.record(ip(2));
        guard.record(ip(1));
        guard.record(ip(3));

        assert_eq!(guard.len(), 2);
        assert_eq!(guard.hits(ip(2)), 0);
        assert_eq!(guard.hits(ip(1)), 2);
        assert_eq!(guard.hits(ip(3)), 1);
    }

    #[test]
    fn test_zero_capacity_uses_default() {
        let guard = AbuseGuard::new(0);
        for i in 0..=255u8 {
            guard.record(ip(i));
        }
        assert_eq!(guard.len(), DEFAULT_CAPACITY);
    }
}
