//! Byte-rate token bucket

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use std::fmt;
use std::num::NonZeroU32;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token bucket shared by every copy of one request
pub struct TokenBucket {
    limiter: DirectLimiter,
    rate: u32,
    burst: u32,
}

impl TokenBucket {
    /// `rate` bytes per second with a burst of `burst` bytes (at least `rate`).
    /// Returns `None` for a zero rate.
    pub fn new(rate: u32, burst: u32) -> Option<Self> {
        let rate_nz = NonZeroU32::new(rate)?;
        let burst = burst.max(rate);
        let burst_nz = NonZeroU32::new(burst)?;

        let quota = Quota::per_second(rate_nz).allow_burst(burst_nz);
        Some(Self {
            limiter: RateLimiter::direct(quota),
            rate,
            burst,
        })
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Wait until `n` bytes worth of tokens are available
    pub async fn consume(&self, n: usize) {
        let mut remaining = n;
        while remaining > 0 {
            let chunk = remaining.min(self.burst as usize);
            if let Some(cells) = NonZeroU32::new(chunk as u32) {
                // chunk never exceeds the burst, so capacity is always sufficient
                let _ = self.limiter.until_n_ready(cells).await;
            }
            remaining -= chunk;
        }
    }
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .finish()
    }
}
