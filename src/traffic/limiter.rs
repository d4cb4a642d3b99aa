//! Token bucket rate limiter
//!
//! Tokens are bytes. A rate of 0 means unlimited. Acquiring more tokens
//! than are available puts the bucket into debt and returns how long the
//! caller must wait, so bytes above the allowance are deferred rather than
//! dropped.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

/// A byte-per-second token bucket
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

#[derive(Debug)]
struct TokenBucket {
    rate: u64,
    tokens: f64,
    capacity: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn configure(&mut self, rate: u64) {
        self.refill();
        self.rate = rate;
        // One second of burst
        self.capacity = rate as f64;
        self.tokens = self.tokens.min(self.capacity);
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.capacity);
    }
}

impl RateLimiter {
    /// Create a limiter; 0 means unlimited
    pub fn new(bytes_per_sec: u64) -> Self {
        let mut bucket = TokenBucket {
            rate: 0,
            tokens: 0.0,
            capacity: 0.0,
            last_update: Instant::now(),
        };
        bucket.configure(bytes_per_sec);
        bucket.tokens = bucket.capacity;
        Self {
            bucket: Mutex::new(bucket),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Reconfigure the rate; takes effect for the next acquisition
    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut bucket = self.bucket.lock();
        let was_unlimited = bucket.rate == 0;
        bucket.configure(bytes_per_sec);
        if was_unlimited || bytes_per_sec == 0 {
            bucket.tokens = bucket.capacity;
        }
        trace!("Rate limiter reconfigured to {} B/s", bytes_per_sec);
    }

    pub fn rate(&self) -> u64 {
        self.bucket.lock().rate
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate() == 0
    }

    /// Take `bytes` tokens now and return how long the caller must wait
    /// before using them
    pub fn reserve(&self, bytes: usize) -> Duration {
        let mut bucket = self.bucket.lock();
        if bucket.rate == 0 {
            return Duration::ZERO;
        }
        bucket.refill();
        bucket.tokens -= bytes as f64;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / bucket.rate as f64)
        }
    }

    /// Wait until `bytes` may be transferred
    pub async fn acquire(&self, bytes: usize) {
        let wait = self.reserve(bytes);
        if !wait.is_zero() {
            trace!("Deferring {} bytes for {:?}", bytes, wait);
            tokio::time::sleep(wait).await;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_waits() {
        let limiter = RateLimiter::unlimited();
        assert!(limiter.is_unlimited());
        for _ in 0..100 {
            assert_eq!(limiter.reserve(1 << 20), Duration::ZERO);
        }
    }

    #[test]
    fn test_burst_then_wait() {
        let limiter = RateLimiter::new(1000);
        assert_eq!(limiter.reserve(1000), Duration::ZERO);

        let wait = limiter.reserve(500);
        assert!(wait > Duration::from_millis(400), "wait was {:?}", wait);
        assert!(wait <= Duration::from_millis(500));
    }

    #[test]
    fn test_large_chunk_is_deferred_not_rejected() {
        let limiter = RateLimiter::new(1000);
        let wait = limiter.reserve(3000);
        assert!(wait >= Duration::from_millis(1900));
    }

    #[test]
    fn test_set_rate_reconfigures() {
        let limiter = RateLimiter::new(1000);
        limiter.reserve(1000);
        limiter.set_rate(0);
        assert_eq!(limiter.reserve(1_000_000), Duration::ZERO);

        limiter.set_rate(100);
        assert_eq!(limiter.rate(), 100);
        assert_eq!(limiter.reserve(100), Duration::ZERO);
        assert!(limiter.reserve(100) > Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_acquire_sleeps() {
        let limiter = RateLimiter::new(10_000);
        limiter.acquire(10_000).await;
        let start = Instant::now();
        limiter.acquire(1_000).await;
        assert!(start.elapsed() >= Duration::from_millis(80));
    }
}
