// =============================================================================
// Rate Limiter — token bucket per endpoint class
// =============================================================================
//
// Cooperative token bucket keyed by a short string that groups related
// endpoints under one quota (e.g. "order", "market_data", "account"). Tokens
// refill linearly over a 60 s window. `acquire` suspends the caller until
// enough capacity is available rather than rejecting the call — callers never
// see a rate-limit error, only latency.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::debug;

const WINDOW: Duration = Duration::from_secs(60);

struct Bucket {
    capacity: f64,
    remaining: f64,
    window_start: Instant,
}

impl Bucket {
    fn new(capacity: u32) -> Self {
        Self {
            capacity: capacity as f64,
            remaining: capacity as f64,
            window_start: Instant::now(),
        }
    }

    /// Refill tokens linearly based on elapsed time, capping at `capacity`.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= WINDOW {
            self.remaining = self.capacity;
            self.window_start = now;
            return;
        }
        let refill_rate = self.capacity / WINDOW.as_secs_f64();
        let refilled = refill_rate * elapsed.as_secs_f64();
        if refilled > 0.0 {
            self.remaining = (self.remaining + refilled).min(self.capacity);
            self.window_start = now;
        }
    }

    /// Seconds until `weight` tokens will be available, given current state.
    fn wait_secs(&self, weight: f64) -> f64 {
        if self.remaining >= weight {
            return 0.0;
        }
        let refill_rate = self.capacity / WINDOW.as_secs_f64();
        if refill_rate <= 0.0 {
            return 0.0;
        }
        (weight - self.remaining) / refill_rate
    }
}

/// Cooperative, per-endpoint-class token bucket rate limiter.
///
/// One instance is typically owned per venue connector; endpoint classes are
/// venue-defined strings ("order", "market_data", ...).
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    default_capacity: u32,
}

impl RateLimiter {
    pub fn new(default_capacity: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Register (or re-register) the per-minute capacity for an endpoint
    /// class. Safe to call at any time; resets that bucket's accounting.
    pub fn configure(&self, endpoint_class: &str, capacity_per_minute: u32) {
        let mut buckets = self.buckets.lock();
        buckets.insert(endpoint_class.to_string(), Bucket::new(capacity_per_minute));
    }

    /// Acquire `weight` tokens from `endpoint_class`'s bucket, suspending the
    /// caller until capacity is available. Unknown endpoint classes fall back
    /// to a bucket sized `default_capacity` (fails closed rather than open).
    pub async fn acquire(&self, endpoint_class: &str, weight: u32) {
        let weight = weight.max(1) as f64;
        loop {
            let wait = {
                let mut buckets = self.buckets.lock();
                let bucket = buckets
                    .entry(endpoint_class.to_string())
                    .or_insert_with(|| Bucket::new(self.default_capacity));
                let now = Instant::now();
                bucket.refill(now);
                let wait = bucket.wait_secs(weight);
                if wait <= 0.0 {
                    bucket.remaining -= weight;
                }
                wait
            };

            if wait <= 0.0 {
                return;
            }

            debug!(endpoint_class, wait_secs = wait, "rate limiter suspending acquirer");
            sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(1200)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_within_capacity_does_not_suspend() {
        let limiter = RateLimiter::new(10);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire("order", 1).await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn unknown_endpoint_class_uses_default_capacity() {
        let limiter = RateLimiter::new(5);
        limiter.acquire("anything", 5).await;
        let buckets = limiter.buckets.lock();
        let bucket = buckets.get("anything").unwrap();
        assert!(bucket.remaining < 1.0);
    }

    #[test]
    fn bucket_wait_secs_is_zero_within_capacity() {
        let bucket = Bucket::new(5);
        assert_eq!(bucket.wait_secs(5.0), 0.0);
    }

    #[test]
    fn bucket_wait_secs_positive_when_exhausted() {
        let mut bucket = Bucket::new(5);
        bucket.remaining = 0.0;
        assert!(bucket.wait_secs(1.0) > 0.0);
    }

    #[test]
    fn configure_resets_bucket_capacity() {
        let limiter = RateLimiter::new(5);
        limiter.configure("order", 100);
        let buckets = limiter.buckets.lock();
        let bucket = buckets.get("order").unwrap();
        assert_eq!(bucket.capacity, 100.0);
    }
}
