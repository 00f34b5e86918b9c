//! Per-user token-bucket rate limiting
//!
//! One bucket paces one direction of one user's traffic. Contention is
//! per-user, so the mutex around the bucket state is never a global choke
//! point. The sleep that actually paces the flow happens outside the lock.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::time;

/// Upper bound on a single pacing wait. Over-rate flows get paced, never
/// hard-stalled.
pub const RATE_LIMIT_WAIT_MAX: Duration = Duration::from_millis(50);

/// Burst allowance in bytes for freshly created buckets
pub const BUCKET_BURST: i64 = 4096;

struct State {
    /// tokens per second
    rate: f64,
    /// maximum accumulated tokens
    burst: i64,
    /// the configured Mbps this bucket was built from, kept for equality
    /// checks against credential updates
    origin_rate: i64,
    available: f64,
    last_refill: Instant,
}

impl State {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.available = (self.available + elapsed * self.rate).min(self.burst as f64);
        self.last_refill = now;
    }
}

pub struct Bucket {
    state: Mutex<State>,
}

impl Bucket {
    /// `rate` in tokens (bytes) per second, `origin_rate` in Mbps
    pub fn new(rate: f64, burst: i64, origin_rate: i64) -> Bucket {
        Bucket {
            state: Mutex::new(State {
                rate,
                burst,
                origin_rate,
                available: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn origin_rate(&self) -> i64 {
        self.state.lock().expect("bucket poisoned").origin_rate
    }

    /// Atomically swap the rate and reset the refill clock. Used when a
    /// user's configured bandwidth changes under a live bucket.
    pub fn update_rate(&self, rate: f64, origin_rate: i64) {
        let mut state = self.state.lock().expect("bucket poisoned");
        state.rate = rate;
        state.origin_rate = origin_rate;
        state.last_refill = Instant::now();
    }

    /// Take `n` tokens, sleeping for the refill time if they are not all
    /// available yet. If the required wait exceeds `max_wait` the tokens
    /// are not taken and the call returns immediately: pacing is best
    /// effort and never turns into a hard stall or an error.
    pub async fn wait_max(&self, n: i64, max_wait: Duration) {
        let sleep_for = {
            let mut state = self.state.lock().expect("bucket poisoned");
            let now = Instant::now();
            state.refill(now);

            let deficit = n as f64 - state.available;
            if deficit <= 0.0 {
                state.available -= n as f64;
                None
            } else {
                let wait = Duration::from_secs_f64(deficit / state.rate);
                if wait > max_wait {
                    None
                } else {
                    state.available -= n as f64;
                    Some(wait)
                }
            }
        };

        if let Some(wait) = sleep_for {
            time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn under_rate_does_not_sleep() {
        let bucket = Bucket::new(125_000.0, BUCKET_BURST, 1);
        let start = Instant::now();
        bucket.wait_max(1024, RATE_LIMIT_WAIT_MAX).await;
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn over_burst_paces_within_cap() {
        // 1 MB/s, burst already drained
        let bucket = Bucket::new(1_000_000.0, BUCKET_BURST, 8);
        bucket.wait_max(BUCKET_BURST, RATE_LIMIT_WAIT_MAX).await;

        // 4096 more bytes need ~4.1ms of refill, inside the cap
        let start = Instant::now();
        bucket.wait_max(4096, RATE_LIMIT_WAIT_MAX).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(3), "waited {waited:?}");
        assert!(waited <= RATE_LIMIT_WAIT_MAX + Duration::from_millis(25));
    }

    #[tokio::test]
    async fn wait_beyond_cap_returns_immediately() {
        // 1 KB/s: refilling 4096 tokens takes seconds, way past the cap
        let bucket = Bucket::new(1024.0, BUCKET_BURST, 1);
        bucket.wait_max(BUCKET_BURST, RATE_LIMIT_WAIT_MAX).await;

        let start = Instant::now();
        bucket.wait_max(4096, RATE_LIMIT_WAIT_MAX).await;
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn update_rate_swaps_origin() {
        let bucket = Bucket::new(125_000.0, BUCKET_BURST, 1);
        assert_eq!(bucket.origin_rate(), 1);
        bucket.update_rate(1_250_000.0, 10);
        assert_eq!(bucket.origin_rate(), 10);
    }
}
