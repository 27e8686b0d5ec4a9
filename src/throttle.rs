//! Token-bucket bandwidth throttle used by the resumable downloader.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Refills at `rate` bytes/second up to `capacity` bytes, context-aware: a
/// wait honours cancellation instead of blocking it out.
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    state: Mutex<(f64, Instant)>,
}

impl TokenBucket {
    /// `burst` of 0 defaults to `rate / 10`, matching the spec's bandwidth
    /// defaulting rule. `rate` of 0 means unlimited (`take` never waits).
    pub fn new(rate_bytes_per_sec: u64, burst_bytes: u64) -> Self {
        let rate = rate_bytes_per_sec as f64;
        let capacity = if burst_bytes > 0 {
            burst_bytes as f64
        } else {
            (rate / 10.0).max(1.0)
        };
        Self {
            capacity,
            rate,
            state: Mutex::new((capacity, Instant::now())),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            capacity: 0.0,
            rate: 0.0,
            state: Mutex::new((0.0, Instant::now())),
        }
    }

    fn refill(&self) -> f64 {
        let mut guard = self.state.lock().unwrap();
        let (tokens, last) = &mut *guard;
        let elapsed = last.elapsed().as_secs_f64();
        *tokens = (*tokens + elapsed * self.rate).min(self.capacity);
        *last = Instant::now();
        *tokens
    }

    fn try_take(&self, n: f64) -> bool {
        let mut guard = self.state.lock().unwrap();
        let (tokens, last) = &mut *guard;
        let elapsed = last.elapsed().as_secs_f64();
        *tokens = (*tokens + elapsed * self.rate).min(self.capacity);
        *last = Instant::now();
        if *tokens >= n {
            *tokens -= n;
            true
        } else {
            false
        }
    }

    /// Wait until `n` bytes' worth of tokens are available, or `cancel`
    /// fires. A no-op when the bucket is unlimited.
    pub async fn take(&self, n: u64, cancel: &CancellationToken) {
        if self.rate <= 0.0 {
            return;
        }
        let n = n as f64;
        loop {
            if self.try_take(n) {
                return;
            }
            let deficit = n - self.refill();
            let wait = Duration::from_secs_f64((deficit / self.rate).max(0.001));
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_never_waits() {
        let bucket = TokenBucket::unlimited();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        bucket.take(10_000_000, &cancel).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn burst_defaults_to_rate_over_ten() {
        let bucket = TokenBucket::new(1000, 0);
        assert_eq!(bucket.capacity, 100.0);
    }

    #[tokio::test]
    async fn throttles_when_exceeding_capacity() {
        let bucket = TokenBucket::new(1_000_000, 1000);
        let cancel = CancellationToken::new();
        bucket.take(1000, &cancel).await; // drains the burst instantly
        let start = Instant::now();
        bucket.take(1000, &cancel).await; // must wait for refill
        assert!(start.elapsed() >= Duration::from_millis(1));
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_wait() {
        let bucket = TokenBucket::new(10, 10);
        let cancel = CancellationToken::new();
        bucket.take(10, &cancel).await;
        cancel.cancel();
        let start = Instant::now();
        bucket.take(1_000_000, &cancel).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
