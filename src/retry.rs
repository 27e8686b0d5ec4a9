//! C1 — Idempotent retry with exponential backoff, jitter, and a
//! non-retryable marker, gated by network health.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ExportError;
use crate::network::NetworkGate;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Base delay before attempt `attempt + 1`, `attempt` starting at 1.
    /// `min(initial * multiplier^(attempt-1), max)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let scale = self.multiplier.powi((attempt as i32) - 1);
        let millis = (self.initial_delay.as_millis() as f64 * scale)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// Actual sleep duration for `attempt`: the base delay, or (if jitter is
    /// enabled) a uniform sample in `[base/2, base]`.
    pub fn sleep_duration(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let half = base.as_millis() as u64 / 2;
        let span = base.as_millis() as u64;
        if span <= half {
            return base;
        }
        let millis = rand::thread_rng().gen_range(half..=span);
        Duration::from_millis(millis)
    }
}

/// Retry engine: runs an operation with exponential backoff, parking instead
/// of consuming attempts while the network is down.
pub struct RetryEngine {
    config: RetryConfig,
    network: Option<Arc<dyn NetworkGate>>,
}

impl RetryEngine {
    pub fn new(config: RetryConfig, network: Option<Arc<dyn NetworkGate>>) -> Self {
        Self { config, network }
    }

    pub fn without_network(config: RetryConfig) -> Self {
        Self {
            config,
            network: None,
        }
    }

    /// Run `op` until it succeeds, a non-retryable error surfaces, attempts
    /// are exhausted, or `cancel` fires. `op` receives the 1-based attempt
    /// number. On final failure the error is wrapped with `label`.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        label: &str,
        mut op: F,
    ) -> Result<T, ExportError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ExportError>>,
    {
        let mut attempt = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ExportError::Cancelled.with_label(label));
            }

            let result = op(attempt).await;
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_cancelled() => return Err(err.with_label(label)),
                Err(err) if !err.is_retryable() => {
                    debug!(label, attempt, "non-retryable error, returning immediately");
                    return Err(err.with_label(label));
                }
                Err(err) => {
                    if let Some(network) = &self.network {
                        if network.state().is_down() {
                            warn!(label, "network down, parking retry without consuming attempt");
                            tokio::select! {
                                _ = network.wait_for_up() => {}
                                _ = cancel.cancelled() => {
                                    return Err(ExportError::Cancelled.with_label(label));
                                }
                            }
                            // Parked retry does not consume an attempt.
                            continue;
                        }
                    }

                    if attempt >= self.config.max_attempts {
                        warn!(label, attempt, "retry attempts exhausted");
                        return Err(err.with_label(label));
                    }

                    let delay = self.config.sleep_duration(attempt);
                    debug!(label, attempt, ?delay, "retrying after backoff");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Err(ExportError::Cancelled.with_label(label));
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_caps_at_max() {
        let cfg = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(cfg.base_delay(1), Duration::from_millis(100));
        assert_eq!(cfg.base_delay(2), Duration::from_millis(200));
        assert_eq!(cfg.base_delay(3), Duration::from_millis(400));
        assert_eq!(cfg.base_delay(10), Duration::from_secs(2));
    }

    #[test]
    fn jittered_delay_within_half_to_full() {
        let cfg = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        };
        for attempt in 1..=5 {
            let base = cfg.base_delay(attempt);
            for _ in 0..20 {
                let d = cfg.sleep_duration(attempt);
                assert!(d <= base);
                assert!(d >= base / 2);
            }
        }
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let engine = RetryEngine::without_network(RetryConfig::default());
        let cancel = CancellationToken::new();
        let result: Result<u32, ExportError> = engine
            .run(&cancel, "op", |_attempt| async { Ok(42) })
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let mut cfg = RetryConfig::default();
        cfg.initial_delay = Duration::from_millis(1);
        cfg.max_delay = Duration::from_millis(5);
        cfg.jitter = false;
        let engine = RetryEngine::without_network(cfg);
        let cancel = CancellationToken::new();
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<u32, ExportError> = engine
            .run(&cancel, "op", |attempt| {
                attempts.store(attempt, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(ExportError::Io {
                            path: "x".into(),
                            source: std::io::Error::new(std::io::ErrorKind::Other, "boom"),
                        })
                    } else {
                        Ok(99)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 99);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_returns_immediately() {
        let engine = RetryEngine::without_network(RetryConfig::default());
        let cancel = CancellationToken::new();
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<u32, ExportError> = engine
            .run(&cancel, "lookup", |attempt| {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let _ = attempt;
                async { Err(ExportError::VmNotFound { path: "/dc/vm/x".into() }) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let mut cfg = RetryConfig::default();
        cfg.max_attempts = 3;
        cfg.initial_delay = Duration::from_millis(1);
        cfg.max_delay = Duration::from_millis(2);
        let engine = RetryEngine::without_network(cfg);
        let cancel = CancellationToken::new();
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<u32, ExportError> = engine
            .run(&cancel, "op", |_attempt| {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async {
                    Err(ExportError::Io {
                        path: "x".into(),
                        source: std::io::Error::new(std::io::ErrorKind::Other, "boom"),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_returns_cancelled_error() {
        let engine = RetryEngine::without_network(RetryConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<u32, ExportError> =
            engine.run(&cancel, "op", |_attempt| async { Ok(1) }).await;
        assert!(matches!(result, Err(ExportError::Step { .. })));
    }
}
