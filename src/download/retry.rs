use std::future::Future;
use std::time::Duration;

use super::daemon::DaemonError;
use crate::config::ReliabilityConfig;

/// Randomized exponential backoff for daemon RPCs.
///
/// Attempt `n` (1-based) that fails transiently waits a uniformly random
/// time between `min_wait` and `min(max_wait, multiplier * 2^(n-1))`
/// seconds. Non-transient errors are returned immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, min_wait: Duration, max_wait: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_wait,
            max_wait: max_wait.max(min_wait),
            multiplier,
        }
    }

    pub fn from_config(config: &ReliabilityConfig) -> Self {
        Self::new(
            config.rpc_max_attempts,
            Duration::from_secs_f64(config.rpc_backoff_min_secs.max(0.0)),
            Duration::from_secs_f64(config.rpc_backoff_max_secs.max(0.0)),
            config.rpc_backoff_multiplier,
        )
    }

    /// Policy used while waiting for the daemon to come up.
    pub fn startup() -> Self {
        Self::new(10, Duration::from_secs(3), Duration::from_secs(12), 2.0)
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO, 0.0)
    }

    /// Wait before retrying after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let ceiling = (self.multiplier * 2f64.powi(exponent))
            .min(self.max_wait.as_secs_f64())
            .max(self.min_wait.as_secs_f64());
        let floor = self.min_wait.as_secs_f64();
        let jitter = rand::random::<f64>();
        Duration::from_secs_f64(floor + jitter * (ceiling - floor))
    }

    /// Run `call` until it succeeds, fails permanently or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, DaemonError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DaemonError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let wait = self.backoff(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                        "Daemon call failed, retrying: {e}"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::error!(operation, attempt, "Daemon call failed, giving up: {e}");
                    }
                    return Err(e);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ReliabilityConfig::default())
    }
}
