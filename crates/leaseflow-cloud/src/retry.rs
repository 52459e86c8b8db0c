//! Bounded retry and polling with exponential backoff

use crate::context::OperationContext;
use crate::error::{BackendResult, CloudError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Retry configuration for backend calls
///
/// Only transient failures are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay, in milliseconds
    pub max_delay_ms: u64,

    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            ..Self::default()
        }
    }

    /// No retries at all
    pub fn none() -> Self {
        Self::new(1, 0)
    }

    /// Delay after the given failed attempt (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis((delay as u64).min(self.max_delay_ms))
    }
}

/// Polling configuration for waiting on backend progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub max_interval_ms: u64,
    /// Hard bound on polls when the context has no deadline
    pub max_polls: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            max_interval_ms: 15_000,
            max_polls: 120,
        }
    }
}

impl PollConfig {
    fn delay_for_poll(&self, poll: u32) -> Duration {
        let delay = self.interval_ms.saturating_mul(1u64 << poll.min(16));
        Duration::from_millis(delay.min(self.max_interval_ms))
    }
}

/// Call `op` until it succeeds, fails non-transiently, or attempts run out
pub async fn retry<T, F, Fut>(
    policy: &RetryConfig,
    ctx: &OperationContext,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match ctx.run(operation, op()).await? {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(CloudError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient backend error, retrying"
                );
                ctx.sleep(operation, delay).await?;
            }
            Err(e) => return Err(CloudError::backend(operation, e)),
        }
    }
}

/// Poll `check` until it yields a value
///
/// `check` returns `Ok(None)` while the backend is still working. The wait
/// is bounded by the context deadline and by `max_polls`.
pub async fn poll_until<T, F, Fut>(
    config: &PollConfig,
    ctx: &OperationContext,
    what: &str,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    for poll in 0..config.max_polls.max(1) {
        if let Some(value) = ctx.run(what, check()).await?? {
            return Ok(value);
        }
        let delay = config.delay_for_poll(poll);
        tracing::debug!(what, poll, delay_ms = delay.as_millis() as u64, "waiting");
        ctx.sleep(what, delay).await?;
    }
    Err(CloudError::Timeout(format!(
        "{} (gave up after {} polls)",
        what, config.max_polls
    )))
}
