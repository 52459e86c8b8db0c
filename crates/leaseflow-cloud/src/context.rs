//! Per-call deadline and cancellation

use crate::error::{CloudError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deadline and cancellation carried by every adapter operation
///
/// Every backend call is raced against both. Losing the race drops the
/// in-flight future, which cancels the request where the client supports
/// it; the adapter then reconciles on the next status query.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl OperationContext {
    /// No deadline, never cancelled unless the token is
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fresh context for teardown after a failed or cancelled operation
    pub fn detached(timeout: Duration) -> Self {
        Self::with_timeout(timeout)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Run `fut` bounded by this context
    pub async fn run<F>(&self, what: &str, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        if self.cancel.is_cancelled() {
            return Err(CloudError::Cancelled(what.to_string()));
        }

        let deadline = self.deadline;
        let bounded = async move {
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
                None => Some(fut.await),
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CloudError::Cancelled(what.to_string())),
            out = bounded => out.ok_or_else(|| CloudError::Timeout(what.to_string())),
        }
    }

    /// Sleep unless the context ends first
    pub async fn sleep(&self, what: &str, duration: Duration) -> Result<()> {
        self.run(what, tokio::time::sleep(duration)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_within_deadline() {
        let ctx = OperationContext::with_timeout(Duration::from_secs(5));
        let value = tokio_test::assert_ok!(ctx.run("quick", async { 7 }).await);
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out() {
        let ctx = OperationContext::with_timeout(Duration::from_secs(1));
        let result = ctx
            .run("slow", tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert!(matches!(result, Err(CloudError::Timeout(what)) if what == "slow"));
    }

    #[tokio::test]
    async fn test_cancelled_context_short_circuits() {
        let ctx = OperationContext::new();
        ctx.cancel_token().cancel();
        let result = ctx.run("anything", async { 1 }).await;
        assert!(matches!(result, Err(CloudError::Cancelled(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_call() {
        let ctx = OperationContext::new();
        let token = ctx.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });
        let result = ctx
            .run("long", tokio::time::sleep(Duration::from_secs(60)))
            .await;
        assert!(matches!(result, Err(CloudError::Cancelled(_))));
    }
}
