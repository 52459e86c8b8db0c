//! Fault injection shared by the in-memory backend clients
//!
//! Every fake client call goes through [`Faults::enter`] with its
//! operation name, which counts the call, applies any configured delay and
//! returns any configured error.

use crate::error::{BackendError, BackendResult};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Fault {
    error: BackendError,
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct Inner {
    faults: HashMap<String, Fault>,
    delays: HashMap<String, Duration>,
    calls: HashMap<String, u32>,
}

#[derive(Debug, Default)]
pub struct Faults {
    inner: Mutex<Inner>,
}

impl Faults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call to `operation`
    pub fn fail(&self, operation: &str, error: BackendError) {
        self.lock().faults.insert(
            operation.to_string(),
            Fault {
                error,
                remaining: None,
            },
        );
    }

    /// Fail the next `times` calls to `operation`
    pub fn fail_times(&self, operation: &str, error: BackendError, times: u32) {
        self.lock().faults.insert(
            operation.to_string(),
            Fault {
                error,
                remaining: Some(times),
            },
        );
    }

    pub fn fail_once(&self, operation: &str, error: BackendError) {
        self.fail_times(operation, error, 1);
    }

    /// Make every call to `operation` take `delay` before doing anything
    pub fn delay(&self, operation: &str, delay: Duration) {
        self.lock().delays.insert(operation.to_string(), delay);
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.faults.clear();
        inner.delays.clear();
    }

    /// Number of calls made to `operation`
    pub fn calls(&self, operation: &str) -> u32 {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    pub async fn enter(&self, operation: &str) -> BackendResult<()> {
        let delay = {
            let mut inner = self.lock();
            *inner.calls.entry(operation.to_string()).or_default() += 1;
            inner.delays.get(operation).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        let Some(fault) = inner.faults.get_mut(operation) else {
            return Ok(());
        };
        let error = fault.error.clone();
        match &mut fault.remaining {
            None => {}
            Some(n) if *n > 1 => *n -= 1,
            Some(_) => {
                inner.faults.remove(operation);
            }
        }
        Err(error)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendErrorKind;

    #[tokio::test]
    async fn test_fail_times_then_recovers() {
        let faults = Faults::new();
        faults.fail_times("create", BackendError::transient("busy"), 2);

        assert!(faults.enter("create").await.is_err());
        assert!(faults.enter("create").await.is_err());
        assert!(faults.enter("create").await.is_ok());
        assert!(faults.enter("delete").await.is_ok());
        assert_eq!(faults.calls("create"), 3);
        assert_eq!(faults.calls("delete"), 1);
    }

    #[tokio::test]
    async fn test_persistent_fault() {
        let faults = Faults::new();
        faults.fail(
            "create",
            BackendError::new(BackendErrorKind::QuotaExceeded, "full"),
        );
        for _ in 0..3 {
            let err = faults.enter("create").await.unwrap_err();
            assert_eq!(err.kind, BackendErrorKind::QuotaExceeded);
        }
        faults.clear();
        assert!(faults.enter("create").await.is_ok());
    }
}
