//! Per-scanner-instance circuit breaker.
//!
//! CLOSED -> OPEN on `failure_threshold` consecutive failures. OPEN fails
//! fast until `recovery_timeout` has elapsed, then allows a bounded number of
//! HALF_OPEN probes. A successful probe closes the breaker and resets
//! counters; a failed probe reopens it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use scanforge_core::error::{Result, ScanforgeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Numeric encoding used by the `circuit_state{instance}` gauge:
    /// 0=CLOSED, 1=OPEN, 2=HALF_OPEN.
    pub fn as_metric_value(self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerOptions {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max: u32,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max: 1,
        }
    }
}

struct Inner {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

/// One breaker per scanner instance. Wraps every adapter call; the worker
/// treats a fail-fast response the same as a scanner failure for
/// retry/DLQ purposes.
pub struct CircuitBreaker {
    options: BreakerOptions,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(options: BreakerOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
            }),
        })
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.reconcile_open_to_half_open(&mut inner);
        inner.state
    }

    fn reconcile_open_to_half_open(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.options.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                }
            }
        }
    }

    /// Attempts to reserve a call slot. `Err(CircuitOpen)` if the breaker is
    /// OPEN or the HALF_OPEN probe budget is exhausted.
    fn try_enter(&self, instance_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        self.reconcile_open_to_half_open(&mut inner);

        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => Err(ScanforgeError::CircuitOpen { instance_id: instance_id.to_string() }),
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.options.half_open_max {
                    inner.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(ScanforgeError::CircuitOpen { instance_id: instance_id.to_string() })
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            return;
        }

        inner.failures += 1;
        if inner.failures >= self.options.failure_threshold {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Runs `f` through the breaker: fails fast without calling `f` when
    /// OPEN, otherwise records the outcome.
    pub async fn call<F, Fut, T>(&self, instance_id: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.try_enter(instance_id)?;
        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ok() -> Result<()> {
        Ok(())
    }
    async fn fail() -> Result<()> {
        Err(ScanforgeError::Scanner("boom".to_string()))
    }

    #[tokio::test]
    async fn opens_after_failure_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new(BreakerOptions {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(50),
            half_open_max: 1,
        });

        for _ in 0..3 {
            assert!(breaker.call("i1", fail).await.is_err());
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let err = breaker.call("i1", ok).await.unwrap_err();
        assert!(matches!(err, ScanforgeError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn half_opens_after_recovery_timeout_and_closes_on_success() {
        let breaker = CircuitBreaker::new(BreakerOptions {
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(30),
            half_open_max: 1,
        });

        breaker.call("i1", fail).await.ok();
        breaker.call("i1", fail).await.ok();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.call("i1", ok).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_the_breaker() {
        let breaker = CircuitBreaker::new(BreakerOptions {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(20),
            half_open_max: 1,
        });

        breaker.call("i1", fail).await.ok();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.call("i1", fail).await.ok();
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
