//! Per-service circuit breaker.
//!
//! CLOSED lets every call through and counts consecutive failures. Reaching
//! `failure_threshold` opens the breaker. After `cool_down` the next
//! `allow()` moves to HALF_OPEN and becomes the single trial call; further
//! callers are denied until the trial reports back. `success_threshold`
//! consecutive successes close the breaker again, and any HALF_OPEN failure
//! reopens it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use vigil_core::{BreakerSnapshot, BreakerState, ErrorKind, ServiceConfig, epoch_millis};

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error("circuit breaker open")]
    Open,

    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at_ms: Option<u64>,
    trial_in_flight: bool,
    failure_threshold: u32,
    success_threshold: u32,
    cool_down_ms: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    service_id: String,
    inner: Mutex<Inner>,
    short_circuited: AtomicU64,
}

impl CircuitBreaker {
    /// Create a breaker using a service's thresholds.
    pub fn new(config: &ServiceConfig) -> Self {
        Self::with_thresholds(
            &config.id,
            config.failure_threshold,
            config.success_threshold,
            config.cool_down,
        )
    }

    pub fn with_thresholds(
        service_id: &str,
        failure_threshold: u32,
        success_threshold: u32,
        cool_down: Duration,
    ) -> Self {
        Self {
            service_id: service_id.to_string(),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at_ms: None,
                trial_in_flight: false,
                failure_threshold: failure_threshold.max(1),
                success_threshold: success_threshold.max(1),
                cool_down_ms: cool_down.as_millis() as u64,
            }),
            short_circuited: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn allow(&self) -> bool {
        self.allow_at(epoch_millis())
    }

    /// Decide whether a call may proceed at `now_ms`.
    ///
    /// An admitted HALF_OPEN trial must be finished with `record_success`,
    /// `record_failure` or `release_trial`; [`acquire`](Self::acquire) does
    /// the release automatically.
    pub fn allow_at(&self, now_ms: u64) -> bool {
        self.admit_at(now_ms).is_some()
    }

    pub fn acquire(&self) -> Option<Permit<'_>> {
        self.acquire_at(epoch_millis())
    }

    /// Like [`allow_at`](Self::allow_at), but a trial admission is held by
    /// the returned permit and freed if the permit is dropped unfinished.
    pub fn acquire_at(&self, now_ms: u64) -> Option<Permit<'_>> {
        self.admit_at(now_ms).map(|trial| Permit {
            breaker: self,
            trial,
        })
    }

    /// `Some(true)` admits the HALF_OPEN trial, `Some(false)` a CLOSED call.
    fn admit_at(&self, now_ms: u64) -> Option<bool> {
        let mut inner = self.lock();
        let admitted = match inner.state {
            BreakerState::Closed => Some(false),
            BreakerState::Open => {
                let opened_at = inner.opened_at_ms.unwrap_or(now_ms);
                if now_ms.saturating_sub(opened_at) >= inner.cool_down_ms {
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.trial_in_flight = true;
                    info!(service = %self.service_id, "circuit breaker half-open, admitting trial");
                    Some(true)
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    None
                } else {
                    inner.trial_in_flight = true;
                    Some(true)
                }
            }
        };
        if admitted.is_none() {
            self.short_circuited.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    pub fn record_success(&self) -> BreakerState {
        self.record_success_at(epoch_millis())
    }

    /// Record a successful call. Returns the state afterwards.
    pub fn record_success_at(&self, _now_ms: u64) -> BreakerState {
        let mut inner = self.lock();
        inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
        inner.consecutive_failures = 0;

        if inner.state == BreakerState::HalfOpen {
            inner.trial_in_flight = false;
            if inner.consecutive_successes >= inner.success_threshold {
                inner.state = BreakerState::Closed;
                inner.opened_at_ms = None;
                info!(
                    service = %self.service_id,
                    successes = inner.consecutive_successes,
                    "circuit breaker closed"
                );
            }
        }
        inner.state
    }

    pub fn record_failure(&self, kind: ErrorKind) -> BreakerState {
        self.record_failure_at(epoch_millis(), kind)
    }

    /// Record a failed call. Returns the state afterwards.
    pub fn record_failure_at(&self, now_ms: u64, kind: ErrorKind) -> BreakerState {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.consecutive_successes = 0;

        match inner.state {
            BreakerState::Closed if inner.consecutive_failures >= inner.failure_threshold => {
                inner.state = BreakerState::Open;
                inner.opened_at_ms = Some(now_ms);
                warn!(
                    service = %self.service_id,
                    failures = inner.consecutive_failures,
                    error_kind = %kind,
                    "circuit breaker opened"
                );
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at_ms = Some(now_ms);
                inner.trial_in_flight = false;
                warn!(service = %self.service_id, error_kind = %kind, "trial failed, circuit breaker reopened");
            }
            _ => {}
        }
        inner.state
    }

    /// Free the HALF_OPEN trial slot without recording an outcome.
    pub fn release_trial(&self) {
        self.lock().trial_in_flight = false;
    }

    /// Return to CLOSED with cleared streaks. The short-circuit counter is kept.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.opened_at_ms = None;
        inner.trial_in_flight = false;
        info!(service = %self.service_id, "circuit breaker reset");
    }

    /// Apply new thresholds; the current state is kept.
    pub fn update_config(&self, config: &ServiceConfig) {
        let mut inner = self.lock();
        inner.failure_threshold = config.failure_threshold.max(1);
        inner.success_threshold = config.success_threshold.max(1);
        inner.cool_down_ms = config.cool_down.as_millis() as u64;
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            opened_at_ms: inner.opened_at_ms,
            half_open_probe_in_flight: inner.trial_in_flight,
            short_circuited_count: self.short_circuited.load(Ordering::Relaxed),
        }
    }

    /// Run `fut` through the breaker. A denied call never polls `fut`.
    /// Dropping the returned future mid-call frees a held trial.
    pub async fn call<T, E, F>(&self, fut: F) -> Result<T, CallError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let Some(permit) = self.acquire() else {
            return Err(CallError::Open);
        };
        match fut.await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure(ErrorKind::Unknown);
                Err(CallError::Inner(e))
            }
        }
    }
}

/// An admitted call. Finish it with [`success`](Self::success),
/// [`failure`](Self::failure) or [`release`](Self::release); dropping an
/// unfinished trial permit releases the HALF_OPEN slot.
#[must_use = "an unfinished permit records no outcome"]
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
}

impl Permit<'_> {
    /// Whether this permit holds the HALF_OPEN trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) -> BreakerState {
        self.trial = false;
        self.breaker.record_success()
    }

    pub fn failure(mut self, kind: ErrorKind) -> BreakerState {
        self.trial = false;
        self.breaker.record_failure(kind)
    }

    /// Finish without recording an outcome.
    pub fn release(self) {}
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial {
            self.breaker.release_trial();
            debug!(service = %self.breaker.service_id, "unfinished trial released");
        }
    }
}
