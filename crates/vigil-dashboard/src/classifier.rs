//! Status classification.
//!
//! `classify` is a pure function of a service's metrics and breaker state.
//! Rules are evaluated critical → warning → degraded → healthy and the first
//! match wins. `StatusTracker` layers hysteresis on top so a single lucky
//! probe cannot lift a critical service.

use vigil_core::{BreakerState, HealthStatus};
use vigil_metrics::MetricsSummary;

pub const CRITICAL_FAILURE_STREAK: u32 = 5;
pub const WARNING_FAILURE_STREAK: u32 = 3;
pub const CRITICAL_SUCCESS_RATE: f64 = 50.0;
pub const DEGRADED_SUCCESS_RATE: f64 = 80.0;

/// Classify a service, returning the status and a short reason.
pub fn classify_with_reason(
    metrics: &MetricsSummary,
    breaker: BreakerState,
) -> (HealthStatus, String) {
    let failures = metrics.consecutive_failures;
    let rate = metrics.success_rate;

    if breaker == BreakerState::Open {
        return (HealthStatus::Critical, "circuit breaker open".to_string());
    }
    if failures >= CRITICAL_FAILURE_STREAK {
        return (HealthStatus::Critical, format!("{failures} consecutive failures"));
    }
    if rate < CRITICAL_SUCCESS_RATE {
        return (
            HealthStatus::Critical,
            format!("success rate {rate:.1}% below {CRITICAL_SUCCESS_RATE}%"),
        );
    }
    if failures >= WARNING_FAILURE_STREAK {
        return (HealthStatus::Warning, format!("{failures} consecutive failures"));
    }
    if rate < DEGRADED_SUCCESS_RATE {
        return (
            HealthStatus::Degraded,
            format!("success rate {rate:.1}% below {DEGRADED_SUCCESS_RATE}%"),
        );
    }
    (HealthStatus::Healthy, "checks passing".to_string())
}

pub fn classify(metrics: &MetricsSummary, breaker: BreakerState) -> HealthStatus {
    classify_with_reason(metrics, breaker).0
}

/// Displayed status of one service, with recovery hysteresis.
#[derive(Debug, Clone)]
pub struct StatusTracker {
    displayed: HealthStatus,
    /// Consecutive successes needed to leave `Critical`.
    recovery_probes: u32,
}

impl StatusTracker {
    pub fn new(recovery_probes: u32) -> Self {
        Self {
            displayed: HealthStatus::Healthy,
            recovery_probes,
        }
    }

    pub fn displayed(&self) -> HealthStatus {
        self.displayed
    }

    pub fn set_recovery_probes(&mut self, recovery_probes: u32) {
        self.recovery_probes = recovery_probes;
    }

    /// Feed a freshly classified status. Returns `(old, new)` when the
    /// displayed status changes.
    pub fn observe(
        &mut self,
        classified: HealthStatus,
        consecutive_successes: u32,
    ) -> Option<(HealthStatus, HealthStatus)> {
        let held = self.displayed == HealthStatus::Critical
            && classified < HealthStatus::Critical
            && consecutive_successes < self.recovery_probes;
        if held || classified == self.displayed {
            return None;
        }
        let old = self.displayed;
        self.displayed = classified;
        Some((old, classified))
    }

    pub fn reset(&mut self) {
        self.displayed = HealthStatus::Healthy;
    }
}
