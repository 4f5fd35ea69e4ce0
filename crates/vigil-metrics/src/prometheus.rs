//! Prometheus text exposition format.
//!
//! Renders per-service health figures into the Prometheus text exposition
//! format for scraping by a Prometheus server or compatible agent.

use std::fmt::Write;

use vigil_core::{BreakerSnapshot, BreakerState, HealthStatus};

use crate::window::MetricsSummary;

/// Everything exported for one service.
pub struct ServiceSample<'a> {
    pub service_id: &'a str,
    pub status: HealthStatus,
    pub metrics: &'a MetricsSummary,
    pub breaker: &'a BreakerSnapshot,
}

/// Process-wide counters, exported without labels.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DropCounters {
    pub alerts: u64,
    pub history_writes: u64,
}

fn breaker_value(state: BreakerState) -> u8 {
    match state {
        BreakerState::Closed => 0,
        BreakerState::HalfOpen => 1,
        BreakerState::Open => 2,
    }
}

/// One gauge or counter family with a line per service.
fn family(
    out: &mut String,
    samples: &[ServiceSample<'_>],
    name: &str,
    kind: &str,
    help: &str,
    value: impl Fn(&ServiceSample<'_>) -> String,
) {
    let _ = writeln!(out, "# HELP vigil_{name} {help}");
    let _ = writeln!(out, "# TYPE vigil_{name} {kind}");
    for s in samples {
        let _ = writeln!(out, "vigil_{name}{{service=\"{}\"}} {}", s.service_id, value(s));
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP vigil_{name} {help}");
    let _ = writeln!(out, "# TYPE vigil_{name} counter");
    let _ = writeln!(out, "vigil_{name} {value}");
}

/// Render service samples into Prometheus text format.
///
/// Produces GAUGE and COUNTER metrics with `service` labels, followed by
/// the unlabelled drop counters.
pub fn render_prometheus(samples: &[ServiceSample<'_>], dropped: DropCounters) -> String {
    let mut out = String::new();

    family(
        &mut out,
        samples,
        "success_rate_percent",
        "gauge",
        "Success rate over the rolling window (0-100).",
        |s| format!("{:.2}", s.metrics.success_rate),
    );
    family(
        &mut out,
        samples,
        "uptime_percent",
        "gauge",
        "All-time uptime (0-100).",
        |s| format!("{:.2}", s.metrics.uptime_percentage),
    );
    family(
        &mut out,
        samples,
        "avg_latency_ms",
        "gauge",
        "Mean probe latency over the rolling window in milliseconds.",
        |s| format!("{:.2}", s.metrics.avg_latency_ms),
    );
    family(
        &mut out,
        samples,
        "consecutive_failures",
        "gauge",
        "Current unbroken failure streak.",
        |s| s.metrics.consecutive_failures.to_string(),
    );
    family(
        &mut out,
        samples,
        "status_severity",
        "gauge",
        "Displayed status: 0 healthy, 1 degraded, 2 warning, 3 critical.",
        |s| s.status.severity().to_string(),
    );
    family(
        &mut out,
        samples,
        "breaker_state",
        "gauge",
        "Circuit breaker: 0 closed, 1 half-open, 2 open.",
        |s| breaker_value(s.breaker.state).to_string(),
    );
    family(
        &mut out,
        samples,
        "checks_total",
        "counter",
        "All-time check attempts.",
        |s| s.metrics.totals.total_attempts.to_string(),
    );
    family(
        &mut out,
        samples,
        "check_failures_total",
        "counter",
        "All-time failed checks.",
        |s| s.metrics.totals.total_failures.to_string(),
    );
    family(
        &mut out,
        samples,
        "short_circuited_total",
        "counter",
        "Calls denied by the circuit breaker.",
        |s| s.breaker.short_circuited_count.to_string(),
    );
    counter(
        &mut out,
        "alerts_dropped_total",
        "Alerts discarded because the alert queue was full.",
        dropped.alerts,
    );
    counter(
        &mut out,
        "history_writes_dropped_total",
        "Check results not persisted because the history queue was full or closed.",
        dropped.history_writes,
    );

    out
}
