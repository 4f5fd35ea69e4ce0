//! Domain types shared across Vigil crates.
//!
//! All types are serializable to/from JSON: they travel over the HTTP API
//! and are persisted in the history store.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier of a monitored service (e.g. "reddit-scraper").
pub type ServiceId = String;

/// Boxed, sendable future used at the trait seams (probes, alert sinks).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Milliseconds since the unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Check results ─────────────────────────────────────────────────

/// Why a probe did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Non-2xx response.
    HttpError,
    /// The probe exceeded its deadline.
    Timeout,
    /// Explicit throttling (429).
    RateLimit,
    /// 401 / 403.
    AuthError,
    /// Transport succeeded but the body was malformed.
    ParseError,
    /// Connection-level failure.
    NetworkError,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::HttpError,
        ErrorKind::Timeout,
        ErrorKind::RateLimit,
        ErrorKind::AuthError,
        ErrorKind::ParseError,
        ErrorKind::NetworkError,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::HttpError => "http_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Success,
    Failure,
    Timeout,
}

/// Immutable record of one probe against one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub service_id: ServiceId,
    /// Completion time (epoch ms).
    pub timestamp_ms: u64,
    pub outcome: CheckOutcome,
    pub latency_ms: u64,
    /// Absent on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Number of items returned by a scrape-style check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_count: Option<u64>,
}

impl HealthCheckResult {
    pub fn success(service_id: &str, timestamp_ms: u64, latency_ms: u64) -> Self {
        Self {
            service_id: service_id.to_string(),
            timestamp_ms,
            outcome: CheckOutcome::Success,
            latency_ms,
            error_kind: None,
            message: None,
            item_count: None,
        }
    }

    /// A failed check. `ErrorKind::Timeout` yields a `Timeout` outcome.
    pub fn failure(
        service_id: &str,
        timestamp_ms: u64,
        latency_ms: u64,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        let outcome = if kind == ErrorKind::Timeout {
            CheckOutcome::Timeout
        } else {
            CheckOutcome::Failure
        };
        Self {
            service_id: service_id.to_string(),
            timestamp_ms,
            outcome,
            latency_ms,
            error_kind: Some(kind),
            message: Some(message.into()),
            item_count: None,
        }
    }

    pub fn with_item_count(mut self, count: Option<u64>) -> Self {
        self.item_count = count;
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == CheckOutcome::Success
    }

    /// Error kind used for breakdowns; failures without one count as `Unknown`.
    pub fn effective_error_kind(&self) -> Option<ErrorKind> {
        match self.outcome {
            CheckOutcome::Success => None,
            CheckOutcome::Timeout => Some(ErrorKind::Timeout),
            CheckOutcome::Failure => Some(self.error_kind.unwrap_or(ErrorKind::Unknown)),
        }
    }
}

// ── Breaker / status ──────────────────────────────────────────────

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived health of a service, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Warning,
    Critical,
}

impl HealthStatus {
    /// 0 (healthy) to 3 (critical).
    pub fn severity(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point-in-time copy of a breaker's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at_ms: Option<u64>,
    pub half_open_probe_in_flight: bool,
    pub short_circuited_count: u64,
}

// ── Alerts ────────────────────────────────────────────────────────

/// Emitted when a service's displayed status crosses a severity boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub service_id: ServiceId,
    pub old_status: HealthStatus,
    pub new_status: HealthStatus,
    pub reason: String,
    pub timestamp_ms: u64,
}

impl AlertEvent {
    /// True when the status got worse.
    pub fn is_escalation(&self) -> bool {
        self.new_status > self.old_status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_is_ordered() {
        assert!(HealthStatus::Critical > HealthStatus::Warning);
        assert!(HealthStatus::Warning > HealthStatus::Degraded);
        assert!(HealthStatus::Degraded > HealthStatus::Healthy);
        assert_eq!(HealthStatus::Healthy.severity(), 0);
        assert_eq!(HealthStatus::Critical.severity(), 3);
    }

    #[test]
    fn timeout_kind_produces_timeout_outcome() {
        let r = HealthCheckResult::failure("svc", 1, 10_000, ErrorKind::Timeout, "deadline");
        assert_eq!(r.outcome, CheckOutcome::Timeout);
        assert_eq!(r.effective_error_kind(), Some(ErrorKind::Timeout));

        let r = HealthCheckResult::failure("svc", 1, 12, ErrorKind::HttpError, "503");
        assert_eq!(r.outcome, CheckOutcome::Failure);
        assert!(!r.is_success());
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::RateLimit).unwrap();
        assert_eq!(json, "\"rate_limit\"");
        assert_eq!(ErrorKind::NetworkError.to_string(), "network_error");
    }

    #[test]
    fn result_json_omits_empty_fields() {
        let r = HealthCheckResult::success("svc", 1000, 42);
        let json = serde_json::to_string(&r).unwrap();
        assert!(!json.contains("error_kind"));
        let back: HealthCheckResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn alert_escalation() {
        let event = AlertEvent {
            service_id: "svc".to_string(),
            old_status: HealthStatus::Warning,
            new_status: HealthStatus::Critical,
            reason: "breaker open".to_string(),
            timestamp_ms: 0,
        };
        assert!(event.is_escalation());
    }
}
