//! vigil-health — circuit breakers and health polling for Vigil.
//!
//! Probes each registered service on a jittered schedule, feeds the
//! outcome into that service's circuit breaker and rolling metrics, and
//! re-derives its displayed status after every check.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── Per-service poll task
//!   │   ├── CircuitBreaker::allow() → short-circuit or probe
//!   │   ├── HealthCheckExecutor (hard timeout) → HealthCheckResult
//!   │   ├── CircuitBreaker::record_* + MetricsStore::record
//!   │   └── classify → StatusTracker → Alerter::push on change
//!   ├── Dashboard (TTL-cached snapshot)
//!   └── Optional StateStore for persisted registrations
//! ```
//!
//! # Circuit breaker
//!
//! `failure_threshold` consecutive failures open the breaker. After
//! `cool_down` a single trial probe is admitted (HALF_OPEN);
//! `success_threshold` consecutive successes close it, any failure
//! reopens it. Callers guarding real traffic use `HealthMonitor::allow`
//! or `CircuitBreaker::call`.

pub mod breaker;
pub mod checker;
pub mod error;
pub mod monitor;

pub use breaker::{CallError, CircuitBreaker, Permit};
pub use checker::{FnProbe, HealthCheckExecutor, HttpProbe, Probe, ProbeOutcome, TcpProbe};
pub use error::{MonitorError, MonitorResult};
pub use monitor::{HealthMonitor, ServiceDetail, UptimeReport, WindowStats};
