//! vigil-metrics — check outcome accounting for Vigil.
//!
//! Tracks per-service rolling windows of check results, derives success
//! rate, uptime, latency and error breakdowns, and hands results off to the
//! history store without ever blocking the caller.
//!
//! # Architecture
//!
//! ```text
//! MetricsStore
//!   ├── service id → Arc<Mutex<RollingWindow>>   (one lock per service)
//!   │     ├── ring buffer of HealthCheckResult
//!   │     └── all-time totals, streaks, last success/failure
//!   └── Option<HistoryWriter> → bounded channel → StateStore
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod history;
pub mod prometheus;
pub mod store;
pub mod window;

pub use history::HistoryWriter;
pub use prometheus::{DropCounters, ServiceSample, render_prometheus};
pub use store::{MetricsError, MetricsStore, SharedWindow, lock_window};
pub use window::{ErrorBreakdown, MetricsSummary, RollingWindow, Totals, Window};
