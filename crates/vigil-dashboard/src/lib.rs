//! vigil-dashboard — status classification, dashboard snapshots and alerting.
//!
//! Turns raw metrics and breaker state into a displayed `HealthStatus`,
//! aggregates all services into a cached `DashboardSnapshot`, and delivers
//! status changes to pluggable alert sinks.
//!
//! # Status rules
//!
//! | Status | Condition (first match wins) |
//! |---|---|
//! | critical | breaker open, ≥5 consecutive failures, or success rate < 50% |
//! | warning | ≥3 consecutive failures |
//! | degraded | success rate in [50%, 80%) |
//! | healthy | otherwise |

pub mod alerter;
pub mod classifier;
pub mod snapshot;

pub use alerter::{AlertSink, Alerter, CallbackSink, LogSink, WebhookSink};
pub use classifier::{StatusTracker, classify, classify_with_reason};
pub use snapshot::{Dashboard, DashboardSnapshot, ServiceReading, ServiceView, build_snapshot};
