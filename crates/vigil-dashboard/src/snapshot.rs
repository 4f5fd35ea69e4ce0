//! System-wide dashboard snapshot with a short-lived cache.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use vigil_core::{BreakerSnapshot, BreakerState, HealthStatus, ServiceId};
use vigil_metrics::MetricsSummary;

/// Per-service copy taken under that service's own locks.
#[derive(Debug, Clone)]
pub struct ServiceReading {
    pub service_id: ServiceId,
    pub status: HealthStatus,
    pub metrics: MetricsSummary,
    pub breaker: BreakerSnapshot,
}

/// One row of the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceView {
    pub service_id: ServiceId,
    pub status: HealthStatus,
    pub success_rate: f64,
    pub uptime_percentage: f64,
    pub consecutive_failures: u32,
    pub avg_latency_ms: f64,
    pub last_success_at: Option<u64>,
    pub last_failure_at: Option<u64>,
    pub breaker_state: BreakerState,
    pub short_circuited_count: u64,
    pub total_attempts_24h: u64,
}

impl From<&ServiceReading> for ServiceView {
    fn from(r: &ServiceReading) -> Self {
        Self {
            service_id: r.service_id.clone(),
            status: r.status,
            success_rate: r.metrics.success_rate,
            uptime_percentage: r.metrics.uptime_percentage,
            consecutive_failures: r.metrics.consecutive_failures,
            avg_latency_ms: r.metrics.avg_latency_ms,
            last_success_at: r.metrics.last_success_at,
            last_failure_at: r.metrics.last_failure_at,
            breaker_state: r.breaker.state,
            short_circuited_count: r.breaker.short_circuited_count,
            total_attempts_24h: r.metrics.attempts_24h,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    /// Most severe status across all services.
    pub overall_status: HealthStatus,
    pub services: Vec<ServiceView>,
    pub total_attempts_24h: u64,
    pub avg_success_rate: f64,
    pub dropped_alerts: u64,
    pub generated_at_ms: u64,
    /// True when this is a cached copy served after a failed rebuild.
    #[serde(default)]
    pub stale: bool,
}

/// Aggregate per-service readings. Services are listed in id order.
pub fn build_snapshot(
    readings: &[ServiceReading],
    dropped_alerts: u64,
    now_ms: u64,
) -> DashboardSnapshot {
    let mut services: Vec<ServiceView> = readings.iter().map(ServiceView::from).collect();
    services.sort_by(|a, b| a.service_id.cmp(&b.service_id));

    let overall_status = services
        .iter()
        .map(|s| s.status)
        .max()
        .unwrap_or(HealthStatus::Healthy);
    let total_attempts_24h = services.iter().map(|s| s.total_attempts_24h).sum();
    let avg_success_rate = if services.is_empty() {
        100.0
    } else {
        services.iter().map(|s| s.success_rate).sum::<f64>() / services.len() as f64
    };

    DashboardSnapshot {
        overall_status,
        services,
        total_attempts_24h,
        avg_success_rate,
        dropped_alerts,
        generated_at_ms: now_ms,
        stale: false,
    }
}

#[derive(Default)]
struct Cache {
    last_good: Option<DashboardSnapshot>,
    /// Set by `invalidate`; the next read rebuilds regardless of age.
    expired: bool,
}

/// TTL cache in front of snapshot generation.
pub struct Dashboard {
    ttl: Duration,
    cache: Mutex<Cache>,
}

impl Dashboard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(Cache::default()),
        }
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Return the cached snapshot if younger than the TTL, otherwise run
    /// `build`. A failed build falls back to the last good snapshot, marked
    /// stale; the error is returned only when nothing was ever cached.
    pub fn snapshot_with<E: std::fmt::Display>(
        &self,
        now_ms: u64,
        build: impl FnOnce() -> Result<DashboardSnapshot, E>,
    ) -> Result<DashboardSnapshot, E> {
        let ttl_ms = self.ttl.as_millis() as u64;
        {
            let cache = self.cache();
            if let Some(cached) = cache.last_good.as_ref().filter(|_| !cache.expired) {
                if now_ms.saturating_sub(cached.generated_at_ms) < ttl_ms {
                    return Ok(cached.clone());
                }
            }
        }

        match build() {
            Ok(fresh) => {
                let mut cache = self.cache();
                cache.last_good = Some(fresh.clone());
                cache.expired = false;
                Ok(fresh)
            }
            Err(e) => match self.cache().last_good.as_ref() {
                Some(last) => {
                    warn!(error = %e, "dashboard rebuild failed, serving last good snapshot");
                    let mut last = last.clone();
                    last.stale = true;
                    Ok(last)
                }
                None => Err(e),
            },
        }
    }

    /// Force the next read to rebuild. The last good snapshot is kept as
    /// the fallback for a failed rebuild.
    pub fn invalidate(&self) {
        self.cache().expired = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_metrics::Totals;

    fn reading(id: &str, status: HealthStatus, success_rate: f64, attempts: u64) -> ServiceReading {
        ServiceReading {
            service_id: id.to_string(),
            status,
            metrics: MetricsSummary {
                success_rate,
                uptime_percentage: success_rate,
                avg_latency_ms: 20.0,
                consecutive_failures: 0,
                consecutive_successes: 1,
                totals: Totals::default(),
                window_len: 0,
                attempts_24h: attempts,
                last_success_at: None,
                last_failure_at: None,
                short_circuited: 0,
            },
            breaker: BreakerSnapshot {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at_ms: None,
                half_open_probe_in_flight: false,
                short_circuited_count: 0,
            },
        }
    }

    #[test]
    fn overall_status_is_most_severe() {
        let readings = vec![
            reading("a", HealthStatus::Healthy, 100.0, 10),
            reading("b", HealthStatus::Warning, 90.0, 20),
            reading("c", HealthStatus::Critical, 20.0, 30),
        ];
        let snap = build_snapshot(&readings, 0, 1_000);
        assert_eq!(snap.overall_status, HealthStatus::Critical);
        assert_eq!(snap.total_attempts_24h, 60);
        assert!((snap.avg_success_rate - 70.0).abs() < 1e-9);
    }

    #[test]
    fn empty_snapshot_is_healthy() {
        let snap = build_snapshot(&[], 3, 1_000);
        assert_eq!(snap.overall_status, HealthStatus::Healthy);
        assert_eq!(snap.avg_success_rate, 100.0);
        assert_eq!(snap.dropped_alerts, 3);
    }

    #[test]
    fn services_sorted_by_id() {
        let readings = vec![
            reading("zeta", HealthStatus::Healthy, 100.0, 0),
            reading("alpha", HealthStatus::Healthy, 100.0, 0),
        ];
        let snap = build_snapshot(&readings, 0, 0);
        assert_eq!(snap.services[0].service_id, "alpha");
    }

    #[test]
    fn cache_serves_within_ttl() {
        let dashboard = Dashboard::new(Duration::from_secs(5));
        let mut builds = 0;
        for now in [1_000, 3_000, 5_999] {
            dashboard
                .snapshot_with(now, || {
                    builds += 1;
                    Ok::<_, String>(build_snapshot(&[], 0, now))
                })
                .unwrap();
        }
        assert_eq!(builds, 1);

        dashboard
            .snapshot_with(6_000, || {
                builds += 1;
                Ok::<_, String>(build_snapshot(&[], 0, 6_000))
            })
            .unwrap();
        assert_eq!(builds, 2);
    }

    #[test]
    fn failed_build_returns_last_good() {
        let dashboard = Dashboard::new(Duration::from_millis(10));
        let readings = vec![reading("a", HealthStatus::Warning, 90.0, 1)];
        dashboard
            .snapshot_with(0, || Ok::<_, String>(build_snapshot(&readings, 0, 0)))
            .unwrap();

        let snap = dashboard
            .snapshot_with(100, || Err("window corrupted".to_string()))
            .unwrap();
        assert!(snap.stale);
        assert_eq!(snap.overall_status, HealthStatus::Warning);
    }

    #[test]
    fn failed_build_without_cache_is_error() {
        let dashboard = Dashboard::new(Duration::from_secs(5));
        let result = dashboard.snapshot_with(0, || Err::<DashboardSnapshot, _>("boom".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn invalidate_forces_rebuild() {
        let dashboard = Dashboard::new(Duration::from_secs(60));
        dashboard
            .snapshot_with(0, || Ok::<_, String>(build_snapshot(&[], 0, 0)))
            .unwrap();
        dashboard.invalidate();
        let mut rebuilt = false;
        dashboard
            .snapshot_with(1, || {
                rebuilt = true;
                Ok::<_, String>(build_snapshot(&[], 0, 1))
            })
            .unwrap();
        assert!(rebuilt);
    }

    #[test]
    fn invalidate_rebuilds_but_keeps_fallback() {
        let dashboard = Dashboard::new(Duration::from_secs(60));
        let readings = vec![reading("a", HealthStatus::Degraded, 70.0, 1)];
        dashboard
            .snapshot_with(0, || Ok::<_, String>(build_snapshot(&readings, 0, 0)))
            .unwrap();

        dashboard.invalidate();
        let mut rebuilt = false;
        let snap = dashboard
            .snapshot_with(10, || {
                rebuilt = true;
                Err("window corrupted".to_string())
            })
            .unwrap();
        assert!(rebuilt);
        assert!(snap.stale);
        assert_eq!(snap.overall_status, HealthStatus::Degraded);

        // Still expired until a rebuild succeeds.
        let snap = dashboard
            .snapshot_with(20, || Ok::<_, String>(build_snapshot(&[], 0, 20)))
            .unwrap();
        assert!(!snap.stale);
        assert_eq!(snap.overall_status, HealthStatus::Healthy);
    }
}
