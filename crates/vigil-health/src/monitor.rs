//! Health monitor — one background poll task per registered service.
//!
//! The `HealthMonitor` owns every service's circuit breaker, probe and
//! status tracker, spawns a poll task per service, and answers read-only
//! queries (dashboard snapshot, per-service detail, error breakdown).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vigil_core::{
    AlertEvent, BreakerSnapshot, ErrorKind, HealthCheckResult, HealthStatus, ProbeSpec,
    ServiceConfig, ServiceId, epoch_millis,
};
use vigil_dashboard::{
    Alerter, Dashboard, DashboardSnapshot, ServiceReading, StatusTracker, build_snapshot,
    classify_with_reason,
};
use vigil_metrics::{
    DropCounters, ErrorBreakdown, MetricsError, MetricsStore, MetricsSummary, ServiceSample,
    Totals, Window, render_prometheus,
};
use vigil_state::StateStore;

use crate::breaker::CircuitBreaker;
use crate::checker::{HealthCheckExecutor, Probe, probe_from_spec};
use crate::error::{MonitorError, MonitorResult};

const HOUR_MS: u64 = 3_600_000;
const DETAIL_RECENT: usize = 10;
const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(5);

// ── Per-service state ─────────────────────────────────────────────

struct Settings {
    config: ServiceConfig,
    probe: Arc<dyn Probe>,
}

struct ServiceEntry {
    id: ServiceId,
    settings: Mutex<Settings>,
    breaker: Arc<CircuitBreaker>,
    tracker: Mutex<StatusTracker>,
    /// Held for the whole of a tick so probes never overlap.
    tick: AsyncMutex<()>,
}

impl ServiceEntry {
    fn settings(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn tracker(&self) -> MutexGuard<'_, StatusTracker> {
        self.tracker.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn config(&self) -> ServiceConfig {
        self.settings().config.clone()
    }

    fn probe(&self) -> Arc<dyn Probe> {
        self.settings().probe.clone()
    }

    fn displayed_status(&self) -> HealthStatus {
        self.tracker().displayed()
    }
}

/// Per-service poll task.
struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl MonitorSlot {
    fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }

    async fn stop_and_wait(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!(error = %e, "poll task failed");
            }
        }
    }
}

struct Registration {
    entry: Arc<ServiceEntry>,
    slot: MonitorSlot,
}

/// Collaborators shared with every poll task.
struct Shared {
    metrics: Arc<MetricsStore>,
    alerter: Arc<Alerter>,
}

// ── Query results ─────────────────────────────────────────────────

/// Figures over the requested time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    /// `None` means the whole buffered window.
    pub window_hours: Option<u64>,
    pub attempts: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDetail {
    pub service_id: ServiceId,
    /// Displayed status, including recovery hysteresis.
    pub status: HealthStatus,
    /// Reason for the freshly classified status.
    pub reason: String,
    pub probe: String,
    pub config: ServiceConfig,
    pub metrics: MetricsSummary,
    pub window: WindowStats,
    pub breaker: BreakerSnapshot,
    pub recent: Vec<HealthCheckResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UptimeReport {
    pub service_id: ServiceId,
    pub uptime_percentage: f64,
    #[serde(flatten)]
    pub totals: Totals,
}

fn window_for(window_hours: Option<u64>, now_ms: u64) -> Window {
    match window_hours {
        Some(hours) => Window::Since(now_ms.saturating_sub(hours.saturating_mul(HOUR_MS))),
        None => Window::All,
    }
}

// ── Monitor ───────────────────────────────────────────────────────

/// Supervisor for all monitored services.
pub struct HealthMonitor {
    /// Active registrations: service id → entry + poll task.
    services: Arc<RwLock<HashMap<ServiceId, Registration>>>,
    shared: Arc<Shared>,
    dashboard: Dashboard,
    /// Persists registrations when set.
    store: Option<StateStore>,
}

impl HealthMonitor {
    pub fn new(metrics: Arc<MetricsStore>, alerter: Arc<Alerter>) -> Self {
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            shared: Arc::new(Shared { metrics, alerter }),
            dashboard: Dashboard::new(DEFAULT_SNAPSHOT_TTL),
            store: None,
        }
    }

    pub fn with_snapshot_ttl(mut self, ttl: Duration) -> Self {
        self.dashboard = Dashboard::new(ttl);
        self
    }

    /// Persist registrations (and serve history) from `store`.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.shared.metrics
    }

    pub fn alerter(&self) -> &Arc<Alerter> {
        &self.shared.alerter
    }

    // ── Registration ──────────────────────────────────────────────

    /// Register a service whose probe is described by its config.
    pub async fn register(&self, config: ServiceConfig) -> MonitorResult<()> {
        config.validate()?;
        let probe = probe_from_spec(&config.probe)
            .ok_or_else(|| vigil_core::ConfigError::ProbeRequired(config.id.clone()))?;
        self.register_with_probe(config, probe).await
    }

    /// Register a service with a caller-supplied probe.
    pub async fn register_with_probe(
        &self,
        config: ServiceConfig,
        probe: Arc<dyn Probe>,
    ) -> MonitorResult<()> {
        config.validate()?;

        let mut services = self.services.write().await;
        if services.contains_key(&config.id) {
            return Err(MonitorError::AlreadyRegistered(config.id));
        }

        self.shared.metrics.register(&config.id, config.window_size);
        let entry = Arc::new(ServiceEntry {
            id: config.id.clone(),
            breaker: Arc::new(CircuitBreaker::new(&config)),
            tracker: Mutex::new(StatusTracker::new(config.recovery_probes)),
            settings: Mutex::new(Settings {
                config: config.clone(),
                probe: probe.clone(),
            }),
            tick: AsyncMutex::new(()),
        });
        let slot = spawn_poll_task(entry.clone(), self.shared.clone());
        services.insert(config.id.clone(), Registration { entry, slot });
        drop(services);

        self.persist(&config);
        self.dashboard.invalidate();
        info!(
            service = %config.id,
            probe = %probe.describe(),
            interval = ?config.poll_interval,
            "service registered"
        );
        Ok(())
    }

    /// Stop monitoring a service and discard its in-memory metrics.
    /// Persisted history is kept.
    pub async fn deregister(&self, service_id: &str) -> MonitorResult<()> {
        let registration = self
            .services
            .write()
            .await
            .remove(service_id)
            .ok_or_else(|| MonitorError::NotFound(service_id.to_string()))?;
        registration.slot.stop();
        self.shared.metrics.unregister(service_id);

        if let Some(store) = &self.store {
            if let Err(e) = store.delete_service(service_id) {
                warn!(service = %service_id, error = %e, "failed to remove stored registration");
            }
        }
        self.dashboard.invalidate();
        info!(service = %service_id, "service deregistered");
        Ok(())
    }

    /// Apply a new configuration to a running service. Counters, history
    /// and breaker state are kept; the poll task restarts on the new timing.
    pub async fn update_config(&self, service_id: &str, config: ServiceConfig) -> MonitorResult<()> {
        if config.id != service_id {
            return Err(MonitorError::IdMismatch {
                expected: service_id.to_string(),
                found: config.id,
            });
        }
        config.validate()?;

        // Let an in-flight tick finish before its task is replaced.
        let current = self.entry(service_id).await?;
        let _tick = current.tick.lock().await;

        let mut services = self.services.write().await;
        let registration = services
            .get_mut(service_id)
            .ok_or_else(|| MonitorError::NotFound(service_id.to_string()))?;
        let entry = registration.entry.clone();

        // A custom probe keeps the instance supplied at registration.
        let probe = match &config.probe {
            ProbeSpec::Custom { .. } => entry.probe(),
            spec => probe_from_spec(spec)
                .ok_or_else(|| vigil_core::ConfigError::ProbeRequired(config.id.clone()))?,
        };

        entry.breaker.update_config(&config);
        entry.tracker().set_recovery_probes(config.recovery_probes);
        self.shared.metrics.register(service_id, config.window_size);
        *entry.settings() = Settings {
            config: config.clone(),
            probe,
        };

        let old = std::mem::replace(
            &mut registration.slot,
            spawn_poll_task(entry, self.shared.clone()),
        );
        old.stop();
        drop(services);

        self.persist(&config);
        self.dashboard.invalidate();
        info!(service = %service_id, "service config updated");
        Ok(())
    }

    /// Re-register services saved in the store that are not yet active.
    /// Returns how many were restored.
    pub async fn load_persisted(&self) -> MonitorResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let mut restored = 0;
        for config in store.list_services()? {
            if self.is_registered(&config.id).await {
                continue;
            }
            let id = config.id.clone();
            match self.register(config).await {
                Ok(()) => restored += 1,
                Err(e) => warn!(service = %id, error = %e, "skipping stored registration"),
            }
        }
        Ok(restored)
    }

    fn persist(&self, config: &ServiceConfig) {
        let Some(store) = &self.store else { return };
        if matches!(config.probe, ProbeSpec::Custom { .. }) {
            return;
        }
        if let Err(e) = store.put_service(config) {
            warn!(service = %config.id, error = %e, "failed to store registration");
        }
    }

    /// Stop every poll task (for graceful shutdown). Returns once none of
    /// them can record another result.
    pub async fn stop_all(&self) {
        let slots: Vec<_> = self
            .services
            .write()
            .await
            .drain()
            .map(|(_, registration)| registration.slot)
            .collect();
        for slot in slots {
            slot.stop_and_wait().await;
        }
        info!("all health monitors stopped");
    }

    pub async fn is_registered(&self, service_id: &str) -> bool {
        self.services.read().await.contains_key(service_id)
    }

    /// Registered service configs, sorted by id.
    pub async fn list_services(&self) -> Vec<ServiceConfig> {
        let mut configs: Vec<_> = self
            .services
            .read()
            .await
            .values()
            .map(|r| r.entry.config())
            .collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        configs
    }

    // ── Call guard ────────────────────────────────────────────────

    async fn entry(&self, service_id: &str) -> MonitorResult<Arc<ServiceEntry>> {
        self.services
            .read()
            .await
            .get(service_id)
            .map(|r| r.entry.clone())
            .ok_or_else(|| MonitorError::NotFound(service_id.to_string()))
    }

    async fn entries(&self) -> Vec<Arc<ServiceEntry>> {
        self.services
            .read()
            .await
            .values()
            .map(|r| r.entry.clone())
            .collect()
    }

    /// Whether real traffic to the service may proceed right now.
    pub async fn allow(&self, service_id: &str) -> MonitorResult<bool> {
        Ok(self.entry(service_id).await?.breaker.allow())
    }

    /// The service's breaker, for callers recording their own outcomes.
    pub async fn breaker(&self, service_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.entry(service_id).await.ok().map(|e| e.breaker.clone())
    }

    /// Run one poll tick immediately, outside the schedule. Returns `None`
    /// when the breaker short-circuited the probe.
    pub async fn check_now(&self, service_id: &str) -> MonitorResult<Option<HealthCheckResult>> {
        let entry = self.entry(service_id).await?;
        Ok(poll_once(&entry, &self.shared).await)
    }

    // ── Queries ───────────────────────────────────────────────────

    /// Per-service copies, each taken under that service's own locks.
    pub async fn readings(&self) -> MonitorResult<Vec<ServiceReading>> {
        collect_readings(&self.entries().await, &self.shared.metrics)
    }

    /// System-wide snapshot, cached for the configured TTL.
    pub async fn snapshot(&self) -> MonitorResult<DashboardSnapshot> {
        let entries = self.entries().await;
        self.dashboard.snapshot_with(epoch_millis(), || -> MonitorResult<DashboardSnapshot> {
            let readings = collect_readings(&entries, &self.shared.metrics)?;
            Ok(build_snapshot(
                &readings,
                self.shared.alerter.dropped_alerts(),
                epoch_millis(),
            ))
        })
    }

    pub async fn service_detail(
        &self,
        service_id: &str,
        window_hours: Option<u64>,
    ) -> MonitorResult<ServiceDetail> {
        let entry = self.entry(service_id).await?;
        let metrics = &self.shared.metrics;
        let summary = metrics.summary(service_id)?;
        let breaker = entry.breaker.snapshot();
        let (_, reason) = classify_with_reason(&summary, breaker.state);

        let window = window_for(window_hours, epoch_millis());
        let stats = {
            let shared_window = metrics
                .window(service_id)
                .ok_or_else(|| MetricsError::UnknownService(service_id.to_string()))?;
            let w = vigil_metrics::lock_window(&shared_window);
            WindowStats {
                window_hours,
                attempts: w.attempts(window),
                success_rate: w.success_rate(window),
                avg_latency_ms: w.avg_latency(window),
            }
        };

        Ok(ServiceDetail {
            service_id: entry.id.clone(),
            status: entry.displayed_status(),
            reason,
            probe: entry.probe().describe(),
            config: entry.config(),
            metrics: summary,
            window: stats,
            breaker,
            recent: metrics.recent(service_id, DETAIL_RECENT)?,
        })
    }

    pub async fn error_breakdown(
        &self,
        service_id: &str,
        window_hours: Option<u64>,
    ) -> MonitorResult<Vec<ErrorBreakdown>> {
        self.entry(service_id).await?;
        let window = window_for(window_hours, epoch_millis());
        Ok(self.shared.metrics.error_breakdown(service_id, window)?)
    }

    pub async fn uptime(&self, service_id: &str) -> MonitorResult<UptimeReport> {
        self.entry(service_id).await?;
        Ok(UptimeReport {
            service_id: service_id.to_string(),
            uptime_percentage: self.shared.metrics.uptime_percentage(service_id)?,
            totals: self.shared.metrics.totals(service_id)?,
        })
    }

    /// Persisted results, newest first. Falls back to the in-memory window
    /// when no store is configured.
    pub async fn history(
        &self,
        service_id: &str,
        limit: usize,
    ) -> MonitorResult<Vec<HealthCheckResult>> {
        match &self.store {
            Some(store) => Ok(store.list_results(service_id, None, limit)?),
            None => {
                self.entry(service_id).await?;
                Ok(self.shared.metrics.recent(service_id, limit)?)
            }
        }
    }

    pub fn recent_alerts(&self, limit: usize) -> Vec<AlertEvent> {
        self.shared.alerter.recent(limit)
    }

    /// Clear the rolling window, streaks, breaker and hysteresis. All-time
    /// totals are kept.
    pub async fn reset(&self, service_id: &str) -> MonitorResult<()> {
        let entry = self.entry(service_id).await?;
        let _tick = entry.tick.lock().await;

        self.shared.metrics.reset(service_id)?;
        entry.breaker.reset();
        let old = {
            let mut tracker = entry.tracker();
            let old = tracker.displayed();
            tracker.reset();
            old
        };
        if old != HealthStatus::Healthy {
            self.shared.alerter.push(AlertEvent {
                service_id: service_id.to_string(),
                old_status: old,
                new_status: HealthStatus::Healthy,
                reason: "reset by operator".to_string(),
                timestamp_ms: epoch_millis(),
            });
        }
        self.dashboard.invalidate();
        info!(service = %service_id, "service health reset");
        Ok(())
    }

    /// Prometheus text exposition of every registered service.
    pub async fn render_prometheus(&self) -> MonitorResult<String> {
        let readings = self.readings().await?;
        let samples: Vec<ServiceSample<'_>> = readings
            .iter()
            .map(|r| ServiceSample {
                service_id: &r.service_id,
                status: r.status,
                metrics: &r.metrics,
                breaker: &r.breaker,
            })
            .collect();
        let dropped = DropCounters {
            alerts: self.shared.alerter.dropped_alerts(),
            history_writes: self.shared.metrics.dropped_history_writes(),
        };
        Ok(render_prometheus(&samples, dropped))
    }
}

fn collect_readings(
    entries: &[Arc<ServiceEntry>],
    metrics: &MetricsStore,
) -> MonitorResult<Vec<ServiceReading>> {
    let mut readings = Vec::with_capacity(entries.len());
    for entry in entries {
        let summary = match metrics.summary(&entry.id) {
            Ok(summary) => summary,
            // Deregistered since the entry list was taken.
            Err(MetricsError::UnknownService(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        readings.push(ServiceReading {
            service_id: entry.id.clone(),
            status: entry.displayed_status(),
            metrics: summary,
            breaker: entry.breaker.snapshot(),
        });
    }
    readings.sort_by(|a, b| a.service_id.cmp(&b.service_id));
    Ok(readings)
}

// ── Poll loop ─────────────────────────────────────────────────────

fn spawn_poll_task(entry: Arc<ServiceEntry>, shared: Arc<Shared>) -> MonitorSlot {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run_poll_loop(entry, shared, shutdown_rx));
    MonitorSlot {
        handle,
        shutdown_tx,
    }
}

/// `poll_interval` plus a random jitter in `[0, jitter]`.
fn next_delay(config: &ServiceConfig) -> Duration {
    let jitter_ms = config.jitter.as_millis() as u64;
    let extra = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };
    config.poll_interval + Duration::from_millis(extra)
}

async fn run_poll_loop(
    entry: Arc<ServiceEntry>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(service = %entry.id, "poll loop starting");
    loop {
        let delay = next_delay(&entry.config());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                poll_once(&entry, &shared).await;
            }
            _ = shutdown.changed() => {
                debug!(service = %entry.id, "poll loop shutting down");
                break;
            }
        }
    }
}

/// One tick: consult the breaker, probe, record, classify, alert.
async fn poll_once(entry: &ServiceEntry, shared: &Shared) -> Option<HealthCheckResult> {
    let _tick = entry.tick.lock().await;
    let config = entry.config();

    let Some(permit) = entry.breaker.acquire() else {
        if let Err(e) = shared.metrics.record_short_circuit(&entry.id) {
            debug!(service = %entry.id, error = %e, "short circuit not recorded");
        }
        debug!(service = %entry.id, "probe skipped, circuit breaker open");
        evaluate(entry, shared);
        return None;
    };

    // Cancelling the tick here drops the permit and frees a held trial.
    let probe = entry.probe();
    let result = HealthCheckExecutor::new(config.probe_timeout)
        .execute(&entry.id, probe.as_ref())
        .await;

    match result.effective_error_kind() {
        None => {
            permit.success();
        }
        Some(ErrorKind::RateLimit) if !config.rate_limit_trips_breaker => {
            permit.release();
        }
        Some(kind) => {
            permit.failure(kind);
        }
    }
    debug!(
        service = %entry.id,
        outcome = ?result.outcome,
        latency_ms = result.latency_ms,
        error_kind = ?result.error_kind,
        "health check completed"
    );

    if let Err(e) = shared.metrics.record(result.clone()) {
        warn!(service = %entry.id, error = %e, "check result not recorded");
        return Some(result);
    }
    evaluate(entry, shared);
    Some(result)
}

/// Re-classify and push an alert when the displayed status changes.
fn evaluate(entry: &ServiceEntry, shared: &Shared) {
    let summary = match shared.metrics.summary(&entry.id) {
        Ok(summary) => summary,
        Err(e) => {
            warn!(service = %entry.id, error = %e, "cannot classify service");
            return;
        }
    };
    let (classified, reason) = classify_with_reason(&summary, entry.breaker.state());
    let change = entry
        .tracker()
        .observe(classified, summary.consecutive_successes);

    if let Some((old_status, new_status)) = change {
        info!(
            service = %entry.id,
            from = %old_status,
            to = %new_status,
            %reason,
            "service status changed"
        );
        shared.alerter.push(AlertEvent {
            service_id: entry.id.clone(),
            old_status,
            new_status,
            reason,
            timestamp_ms: epoch_millis(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::{FnProbe, ProbeOutcome};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vigil_core::BreakerState;

    /// Probe that replays queued outcomes, then succeeds.
    fn scripted() -> (Arc<Mutex<VecDeque<ProbeOutcome>>>, Arc<dyn Probe>) {
        let script = Arc::new(Mutex::new(VecDeque::new()));
        let queue = script.clone();
        let probe = FnProbe::new("scripted", move || {
            let next = queue.lock().unwrap().pop_front();
            async move { next.unwrap_or_else(ProbeOutcome::ok) }
        });
        (script, Arc::new(probe))
    }

    fn push(script: &Mutex<VecDeque<ProbeOutcome>>, outcome: ProbeOutcome, times: usize) {
        let mut queue = script.lock().unwrap();
        for _ in 0..times {
            queue.push_back(outcome.clone());
        }
    }

    fn config(id: &str) -> ServiceConfig {
        let mut config = ServiceConfig::new(id, ProbeSpec::Custom { name: id.to_string() });
        config.poll_interval = Duration::from_secs(3600);
        config
    }

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(Arc::new(MetricsStore::new()), Arc::new(Alerter::new(64)))
            .with_snapshot_ttl(Duration::ZERO)
    }

    async fn check_times(monitor: &HealthMonitor, id: &str, times: usize) {
        for _ in 0..times {
            monitor.check_now(id).await.unwrap();
        }
    }

    fn http_error() -> ProbeOutcome {
        ProbeOutcome::fail(ErrorKind::HttpError, "status 500")
    }

    #[tokio::test]
    async fn register_and_deregister() {
        let monitor = monitor();
        let (_, probe) = scripted();
        monitor
            .register_with_probe(config("reddit-scraper"), probe.clone())
            .await
            .unwrap();
        assert!(monitor.is_registered("reddit-scraper").await);
        assert!(matches!(
            monitor.register_with_probe(config("reddit-scraper"), probe).await,
            Err(MonitorError::AlreadyRegistered(_))
        ));

        monitor.deregister("reddit-scraper").await.unwrap();
        assert!(!monitor.is_registered("reddit-scraper").await);
        assert!(monitor.metrics().service_ids().is_empty());
        assert!(matches!(
            monitor.deregister("reddit-scraper").await,
            Err(MonitorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn invalid_config_rejected() {
        let monitor = monitor();
        let (_, probe) = scripted();
        let mut bad = config("svc");
        bad.failure_threshold = 0;
        assert!(matches!(
            monitor.register_with_probe(bad, probe).await,
            Err(MonitorError::Config(_))
        ));

        // Custom probes cannot be built from config alone.
        assert!(matches!(
            monitor.register(config("svc")).await,
            Err(MonitorError::Config(vigil_core::ConfigError::ProbeRequired(_)))
        ));
    }

    #[tokio::test]
    async fn failures_open_breaker_and_alert_once() {
        let monitor = monitor();
        let (script, probe) = scripted();
        monitor.register_with_probe(config("svc"), probe).await.unwrap();

        check_times(&monitor, "svc", 10).await;
        push(&script, http_error(), 3);
        check_times(&monitor, "svc", 3).await;

        let breaker = monitor.breaker("svc").await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!monitor.allow("svc").await.unwrap());

        // Breaker open: next tick is short-circuited, not a failure.
        assert!(monitor.check_now("svc").await.unwrap().is_none());
        let detail = monitor.service_detail("svc", None).await.unwrap();
        assert_eq!(detail.status, HealthStatus::Critical);
        assert_eq!(detail.metrics.totals.total_attempts, 13);
        assert_eq!(detail.metrics.short_circuited, 1);

        let alerts = monitor.recent_alerts(10);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].old_status, HealthStatus::Healthy);
        assert_eq!(alerts[0].new_status, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn recovery_requires_consecutive_successes() {
        let monitor = monitor();
        let (script, probe) = scripted();
        let mut cfg = config("svc");
        cfg.cool_down = Duration::ZERO;
        monitor.register_with_probe(cfg, probe).await.unwrap();

        check_times(&monitor, "svc", 20).await;
        push(&script, http_error(), 3);
        check_times(&monitor, "svc", 3).await;
        assert_eq!(
            monitor.service_detail("svc", None).await.unwrap().status,
            HealthStatus::Critical
        );

        // First trial succeeds: half-open, still displayed critical.
        check_times(&monitor, "svc", 1).await;
        let detail = monitor.service_detail("svc", None).await.unwrap();
        assert_eq!(detail.breaker.state, BreakerState::HalfOpen);
        assert_eq!(detail.status, HealthStatus::Critical);

        check_times(&monitor, "svc", 1).await;
        let detail = monitor.service_detail("svc", None).await.unwrap();
        assert_eq!(detail.breaker.state, BreakerState::Closed);
        assert_eq!(detail.status, HealthStatus::Healthy);

        let alerts = monitor.recent_alerts(10);
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].new_status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn rate_limit_does_not_trip_breaker_by_default() {
        let monitor = monitor();
        let (script, probe) = scripted();
        let mut cfg = config("svc");
        cfg.failure_threshold = 1;
        monitor.register_with_probe(cfg.clone(), probe).await.unwrap();

        push(&script, ProbeOutcome::fail(ErrorKind::RateLimit, "status 429"), 1);
        check_times(&monitor, "svc", 1).await;
        assert_eq!(monitor.breaker("svc").await.unwrap().state(), BreakerState::Closed);
        let uptime = monitor.uptime("svc").await.unwrap();
        assert_eq!(uptime.totals.total_failures, 1);

        cfg.rate_limit_trips_breaker = true;
        monitor.update_config("svc", cfg).await.unwrap();
        push(&script, ProbeOutcome::fail(ErrorKind::RateLimit, "status 429"), 1);
        check_times(&monitor, "svc", 1).await;
        assert_eq!(monitor.breaker("svc").await.unwrap().state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn reset_clears_everything_but_totals() {
        let monitor = monitor();
        let (script, probe) = scripted();
        monitor.register_with_probe(config("svc"), probe).await.unwrap();
        push(&script, http_error(), 3);
        check_times(&monitor, "svc", 3).await;

        monitor.reset("svc").await.unwrap();
        let detail = monitor.service_detail("svc", None).await.unwrap();
        assert_eq!(detail.status, HealthStatus::Healthy);
        assert_eq!(detail.breaker.state, BreakerState::Closed);
        assert_eq!(detail.metrics.window_len, 0);
        assert_eq!(detail.metrics.consecutive_failures, 0);
        assert_eq!(detail.metrics.totals.total_attempts, 3);

        let alerts = monitor.recent_alerts(1);
        assert_eq!(alerts[0].reason, "reset by operator");
    }

    #[tokio::test]
    async fn snapshot_reports_most_severe_status() {
        let monitor = monitor();
        for (id, failures) in [("healthy", 0), ("warning", 3), ("critical", 6)] {
            let (script, probe) = scripted();
            let mut cfg = config(id);
            cfg.failure_threshold = 10;
            monitor.register_with_probe(cfg, probe).await.unwrap();
            check_times(&monitor, id, 20).await;
            push(&script, http_error(), failures);
            check_times(&monitor, id, failures).await;
        }

        let snapshot = monitor.snapshot().await.unwrap();
        assert_eq!(snapshot.services.len(), 3);
        assert_eq!(snapshot.overall_status, HealthStatus::Critical);
        let status_of = |id: &str| {
            snapshot
                .services
                .iter()
                .find(|s| s.service_id == id)
                .map(|s| s.status)
        };
        assert_eq!(status_of("healthy"), Some(HealthStatus::Healthy));
        assert_eq!(status_of("warning"), Some(HealthStatus::Warning));
        assert_eq!(status_of("critical"), Some(HealthStatus::Critical));
    }

    #[tokio::test]
    async fn error_breakdown_and_uptime() {
        let monitor = monitor();
        let (script, probe) = scripted();
        let mut cfg = config("svc");
        cfg.failure_threshold = 10;
        monitor.register_with_probe(cfg, probe).await.unwrap();

        check_times(&monitor, "svc", 6).await;
        push(&script, ProbeOutcome::fail(ErrorKind::Timeout, "slow"), 1);
        push(&script, http_error(), 1);
        push(&script, ProbeOutcome::fail(ErrorKind::Timeout, "slow"), 1);
        check_times(&monitor, "svc", 3).await;

        let breakdown = monitor.error_breakdown("svc", Some(24)).await.unwrap();
        assert_eq!(breakdown[0].error_kind, ErrorKind::Timeout);
        assert_eq!(breakdown[0].count, 2);

        let uptime = monitor.uptime("svc").await.unwrap();
        assert!((uptime.uptime_percentage - 66.666).abs() < 0.01);
        assert_eq!(uptime.totals.total_attempts, 9);
    }

    #[tokio::test]
    async fn update_config_rejects_id_mismatch() {
        let monitor = monitor();
        let (_, probe) = scripted();
        monitor.register_with_probe(config("a"), probe).await.unwrap();
        assert!(matches!(
            monitor.update_config("a", config("b")).await,
            Err(MonitorError::IdMismatch { .. })
        ));
        assert!(matches!(
            monitor.update_config("ghost", config("ghost")).await,
            Err(MonitorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn poll_loop_runs_on_schedule() {
        let monitor = monitor();
        let (_, probe) = scripted();
        let mut cfg = config("svc");
        cfg.poll_interval = Duration::from_millis(20);
        cfg.jitter = Duration::ZERO;
        monitor.register_with_probe(cfg, probe).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let totals = monitor.uptime("svc").await.unwrap().totals;
        assert!(totals.total_attempts >= 2);

        monitor.stop_all().await;
        assert!(monitor.list_services().await.is_empty());
    }

    #[tokio::test]
    async fn registrations_survive_restart() {
        let store = StateStore::open_in_memory().unwrap();
        let tcp = ServiceConfig::new(
            "db",
            ProbeSpec::Tcp {
                address: "127.0.0.1:1".to_string(),
            },
        );

        let first = monitor().with_store(store.clone());
        first.register(tcp.clone()).await.unwrap();
        // Custom probes are not persisted.
        let (_, probe) = scripted();
        first.register_with_probe(config("custom"), probe).await.unwrap();
        first.stop_all().await;
        assert_eq!(store.list_services().unwrap().len(), 1);

        let second = monitor().with_store(store.clone());
        assert_eq!(second.load_persisted().await.unwrap(), 1);
        assert_eq!(second.list_services().await, vec![tcp]);

        second.deregister("db").await.unwrap();
        assert!(store.list_services().unwrap().is_empty());
    }

    #[tokio::test]
    async fn prometheus_lists_registered_services() {
        let monitor = monitor();
        let (_, probe) = scripted();
        monitor.register_with_probe(config("svc"), probe).await.unwrap();
        check_times(&monitor, "svc", 1).await;

        let text = monitor.render_prometheus().await.unwrap();
        assert!(text.contains("vigil_checks_total{service=\"svc\"} 1"));
        assert!(text.contains("vigil_history_writes_dropped_total 0"));
    }

    /// Probe that fails once, then sleeps before succeeding. Counts calls
    /// and completed slow calls.
    fn slow_after_failure(delay: Duration) -> (Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<dyn Probe>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (c, f) = (calls.clone(), finished.clone());
        let probe = FnProbe::new("slow", move || {
            let call = c.fetch_add(1, Ordering::SeqCst);
            let finished = f.clone();
            async move {
                if call == 0 {
                    return http_error();
                }
                tokio::time::sleep(delay).await;
                finished.fetch_add(1, Ordering::SeqCst);
                ProbeOutcome::ok()
            }
        });
        (calls, finished, Arc::new(probe))
    }

    fn fast_cycle_config(id: &str) -> ServiceConfig {
        let mut config = config(id);
        config.failure_threshold = 1;
        config.success_threshold = 1;
        config.cool_down = Duration::ZERO;
        config.poll_interval = Duration::from_millis(20);
        config.jitter = Duration::ZERO;
        config.probe_timeout = Duration::from_secs(5);
        config
    }

    async fn wait_for(breaker: &CircuitBreaker, pred: impl Fn(&BreakerSnapshot) -> bool) -> bool {
        for _ in 0..300 {
            if pred(&breaker.snapshot()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn reload_during_trial_lets_breaker_close() {
        let monitor = monitor();
        let (calls, _, probe) = slow_after_failure(Duration::from_millis(300));
        monitor
            .register_with_probe(fast_cycle_config("svc"), probe)
            .await
            .unwrap();
        let breaker = monitor.breaker("svc").await.unwrap();
        let in_trial = |s: &BreakerSnapshot| s.state == BreakerState::HalfOpen && s.half_open_probe_in_flight;
        assert!(wait_for(&breaker, in_trial).await);

        let mut reloaded = fast_cycle_config("svc");
        reloaded.recovery_probes = 1;
        monitor.update_config("svc", reloaded).await.unwrap();

        assert!(wait_for(&breaker, |s| s.state == BreakerState::Closed).await);
        assert!(!breaker.snapshot().half_open_probe_in_flight);
        assert!(calls.load(Ordering::SeqCst) >= 2);
        monitor.stop_all().await;
    }

    #[tokio::test]
    async fn deregister_cancels_in_flight_trial() {
        let monitor = monitor();
        let (calls, finished, probe) = slow_after_failure(Duration::from_millis(300));
        monitor
            .register_with_probe(fast_cycle_config("svc"), probe)
            .await
            .unwrap();
        let breaker = monitor.breaker("svc").await.unwrap();
        assert!(wait_for(&breaker, |s| s.half_open_probe_in_flight).await);

        monitor.deregister("svc").await.unwrap();
        assert!(wait_for(&breaker, |s| !s.half_open_probe_in_flight).await);

        // The aborted probe never completes and nothing polls again.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.allow());
    }
}
