//! MetricsStore — per-service rolling windows behind per-service locks.
//!
//! The registry map is only locked long enough to clone an `Arc`; every
//! read or write then locks that one service's window. Two services never
//! contend, and no lock is held across an await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use thiserror::Error;
use tracing::debug;

use vigil_core::{HealthCheckResult, ServiceId, epoch_millis};

use crate::history::HistoryWriter;
use crate::window::{ErrorBreakdown, MetricsSummary, RollingWindow, Totals, Window};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetricsError {
    #[error("service {0} is not registered")]
    UnknownService(ServiceId),

    #[error("metrics for service {0} are inconsistent")]
    Corrupted(ServiceId),
}

pub type SharedWindow = Arc<Mutex<RollingWindow>>;

/// Lock a window, recovering the data if a previous holder panicked.
pub fn lock_window(window: &SharedWindow) -> MutexGuard<'_, RollingWindow> {
    window.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Thread-safe store of rolling windows, one per service.
#[derive(Default)]
pub struct MetricsStore {
    windows: RwLock<HashMap<ServiceId, SharedWindow>>,
    /// Optional best-effort persistence.
    history: Option<HistoryWriter>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror every recorded result into the history store.
    pub fn with_history(mut self, history: HistoryWriter) -> Self {
        self.history = Some(history);
        self
    }

    /// Results the history writer had to drop; 0 without history.
    pub fn dropped_history_writes(&self) -> u64 {
        self.history.as_ref().map_or(0, HistoryWriter::dropped)
    }

    /// Register a service. Re-registering resizes the existing window.
    pub fn register(&self, service_id: &str, capacity: usize) {
        let mut windows = self.windows.write().unwrap_or_else(|p| p.into_inner());
        match windows.get(service_id) {
            Some(existing) => lock_window(existing).resize(capacity),
            None => {
                windows.insert(
                    service_id.to_string(),
                    Arc::new(Mutex::new(RollingWindow::new(capacity))),
                );
            }
        }
        debug!(%service_id, capacity, "registered for metrics");
    }

    /// Discard a service's window. Returns true if it existed.
    pub fn unregister(&self, service_id: &str) -> bool {
        let mut windows = self.windows.write().unwrap_or_else(|p| p.into_inner());
        let existed = windows.remove(service_id).is_some();
        debug!(%service_id, existed, "unregistered from metrics");
        existed
    }

    /// The shared window of one service.
    pub fn window(&self, service_id: &str) -> Option<SharedWindow> {
        let windows = self.windows.read().unwrap_or_else(|p| p.into_inner());
        windows.get(service_id).cloned()
    }

    fn with_window<R>(
        &self,
        service_id: &str,
        f: impl FnOnce(&mut RollingWindow) -> R,
    ) -> Result<R, MetricsError> {
        let window = self
            .window(service_id)
            .ok_or_else(|| MetricsError::UnknownService(service_id.to_string()))?;
        let mut guard = lock_window(&window);
        Ok(f(&mut guard))
    }

    /// Ingest a check result. Persistence is handed off without waiting.
    pub fn record(&self, result: HealthCheckResult) -> Result<(), MetricsError> {
        let service_id = result.service_id.clone();
        match &self.history {
            Some(history) => {
                let copy = result.clone();
                self.with_window(&service_id, |w| w.record(result))?;
                history.submit(copy);
            }
            None => self.with_window(&service_id, |w| w.record(result))?,
        }
        Ok(())
    }

    pub fn record_short_circuit(&self, service_id: &str) -> Result<(), MetricsError> {
        self.with_window(service_id, |w| w.record_short_circuit())
    }

    pub fn success_rate(&self, service_id: &str, window: Window) -> Result<f64, MetricsError> {
        self.with_window(service_id, |w| w.success_rate(window))
    }

    pub fn uptime_percentage(&self, service_id: &str) -> Result<f64, MetricsError> {
        self.with_window(service_id, |w| w.uptime_percentage())
    }

    pub fn avg_latency(&self, service_id: &str, window: Window) -> Result<f64, MetricsError> {
        self.with_window(service_id, |w| w.avg_latency(window))
    }

    pub fn error_breakdown(
        &self,
        service_id: &str,
        window: Window,
    ) -> Result<Vec<ErrorBreakdown>, MetricsError> {
        self.with_window(service_id, |w| w.error_breakdown(window))
    }

    pub fn totals(&self, service_id: &str) -> Result<Totals, MetricsError> {
        self.with_window(service_id, |w| w.totals())
    }

    pub fn recent(
        &self,
        service_id: &str,
        limit: usize,
    ) -> Result<Vec<HealthCheckResult>, MetricsError> {
        self.with_window(service_id, |w| w.recent(limit))
    }

    /// Summary over the whole window, checked for consistency.
    pub fn summary(&self, service_id: &str) -> Result<MetricsSummary, MetricsError> {
        let now = epoch_millis();
        self.with_window(service_id, |w| {
            w.is_consistent().then(|| w.summary(now))
        })?
        .ok_or_else(|| MetricsError::Corrupted(service_id.to_string()))
    }

    /// Clear one service's window and streaks.
    pub fn reset(&self, service_id: &str) -> Result<(), MetricsError> {
        self.with_window(service_id, |w| w.clear())
    }

    pub fn service_ids(&self) -> Vec<ServiceId> {
        let windows = self.windows.read().unwrap_or_else(|p| p.into_inner());
        let mut ids: Vec<_> = windows.keys().cloned().collect();
        ids.sort();
        ids
    }
}
