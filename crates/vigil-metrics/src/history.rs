//! Best-effort persistence of check results.
//!
//! `HistoryWriter::submit` never waits: results go into a bounded channel
//! and are dropped (and counted) when it is full. A background task drains
//! the channel into the `StateStore` in small batches and prunes results
//! older than the retention period.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use vigil_core::{HealthCheckResult, epoch_millis};
use vigil_state::StateStore;

const MAX_BATCH: usize = 64;
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Handle used by the metrics store to hand off results.
#[derive(Clone)]
pub struct HistoryWriter {
    tx: mpsc::Sender<HealthCheckResult>,
    dropped: Arc<AtomicU64>,
}

impl HistoryWriter {
    /// Spawn the writer task. It stops on shutdown (after draining what is
    /// queued) or once every `HistoryWriter` clone is dropped.
    pub fn spawn(
        store: StateStore,
        capacity: usize,
        retention: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_writer(store, rx, retention, shutdown));
        let writer = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (writer, handle)
    }

    /// Queue a result for persistence. Returns false if it was dropped.
    pub fn submit(&self, result: HealthCheckResult) -> bool {
        match self.tx.try_send(result) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(result)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(service = %result.service_id, dropped, "history queue full, result dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Results dropped because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn run_writer(
    store: StateStore,
    mut rx: mpsc::Receiver<HealthCheckResult>,
    retention: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(retention_secs = retention.as_secs(), "history writer started");
    let mut prune = tokio::time::interval(PRUNE_INTERVAL);

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(first) = received else { break };
                let mut batch = vec![first];
                while batch.len() < MAX_BATCH {
                    match rx.try_recv() {
                        Ok(result) => batch.push(result),
                        Err(_) => break,
                    }
                }
                write_batch(&store, &batch);
            }
            _ = prune.tick() => {
                let cutoff = epoch_millis().saturating_sub(retention.as_millis() as u64);
                if let Err(e) = store.prune_results_before(cutoff) {
                    warn!(error = %e, "history prune failed");
                }
            }
            _ = shutdown.changed() => {
                let mut batch = Vec::new();
                while let Ok(result) = rx.try_recv() {
                    batch.push(result);
                }
                write_batch(&store, &batch);
                break;
            }
        }
    }
    info!("history writer stopped");
}

fn write_batch(store: &StateStore, batch: &[HealthCheckResult]) {
    if let Err(e) = store.put_results(batch) {
        error!(error = %e, count = batch.len(), "failed to persist check results");
    }
}
