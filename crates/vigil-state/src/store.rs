//! StateStore — redb-backed persistence for Vigil.
//!
//! Provides typed operations over check results and service registrations.
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use vigil_core::{HealthCheckResult, ServiceConfig};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe history store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    /// Disambiguates results recorded within the same millisecond.
    seq: Arc<AtomicU64>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_db(db);
        store.ensure_tables()?;
        debug!(?path, "history store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_db(db);
        store.ensure_tables()?;
        debug!("in-memory history store opened");
        Ok(store)
    }

    fn from_db(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            seq: Arc::new(AtomicU64::new(vigil_core::epoch_millis())),
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(CHECKS).map_err(map_err!(Table))?;
        txn.open_table(SERVICES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Check results ──────────────────────────────────────────────

    /// Append a single check result.
    pub fn put_result(&self, result: &HealthCheckResult) -> StateResult<()> {
        self.put_results(std::slice::from_ref(result))
    }

    /// Append a batch of check results in one transaction.
    pub fn put_results(&self, results: &[HealthCheckResult]) -> StateResult<()> {
        if results.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CHECKS).map_err(map_err!(Table))?;
            for result in results {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                let key = check_key(&result.service_id, result.timestamp_ms, seq);
                let value = serde_json::to_vec(result).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = results.len(), "check results stored");
        Ok(())
    }

    /// Most recent results for a service (newest first), optionally only
    /// those at or after `since_ms`.
    pub fn list_results(
        &self,
        service_id: &str,
        since_ms: Option<u64>,
        limit: usize,
    ) -> StateResult<Vec<HealthCheckResult>> {
        let (start, end) = check_range(service_id, since_ms.unwrap_or(0));
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECKS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
            .rev()
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let result: HealthCheckResult =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(result);
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    /// Number of stored results for a service.
    pub fn count_results(&self, service_id: &str) -> StateResult<u64> {
        let (start, end) = check_range(service_id, 0);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECKS).map_err(map_err!(Table))?;
        let mut count = 0;
        for entry in table.range(start.as_str()..end.as_str()).map_err(map_err!(Read))? {
            entry.map_err(map_err!(Read))?;
            count += 1;
        }
        Ok(count)
    }

    /// Delete results older than `cutoff_ms` across all services.
    pub fn prune_results_before(&self, cutoff_ms: u64) -> StateResult<u64> {
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(CHECKS).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    let ts = check_key_timestamp(&k)?;
                    (ts < cutoff_ms).then_some(k)
                })
                .collect()
        };
        let removed = self.remove_checks(&keys)?;
        if removed > 0 {
            debug!(removed, cutoff_ms, "pruned check history");
        }
        Ok(removed)
    }

    fn remove_checks(&self, keys: &[String]) -> StateResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CHECKS).map_err(map_err!(Table))?;
            for key in keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(keys.len() as u64)
    }

    // ── Services ───────────────────────────────────────────────────

    /// Insert or update a service registration.
    pub fn put_service(&self, config: &ServiceConfig) -> StateResult<()> {
        let value = serde_json::to_vec(config).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            table
                .insert(config.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(service = %config.id, "service registration stored");
        Ok(())
    }

    /// List all service registrations.
    pub fn list_services(&self) -> StateResult<Vec<ServiceConfig>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let config: ServiceConfig =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(config);
        }
        Ok(results)
    }

    /// Delete a service registration. Returns true if it existed.
    pub fn delete_service(&self, service_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            existed = table.remove(service_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%service_id, existed, "service registration deleted");
        Ok(existed)
    }
}
