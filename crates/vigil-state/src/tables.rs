//! redb table definitions for the Vigil history store.

use redb::TableDefinition;

/// Check results keyed by `{service}:{timestamp_ms:020}:{seq:06}`.
pub const CHECKS: TableDefinition<&str, &[u8]> = TableDefinition::new("checks");

/// Registered service configs keyed by `{service}`.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Key for one check result.
pub fn check_key(service_id: &str, timestamp_ms: u64, seq: u64) -> String {
    format!("{service_id}:{timestamp_ms:020}:{:06}", seq % 1_000_000)
}

/// Half-open key range `[start, end)` covering one service's checks from
/// `since_ms` onwards. `;` sorts directly after `:`.
pub fn check_range(service_id: &str, since_ms: u64) -> (String, String) {
    (format!("{service_id}:{since_ms:020}"), format!("{service_id};"))
}

/// Extract the timestamp from a check key.
pub fn check_key_timestamp(key: &str) -> Option<u64> {
    let mut parts = key.rsplitn(3, ':');
    let _seq = parts.next()?;
    parts.next()?.parse().ok()
}
