//! vigil.toml configuration parser and per-service configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::serde_duration;
use crate::error::ConfigError;
use crate::types::ServiceId;

/// Service ids that would shadow fixed API routes.
const RESERVED_IDS: &[&str] = &["dashboard", "alerts"];

// ── Per-service config ────────────────────────────────────────────

/// How a service is probed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// HTTP GET against `http://{address}{path}`.
    Http {
        address: String,
        #[serde(default = "default_http_path")]
        path: String,
        /// Treat a non-JSON body as `parse_error` and count returned items.
        #[serde(default)]
        expect_json: bool,
    },
    /// TCP connect only.
    Tcp { address: String },
    /// In-process probe supplied at registration time.
    Custom { name: String },
}

/// Typed configuration for one monitored service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub id: ServiceId,
    pub probe: ProbeSpec,
    #[serde(default = "default_poll_interval", with = "serde_duration")]
    pub poll_interval: Duration,
    #[serde(default = "default_probe_timeout", with = "serde_duration")]
    pub probe_timeout: Duration,
    /// Upper bound of the random delay added to each poll interval.
    #[serde(default = "default_jitter", with = "serde_duration")]
    pub jitter: Duration,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_cool_down", with = "serde_duration")]
    pub cool_down: Duration,
    /// Number of most recent results kept in the rolling window.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Consecutive successes required before a critical status is lifted.
    #[serde(default = "default_recovery_probes")]
    pub recovery_probes: u32,
    /// Whether `rate_limit` outcomes count toward the breaker's failure streak.
    #[serde(default)]
    pub rate_limit_trips_breaker: bool,
}

fn default_http_path() -> String {
    "/health".to_string()
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_probe_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_jitter() -> Duration {
    Duration::from_secs(2)
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_success_threshold() -> u32 {
    2
}
fn default_cool_down() -> Duration {
    Duration::from_secs(60)
}
fn default_window_size() -> usize {
    100
}
fn default_recovery_probes() -> u32 {
    2
}

impl ServiceConfig {
    /// A config with default tunables.
    pub fn new(id: impl Into<ServiceId>, probe: ProbeSpec) -> Self {
        Self {
            id: id.into(),
            probe,
            poll_interval: default_poll_interval(),
            probe_timeout: default_probe_timeout(),
            jitter: default_jitter(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            cool_down: default_cool_down(),
            window_size: default_window_size(),
            recovery_probes: default_recovery_probes(),
            rate_limit_trips_breaker: false,
        }
    }

    /// Reject configurations that would make the monitor misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_id(&self.id)?;

        let invalid = |field: &'static str, reason: &str| ConfigError::InvalidValue {
            service: self.id.clone(),
            field,
            reason: reason.to_string(),
        };

        if self.failure_threshold == 0 {
            return Err(invalid("failure_threshold", "must be at least 1"));
        }
        if self.success_threshold == 0 {
            return Err(invalid("success_threshold", "must be at least 1"));
        }
        if self.window_size == 0 || self.window_size > 100_000 {
            return Err(invalid("window_size", "must be between 1 and 100000"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval", "must be greater than zero"));
        }
        if self.probe_timeout.is_zero() {
            return Err(invalid("probe_timeout", "must be greater than zero"));
        }
        if self.jitter > self.poll_interval {
            return Err(invalid("jitter", "must not exceed poll_interval"));
        }

        match &self.probe {
            ProbeSpec::Http { address, path, .. } => {
                if address.trim().is_empty() {
                    return Err(invalid("probe.address", "must not be empty"));
                }
                if !path.starts_with('/') {
                    return Err(invalid("probe.path", "must start with '/'"));
                }
            }
            ProbeSpec::Tcp { address } => {
                if address.trim().is_empty() {
                    return Err(invalid("probe.address", "must not be empty"));
                }
            }
            ProbeSpec::Custom { .. } => {}
        }
        Ok(())
    }
}

/// Service ids appear in URL paths and store keys.
pub fn validate_id(id: &str) -> Result<(), ConfigError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid {
        return Err(ConfigError::InvalidId(id.to_string()));
    }
    if RESERVED_IDS.contains(&id) {
        return Err(ConfigError::ReservedId(id.to_string()));
    }
    Ok(())
}

// ── vigil.toml ────────────────────────────────────────────────────

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VigilConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Required in `x-admin-token` for reset/registration routes.
    /// When unset those routes are disabled.
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            admin_token: None,
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8450
}

/// Best-effort persistence of check results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// redb file; history is disabled when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_history_queue")]
    pub queue_capacity: usize,
    #[serde(default = "default_retention", with = "serde_duration")]
    pub retention: Duration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: None,
            queue_capacity: default_history_queue(),
            retention: default_retention(),
        }
    }
}

fn default_history_queue() -> usize {
    1024
}
fn default_retention() -> Duration {
    Duration::from_secs(7 * 86_400)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_alert_queue")]
    pub queue_capacity: usize,
    /// Log every alert through `tracing`.
    #[serde(default = "default_true")]
    pub log: bool,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_alert_queue(),
            log: true,
            webhook: None,
        }
    }
}

fn default_alert_queue() -> usize {
    256
}
fn default_true() -> bool {
    true
}

/// Alerts are POSTed as JSON to `http://{address}{path}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookConfig {
    pub address: String,
    #[serde(default = "default_webhook_path")]
    pub path: String,
    #[serde(default = "default_webhook_timeout", with = "serde_duration")]
    pub timeout: Duration,
}

fn default_webhook_path() -> String {
    "/".to_string()
}
fn default_webhook_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_snapshot_ttl", with = "serde_duration")]
    pub snapshot_ttl: Duration,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            snapshot_ttl: default_snapshot_ttl(),
        }
    }
}

fn default_snapshot_ttl() -> Duration {
    Duration::from_secs(5)
}

impl VigilConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate a vigil.toml document.
    ///
    /// Keys from `[defaults]` are copied into each `[[services]]` table that
    /// does not set them.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut doc: toml::Table = toml::from_str(content)?;

        if let Some(toml::Value::Table(defaults)) = doc.remove("defaults") {
            if let Some(toml::Value::Array(services)) = doc.get_mut("services") {
                for service in services.iter_mut() {
                    if let toml::Value::Table(entry) = service {
                        for (key, value) in &defaults {
                            if !entry.contains_key(key) {
                                entry.insert(key.clone(), value.clone());
                            }
                        }
                    }
                }
            }
        }

        let config: VigilConfig = toml::Value::Table(doc).try_into()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for service in &self.services {
            service.validate()?;
            if matches!(service.probe, ProbeSpec::Custom { .. }) {
                return Err(ConfigError::ProbeRequired(service.id.clone()));
            }
            if !seen.insert(service.id.as_str()) {
                return Err(ConfigError::Duplicate(service.id.clone()));
            }
        }
        if self.alerts.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                service: "-".to_string(),
                field: "alerts.queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.history.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                service: "-".to_string(),
                field: "history.queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
