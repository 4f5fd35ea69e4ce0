//! vigil-core — shared types and configuration for Vigil.
//!
//! Everything the other Vigil crates exchange lives here: check results,
//! breaker and health states, alert events, and the typed per-service
//! configuration that is validated before a service is registered.
//!
//! # Configuration
//!
//! ```toml
//! [server]
//! port = 8450
//! admin_token = "change-me"
//!
//! [defaults]
//! poll_interval = "30s"
//! failure_threshold = 3
//!
//! [[services]]
//! id = "reddit-scraper"
//! probe = { kind = "http", address = "127.0.0.1:9001", path = "/health" }
//! ```
//!
//! Keys in `[defaults]` are applied to every `[[services]]` entry that does
//! not set them itself.

pub mod config;
pub mod duration;
pub mod error;
pub mod types;

pub use config::{ProbeSpec, ServiceConfig, VigilConfig};
pub use duration::{format_duration, parse_duration};
pub use error::ConfigError;
pub use types::*;
