//! Configuration errors.

use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// These are the only errors Vigil treats as fatal to a registration:
/// probe failures are data, not errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid service id {0:?}: use 1-128 characters from [A-Za-z0-9._-]")]
    InvalidId(String),

    #[error("service id {0:?} is reserved")]
    ReservedId(String),

    #[error("duplicate service id {0:?}")]
    Duplicate(String),

    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    #[error("service {service}: invalid {field}: {reason}")]
    InvalidValue {
        service: String,
        field: &'static str,
        reason: String,
    },

    #[error("service {0} uses a custom probe and must be registered with one")]
    ProbeRequired(String),
}
