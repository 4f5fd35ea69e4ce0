use thiserror::Error;

use vigil_core::{ConfigError, ServiceId};
use vigil_metrics::MetricsError;
use vigil_state::StateError;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("service {0} is not registered")]
    NotFound(ServiceId),

    #[error("service {0} is already registered")]
    AlreadyRegistered(ServiceId),

    #[error("config id {found} does not match service {expected}")]
    IdMismatch { expected: ServiceId, found: ServiceId },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("history store: {0}")]
    State(#[from] StateError),
}

pub type MonitorResult<T> = Result<T, MonitorError>;
