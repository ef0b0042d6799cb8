use crate::config::ConfigError;
use crate::supervisor::TaskKind;
use crate::telemetry::TelemetryError;
use crate::transport::TransportError;
use thiserror::Error;

/// Failures that end an emulator task, and with it the whole run.
#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("operator input error: {0}")]
    Input(#[from] std::io::Error),
    #[error("telemetry serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("telemetry event rejected: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("{0} task panicked")]
    TaskPanicked(TaskKind),
}
