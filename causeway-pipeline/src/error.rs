//! Pipeline error types.

use causeway_core::{CausewayError, ConfigError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to install tracing subscriber: {reason}")]
    Telemetry { reason: String },

    #[error("Background task {task} failed: {reason}")]
    Task { task: &'static str, reason: String },

    #[error(transparent)]
    Causeway(#[from] CausewayError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
