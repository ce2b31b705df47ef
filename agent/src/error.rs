//! Error types for the Replay agent.
//!
//! Each subsystem has its own error enum next to its code. [`AgentError`]
//! gathers them for the lifecycle, which is where startup failures surface.

use thiserror::Error;

use crate::config::ConfigError;
use crate::recorder::RecorderError;
use crate::sink::SinkError;
use crate::uploader::UploadError;

/// Errors that can occur while starting or stopping the agent.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Event sink error.
    #[error("event sink error: {0}")]
    Sink(#[from] SinkError),

    /// Session registration or upload error.
    #[error("upload error: {0}")]
    Upload(#[from] UploadError),

    /// Capture process error.
    #[error("recorder error: {0}")]
    Recorder(#[from] RecorderError),
}

/// Result type alias using [`AgentError`].
pub type Result<T> = std::result::Result<T, AgentError>;
