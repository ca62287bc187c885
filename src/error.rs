//! Error handling for pipemesh
//!
//! [`PipemeshError`] covers everything above the module graph: settings,
//! deployment planning, the job daemon and remote orchestration. Errors
//! raised inside a running pipeline stay [`PipelineError`] and are wrapped
//! here when they cross that boundary.

use crate::pipeline::PipelineError;
use thiserror::Error;

/// Main error type for pipemesh operations
#[derive(Error, Debug)]
pub enum PipemeshError {
    /// Errors raised while building or running a module graph
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Errors related to settings loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job lifecycle failures inside the daemon
    #[error("Job error: {0}")]
    Job(String),

    /// Failures talking to a remote daemon
    #[error("Remote error: {0}")]
    Remote(String),

    /// Framing violations on a control connection
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<PipemeshError>,
    },
}

impl PipemeshError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        PipemeshError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

impl From<serde_json::Error> for PipemeshError {
    fn from(err: serde_json::Error) -> Self {
        PipemeshError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for PipemeshError {
    fn from(err: toml::de::Error) -> Self {
        PipemeshError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for PipemeshError {
    fn from(err: toml::ser::Error) -> Self {
        PipemeshError::Serialization(err.to_string())
    }
}

/// Result type alias for pipemesh operations
pub type Result<T> = std::result::Result<T, PipemeshError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
