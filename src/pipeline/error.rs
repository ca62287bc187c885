//! Pipeline-specific error types.

use thiserror::Error;

/// Errors that can occur while building or running a pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed description, unknown module type, unknown endpoint or empty channel.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A sink failed while handling a packet.
    #[error("Dispatch {source_id} -> {sink_id} on channel '{channel}' failed: {source}")]
    Dispatch {
        source_id: String,
        sink_id: String,
        channel: String,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("Module '{0}' cannot be cloned")]
    NotCloneable(String),

    #[error("Module '{module}' failed to initialize: {message}")]
    Initialization { module: String, message: String },

    #[error("Module '{module}' error: {message}")]
    Module { module: String, message: String },

    #[error("Module '{0}' is not a source")]
    NotASource(String),

    #[error("Remote communication error: {0}")]
    RemoteCommunication(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::Configuration(message.into())
    }

    pub fn module(module: &str, message: impl Into<String>) -> Self {
        PipelineError::Module {
            module: module.to_string(),
            message: message.into(),
        }
    }

    pub fn with_context(self, context: impl Into<String>) -> Self {
        PipelineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Walk through dispatch and context wrappers to the error that started it.
    pub fn root_cause(&self) -> &PipelineError {
        match self {
            PipelineError::Dispatch { source, .. } | PipelineError::WithContext { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
