//! Errors raised inside pipeline phases, before classification.

use std::time::Duration;

use platforms_parser::ExtractorError;
use thiserror::Error;

use crate::domain::CheckpointError;
use crate::download::DownloadError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("extraction failed on {platform}: {source}")]
    Extraction {
        platform: String,
        #[source]
        source: ExtractorError,
    },

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },

    #[error("{service} returned {status:?}: {message}")]
    Service {
        service: &'static str,
        status: Option<u16>,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("{0}")]
    Store(#[from] crate::Error),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Marks work that must not be retried.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The job was cancelled between phases.
    #[error("job cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn service(service: &'static str, status: Option<u16>, message: impl Into<String>) -> Self {
        PipelineError::Service {
            service,
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        PipelineError::InvalidInput(message.into())
    }
}

impl From<process_utils::ToolError> for PipelineError {
    fn from(e: process_utils::ToolError) -> Self {
        let tool = match &e {
            process_utils::ToolError::Spawn { program, .. }
            | process_utils::ToolError::Wait { program, .. }
            | process_utils::ToolError::TimedOut { program, .. } => program.clone(),
        };
        PipelineError::Tool {
            tool,
            message: e.to_string(),
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        PipelineError::Service {
            service: "http",
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
            retry_after: None,
        }
    }
}
