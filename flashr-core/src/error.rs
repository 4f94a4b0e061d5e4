//! The error taxonomy of the operation engine.
//!
//! Every failure that ends an operation is delivered to the UI as a
//! [`ProgressEvent::Error`](crate::event::ProgressEvent::Error) carrying one of
//! these variants.
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures produced while running, finalizing or aborting an operation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The external pipeline could not be started at all.
    #[error("failed to start {command}: {reason}")]
    Launch { command: String, reason: String },

    /// The pipeline ran but exited unsuccessfully.
    #[error("{command} failed (exit code {code}){}", detail_suffix(.detail))]
    Runtime {
        command: String,
        code: u32,
        detail: Option<String>,
    },

    /// The progress stream stayed silent for longer than the hang window.
    #[error("operation timed out - no progress for {}s", .0.as_secs())]
    Timeout(Duration),

    /// The transfer itself succeeded but making it durable did not.
    #[error("{step} failed: {source}")]
    Finalize {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    /// The kill signal for an abort could not be delivered.
    #[error("error aborting {kind}: {source}")]
    AbortFailed {
        kind: &'static str,
        #[source]
        source: io::Error,
    },

    /// The integrity record store could not be read or written.
    #[error("integrity record {}: {reason}", .path.display())]
    Record { path: PathBuf, reason: String },

    /// The background worker went away without reporting a terminal event.
    #[error("background worker exited without reporting a result")]
    WorkerLost,

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(text) if !text.trim().is_empty() => format!(": {}", text.trim()),
        _ => String::new(),
    }
}

impl EngineError {
    /// Builds a [`EngineError::Launch`] from any displayable cause.
    pub fn launch(command: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Launch {
            command: command.into(),
            reason: format!("{reason:#}"),
        }
    }

    /// Whether this error belongs to the "silent hang" class.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
