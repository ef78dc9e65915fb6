use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the daemon runtime and its socket protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] tether_core::ConfigError),

    #[error("store error: {0}")]
    Store(#[from] tether_core::StoreError),

    #[error("tracker error: {0}")]
    Tracker(#[from] tether_core::TrackerError),

    #[error("execution service error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    /// The daemon answered with an error; `kind` is the tracker error tag when present.
    #[error("{message}")]
    Rejected {
        kind: Option<String>,
        message: String,
    },

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

/// Failures talking to the execution service.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The service answered with a non-success status.
    #[error("execution service answered {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected execution service response: {0}")]
    InvalidResponse(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
