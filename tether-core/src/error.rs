//! Error types for tether-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ApplicationId;

/// Errors from reading or writing the durable process store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error (save path).
    #[error("store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// `dirs::home_dir()` returned `None`, so `~/.tether/` cannot be located.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

/// Errors from loading `~/.tether/config.yaml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load, with the file path.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

/// Failures of tracker operations.
///
/// `LaunchFailed`, `StopFailed` and `DuplicateLaunch` are returned to callers
/// and never mutate the registry. The channel variants describe terminal
/// signals the channel manager absorbs itself; they are logged, not returned.
/// `StorageCorrupt` describes one persisted entry dropped at reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("launch of '{application_id}' failed: {message}")]
    LaunchFailed {
        application_id: ApplicationId,
        message: String,
    },

    #[error("stop of '{application_id}' failed: {message}")]
    StopFailed {
        application_id: ApplicationId,
        message: String,
    },

    #[error("application '{0}' is already running or being launched")]
    DuplicateLaunch(ApplicationId),

    #[error("status channel transport error: {0}")]
    ChannelTransportError(String),

    #[error("status channel closed abnormally (code {code:?})")]
    ChannelAbnormalClose { code: Option<u16> },

    #[error("persisted entry '{key}' is unusable: {reason}")]
    StorageCorrupt { key: String, reason: String },

    /// The tracker's control loop is gone (shut down or crashed).
    #[error("tracker is not running")]
    TrackerUnavailable,
}

impl TrackerError {
    /// Stable machine-readable tag used on the daemon wire protocol.
    pub fn kind(&self) -> &'static str {
        match self {
            TrackerError::LaunchFailed { .. } => "launch_failed",
            TrackerError::StopFailed { .. } => "stop_failed",
            TrackerError::DuplicateLaunch(_) => "duplicate_launch",
            TrackerError::ChannelTransportError(_) => "channel_transport_error",
            TrackerError::ChannelAbnormalClose { .. } => "channel_abnormal_close",
            TrackerError::StorageCorrupt { .. } => "storage_corrupt",
            TrackerError::TrackerUnavailable => "tracker_unavailable",
        }
    }
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn store_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
