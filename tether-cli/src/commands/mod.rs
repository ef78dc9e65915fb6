pub mod daemon;
pub mod ps;
pub mod start;
pub mod stop;

use anyhow::{anyhow, Error};

use tether_daemon::DaemonError;

/// Turn a daemon client error into a message that says what to do next.
pub(crate) fn explain(err: DaemonError, action: &str) -> Error {
    match err {
        DaemonError::DaemonNotRunning { .. } => {
            anyhow!("daemon is not running; start it with `tether daemon start`")
        }
        DaemonError::Rejected {
            kind: Some(kind),
            message,
        } if kind == "duplicate_launch" => anyhow!("{message} (use `tether stop` first)"),
        other => Error::new(other).context(format!("failed to {action}")),
    }
}
