//! Tracker configuration, read from `<home>/.tether/config.yaml`.
//!
//! Every field is optional in the file; a missing file is the default config.
//!
//! ```yaml
//! execution_url: http://localhost:3000
//! status_url_template: ws://localhost:3000/api/process/{process_id}/ws
//! session_id: 3f2a…
//! request_timeout_secs: 10
//! audit_interval_secs: 30
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::store::tether_root;
use crate::types::ProcessId;

pub const CONFIG_FILE: &str = "config.yaml";
pub const PROCESS_ID_PLACEHOLDER: &str = "{process_id}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Base URL of the execution service.
    pub execution_url: String,
    /// Websocket URL of a process status stream; must contain `{process_id}`.
    pub status_url_template: String,
    /// Sent as `x-session-id` on every execution service request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub request_timeout_secs: u64,
    /// Periodic liveness audit against the execution service. Off when unset or 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_interval_secs: Option<u64>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            execution_url: "http://localhost:3000".to_string(),
            status_url_template: format!(
                "ws://localhost:3000/api/process/{PROCESS_ID_PLACEHOLDER}/ws"
            ),
            session_id: None,
            request_timeout_secs: 10,
            audit_interval_secs: None,
        }
    }
}

impl TrackerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn audit_interval(&self) -> Option<Duration> {
        self.audit_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Status endpoint for one process.
    pub fn status_url(&self, process_id: &ProcessId) -> String {
        self.status_url_template
            .replace(PROCESS_ID_PLACEHOLDER, process_id.as_str())
    }

    fn validate(self, path: &Path) -> Result<Self, ConfigError> {
        if !self.status_url_template.contains(PROCESS_ID_PLACEHOLDER) {
            return Err(ConfigError::Invalid(format!(
                "status_url_template in {} must contain {PROCESS_ID_PLACEHOLDER}",
                path.display()
            )));
        }
        if self.execution_url.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "execution_url in {} must not be empty",
                path.display()
            )));
        }
        Ok(self)
    }
}

/// `<home>/.tether/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    tether_root(home).join(CONFIG_FILE)
}

/// Load the config, falling back to defaults when the file does not exist.
pub fn load_at(home: &Path) -> Result<TrackerConfig, ConfigError> {
    let path = config_path_at(home);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(TrackerConfig::default())
        }
        Err(source) => return Err(ConfigError::Io { path, source }),
    };
    if contents.trim().is_empty() {
        return Ok(TrackerConfig::default());
    }
    let config: TrackerConfig = serde_yaml::from_str(&contents).map_err(|source| {
        ConfigError::Parse {
            path: path.clone(),
            source,
        }
    })?;
    config.validate(&path)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<TrackerConfig, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
    load_at(&home)
}
