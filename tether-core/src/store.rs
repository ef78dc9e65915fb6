//! Durable process store.
//!
//! # Storage layout
//!
//! ```text
//! ~/.tether/
//!   processes.json   ({"<application_id>": "<process_id>", …}, mode 0600)
//! ```
//!
//! The whole map is rewritten on every registry mutation using the same
//! `.tmp` sibling + `rename` pattern for every write, so a crash leaves either
//! the previous or the next complete document on disk.
//!
//! Reading is lenient: a missing or unparseable document yields an empty
//! state, and unusable entries are reported individually instead of failing
//! the load.
//!
//! Every function has an `_at(home, …)` form; the bare wrappers resolve the
//! home directory with `dirs::home_dir()`. Tests only use the `_at` forms.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{store_io_err, StoreError, TrackerError};
use crate::types::{ApplicationId, ProcessId};

pub const STORE_FILE: &str = "processes.json";

/// Result of reading the persisted map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedState {
    /// Entries with a usable application id and process id, in key order.
    pub entries: Vec<(ApplicationId, ProcessId)>,
    /// One `TrackerError::StorageCorrupt` per dropped entry.
    pub rejected: Vec<TrackerError>,
    /// Set when the document as a whole could not be parsed.
    pub unreadable: Option<String>,
}

// ---------------------------------------------------------------------------
// 1. Paths
// ---------------------------------------------------------------------------

/// `<home>/.tether`
pub fn tether_root(home: &Path) -> PathBuf {
    home.join(".tether")
}

/// `<home>/.tether/processes.json`: pure, no I/O.
pub fn store_path_at(home: &Path) -> PathBuf {
    tether_root(home).join(STORE_FILE)
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Read the persisted map from `<home>/.tether/processes.json`.
///
/// A missing file is an empty state. Only unexpected I/O failures (permission
/// denied and the like) are returned as errors.
pub fn load_at(home: &Path) -> Result<PersistedState, StoreError> {
    let path = store_path_at(home);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(PersistedState::default())
        }
        Err(err) => return Err(store_io_err(&path, err)),
    };
    Ok(parse_entries(&contents))
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<PersistedState, StoreError> {
    load_at(&home()?)
}

/// Parse a persisted document.
///
/// Values may be strings or non-negative integers (process ids are numeric on
/// most hosts). Anything else, or an empty key or value, rejects that entry.
pub fn parse_entries(contents: &str) -> PersistedState {
    if contents.trim().is_empty() {
        return PersistedState::default();
    }

    let object = match serde_json::from_str::<Value>(contents) {
        Ok(Value::Object(object)) => object,
        Ok(other) => {
            return PersistedState {
                unreadable: Some(format!("expected a JSON object, found {}", json_kind(&other))),
                ..PersistedState::default()
            }
        }
        Err(err) => {
            return PersistedState {
                unreadable: Some(err.to_string()),
                ..PersistedState::default()
            }
        }
    };

    let mut state = PersistedState::default();
    for (key, value) in object {
        let application_id = ApplicationId::from(key.clone());
        if application_id.is_empty() {
            state.rejected.push(corrupt(key, "empty application id"));
            continue;
        }

        let process_id = match value {
            Value::String(s) => ProcessId::from(s),
            Value::Number(n) if n.is_u64() => ProcessId::from(n.to_string()),
            Value::Null => {
                state.rejected.push(corrupt(key, "missing process id"));
                continue;
            }
            other => {
                let reason = format!("process id is a JSON {}", json_kind(&other));
                state.rejected.push(corrupt(key, reason));
                continue;
            }
        };
        if process_id.is_empty() {
            state.rejected.push(corrupt(key, "empty process id"));
            continue;
        }

        state.entries.push((application_id, process_id));
    }
    state
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically replace the persisted map.
///
/// Write flow: serialize → `processes.json.tmp` → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
    let root = tether_root(home);
    if !root.exists() {
        std::fs::create_dir_all(&root).map_err(|e| store_io_err(&root, e))?;
        set_dir_permissions(&root)?;
    }

    let path = store_path_at(home);
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(entries)?;
    std::fs::write(&tmp, json).map_err(|e| store_io_err(&tmp, e))?;
    set_file_permissions(&tmp)?;
    std::fs::rename(&tmp, &path).map_err(|e| store_io_err(&path, e))?;
    Ok(())
}

/// `save_at` convenience wrapper.
pub fn save(entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
    save_at(&home()?, entries)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn corrupt(key: String, reason: impl Into<String>) -> TrackerError {
    TrackerError::StorageCorrupt {
        key,
        reason: reason.into(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn home() -> Result<PathBuf, StoreError> {
    dirs::home_dir().ok_or(StoreError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| store_io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| store_io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
