//! Domain types for process tracking.
//!
//! Identifiers are opaque strings supplied by the application directory and
//! the execution service; the core never interprets them beyond emptiness.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identifier of an application in the external application directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationId(pub String);

impl ApplicationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ApplicationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ApplicationId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier the execution service assigned to a launched OS process.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub String);

impl ProcessId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ProcessId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProcessId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        Self(pid.to_string())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Last known state of the status channel attached to a process handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    #[default]
    Connecting,
    Open,
    Closed,
    Errored,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Open => write!(f, "open"),
            ChannelState::Closed => write!(f, "closed"),
            ChannelState::Errored => write!(f, "errored"),
        }
    }
}

/// Why a tracked process stopped being tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCause {
    /// An operator asked the execution service to stop it.
    Requested,
    /// The status channel sent the terminal `stopped` message.
    TerminalMessage,
    /// The status channel failed at the transport level.
    TransportError,
    /// The status channel closed without a close handshake.
    AbnormalClose,
    /// The periodic audit found the process exited.
    Audit,
    /// A newer launch result replaced the handle.
    Replaced,
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// The core's record linking an application to one externally launched process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub application_id: ApplicationId,
    pub process_id: ProcessId,
    pub channel_state: ChannelState,
    pub last_event_at: DateTime<Utc>,
}

impl ProcessHandle {
    /// A fresh handle whose channel has not reported anything yet.
    pub fn connecting(application_id: ApplicationId, process_id: ProcessId) -> Self {
        Self {
            application_id,
            process_id,
            channel_state: ChannelState::Connecting,
            last_event_at: Utc::now(),
        }
    }
}

/// Immutable view of the registry handed to readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RegistrySnapshot {
    pub handles: BTreeMap<ApplicationId, ProcessHandle>,
    pub taken_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    pub fn get(&self, application_id: &ApplicationId) -> Option<&ProcessHandle> {
        self.handles.get(application_id)
    }

    pub fn contains(&self, application_id: &ApplicationId) -> bool {
        self.handles.contains_key(application_id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// `{application_id: process_id}`, the shape mirrored to durable storage.
    pub fn to_entries(&self) -> BTreeMap<String, String> {
        self.handles
            .values()
            .map(|h| (h.application_id.0.clone(), h.process_id.0.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_display() {
        assert_eq!(ApplicationId::from("42").to_string(), "42");
        assert_eq!(ProcessId::from(900u32).to_string(), "900");
    }

    #[test]
    fn blank_ids_are_empty() {
        assert!(ApplicationId::from("").is_empty());
        assert!(ProcessId::from("   ").is_empty());
        assert!(!ProcessId::from("900").is_empty());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let json = serde_json::to_string(&ApplicationId::from("42")).expect("serialize");
        assert_eq!(json, r#""42""#);
    }

    #[test]
    fn channel_state_display() {
        assert_eq!(ChannelState::Connecting.to_string(), "connecting");
        assert_eq!(ChannelState::Errored.to_string(), "errored");
    }

    #[test]
    fn snapshot_entries_map_application_to_process() {
        let mut snapshot = RegistrySnapshot::default();
        let handle = ProcessHandle::connecting("42".into(), "900".into());
        snapshot.handles.insert(handle.application_id.clone(), handle);

        let entries = snapshot.to_entries();
        assert_eq!(entries.get("42").map(String::as_str), Some("900"));
        assert_eq!(entries.len(), 1);
    }
}
