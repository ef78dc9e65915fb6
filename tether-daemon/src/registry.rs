//! In-memory process registry, mirrored to the durable store on every change.
//!
//! Readers never see the map itself: every commit publishes a fresh
//! [`RegistrySnapshot`] on a `watch` channel.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use tether_core::{
    store, ApplicationId, ChannelState, PersistedState, ProcessHandle, ProcessId,
    RegistrySnapshot,
};

pub struct ProcessRegistry {
    home: PathBuf,
    handles: BTreeMap<ApplicationId, ProcessHandle>,
    snapshots: watch::Sender<Arc<RegistrySnapshot>>,
}

impl ProcessRegistry {
    /// An empty registry persisting under `home`, plus a reader for its snapshots.
    pub fn new(home: PathBuf) -> (Self, watch::Receiver<Arc<RegistrySnapshot>>) {
        let (snapshots, reader) = watch::channel(Arc::new(RegistrySnapshot {
            handles: BTreeMap::new(),
            taken_at: Utc::now(),
        }));
        let registry = Self {
            home,
            handles: BTreeMap::new(),
            snapshots,
        };
        (registry, reader)
    }

    /// Rebuild tracking state from what was persisted before the last shutdown.
    ///
    /// Unusable entries are dropped with a warning. Every surviving entry gets
    /// a `Connecting` handle; the caller must open a channel for each returned
    /// pair. When anything was dropped the cleaned map is written back.
    pub fn reconcile(&mut self, state: PersistedState) -> Vec<(ProcessId, ApplicationId)> {
        let PersistedState {
            entries,
            rejected,
            unreadable,
        } = state;

        if let Some(reason) = unreadable.as_deref() {
            tracing::warn!(
                path = %store::store_path_at(&self.home).display(),
                error = %reason,
                "persisted process map is unreadable; starting empty",
            );
        }
        for error in &rejected {
            tracing::warn!(error = %error, "discarding persisted process entry");
        }

        let mut to_open = Vec::with_capacity(entries.len());
        for (application_id, process_id) in entries {
            tracing::info!(
                application_id = %application_id,
                process_id = %process_id,
                "restoring tracked process",
            );
            to_open.push((process_id.clone(), application_id.clone()));
            self.handles.insert(
                application_id.clone(),
                ProcessHandle::connecting(application_id, process_id),
            );
        }

        let dirty = unreadable.is_some() || !rejected.is_empty();
        self.commit(dirty);
        to_open
    }

    pub fn get(&self, application_id: &ApplicationId) -> Option<&ProcessHandle> {
        self.handles.get(application_id)
    }

    pub fn contains(&self, application_id: &ApplicationId) -> bool {
        self.handles.contains_key(application_id)
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Handles as `(application_id, process_id)` pairs.
    pub fn tracked(&self) -> Vec<(ApplicationId, ProcessId)> {
        self.handles
            .values()
            .map(|h| (h.application_id.clone(), h.process_id.clone()))
            .collect()
    }

    /// Insert or replace the handle for its application; returns the replaced one.
    pub fn insert(&mut self, handle: ProcessHandle) -> Option<ProcessHandle> {
        let previous = self.handles.insert(handle.application_id.clone(), handle);
        self.commit(true);
        previous
    }

    pub fn remove(&mut self, application_id: &ApplicationId) -> Option<ProcessHandle> {
        let removed = self.handles.remove(application_id)?;
        self.commit(true);
        Some(removed)
    }

    /// Remove `application_id` only while it is still tracking `process_id`.
    pub fn remove_if_owned(
        &mut self,
        application_id: &ApplicationId,
        process_id: &ProcessId,
    ) -> Option<ProcessHandle> {
        if self.handles.get(application_id)?.process_id != *process_id {
            return None;
        }
        self.remove(application_id)
    }

    /// Record a channel state change. Not persisted: storage only holds ids.
    pub fn set_channel_state(
        &mut self,
        application_id: &ApplicationId,
        process_id: &ProcessId,
        state: ChannelState,
    ) -> bool {
        let Some(handle) = self.owned_mut(application_id, process_id) else {
            return false;
        };
        handle.channel_state = state;
        handle.last_event_at = Utc::now();
        self.commit(false);
        true
    }

    /// Note that the channel delivered something, without changing its state.
    pub fn touch(&mut self, application_id: &ApplicationId, process_id: &ProcessId) {
        if let Some(handle) = self.owned_mut(application_id, process_id) {
            handle.last_event_at = Utc::now();
            self.commit(false);
        }
    }

    fn owned_mut(
        &mut self,
        application_id: &ApplicationId,
        process_id: &ProcessId,
    ) -> Option<&mut ProcessHandle> {
        self.handles
            .get_mut(application_id)
            .filter(|handle| handle.process_id == *process_id)
    }

    /// Publish a snapshot and, when `persist` is set, rewrite the store in full.
    fn commit(&mut self, persist: bool) {
        let snapshot = RegistrySnapshot {
            handles: self.handles.clone(),
            taken_at: Utc::now(),
        };
        if persist {
            // A failed write leaves the previous document in place; the next
            // mutation retries with the full map.
            if let Err(err) = store::save_at(&self.home, &snapshot.to_entries()) {
                tracing::error!(error = %err, "failed to persist process registry");
            }
        }
        self.snapshots.send_replace(Arc::new(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn persisted(home: &TempDir) -> BTreeMap<String, String> {
        let state = store::load_at(home.path()).expect("load");
        state
            .entries
            .into_iter()
            .map(|(a, p)| (a.0, p.0))
            .collect()
    }

    #[test]
    fn insert_persists_and_publishes() {
        let home = TempDir::new().unwrap();
        let (mut registry, reader) = ProcessRegistry::new(home.path().to_path_buf());

        registry.insert(ProcessHandle::connecting("42".into(), "900".into()));

        assert!(reader.borrow().contains(&ApplicationId::from("42")));
        assert_eq!(
            persisted(&home).get("42").map(String::as_str),
            Some("900")
        );
    }

    #[test]
    fn remove_if_owned_ignores_other_process() {
        let home = TempDir::new().unwrap();
        let (mut registry, _reader) = ProcessRegistry::new(home.path().to_path_buf());
        registry.insert(ProcessHandle::connecting("42".into(), "900".into()));

        assert!(registry
            .remove_if_owned(&"42".into(), &"901".into())
            .is_none());
        assert!(registry.contains(&"42".into()));

        assert!(registry
            .remove_if_owned(&"42".into(), &"900".into())
            .is_some());
        assert!(persisted(&home).is_empty());
    }

    #[test]
    fn second_remove_is_a_no_op() {
        let home = TempDir::new().unwrap();
        let (mut registry, _reader) = ProcessRegistry::new(home.path().to_path_buf());
        registry.insert(ProcessHandle::connecting("42".into(), "900".into()));

        assert!(registry.remove(&"42".into()).is_some());
        assert!(registry.remove(&"42".into()).is_none());
    }

    #[test]
    fn reconcile_drops_bad_entries_and_rewrites_store() {
        let home = TempDir::new().unwrap();
        let path = store::store_path_at(home.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"A":"900","B":""}"#).unwrap();

        let (mut registry, reader) = ProcessRegistry::new(home.path().to_path_buf());
        let to_open = registry.reconcile(store::load_at(home.path()).unwrap());

        assert_eq!(to_open, vec![(ProcessId::from("900"), ApplicationId::from("A"))]);
        let snapshot = reader.borrow().clone();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot.get(&"A".into()).map(|h| h.channel_state),
            Some(ChannelState::Connecting)
        );
        assert_eq!(persisted(&home).len(), 1, "cleaned map written back");
    }

    #[test]
    fn channel_state_updates_are_not_persisted_but_published() {
        let home = TempDir::new().unwrap();
        let (mut registry, reader) = ProcessRegistry::new(home.path().to_path_buf());
        registry.insert(ProcessHandle::connecting("42".into(), "900".into()));

        assert!(registry.set_channel_state(&"42".into(), &"900".into(), ChannelState::Open));
        assert!(!registry.set_channel_state(&"42".into(), &"1".into(), ChannelState::Closed));
        assert_eq!(
            reader.borrow().get(&"42".into()).map(|h| h.channel_state),
            Some(ChannelState::Open)
        );
    }
}
