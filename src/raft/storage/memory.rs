use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{RaftError, Result};
use crate::raft::log::LogEntry;
use crate::raft::storage::{HardState, LogStore, Snapshot, SnapshotStore};

#[derive(Debug, Default)]
struct MemLogInner {
    hard_state: HardState,
    entries: Vec<LogEntry>,
    fail_writes: bool,
}

/// In-memory log store.
///
/// Clones share the same contents, so a test can drop a node and start a
/// new one over the same "disk" to simulate a crash and restart.
#[derive(Debug, Clone, Default)]
pub struct MemLogStore {
    inner: Arc<Mutex<MemLogInner>>,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, as a full or broken disk would.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    fn lock(&self) -> MutexGuard<'_, MemLogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writable(&self) -> Result<MutexGuard<'_, MemLogInner>> {
        let inner = self.lock();
        if inner.fail_writes {
            return Err(RaftError::Storage(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        Ok(inner)
    }
}

impl LogStore for MemLogStore {
    fn load_hard_state(&self) -> Result<HardState> {
        Ok(self.lock().hard_state)
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        self.writable()?.hard_state = *state;
        Ok(())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.writable()?.entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&mut self, index: u64) -> Result<()> {
        self.writable()?.entries.retain(|e| e.index < index);
        Ok(())
    }

    fn compact_to(&mut self, index: u64) -> Result<()> {
        self.writable()?.entries.retain(|e| e.index > index);
        Ok(())
    }

    fn load_entries(&self) -> Result<Vec<LogEntry>> {
        Ok(self.lock().entries.clone())
    }
}

/// In-memory snapshot store; clones share the stored snapshot.
#[derive(Debug, Clone, Default)]
pub struct MemSnapshotStore {
    inner: Arc<Mutex<Option<Snapshot>>>,
}

impl MemSnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemSnapshotStore {
    fn save(&mut self, snapshot: &Snapshot) -> Result<()> {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::log::Payload;
    use crate::raft::membership::ClusterConfiguration;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry::new(term, index, Payload::Command(vec![index as u8]))
    }

    #[test]
    fn persists_hard_state() {
        let mut store = MemLogStore::new();
        let state = HardState {
            current_term: 5,
            voted_for: Some(2),
        };
        store.save_hard_state(&state).unwrap();
        assert_eq!(store.load_hard_state().unwrap(), state);
    }

    #[test]
    fn clones_share_contents() {
        let mut store = MemLogStore::new();
        let restarted = store.clone();
        store.append(&[entry(1, 1), entry(1, 2)]).unwrap();
        assert_eq!(restarted.load_entries().unwrap().len(), 2);
    }

    #[test]
    fn truncate_and_compact() {
        let mut store = MemLogStore::new();
        store
            .append(&[entry(1, 1), entry(1, 2), entry(2, 3), entry(2, 4)])
            .unwrap();
        store.truncate_from(4).unwrap();
        store.compact_to(1).unwrap();
        let indices: Vec<u64> = store.load_entries().unwrap().iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![2, 3]);
    }

    #[test]
    fn injected_failure_is_a_storage_error() {
        let mut store = MemLogStore::new();
        store.set_fail_writes(true);
        let err = store.append(&[entry(1, 1)]).unwrap_err();
        assert!(err.is_fatal());
        store.set_fail_writes(false);
        assert!(store.append(&[entry(1, 1)]).is_ok());
    }

    #[test]
    fn snapshot_store_replaces_previous() {
        let mut store = MemSnapshotStore::new();
        assert!(store.load().unwrap().is_none());
        for index in [5, 9] {
            store
                .save(&Snapshot {
                    last_included_index: index,
                    last_included_term: 1,
                    config: ClusterConfiguration::new([1, 2, 3]),
                    data: vec![],
                })
                .unwrap();
        }
        assert_eq!(store.load().unwrap().unwrap().last_included_index, 9);
    }
}
