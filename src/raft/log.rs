use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::raft::membership::ClusterConfiguration;
use crate::raft::storage::{HardState, LogStore};

/// What a log entry carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Appended by every new leader so entries of its term become committable
    Noop,
    /// Opaque command bytes for the consumer state machine
    Command(Vec<u8>),
    /// Full membership after a single-server change
    Config(ClusterConfiguration),
}

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub payload: Payload,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, payload: Payload) -> Self {
        Self {
            term,
            index,
            payload,
        }
    }
}

/// The node's view of the replicated log: every entry after the latest
/// snapshot, mirrored in memory and written through to the [`LogStore`].
///
/// Mutations return only after the store has durably accepted them.
pub struct RaftLog {
    store: Box<dyn LogStore>,
    entries: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
}

impl RaftLog {
    /// Load the log from `store`, discarding anything already covered by
    /// the snapshot at `snapshot_index`.
    ///
    /// Gaps, index regressions or term regressions are reported as
    /// [`RaftError::Corrupted`]; the node must not start on such a log.
    pub fn open(mut store: Box<dyn LogStore>, snapshot_index: u64, snapshot_term: u64) -> Result<Self> {
        let loaded = store.load_entries()?;
        let stale = loaded
            .iter()
            .take_while(|e| e.index <= snapshot_index)
            .count();
        if stale > 0 {
            // A crash between snapshot save and log compaction leaves a covered prefix behind
            store.compact_to(snapshot_index)?;
        }
        let entries: Vec<LogEntry> = loaded.into_iter().skip(stale).collect();

        let mut expected_index = snapshot_index + 1;
        let mut min_term = snapshot_term;
        for entry in &entries {
            if entry.index != expected_index {
                return Err(RaftError::Corrupted(format!(
                    "log gap: expected index {}, found {}",
                    expected_index, entry.index
                )));
            }
            if entry.term < min_term {
                return Err(RaftError::Corrupted(format!(
                    "term regression at index {}: {} < {}",
                    entry.index, entry.term, min_term
                )));
            }
            expected_index += 1;
            min_term = entry.term;
        }

        Ok(Self {
            store,
            entries,
            snapshot_index,
            snapshot_term,
        })
    }

    pub fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        self.store.save_hard_state(state)
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn first_index(&self) -> u64 {
        self.snapshot_index + 1
    }

    /// Get the last log index
    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    /// Get the last log term
    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// Number of uncompacted entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Term of the entry at `index`, including the snapshot boundary.
    /// `None` for compacted or missing indices.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Get log entry at index (1-indexed). Compacted entries are gone.
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    /// Up to `max` entries starting at `start` (inclusive).
    pub fn entries_from(&self, start: u64, max: usize) -> Vec<LogEntry> {
        let start = start.max(self.first_index());
        let offset = (start - self.snapshot_index - 1) as usize;
        if offset >= self.entries.len() {
            return Vec::new();
        }
        self.entries[offset..].iter().take(max).cloned().collect()
    }

    /// Entries with index in `(after, last_index]`, used to rebuild derived state.
    pub fn entries_after(&self, after: u64) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |e| e.index > after)
    }

    /// Whether the log contains `prev_index` with `prev_term`.
    ///
    /// Indices below the snapshot are committed and therefore match any
    /// leader's log.
    pub fn matches(&self, prev_index: u64, prev_term: u64) -> bool {
        if prev_index < self.snapshot_index {
            return true;
        }
        self.term_at(prev_index) == Some(prev_term)
    }

    /// Index just before the run of entries sharing `index`'s term.
    ///
    /// Lets a leader skip a whole conflicting term in one round trip.
    pub fn conflict_hint(&self, index: u64) -> u64 {
        let last = self.last_index();
        if index > last {
            return last;
        }
        let Some(term) = self.term_at(index) else {
            return self.snapshot_index;
        };
        let mut hint = index - 1;
        while hint > self.snapshot_index && self.term_at(hint) == Some(term) {
            hint -= 1;
        }
        hint
    }

    /// Check if candidate's log is at least as up-to-date as ours
    pub fn is_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_term();
        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= self.last_index())
    }

    /// Leader-side append of a new entry in `term`. Returns its index.
    pub fn append(&mut self, term: u64, payload: Payload) -> Result<u64> {
        let entry = LogEntry::new(term, self.last_index() + 1, payload);
        self.store.append(std::slice::from_ref(&entry))?;
        let index = entry.index;
        self.entries.push(entry);
        Ok(index)
    }

    /// Follower-side merge of a leader's entries following `prev_index`.
    ///
    /// Entries already present with the same term are kept; the first
    /// conflicting entry truncates the log from its index before the rest
    /// is appended. Returns the index of the last entry of the request.
    pub fn append_from_leader(&mut self, prev_index: u64, entries: &[LogEntry]) -> Result<u64> {
        let last_new = prev_index + entries.len() as u64;
        let mut pending = entries;
        while let Some((entry, rest)) = pending.split_first() {
            if entry.index <= self.snapshot_index {
                pending = rest;
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => pending = rest,
                Some(_) => {
                    tracing::debug!(
                        index = entry.index,
                        "Conflicting entry, truncating log"
                    );
                    self.truncate_from(entry.index)?;
                    break;
                }
                None => break,
            }
        }
        if !pending.is_empty() {
            self.store.append(pending)?;
            self.entries.extend_from_slice(pending);
        }
        Ok(last_new)
    }

    /// Drop every entry with index >= `index`.
    pub fn truncate_from(&mut self, index: u64) -> Result<()> {
        if index <= self.snapshot_index || index > self.last_index() {
            return Ok(());
        }
        self.store.truncate_from(index)?;
        self.entries.truncate((index - self.snapshot_index - 1) as usize);
        Ok(())
    }

    /// Discard entries up to and including `index`, which the snapshot at
    /// (`index`, `term`) now covers. Entries after `index` are retained.
    pub fn compact_to(&mut self, index: u64, term: u64) -> Result<()> {
        if index <= self.snapshot_index {
            return Ok(());
        }
        self.store.compact_to(index)?;
        let drop = ((index - self.snapshot_index) as usize).min(self.entries.len());
        self.entries.drain(..drop);
        self.snapshot_index = index;
        self.snapshot_term = term;
        Ok(())
    }

    /// Replace the whole log with the snapshot boundary (`index`, `term`).
    pub fn reset_to(&mut self, index: u64, term: u64) -> Result<()> {
        if !self.entries.is_empty() {
            self.store.truncate_from(self.first_index())?;
        }
        self.store.compact_to(index)?;
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
        Ok(())
    }
}

impl std::fmt::Debug for RaftLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftLog")
            .field("snapshot_index", &self.snapshot_index)
            .field("snapshot_term", &self.snapshot_term)
            .field("last_index", &self.last_index())
            .field("len", &self.entries.len())
            .finish()
    }
}
