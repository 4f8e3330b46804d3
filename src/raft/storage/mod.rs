//! Durable state behind a Raft node.
//!
//! A node owns exactly one [`LogStore`] (hard state plus log entries) and one
//! [`SnapshotStore`]. Every mutation returns only after it is durable, so the
//! node can reply to peers as soon as the call returns.

mod file;
mod memory;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::raft::log::LogEntry;
use crate::raft::membership::ClusterConfiguration;
use crate::raft::NodeId;

pub use file::{FileLogStore, FileSnapshotStore};
pub use memory::{MemLogStore, MemSnapshotStore};

/// Term and vote, persisted before any reply that depends on them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// Consumer state up to `last_included_index`, plus the membership that was
/// committed at that point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub config: ClusterConfiguration,
    pub data: Vec<u8>,
}

/// Persistence for term, vote and log entries.
pub trait LogStore: Send {
    /// Load the persisted term and vote. A fresh store returns the default.
    fn load_hard_state(&self) -> Result<HardState>;

    fn save_hard_state(&mut self, state: &HardState) -> Result<()>;

    /// Append entries after the current tail.
    fn append(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// Remove every entry with index >= `index`.
    fn truncate_from(&mut self, index: u64) -> Result<()>;

    /// Remove every entry with index <= `index`.
    fn compact_to(&mut self, index: u64) -> Result<()>;

    /// All retained entries in index order (for crash recovery).
    fn load_entries(&self) -> Result<Vec<LogEntry>>;
}

/// Persistence for the latest snapshot. Saving replaces the previous one.
pub trait SnapshotStore: Send {
    fn save(&mut self, snapshot: &Snapshot) -> Result<()>;

    fn load(&self) -> Result<Option<Snapshot>>;
}
