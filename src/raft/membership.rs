use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::raft::log::{Payload, RaftLog};
use crate::raft::NodeId;

/// The set of voting members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    members: BTreeSet<NodeId>,
}

impl ClusterConfiguration {
    pub fn new(members: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }

    pub fn members(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().copied()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.members.contains(&node_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Votes or acknowledgements needed for a decision
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// The configuration after applying `change`.
    pub fn with_change(&self, change: ConfigChange) -> Self {
        let mut members = self.members.clone();
        match change {
            ConfigChange::AddServer(id) => {
                members.insert(id);
            }
            ConfigChange::RemoveServer(id) => {
                members.remove(&id);
            }
        }
        Self { members }
    }

    /// Whether `change` would leave this configuration untouched.
    pub fn is_unchanged_by(&self, change: ConfigChange) -> bool {
        match change {
            ConfigChange::AddServer(id) => self.contains(id),
            ConfigChange::RemoveServer(id) => !self.contains(id),
        }
    }

    /// Whether the members in `votes` form a majority of this configuration.
    pub fn has_quorum(&self, votes: &HashSet<NodeId>) -> bool {
        let granted = self.members.iter().filter(|id| votes.contains(id)).count();
        granted >= self.quorum()
    }

    /// Highest index replicated on a majority, given each member's match index.
    pub fn quorum_match_index(&self, match_index: impl Fn(NodeId) -> u64) -> u64 {
        if self.members.is_empty() {
            return 0;
        }
        let mut indices: Vec<u64> = self.members.iter().map(|&id| match_index(id)).collect();
        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices[self.quorum() - 1]
    }
}

/// A single-server membership change requested by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigChange {
    AddServer(NodeId),
    RemoveServer(NodeId),
}

impl std::fmt::Display for ConfigChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigChange::AddServer(id) => write!(f, "add server {id}"),
            ConfigChange::RemoveServer(id) => write!(f, "remove server {id}"),
        }
    }
}

/// Committed configuration plus at most one uncommitted change.
///
/// The committed configuration decides elections and commitment; the
/// pending one only widens the set of peers a leader replicates to, so an
/// added server catches up before its change commits.
#[derive(Debug, Clone)]
pub struct Membership {
    committed: ClusterConfiguration,
    pending: Option<(u64, ClusterConfiguration)>,
}

impl Membership {
    pub fn new(committed: ClusterConfiguration) -> Self {
        Self {
            committed,
            pending: None,
        }
    }

    pub fn committed(&self) -> &ClusterConfiguration {
        &self.committed
    }

    /// Log index of the uncommitted configuration entry, if any
    pub fn pending_index(&self) -> Option<u64> {
        self.pending.as_ref().map(|(index, _)| *index)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// A configuration entry was appended at `index`.
    pub fn on_append(&mut self, index: u64, config: ClusterConfiguration) {
        self.pending = Some((index, config));
    }

    /// The configuration entry at `index` committed and was applied.
    pub fn on_commit(&mut self, index: u64, config: ClusterConfiguration) {
        self.committed = config;
        if matches!(self.pending, Some((pending, _)) if pending <= index) {
            self.pending = None;
        }
    }

    /// Replace everything with the configuration carried by a snapshot.
    pub fn reset(&mut self, committed: ClusterConfiguration) {
        self.committed = committed;
        self.pending = None;
    }

    /// Re-derive the pending change from the log tail after `applied`.
    ///
    /// Called whenever the log changes underneath a follower: an appended
    /// configuration entry becomes pending, a truncated one disappears.
    pub fn refresh_pending(&mut self, log: &RaftLog, applied: u64) {
        self.pending = log
            .entries_after(applied)
            .filter_map(|entry| match &entry.payload {
                Payload::Config(config) => Some((entry.index, config.clone())),
                _ => None,
            })
            .last();
    }

    /// Peers a leader must replicate to: committed and pending members,
    /// minus the leader itself.
    pub fn replication_targets(&self, self_id: NodeId) -> BTreeSet<NodeId> {
        let pending = self.pending.iter().flat_map(|(_, config)| config.members());
        self.committed
            .members()
            .chain(pending)
            .filter(|&id| id != self_id)
            .collect()
    }
}
