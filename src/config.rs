use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RaftError, Result};
use crate::raft::NodeId;

/// Configuration for a single Raft node.
///
/// `members` is the bootstrap cluster configuration (including this node).
/// Once membership entries are committed, the replicated configuration wins.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub members: Vec<NodeId>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Bound on a single outbound RPC before it is treated as lost
    pub rpc_timeout_ms: u64,
    /// Maximum number of entries carried by one AppendEntries request
    pub max_append_entries: usize,
    /// Uncompacted log length that triggers a snapshot
    pub compaction_threshold: usize,
    pub config_change_timeout_ms: u64,
    pub client_timeout_ms: u64,
    /// How many leader hints the gateway follows before giving up
    pub max_redirects: usize,
    /// Directory for file-backed stores. `None` means in-memory only.
    pub data_dir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            members: vec![1],
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            max_append_entries: 64,
            compaction_threshold: 1000,
            config_change_timeout_ms: 2000,
            client_timeout_ms: 2000,
            max_redirects: 3,
            data_dir: None,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: NodeId, members: Vec<NodeId>) -> Self {
        Self {
            node_id,
            members,
            ..Default::default()
        }
    }

    pub fn with_member(mut self, node_id: NodeId) -> Self {
        if !self.members.contains(&node_id) {
            self.members.push(node_id);
        }
        self
    }

    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    pub fn with_heartbeat_interval(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn config_change_timeout(&self) -> Duration {
        Duration::from_millis(self.config_change_timeout_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    /// Reject settings under which the protocol cannot make progress.
    ///
    /// An empty `members` list is allowed: such a node waits to be added by
    /// an existing leader.
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms == 0
            || self.election_timeout_min_ms > self.election_timeout_max_ms
        {
            return Err(RaftError::InvalidConfig(format!(
                "election timeout range {}..={} is invalid",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat interval {}ms must be below the election timeout {}ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.max_append_entries == 0 {
            return Err(RaftError::InvalidConfig(
                "max_append_entries must be at least 1".to_string(),
            ));
        }
        if self.compaction_threshold == 0 {
            return Err(RaftError::InvalidConfig(
                "compaction_threshold must be at least 1".to_string(),
            ));
        }
        if !self.members.is_empty() && !self.members.contains(&self.node_id) {
            return Err(RaftError::InvalidConfig(format!(
                "node {} missing from bootstrap members {:?}",
                self.node_id, self.members
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node_id, 1);
        assert_eq!(cfg.members, vec![1]);
        assert_eq!(cfg.election_timeout_min_ms, 150);
        assert_eq!(cfg.election_timeout_max_ms, 300);
        assert_eq!(cfg.heartbeat_interval_ms, 50);
        assert_eq!(cfg.max_append_entries, 64);
        assert_eq!(cfg.compaction_threshold, 1000);
        assert!(cfg.data_dir.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn node_config_with_member() {
        let cfg = NodeConfig::new(1, vec![1])
            .with_member(2)
            .with_member(3)
            .with_member(2);
        assert_eq!(cfg.members, vec![1, 2, 3]);
    }

    #[test]
    fn validate_rejects_inverted_timeouts() {
        let cfg = NodeConfig::default().with_election_timeout(300, 150);
        assert!(matches!(cfg.validate(), Err(RaftError::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_slow_heartbeat() {
        let cfg = NodeConfig::default().with_heartbeat_interval(150);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_self() {
        let cfg = NodeConfig::new(4, vec![1, 2, 3]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_allows_joining_node_without_members() {
        let cfg = NodeConfig::new(4, vec![]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_batch() {
        let mut cfg = NodeConfig::default();
        cfg.max_append_entries = 0;
        assert!(cfg.validate().is_err());
    }
}
