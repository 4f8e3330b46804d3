use thiserror::Error;

use crate::raft::NodeId;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not the leader, current leader is node {0:?}")]
    NotLeader(Option<NodeId>),

    #[error("Leadership lost before the entry was committed")]
    LeadershipLost,

    #[error("Operation timed out")]
    Timeout,

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupted persistent state: {0}")]
    Corrupted(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Raft node has shut down")]
    Shutdown,
}

impl RaftError {
    /// Errors after which the node must stop participating in the protocol.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RaftError::Storage(_) | RaftError::Serialization(_) | RaftError::Corrupted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_and_corruption_are_fatal() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert!(RaftError::Storage(io).is_fatal());
        assert!(RaftError::Corrupted("bad tail".to_string()).is_fatal());
        assert!(!RaftError::NotLeader(Some(2)).is_fatal());
        assert!(!RaftError::Timeout.is_fatal());
    }

    #[test]
    fn not_leader_message_includes_hint() {
        let err = RaftError::NotLeader(Some(3));
        assert_eq!(
            err.to_string(),
            "Not the leader, current leader is node Some(3)"
        );
    }
}
