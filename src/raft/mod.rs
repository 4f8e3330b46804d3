pub mod log;
pub mod membership;
pub mod network;
pub mod node;
pub mod replication;
pub mod rpc;
pub mod state;
pub mod state_machine;
pub mod storage;
pub mod timer;

/// Identifier of a cluster member
pub type NodeId = u64;

pub use log::{LogEntry, Payload, RaftLog};
pub use membership::{ClusterConfiguration, ConfigChange, Membership};
pub use network::{InMemoryNetwork, InMemoryTransport, Transport};
pub use node::{NodeStatus, RaftHandle, RaftNode};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, CommandResponse, ConfigChangeResponse,
    ConfigChangeStatus, InstallSnapshotRequest, InstallSnapshotResponse, RaftRequest,
    RaftResponse, VoteRequest, VoteResponse,
};
pub use state::{RaftRole, RaftState};
pub use state_machine::{InMemoryStateMachine, StateMachine};
pub use storage::{
    FileLogStore, FileSnapshotStore, HardState, LogStore, MemLogStore, MemSnapshotStore,
    Snapshot, SnapshotStore,
};
