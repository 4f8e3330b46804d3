use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::raft::log::{LogEntry, RaftLog};
use crate::raft::membership::ClusterConfiguration;
use crate::raft::state::{RaftRole, RaftState};
use crate::raft::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// `match_index` is the last index known to match the leader on success,
/// and a hint for where to retry on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub match_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub config: ClusterConfiguration,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub success: bool,
}

/// Outcome of an AddServer/RemoveServer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigChangeStatus {
    /// The change committed, or there was nothing to change
    Ok,
    /// The change did not commit in time; the caller retries
    Timeout,
    /// Ask `leader_hint` instead
    NotLeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChangeResponse {
    pub status: ConfigChangeStatus,
    pub leader_hint: Option<NodeId>,
}

impl ConfigChangeResponse {
    pub fn ok(leader: NodeId) -> Self {
        Self {
            status: ConfigChangeStatus::Ok,
            leader_hint: Some(leader),
        }
    }

    pub fn timeout(leader_hint: Option<NodeId>) -> Self {
        Self {
            status: ConfigChangeStatus::Timeout,
            leader_hint,
        }
    }

    pub fn not_leader(leader_hint: Option<NodeId>) -> Self {
        Self {
            status: ConfigChangeStatus::NotLeader,
            leader_hint,
        }
    }
}

/// Outcome of a forwarded client command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResponse {
    Applied { index: u64 },
    NotLeader { leader_hint: Option<NodeId> },
    LeadershipLost,
    Timeout,
    Failed { reason: String },
}

/// Every request a node accepts from the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRequest {
    RequestVote(VoteRequest),
    AppendEntries(AppendEntriesRequest),
    InstallSnapshot(InstallSnapshotRequest),
    AddServer { peer_id: NodeId },
    RemoveServer { peer_id: NodeId },
    ClientCommand { payload: Vec<u8> },
    WhoIsTheLeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftResponse {
    Vote(VoteResponse),
    AppendEntries(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotResponse),
    ConfigChange(ConfigChangeResponse),
    Command(CommandResponse),
    Leader(Option<NodeId>),
}

impl RaftRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            RaftRequest::RequestVote(_) => "request_vote",
            RaftRequest::AppendEntries(_) => "append_entries",
            RaftRequest::InstallSnapshot(_) => "install_snapshot",
            RaftRequest::AddServer { .. } => "add_server",
            RaftRequest::RemoveServer { .. } => "remove_server",
            RaftRequest::ClientCommand { .. } => "client_command",
            RaftRequest::WhoIsTheLeader => "who_is_the_leader",
        }
    }
}

impl RaftResponse {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Handle RequestVote RPC.
///
/// The caller must persist the resulting hard state before the response
/// leaves the node.
pub fn handle_request_vote(
    state: &mut RaftState,
    log: &RaftLog,
    req: &VoteRequest,
    my_id: NodeId,
) -> VoteResponse {
    // If request term is greater, update our term and become follower
    state.observe_term(req.term);

    let vote_granted = if req.term < state.current_term {
        // Reject if request term is less than our current term
        false
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        // Already voted for someone else in this term
        false
    } else if !log.is_up_to_date(req.last_log_index, req.last_log_term) {
        // Candidate's log is not up-to-date
        false
    } else {
        state.voted_for = Some(req.candidate_id);
        true
    };

    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    VoteResponse {
        term: state.current_term,
        vote_granted,
    }
}

/// Handle AppendEntries RPC.
///
/// Log changes are durable when this returns; the hard state still has to
/// be persisted by the caller before replying.
pub fn handle_append_entries(
    state: &mut RaftState,
    log: &mut RaftLog,
    req: &AppendEntriesRequest,
    my_id: NodeId,
) -> Result<AppendEntriesResponse> {
    state.observe_term(req.term);

    // Reject if request term is less than our current term
    if req.term < state.current_term {
        return Ok(AppendEntriesResponse {
            term: state.current_term,
            success: false,
            match_index: log.last_index(),
        });
    }

    // Valid AppendEntries from leader - reset to follower if we're a candidate
    if state.role != RaftRole::Follower {
        state.become_follower(req.term);
    }
    state.leader_id = Some(req.leader_id);

    if !log.matches(req.prev_log_index, req.prev_log_term) {
        let hint = log.conflict_hint(req.prev_log_index);
        tracing::debug!(
            node_id = my_id,
            prev_log_index = req.prev_log_index,
            prev_log_term = req.prev_log_term,
            hint,
            "Log mismatch, rejecting AppendEntries"
        );
        return Ok(AppendEntriesResponse {
            term: state.current_term,
            success: false,
            match_index: hint,
        });
    }

    let last_new_index = log.append_from_leader(req.prev_log_index, &req.entries)?;
    if !req.entries.is_empty() {
        tracing::debug!(
            node_id = my_id,
            entries_appended = req.entries.len(),
            new_last_index = log.last_index(),
            "Appended entries"
        );
    }

    // Update commit index; it never moves backwards
    let new_commit = req.leader_commit.min(last_new_index);
    if new_commit > state.commit_index {
        state.commit_index = new_commit;
    }

    Ok(AppendEntriesResponse {
        term: state.current_term,
        success: true,
        match_index: last_new_index,
    })
}
