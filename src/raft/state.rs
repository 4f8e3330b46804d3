use std::collections::HashSet;

use crate::raft::storage::HardState;
use crate::raft::NodeId;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Term, vote and progress bookkeeping for one node. The log lives in
/// [`RaftLog`](crate::raft::RaftLog), membership in
/// [`Membership`](crate::raft::Membership).
///
/// What each field protects:
/// - `voted_for`: one vote per term, written to disk before the vote is
///   granted, so at most one leader wins a term
/// - `current_term`: never decreases; any message carrying a newer term
///   turns the node into a follower of that term
/// - `commit_index`: never decreases, and on a follower never passes the
///   last entry confirmed by the current leader
/// - `last_applied`: trails `commit_index`; only committed entries reach
///   the state machine, one at a time and in index order
#[derive(Debug)]
pub struct RaftState {
    // Persistent state
    pub current_term: u64,
    pub voted_for: Option<NodeId>,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,

    // Current role
    pub role: RaftRole,

    // Known leader (if any)
    pub leader_id: Option<NodeId>,

    // Votes received in current election (for candidates)
    pub votes_received: HashSet<NodeId>,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            commit_index: 0,
            last_applied: 0,
            role: RaftRole::Follower,
            leader_id: None,
            votes_received: HashSet::new(),
        }
    }

    /// Rebuild from what was persisted before a restart.
    pub fn restore(hard_state: HardState, applied: u64) -> Self {
        Self {
            current_term: hard_state.current_term,
            voted_for: hard_state.voted_for,
            commit_index: applied,
            last_applied: applied,
            ..Self::new()
        }
    }

    /// The part of the state that must survive a crash.
    pub fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        }
    }

    /// Step down on a newer term. Returns true if `term` was newer.
    pub fn observe_term(&mut self, term: u64) -> bool {
        if term > self.current_term {
            self.become_follower(term);
            true
        } else {
            false
        }
    }

    /// Transition to follower state.
    ///
    /// The vote is only cleared when the term moves forward; a candidate
    /// that discovers the leader of its own term keeps its self-vote.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        self.role = RaftRole::Follower;
        self.votes_received.clear();
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self, my_id: NodeId) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.votes_received.clear();
        self.votes_received.insert(my_id);
        self.leader_id = None;
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, my_id: NodeId) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);
        self.votes_received.clear();
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}
