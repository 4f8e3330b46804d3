use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::raft::log::{Payload, RaftLog};
use crate::raft::membership::{ClusterConfiguration, ConfigChange, Membership};
use crate::raft::network::Transport;
use crate::raft::replication::{ReplicationManager, SentBatch, SentKind};
use crate::raft::rpc::{
    self, AppendEntriesRequest, AppendEntriesResponse, CommandResponse, ConfigChangeResponse,
    InstallSnapshotRequest, InstallSnapshotResponse, RaftRequest, RaftResponse, VoteRequest,
    VoteResponse,
};
use crate::raft::state::{RaftRole, RaftState};
use crate::raft::state_machine::StateMachine;
use crate::raft::storage::{
    FileLogStore, FileSnapshotStore, HardState, LogStore, MemLogStore, MemSnapshotStore,
    Snapshot, SnapshotStore,
};
use crate::raft::timer::next_election_deadline;
use crate::raft::NodeId;

const MESSAGE_QUEUE_CAPACITY: usize = 1024;

/// Message types for the Raft node event loop
#[derive(Debug)]
pub(crate) enum RaftMessage {
    /// Inbound RequestVote from a candidate
    RequestVote {
        request: VoteRequest,
        response_tx: oneshot::Sender<VoteResponse>,
    },
    /// Inbound AppendEntries from a leader
    AppendEntries {
        request: AppendEntriesRequest,
        response_tx: oneshot::Sender<AppendEntriesResponse>,
    },
    /// Inbound InstallSnapshot from a leader
    InstallSnapshot {
        request: InstallSnapshotRequest,
        response_tx: oneshot::Sender<InstallSnapshotResponse>,
    },
    /// Request to append a command to the log; answered once it is applied
    AppendCommand {
        payload: Vec<u8>,
        response_tx: oneshot::Sender<Result<u64>>,
    },
    /// Request to add or remove a server; answered once it commits
    ChangeConfig {
        change: ConfigChange,
        response_tx: oneshot::Sender<ConfigChangeResponse>,
    },
    /// A peer answered our RequestVote for `term`
    VoteReply {
        peer_id: NodeId,
        term: u64,
        response: VoteResponse,
    },
    /// A replicator finished a request
    ReplicationReply {
        peer_id: NodeId,
        batch: SentBatch,
        outcome: Result<RaftResponse>,
    },
    /// Trigger election
    TriggerElection,
}

/// Point-in-time view of a node, published after every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: RaftRole,
    pub current_term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub snapshot_index: u64,
    /// Uncompacted log entries
    pub log_len: usize,
    /// Committed voting members
    pub members: Vec<NodeId>,
}

struct PendingCommand {
    term: u64,
    response_tx: oneshot::Sender<Result<u64>>,
}

struct PendingConfigChange {
    term: u64,
    response_tx: oneshot::Sender<ConfigChangeResponse>,
}

/// The consensus core of one node.
///
/// All state is owned by a single task running [`RaftNode::run`]; everything
/// else talks to it through a [`RaftHandle`]. Storage failures are fatal:
/// `run` returns the error and the node stops voting and acknowledging.
pub struct RaftNode<S: StateMachine> {
    id: NodeId,
    config: NodeConfig,
    state: RaftState,
    log: RaftLog,
    snapshots: Box<dyn SnapshotStore>,
    membership: Membership,
    state_machine: S,
    transport: Arc<dyn Transport>,
    replication: ReplicationManager,
    waiters: BTreeMap<u64, PendingCommand>,
    config_waiters: BTreeMap<u64, PendingConfigChange>,
    persisted: HardState,
    election_deadline: Instant,
    message_tx: mpsc::Sender<RaftMessage>,
    message_rx: Option<mpsc::Receiver<RaftMessage>>,
    status_tx: watch::Sender<NodeStatus>,
    commit_tx: watch::Sender<u64>,
}

impl<S: StateMachine> RaftNode<S> {
    /// Recover a node from its stores.
    ///
    /// Fails with [`RaftError::Corrupted`] when the persisted log, snapshot
    /// and consumer progress contradict each other.
    pub fn new(
        config: NodeConfig,
        log_store: Box<dyn LogStore>,
        snapshot_store: Box<dyn SnapshotStore>,
        mut state_machine: S,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, RaftHandle)> {
        config.validate()?;
        let id = config.node_id;

        let hard_state = log_store.load_hard_state()?;
        let snapshot = snapshot_store.load()?;
        let (snapshot_index, snapshot_term) = snapshot
            .as_ref()
            .map(|s| (s.last_included_index, s.last_included_term))
            .unwrap_or((0, 0));
        let base_config = match &snapshot {
            Some(s) => s.config.clone(),
            None => ClusterConfiguration::new(config.members.iter().copied()),
        };

        let log = RaftLog::open(log_store, snapshot_index, snapshot_term)?;
        if hard_state.current_term < log.last_term() {
            return Err(RaftError::Corrupted(format!(
                "persisted term {} is behind last log term {}",
                hard_state.current_term,
                log.last_term()
            )));
        }

        let mut applied = state_machine.last_applied();
        if let Some(snapshot) = &snapshot {
            if applied < snapshot.last_included_index {
                state_machine.restore(&snapshot.data)?;
                applied = snapshot.last_included_index;
            }
        }
        if applied > log.last_index() {
            return Err(RaftError::Corrupted(format!(
                "state machine applied index {} beyond last log index {}",
                applied,
                log.last_index()
            )));
        }

        let mut membership = Membership::new(base_config);
        for entry in log.entries_after(snapshot_index) {
            if entry.index > applied {
                break;
            }
            if let Payload::Config(members) = &entry.payload {
                membership.on_commit(entry.index, members.clone());
            }
        }
        membership.refresh_pending(&log, applied);

        let (message_tx, message_rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
        let replication =
            ReplicationManager::new(id, transport.clone(), message_tx.clone(), config.rpc_timeout());
        let state = RaftState::restore(hard_state, applied);
        let (status_tx, status_rx) = watch::channel(NodeStatus {
            node_id: id,
            role: RaftRole::Follower,
            current_term: hard_state.current_term,
            leader_id: None,
            commit_index: applied,
            last_applied: applied,
            last_log_index: log.last_index(),
            last_log_term: log.last_term(),
            snapshot_index,
            log_len: log.len(),
            members: membership.committed().members().collect(),
        });
        let (commit_tx, commit_rx) = watch::channel(applied);

        tracing::info!(
            node_id = id,
            term = hard_state.current_term,
            last_log_index = log.last_index(),
            snapshot_index,
            applied,
            "Recovered Raft state"
        );

        let handle = RaftHandle {
            node_id: id,
            message_tx: message_tx.clone(),
            status_rx,
            commit_rx,
            client_timeout: config.client_timeout(),
            config_change_timeout: config.config_change_timeout(),
        };
        let election_deadline =
            next_election_deadline(config.election_timeout_min_ms, config.election_timeout_max_ms);

        let node = Self {
            id,
            config,
            state,
            log,
            snapshots: snapshot_store,
            membership,
            state_machine,
            transport,
            replication,
            waiters: BTreeMap::new(),
            config_waiters: BTreeMap::new(),
            persisted: hard_state,
            election_deadline,
            message_tx,
            message_rx: Some(message_rx),
            status_tx,
            commit_tx,
        };
        Ok((node, handle))
    }

    /// Build a node over the stores selected by `config.data_dir`: files
    /// under that directory, or memory when it is unset.
    pub fn open(
        config: NodeConfig,
        state_machine: S,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, RaftHandle)> {
        let (log_store, snapshot_store): (Box<dyn LogStore>, Box<dyn SnapshotStore>) =
            match &config.data_dir {
                Some(dir) => (
                    Box::new(FileLogStore::open(dir)?),
                    Box::new(FileSnapshotStore::open(dir)?),
                ),
                None => (
                    Box::new(MemLogStore::new()),
                    Box::new(MemSnapshotStore::new()),
                ),
            };
        Self::new(config, log_store, snapshot_store, state_machine, transport)
    }

    /// Run the Raft node main loop until `shutdown` fires or a fatal error occurs
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let Some(mut message_rx) = self.message_rx.take() else {
            return Err(RaftError::Shutdown);
        };
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.reset_election_timer();

        tracing::info!(
            node_id = self.id,
            members = ?self.membership.committed().members().collect::<Vec<_>>(),
            "Raft node started"
        );

        let outcome = loop {
            let is_leader = self.state.role == RaftRole::Leader;
            let deadline = self.election_deadline;

            let result = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),

                // Handle incoming messages
                msg = message_rx.recv() => match msg {
                    Some(msg) => self.handle_message(msg),
                    None => break Ok(()),
                },

                // Election timeout (for followers and candidates)
                _ = sleep_until(deadline), if !is_leader => self.handle_election_timeout(),

                // Heartbeat interval (for leaders)
                _ = heartbeat.tick(), if is_leader => self.replicate_all(),
            };

            if let Err(e) = result {
                if e.is_fatal() {
                    tracing::error!(node_id = self.id, error = %e, "Fatal error, stopping node");
                    break Err(e);
                }
                tracing::warn!(node_id = self.id, error = %e, "Error while handling event");
            }
            self.publish_status();
        };

        self.stop();
        outcome
    }

    fn handle_message(&mut self, msg: RaftMessage) -> Result<()> {
        match msg {
            RaftMessage::RequestVote {
                request,
                response_tx,
            } => {
                let response = self.handle_vote_request(&request)?;
                let _ = response_tx.send(response);
            }
            RaftMessage::AppendEntries {
                request,
                response_tx,
            } => {
                let response = self.handle_append_entries(&request)?;
                let _ = response_tx.send(response);
            }
            RaftMessage::InstallSnapshot {
                request,
                response_tx,
            } => {
                let response = self.handle_install_snapshot(request)?;
                let _ = response_tx.send(response);
            }
            RaftMessage::AppendCommand {
                payload,
                response_tx,
            } => self.handle_append_command(payload, response_tx)?,
            RaftMessage::ChangeConfig {
                change,
                response_tx,
            } => self.handle_config_change(change, response_tx)?,
            RaftMessage::VoteReply {
                peer_id,
                term,
                response,
            } => self.handle_vote_reply(peer_id, term, response)?,
            RaftMessage::ReplicationReply {
                peer_id,
                batch,
                outcome,
            } => self.handle_replication_reply(peer_id, batch, outcome)?,
            RaftMessage::TriggerElection => self.start_election()?,
        }
        Ok(())
    }

    fn handle_vote_request(&mut self, request: &VoteRequest) -> Result<VoteResponse> {
        let prev_role = self.state.role;
        let response = rpc::handle_request_vote(&mut self.state, &self.log, request, self.id);
        self.persist_hard_state()?;
        self.on_role_change(prev_role);

        // Reset election timeout if we granted vote
        if response.vote_granted {
            self.reset_election_timer();
        }
        Ok(response)
    }

    fn handle_append_entries(&mut self, request: &AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let prev_role = self.state.role;
        let from_leader = request.term >= self.state.current_term;

        // Persist a newer term before writing any of its entries
        if self.state.observe_term(request.term) {
            self.persist_hard_state()?;
        }
        let response = rpc::handle_append_entries(&mut self.state, &mut self.log, request, self.id)?;
        self.persist_hard_state()?;
        self.on_role_change(prev_role);
        if from_leader {
            self.reset_election_timer();
        }

        self.membership
            .refresh_pending(&self.log, self.state.last_applied);
        self.apply_committed()?;
        Ok(response)
    }

    fn handle_install_snapshot(
        &mut self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        if request.term < self.state.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.state.current_term,
                success: false,
            });
        }

        let prev_role = self.state.role;
        self.state.observe_term(request.term);
        if self.state.role != RaftRole::Follower {
            self.state.become_follower(request.term);
        }
        self.state.leader_id = Some(request.leader_id);
        self.persist_hard_state()?;
        self.on_role_change(prev_role);
        self.reset_election_timer();

        let index = request.last_included_index;
        let term = request.last_included_term;
        if index <= self.state.last_applied {
            tracing::debug!(node_id = self.id, index, "Snapshot already covered, ignoring");
            return Ok(InstallSnapshotResponse {
                term: self.state.current_term,
                success: true,
            });
        }

        let snapshot = Snapshot {
            last_included_index: index,
            last_included_term: term,
            config: request.config,
            data: request.data,
        };
        self.snapshots.save(&snapshot)?;

        // Keep a suffix that agrees with the snapshot, otherwise start over
        if self.log.term_at(index) == Some(term) {
            self.log.compact_to(index, term)?;
        } else {
            self.log.reset_to(index, term)?;
        }

        self.state_machine.restore(&snapshot.data)?;
        self.membership.reset(snapshot.config);
        self.membership.refresh_pending(&self.log, index);
        self.state.last_applied = index;
        self.state.commit_index = self.state.commit_index.max(index);

        tracing::info!(
            node_id = self.id,
            snapshot_index = index,
            snapshot_term = term,
            "Installed snapshot from leader"
        );

        self.apply_committed()?;
        Ok(InstallSnapshotResponse {
            term: self.state.current_term,
            success: true,
        })
    }

    /// Handle a request to append a command (leader only)
    fn handle_append_command(
        &mut self,
        payload: Vec<u8>,
        response_tx: oneshot::Sender<Result<u64>>,
    ) -> Result<()> {
        if self.state.role != RaftRole::Leader {
            let _ = response_tx.send(Err(RaftError::NotLeader(self.state.leader_id)));
            return Ok(());
        }

        let term = self.state.current_term;
        let index = self.log.append(term, Payload::Command(payload))?;
        tracing::debug!(node_id = self.id, index, term, "Appended command to log");
        self.waiters.insert(index, PendingCommand { term, response_tx });

        self.advance_commit()?;
        self.replicate_all()
    }

    fn handle_config_change(
        &mut self,
        change: ConfigChange,
        response_tx: oneshot::Sender<ConfigChangeResponse>,
    ) -> Result<()> {
        if self.state.role != RaftRole::Leader {
            let _ = response_tx.send(ConfigChangeResponse::not_leader(self.state.leader_id));
            return Ok(());
        }
        if self.membership.has_pending() {
            tracing::info!(
                node_id = self.id,
                %change,
                pending_index = ?self.membership.pending_index(),
                "Membership change already in progress, rejecting"
            );
            let _ = response_tx.send(ConfigChangeResponse::not_leader(Some(self.id)));
            return Ok(());
        }
        if self.membership.committed().is_unchanged_by(change) {
            let _ = response_tx.send(ConfigChangeResponse::ok(self.id));
            return Ok(());
        }

        let term = self.state.current_term;
        let target = self.membership.committed().with_change(change);
        let index = self.log.append(term, Payload::Config(target.clone()))?;
        self.membership.on_append(index, target);
        tracing::info!(node_id = self.id, %change, index, "Appended membership change");
        self.config_waiters
            .insert(index, PendingConfigChange { term, response_tx });

        let targets = self.membership.replication_targets(self.id);
        self.replication
            .sync_peers(&targets, self.log.last_index() + 1);

        self.advance_commit()?;
        self.replicate_all()
    }

    fn handle_vote_reply(&mut self, peer_id: NodeId, term: u64, response: VoteResponse) -> Result<()> {
        if response.term > self.state.current_term {
            return self.step_down(response.term);
        }
        if self.state.role != RaftRole::Candidate
            || term != self.state.current_term
            || !response.vote_granted
        {
            return Ok(());
        }

        self.state.votes_received.insert(peer_id);
        tracing::debug!(
            node_id = self.id,
            peer_id,
            votes = self.state.votes_received.len(),
            "Received vote"
        );

        if self
            .membership
            .committed()
            .has_quorum(&self.state.votes_received)
        {
            self.become_leader()?;
        }
        Ok(())
    }

    fn handle_replication_reply(
        &mut self,
        peer_id: NodeId,
        batch: SentBatch,
        outcome: Result<RaftResponse>,
    ) -> Result<()> {
        // Replies from an earlier leadership do not own the current progress
        if self.state.role != RaftRole::Leader || batch.term != self.state.current_term {
            return Ok(());
        }
        let Some(progress) = self.replication.progress_mut(peer_id) else {
            return Ok(());
        };
        progress.in_flight = false;

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                tracing::trace!(peer_id, error = %e, "Replication request failed");
                return Ok(());
            }
        };

        match (batch.kind, response) {
            (
                SentKind::Append {
                    prev_log_index,
                    entries,
                },
                RaftResponse::AppendEntries(resp),
            ) => {
                if resp.term > self.state.current_term {
                    return self.step_down(resp.term);
                }
                if let Some(progress) = self.replication.progress_mut(peer_id) {
                    if resp.success {
                        progress.record_success(prev_log_index + entries);
                    } else {
                        progress.record_mismatch(resp.match_index);
                        tracing::debug!(
                            peer_id,
                            next_index = progress.next_index,
                            "AppendEntries rejected, backing off"
                        );
                    }
                }
            }
            (
                SentKind::Snapshot {
                    last_included_index,
                },
                RaftResponse::InstallSnapshot(resp),
            ) => {
                if resp.term > self.state.current_term {
                    return self.step_down(resp.term);
                }
                if resp.success {
                    if let Some(progress) = self.replication.progress_mut(peer_id) {
                        progress.record_success(last_included_index);
                    }
                    tracing::info!(peer_id, last_included_index, "Peer installed snapshot");
                }
            }
            (kind, other) => {
                tracing::warn!(peer_id, ?kind, response = ?other, "Mismatched replication reply");
                return Ok(());
            }
        }

        self.advance_commit()?;

        let behind = self
            .replication
            .progress(peer_id)
            .map(|p| p.next_index <= self.log.last_index())
            .unwrap_or(false);
        if behind && self.state.role == RaftRole::Leader {
            self.replicate_to(peer_id)?;
        }
        Ok(())
    }

    fn handle_election_timeout(&mut self) -> Result<()> {
        if self.state.role == RaftRole::Leader {
            return Ok(());
        }
        if !self.membership.committed().contains(self.id) {
            self.reset_election_timer();
            return Ok(());
        }
        tracing::info!(
            node_id = self.id,
            term = self.state.current_term,
            "Election timeout, starting election"
        );
        self.start_election()
    }

    /// Start a new election
    fn start_election(&mut self) -> Result<()> {
        if !self.membership.committed().contains(self.id) {
            tracing::warn!(node_id = self.id, "Not a voting member, not campaigning");
            return Ok(());
        }

        let prev_role = self.state.role;
        self.state.become_candidate(self.id);
        self.persist_hard_state()?;
        self.on_role_change(prev_role);
        self.reset_election_timer();

        let term = self.state.current_term;
        tracing::info!(node_id = self.id, term, "Starting election");

        if self
            .membership
            .committed()
            .has_quorum(&self.state.votes_received)
        {
            return self.become_leader();
        }

        let request = VoteRequest {
            term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        let peers: Vec<NodeId> = self
            .membership
            .committed()
            .members()
            .filter(|&peer| peer != self.id)
            .collect();

        for peer_id in peers {
            let transport = self.transport.clone();
            let events = self.message_tx.clone();
            let request = RaftRequest::RequestVote(request.clone());
            let rpc_timeout = self.config.rpc_timeout();

            tokio::spawn(async move {
                match timeout(rpc_timeout, transport.send(peer_id, request)).await {
                    Ok(Ok(RaftResponse::Vote(response))) => {
                        let reply = RaftMessage::VoteReply {
                            peer_id,
                            term,
                            response,
                        };
                        let _ = events.send(reply).await;
                    }
                    Ok(Ok(other)) => {
                        tracing::warn!(peer_id, response = ?other, "Unexpected response to RequestVote");
                    }
                    Ok(Err(e)) => {
                        tracing::trace!(peer_id, error = %e, "Vote request failed");
                    }
                    Err(_) => {
                        tracing::trace!(peer_id, "Vote request timed out");
                    }
                }
            });
        }
        Ok(())
    }

    fn become_leader(&mut self) -> Result<()> {
        self.state.become_leader(self.id);
        let term = self.state.current_term;
        tracing::info!(node_id = self.id, term, "Became leader");

        let targets = self.membership.replication_targets(self.id);
        self.replication
            .reset(&targets, self.log.last_index() + 1);

        // Entries from earlier terms only commit behind one from this term
        let index = self.log.append(term, Payload::Noop)?;
        tracing::debug!(node_id = self.id, index, term, "Appended leader no-op");

        self.advance_commit()?;
        self.replicate_all()
    }

    fn step_down(&mut self, term: u64) -> Result<()> {
        let prev_role = self.state.role;
        self.state.become_follower(term);
        self.persist_hard_state()?;
        self.on_role_change(prev_role);
        Ok(())
    }

    /// Clean up after losing leadership.
    fn on_role_change(&mut self, prev_role: RaftRole) {
        if prev_role != RaftRole::Leader || self.state.role == RaftRole::Leader {
            return;
        }
        tracing::info!(
            node_id = self.id,
            term = self.state.current_term,
            role = %self.state.role,
            "Stepped down from leader"
        );
        self.replication.stop_all();
        for (_, waiter) in std::mem::take(&mut self.waiters) {
            let _ = waiter.response_tx.send(Err(RaftError::LeadershipLost));
        }
        for (_, waiter) in std::mem::take(&mut self.config_waiters) {
            let _ = waiter
                .response_tx
                .send(ConfigChangeResponse::not_leader(self.state.leader_id));
        }
        self.reset_election_timer();
    }

    /// Send AppendEntries (or a snapshot) to every peer without a request in flight.
    fn replicate_all(&mut self) -> Result<()> {
        if self.state.role != RaftRole::Leader {
            return Ok(());
        }
        for peer_id in self.replication.peer_ids() {
            self.replicate_to(peer_id)?;
        }
        Ok(())
    }

    fn replicate_to(&mut self, peer_id: NodeId) -> Result<()> {
        let Some(progress) = self.replication.progress(peer_id).copied() else {
            return Ok(());
        };
        if progress.in_flight {
            return Ok(());
        }

        let term = self.state.current_term;
        let (request, kind) = if progress.next_index <= self.log.snapshot_index() {
            let Some(snapshot) = self.snapshots.load()? else {
                return Err(RaftError::Corrupted(format!(
                    "log compacted to {} but no snapshot is stored",
                    self.log.snapshot_index()
                )));
            };
            tracing::debug!(
                peer_id,
                next_index = progress.next_index,
                snapshot_index = snapshot.last_included_index,
                "Peer needs compacted entries, sending snapshot"
            );
            let kind = SentKind::Snapshot {
                last_included_index: snapshot.last_included_index,
            };
            let request = RaftRequest::InstallSnapshot(InstallSnapshotRequest {
                term,
                leader_id: self.id,
                last_included_index: snapshot.last_included_index,
                last_included_term: snapshot.last_included_term,
                config: snapshot.config,
                data: snapshot.data,
            });
            (request, kind)
        } else {
            let next_index = progress.next_index.min(self.log.last_index() + 1);
            let prev_log_index = next_index - 1;
            let prev_log_term = self.log.term_at(prev_log_index).ok_or_else(|| {
                RaftError::Corrupted(format!("missing term for log index {prev_log_index}"))
            })?;
            let entries = self
                .log
                .entries_from(next_index, self.config.max_append_entries);
            let kind = SentKind::Append {
                prev_log_index,
                entries: entries.len() as u64,
            };
            let request = RaftRequest::AppendEntries(AppendEntriesRequest {
                term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.state.commit_index,
            });
            (request, kind)
        };

        self.replication
            .dispatch(peer_id, request, SentBatch { term, kind });
        Ok(())
    }

    /// Commit the highest current-term index stored on a majority.
    fn advance_commit(&mut self) -> Result<()> {
        if self.state.role != RaftRole::Leader {
            return Ok(());
        }

        let my_id = self.id;
        let last_index = self.log.last_index();
        let replication = &self.replication;
        let candidate = self.membership.committed().quorum_match_index(|peer| {
            if peer == my_id {
                last_index
            } else {
                replication.match_index(peer)
            }
        });

        if candidate <= self.state.commit_index {
            return Ok(());
        }
        // Only commit entries from current term
        if self.log.term_at(candidate) != Some(self.state.current_term) {
            return Ok(());
        }

        self.state.commit_index = candidate;
        tracing::debug!(node_id = self.id, commit_index = candidate, "Updated commit index");
        self.apply_committed()
    }

    /// Apply committed entries in index order and answer their waiters.
    fn apply_committed(&mut self) -> Result<()> {
        while self.state.last_applied < self.state.commit_index {
            let index = self.state.last_applied + 1;
            let entry = self.log.get(index).cloned().ok_or_else(|| {
                RaftError::Corrupted(format!("committed entry {index} missing from log"))
            })?;
            let term = entry.term;

            match entry.payload {
                Payload::Noop => {}
                Payload::Command(command) => self.state_machine.apply(index, &command),
                Payload::Config(members) => self.apply_configuration(index, members),
            }
            self.state.last_applied = index;

            if let Some(waiter) = self.waiters.remove(&index) {
                let result = if waiter.term == term {
                    Ok(index)
                } else {
                    Err(RaftError::LeadershipLost)
                };
                let _ = waiter.response_tx.send(result);
            }
            if let Some(waiter) = self.config_waiters.remove(&index) {
                let response = if waiter.term == term {
                    ConfigChangeResponse::ok(self.id)
                } else {
                    ConfigChangeResponse::not_leader(self.state.leader_id)
                };
                let _ = waiter.response_tx.send(response);
            }

            if self.state.role == RaftRole::Leader
                && !self.membership.committed().contains(self.id)
            {
                tracing::info!(node_id = self.id, "Removed from configuration, stepping down");
                let term = self.state.current_term;
                self.state.leader_id = None;
                self.step_down(term)?;
            }
        }

        self.commit_tx.send_if_modified(|applied| {
            let changed = *applied != self.state.last_applied;
            *applied = self.state.last_applied;
            changed
        });
        self.maybe_compact()
    }

    fn apply_configuration(&mut self, index: u64, members: ClusterConfiguration) {
        self.membership.on_commit(index, members);
        tracing::info!(
            node_id = self.id,
            index,
            members = ?self.membership.committed().members().collect::<Vec<_>>(),
            "Membership change committed"
        );
        if self.state.role == RaftRole::Leader {
            let targets = self.membership.replication_targets(self.id);
            self.replication
                .sync_peers(&targets, self.log.last_index() + 1);
        }
    }

    /// Snapshot the consumer and drop the covered log prefix once the log
    /// grows past the configured threshold.
    fn maybe_compact(&mut self) -> Result<()> {
        if self.log.len() <= self.config.compaction_threshold {
            return Ok(());
        }
        let index = self.state.last_applied;
        if index <= self.log.snapshot_index() {
            return Ok(());
        }
        let term = self.log.term_at(index).ok_or_else(|| {
            RaftError::Corrupted(format!("missing term for applied index {index}"))
        })?;

        let snapshot = Snapshot {
            last_included_index: index,
            last_included_term: term,
            config: self.membership.committed().clone(),
            data: self.state_machine.snapshot()?,
        };
        self.snapshots.save(&snapshot)?;
        self.log.compact_to(index, term)?;

        tracing::info!(
            node_id = self.id,
            snapshot_index = index,
            retained = self.log.len(),
            "Compacted log"
        );
        Ok(())
    }

    fn persist_hard_state(&mut self) -> Result<()> {
        let hard_state = self.state.hard_state();
        if hard_state != self.persisted {
            self.log.save_hard_state(&hard_state)?;
            self.persisted = hard_state;
        }
        Ok(())
    }

    fn reset_election_timer(&mut self) {
        self.election_deadline = next_election_deadline(
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
        );
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.id,
            role: self.state.role,
            current_term: self.state.current_term,
            leader_id: self.state.leader_id,
            commit_index: self.state.commit_index,
            last_applied: self.state.last_applied,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
            snapshot_index: self.log.snapshot_index(),
            log_len: self.log.len(),
            members: self.membership.committed().members().collect(),
        }
    }

    fn publish_status(&self) {
        let status = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn stop(&mut self) {
        self.replication.stop_all();
        for (_, waiter) in std::mem::take(&mut self.waiters) {
            let _ = waiter.response_tx.send(Err(RaftError::Shutdown));
        }
        for (_, waiter) in std::mem::take(&mut self.config_waiters) {
            let _ = waiter.response_tx.send(ConfigChangeResponse::not_leader(None));
        }
        tracing::info!(node_id = self.id, term = self.state.current_term, "Raft node stopped");
    }
}

/// Cloneable entry point to a running [`RaftNode`].
#[derive(Clone)]
pub struct RaftHandle {
    node_id: NodeId,
    message_tx: mpsc::Sender<RaftMessage>,
    status_rx: watch::Receiver<NodeStatus>,
    commit_rx: watch::Receiver<u64>,
    client_timeout: std::time::Duration,
    config_change_timeout: std::time::Duration,
}

impl RaftHandle {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> RaftMessage) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.message_tx
            .send(build(tx))
            .await
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)
    }

    /// Dispatch any inbound request to the node.
    pub async fn handle_rpc(&self, request: RaftRequest) -> Result<RaftResponse> {
        match request {
            RaftRequest::RequestVote(request) => {
                let response = self
                    .call(|response_tx| RaftMessage::RequestVote {
                        request,
                        response_tx,
                    })
                    .await?;
                Ok(RaftResponse::Vote(response))
            }
            RaftRequest::AppendEntries(request) => {
                let response = self
                    .call(|response_tx| RaftMessage::AppendEntries {
                        request,
                        response_tx,
                    })
                    .await?;
                Ok(RaftResponse::AppendEntries(response))
            }
            RaftRequest::InstallSnapshot(request) => {
                let response = self
                    .call(|response_tx| RaftMessage::InstallSnapshot {
                        request,
                        response_tx,
                    })
                    .await?;
                Ok(RaftResponse::InstallSnapshot(response))
            }
            RaftRequest::AddServer { peer_id } => Ok(RaftResponse::ConfigChange(
                self.add_server(peer_id).await,
            )),
            RaftRequest::RemoveServer { peer_id } => Ok(RaftResponse::ConfigChange(
                self.remove_server(peer_id).await,
            )),
            RaftRequest::ClientCommand { payload } => {
                let response = match self.submit(payload).await {
                    Ok(index) => CommandResponse::Applied { index },
                    Err(RaftError::NotLeader(leader_hint)) => CommandResponse::NotLeader { leader_hint },
                    Err(RaftError::LeadershipLost) => CommandResponse::LeadershipLost,
                    Err(RaftError::Timeout) => CommandResponse::Timeout,
                    Err(e) => CommandResponse::Failed {
                        reason: e.to_string(),
                    },
                };
                Ok(RaftResponse::Command(response))
            }
            RaftRequest::WhoIsTheLeader => Ok(RaftResponse::Leader(self.leader())),
        }
    }

    /// Replicate `payload` and wait until it is applied. Returns its log index.
    ///
    /// Fails with `NotLeader` (carrying a hint) on a non-leader, with
    /// `LeadershipLost` if the entry may not commit, and with `Timeout`
    /// after the configured client timeout.
    pub async fn submit(&self, payload: Vec<u8>) -> Result<u64> {
        let call = self.call(|response_tx| RaftMessage::AppendCommand {
            payload,
            response_tx,
        });
        match timeout(self.client_timeout, call).await {
            Ok(result) => result?,
            Err(_) => Err(RaftError::Timeout),
        }
    }

    pub async fn add_server(&self, peer_id: NodeId) -> ConfigChangeResponse {
        self.change_config(ConfigChange::AddServer(peer_id)).await
    }

    pub async fn remove_server(&self, peer_id: NodeId) -> ConfigChangeResponse {
        self.change_config(ConfigChange::RemoveServer(peer_id)).await
    }

    async fn change_config(&self, change: ConfigChange) -> ConfigChangeResponse {
        let call = self.call(|response_tx| RaftMessage::ChangeConfig {
            change,
            response_tx,
        });
        match timeout(self.config_change_timeout, call).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => ConfigChangeResponse::not_leader(None),
            Err(_) => ConfigChangeResponse::timeout(self.leader()),
        }
    }

    /// Start an election now instead of waiting for the timer.
    pub async fn campaign(&self) -> Result<()> {
        self.message_tx
            .send(RaftMessage::TriggerElection)
            .await
            .map_err(|_| RaftError::Shutdown)
    }

    /// Get the current leader ID
    pub fn leader(&self) -> Option<NodeId> {
        self.status_rx.borrow().leader_id
    }

    /// Check if this node is the leader
    pub fn is_leader(&self) -> bool {
        self.status_rx.borrow().role == RaftRole::Leader
    }

    pub fn status(&self) -> NodeStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<NodeStatus> {
        self.status_rx.clone()
    }

    /// Watch the highest applied index
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_rx.clone()
    }
}

impl std::fmt::Debug for RaftHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftHandle")
            .field("node_id", &self.node_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::log::LogEntry;
    use crate::raft::network::InMemoryNetwork;
    use crate::raft::state_machine::InMemoryStateMachine;

    fn config(node_id: NodeId, members: Vec<NodeId>) -> NodeConfig {
        NodeConfig::new(node_id, members)
            .with_election_timeout(50, 100)
            .with_heartbeat_interval(10)
    }

    #[test]
    fn recovery_rejects_term_behind_log() {
        let mut store = MemLogStore::new();
        store
            .append(&[LogEntry::new(3, 1, Payload::Noop)])
            .unwrap();
        store
            .save_hard_state(&HardState {
                current_term: 2,
                voted_for: None,
            })
            .unwrap();

        let network = InMemoryNetwork::new();
        let result = RaftNode::new(
            config(1, vec![1]),
            Box::new(store),
            Box::new(MemSnapshotStore::new()),
            InMemoryStateMachine::new(),
            Arc::new(network.transport(1)),
        );
        assert!(matches!(result, Err(RaftError::Corrupted(_))));
    }

    #[test]
    fn recovery_rejects_consumer_ahead_of_log() {
        let mut machine = InMemoryStateMachine::durable();
        machine.apply(5, b"x");

        let network = InMemoryNetwork::new();
        let result = RaftNode::new(
            config(1, vec![1]),
            Box::new(MemLogStore::new()),
            Box::new(MemSnapshotStore::new()),
            machine,
            Arc::new(network.transport(1)),
        );
        assert!(matches!(result, Err(RaftError::Corrupted(_))));
    }

    #[tokio::test]
    async fn single_node_elects_itself_and_applies() {
        let network = InMemoryNetwork::new();
        let machine = InMemoryStateMachine::new();
        let (node, handle) = RaftNode::open(
            config(1, vec![1]),
            machine.clone(),
            Arc::new(network.transport(1)),
        )
        .unwrap();
        network.register(handle.clone()).await;

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(node.run(shutdown.clone()));

        let mut status = handle.subscribe_status();
        timeout(std::time::Duration::from_secs(2), async {
            while status.borrow_and_update().role != RaftRole::Leader {
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        let index = handle.submit(b"enqueue".to_vec()).await.unwrap();
        assert_eq!(index, 2); // after the leader no-op
        assert_eq!(machine.commands(), vec![b"enqueue".to_vec()]);
        assert_eq!(*handle.subscribe_commits().borrow(), 2);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn follower_rejects_submit_with_hint() {
        let network = InMemoryNetwork::new();
        let (node, handle) = RaftNode::open(
            // Never times out during the test
            config(2, vec![1, 2, 3]).with_election_timeout(10_000, 20_000),
            InMemoryStateMachine::new(),
            Arc::new(network.transport(2)),
        )
        .unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(node.run(shutdown.clone()));

        let heartbeat = AppendEntriesRequest {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        let response = handle
            .handle_rpc(RaftRequest::AppendEntries(heartbeat))
            .await
            .unwrap();
        assert!(matches!(
            response,
            RaftResponse::AppendEntries(AppendEntriesResponse { success: true, .. })
        ));

        let err = handle.submit(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, RaftError::NotLeader(Some(1))));

        let response = handle.add_server(4).await;
        assert_eq!(response, ConfigChangeResponse::not_leader(Some(1)));

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    /// Log store whose term and vote writes fail while entry writes succeed.
    struct TermWritesFail(MemLogStore);

    impl LogStore for TermWritesFail {
        fn load_hard_state(&self) -> Result<HardState> {
            self.0.load_hard_state()
        }

        fn save_hard_state(&mut self, _state: &HardState) -> Result<()> {
            Err(RaftError::Storage(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk lost power",
            )))
        }

        fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
            self.0.append(entries)
        }

        fn truncate_from(&mut self, index: u64) -> Result<()> {
            self.0.truncate_from(index)
        }

        fn compact_to(&mut self, index: u64) -> Result<()> {
            self.0.compact_to(index)
        }

        fn load_entries(&self) -> Result<Vec<LogEntry>> {
            self.0.load_entries()
        }
    }

    #[tokio::test]
    async fn follower_restarts_after_crash_while_accepting_new_term() {
        let network = InMemoryNetwork::new();
        let disk = MemLogStore::new();
        let (mut node, _handle) = RaftNode::new(
            config(2, vec![1, 2, 3]),
            Box::new(TermWritesFail(disk.clone())),
            Box::new(MemSnapshotStore::new()),
            InMemoryStateMachine::new(),
            Arc::new(network.transport(2)),
        )
        .unwrap();

        let request = AppendEntriesRequest {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::new(1, 1, Payload::Noop)],
            leader_commit: 0,
        };
        let result = node.handle_append_entries(&request);
        assert!(matches!(result, Err(RaftError::Storage(_))));
        drop(node);

        // No entry of term 1 may reach the disk before term 1 itself
        assert_eq!(disk.load_hard_state().unwrap().current_term, 0);
        assert!(disk.load_entries().unwrap().is_empty());

        let (mut node, _handle) = RaftNode::new(
            config(2, vec![1, 2, 3]),
            Box::new(disk.clone()),
            Box::new(MemSnapshotStore::new()),
            InMemoryStateMachine::new(),
            Arc::new(network.transport(2)),
        )
        .expect("Follower should restart over the same disk");

        let response = node.handle_append_entries(&request).unwrap();
        assert!(response.success);
        assert_eq!(disk.load_hard_state().unwrap().current_term, 1);
        assert_eq!(disk.load_entries().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_replication_reply_keeps_request_in_flight() {
        let network = InMemoryNetwork::new();
        let (mut node, _handle) = RaftNode::new(
            config(1, vec![1, 2, 3]).with_election_timeout(10_000, 20_000),
            Box::new(MemLogStore::new()),
            Box::new(MemSnapshotStore::new()),
            InMemoryStateMachine::new(),
            Arc::new(network.transport(1)),
        )
        .unwrap();

        node.start_election().unwrap();
        let first_term = node.state.current_term;
        node.handle_vote_reply(
            2,
            first_term,
            VoteResponse {
                term: first_term,
                vote_granted: true,
            },
        )
        .unwrap();
        assert_eq!(node.state.role, RaftRole::Leader);

        // Lose leadership, then win it back in a later term
        node.step_down(first_term + 1).unwrap();
        node.start_election().unwrap();
        let second_term = node.state.current_term;
        node.handle_vote_reply(
            2,
            second_term,
            VoteResponse {
                term: second_term,
                vote_granted: true,
            },
        )
        .unwrap();
        assert_eq!(node.state.role, RaftRole::Leader);
        assert!(second_term > first_term);

        node.replication.progress_mut(2).unwrap().in_flight = true;
        let stale = SentBatch {
            term: first_term,
            kind: SentKind::Append {
                prev_log_index: 0,
                entries: 1,
            },
        };
        node.handle_replication_reply(2, stale, Err(RaftError::Timeout))
            .unwrap();
        assert!(node.replication.progress(2).unwrap().in_flight);

        let current = SentBatch {
            term: second_term,
            ..stale
        };
        node.handle_replication_reply(2, current, Err(RaftError::Timeout))
            .unwrap();
        assert!(!node.replication.progress(2).unwrap().in_flight);
    }

    #[tokio::test]
    async fn storage_failure_stops_the_node() {
        let network = InMemoryNetwork::new();
        let store = MemLogStore::new();
        let (node, handle) = RaftNode::new(
            config(1, vec![1]),
            Box::new(store.clone()),
            Box::new(MemSnapshotStore::new()),
            InMemoryStateMachine::new(),
            Arc::new(network.transport(1)),
        )
        .unwrap();
        store.set_fail_writes(true);

        let result = timeout(
            std::time::Duration::from_secs(2),
            node.run(CancellationToken::new()),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(RaftError::Storage(_))));
        assert!(matches!(
            handle.submit(b"x".to_vec()).await,
            Err(RaftError::Shutdown)
        ));
    }
}
