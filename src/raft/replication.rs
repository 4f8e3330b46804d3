use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::RaftError;
use crate::raft::network::Transport;
use crate::raft::node::RaftMessage;
use crate::raft::rpc::RaftRequest;
use crate::raft::NodeId;

/// Snapshot transfers get this many RPC timeouts
const SNAPSHOT_TIMEOUT_FACTOR: u32 = 10;

/// Leader's view of how far one follower has caught up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerProgress {
    /// Next log index to send
    pub next_index: u64,
    /// Highest index known to be replicated on the peer
    pub match_index: u64,
    /// A request is outstanding; no other is sent until it resolves
    pub in_flight: bool,
}

impl PeerProgress {
    pub fn new(next_index: u64) -> Self {
        Self {
            next_index,
            match_index: 0,
            in_flight: false,
        }
    }

    /// The peer now holds everything up to `index`. Never moves backwards.
    pub fn record_success(&mut self, index: u64) {
        self.match_index = self.match_index.max(index);
        self.next_index = self.next_index.max(self.match_index + 1);
    }

    /// The consistency check failed; retry from just after `hint`.
    pub fn record_mismatch(&mut self, hint: u64) {
        let retry = self.next_index.saturating_sub(1).min(hint + 1);
        self.next_index = retry.max(self.match_index + 1).max(1);
    }
}

/// What an outstanding request covered, echoed back with its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentKind {
    Append { prev_log_index: u64, entries: u64 },
    Snapshot { last_included_index: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentBatch {
    pub term: u64,
    pub kind: SentKind,
}

struct Replicator {
    jobs: mpsc::Sender<(RaftRequest, SentBatch)>,
    cancel: CancellationToken,
}

struct Peer {
    progress: PeerProgress,
    replicator: Replicator,
}

/// Progress and replicator task for every peer a leader replicates to.
///
/// Replicators only carry requests to the network and post the outcome back
/// to the node's queue; all decisions stay in the node.
pub struct ReplicationManager {
    node_id: NodeId,
    peers: HashMap<NodeId, Peer>,
    transport: Arc<dyn Transport>,
    events: mpsc::Sender<RaftMessage>,
    rpc_timeout: Duration,
}

impl ReplicationManager {
    pub(crate) fn new(
        node_id: NodeId,
        transport: Arc<dyn Transport>,
        events: mpsc::Sender<RaftMessage>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            peers: HashMap::new(),
            transport,
            events,
            rpc_timeout,
        }
    }

    /// Start replicating to `targets` from scratch, as a new leader does.
    pub fn reset(&mut self, targets: &BTreeSet<NodeId>, next_index: u64) {
        self.stop_all();
        self.sync_peers(targets, next_index);
    }

    /// Add replicators for new targets and stop those no longer targeted.
    pub fn sync_peers(&mut self, targets: &BTreeSet<NodeId>, next_index: u64) {
        let removed: Vec<NodeId> = self
            .peers
            .keys()
            .filter(|id| !targets.contains(id))
            .copied()
            .collect();
        for peer_id in removed {
            if let Some(peer) = self.peers.remove(&peer_id) {
                peer.replicator.cancel.cancel();
                tracing::debug!(node_id = self.node_id, peer_id, "Stopped replicating to peer");
            }
        }

        for &peer_id in targets {
            if peer_id == self.node_id || self.peers.contains_key(&peer_id) {
                continue;
            }
            let replicator = self.spawn_replicator(peer_id);
            self.peers.insert(
                peer_id,
                Peer {
                    progress: PeerProgress::new(next_index),
                    replicator,
                },
            );
            tracing::debug!(node_id = self.node_id, peer_id, next_index, "Replicating to peer");
        }
    }

    pub fn stop_all(&mut self) {
        for (_, peer) in self.peers.drain() {
            peer.replicator.cancel.cancel();
        }
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    pub fn progress(&self, peer_id: NodeId) -> Option<&PeerProgress> {
        self.peers.get(&peer_id).map(|p| &p.progress)
    }

    pub fn progress_mut(&mut self, peer_id: NodeId) -> Option<&mut PeerProgress> {
        self.peers.get_mut(&peer_id).map(|p| &mut p.progress)
    }

    pub fn match_index(&self, peer_id: NodeId) -> u64 {
        self.progress(peer_id).map(|p| p.match_index).unwrap_or(0)
    }

    /// Hand a request to the peer's replicator and mark it in flight.
    pub fn dispatch(&mut self, peer_id: NodeId, request: RaftRequest, batch: SentBatch) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        match peer.replicator.jobs.try_send((request, batch)) {
            Ok(()) => peer.progress.in_flight = true,
            Err(e) => {
                tracing::warn!(peer_id, error = %e, "Replicator not accepting requests");
            }
        }
    }

    fn spawn_replicator(&self, peer_id: NodeId) -> Replicator {
        let (jobs, job_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        tokio::spawn(run_replicator(
            peer_id,
            job_rx,
            self.transport.clone(),
            self.events.clone(),
            self.rpc_timeout,
            cancel.clone(),
        ));
        Replicator { jobs, cancel }
    }
}

impl Drop for ReplicationManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

async fn run_replicator(
    peer_id: NodeId,
    mut jobs: mpsc::Receiver<(RaftRequest, SentBatch)>,
    transport: Arc<dyn Transport>,
    events: mpsc::Sender<RaftMessage>,
    rpc_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let (request, batch) = tokio::select! {
            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let limit = match batch.kind {
            SentKind::Snapshot { .. } => rpc_timeout * SNAPSHOT_TIMEOUT_FACTOR,
            SentKind::Append { .. } => rpc_timeout,
        };
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            result = timeout(limit, transport.send(peer_id, request)) => {
                result.unwrap_or(Err(RaftError::Timeout))
            }
        };

        let reply = RaftMessage::ReplicationReply {
            peer_id,
            batch,
            outcome,
        };
        if events.send(reply).await.is_err() {
            break;
        }
    }
    tracing::trace!(peer_id, "Replicator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_never_moves_backwards() {
        let mut progress = PeerProgress::new(11);
        progress.record_success(15);
        assert_eq!(progress.match_index, 15);
        assert_eq!(progress.next_index, 16);

        // A delayed reply for an older batch
        progress.record_success(12);
        assert_eq!(progress.match_index, 15);
        assert_eq!(progress.next_index, 16);
    }

    #[test]
    fn mismatch_uses_hint() {
        let mut progress = PeerProgress::new(11);
        progress.record_mismatch(3);
        assert_eq!(progress.next_index, 4);

        // A hint past next_index still backs off by one
        progress.record_mismatch(50);
        assert_eq!(progress.next_index, 3);
    }

    #[test]
    fn mismatch_stays_above_match_index() {
        let mut progress = PeerProgress::new(11);
        progress.record_success(8);
        progress.next_index = 11;
        progress.record_mismatch(2);
        assert_eq!(progress.next_index, 9);
    }

    #[test]
    fn mismatch_bottoms_out_at_one() {
        let mut progress = PeerProgress::new(1);
        progress.record_mismatch(0);
        assert_eq!(progress.next_index, 1);
    }
}
