//! Client-facing entry point that hides which node currently leads.
//!
//! Requests go to the local node first. A `NotLeader` answer carrying a
//! hint is followed by forwarding to the hinted node, up to a bounded
//! number of redirects.

use std::sync::Arc;

use crate::error::{RaftError, Result};
use crate::raft::network::Transport;
use crate::raft::node::RaftHandle;
use crate::raft::rpc::{
    CommandResponse, ConfigChangeResponse, ConfigChangeStatus, RaftRequest, RaftResponse,
};
use crate::raft::NodeId;

pub struct Gateway {
    local: RaftHandle,
    transport: Arc<dyn Transport>,
    max_redirects: usize,
}

impl Gateway {
    pub fn new(local: RaftHandle, transport: Arc<dyn Transport>, max_redirects: usize) -> Self {
        Self {
            local,
            transport,
            max_redirects,
        }
    }

    /// Ask `node_id` who it believes the leader is.
    pub async fn ask_leader(&self, node_id: NodeId) -> Result<Option<NodeId>> {
        if node_id == self.local.node_id() {
            return Ok(self.local.leader());
        }
        match self.transport.send(node_id, RaftRequest::WhoIsTheLeader).await? {
            RaftResponse::Leader(leader) => Ok(leader),
            other => Err(RaftError::Transport(format!(
                "unexpected response to WhoIsTheLeader: {other:?}"
            ))),
        }
    }

    /// Replicate a command through whichever node leads. Returns its index.
    pub async fn submit(&self, payload: Vec<u8>) -> Result<u64> {
        let mut hint = match self.local.submit(payload.clone()).await {
            Err(RaftError::NotLeader(hint)) => hint,
            other => return other,
        };

        for _ in 0..self.max_redirects {
            let Some(leader) = hint.filter(|&id| id != self.local.node_id()) else {
                break;
            };
            tracing::debug!(
                node_id = self.local.node_id(),
                leader,
                "Forwarding command to leader"
            );
            let request = RaftRequest::ClientCommand {
                payload: payload.clone(),
            };
            match self.transport.send(leader, request).await? {
                RaftResponse::Command(CommandResponse::Applied { index }) => return Ok(index),
                RaftResponse::Command(CommandResponse::NotLeader { leader_hint }) => {
                    hint = leader_hint;
                }
                RaftResponse::Command(CommandResponse::LeadershipLost) => {
                    return Err(RaftError::LeadershipLost)
                }
                RaftResponse::Command(CommandResponse::Timeout) => return Err(RaftError::Timeout),
                RaftResponse::Command(CommandResponse::Failed { reason }) => {
                    return Err(RaftError::Transport(reason))
                }
                other => {
                    return Err(RaftError::Transport(format!(
                        "unexpected response to ClientCommand: {other:?}"
                    )))
                }
            }
        }
        Err(RaftError::NotLeader(hint))
    }

    pub async fn add_server(&self, peer_id: NodeId) -> ConfigChangeResponse {
        let response = self.local.add_server(peer_id).await;
        self.follow_config_hints(response, RaftRequest::AddServer { peer_id })
            .await
    }

    pub async fn remove_server(&self, peer_id: NodeId) -> ConfigChangeResponse {
        let response = self.local.remove_server(peer_id).await;
        self.follow_config_hints(response, RaftRequest::RemoveServer { peer_id })
            .await
    }

    async fn follow_config_hints(
        &self,
        mut response: ConfigChangeResponse,
        request: RaftRequest,
    ) -> ConfigChangeResponse {
        let mut asked = self.local.node_id();
        for _ in 0..self.max_redirects {
            if response.status != ConfigChangeStatus::NotLeader {
                break;
            }
            // A leader naming itself is busy with another change
            let Some(leader) = response.leader_hint.filter(|&id| id != asked) else {
                break;
            };
            tracing::debug!(leader, kind = request.kind(), "Forwarding membership change");
            response = match self.transport.send(leader, request.clone()).await {
                Ok(RaftResponse::ConfigChange(response)) => response,
                Ok(other) => {
                    tracing::warn!(leader, response = ?other, "Unexpected membership response");
                    return ConfigChangeResponse::not_leader(None);
                }
                Err(e) => {
                    tracing::debug!(leader, error = %e, "Leader unreachable");
                    return ConfigChangeResponse::not_leader(Some(leader));
                }
            };
            asked = leader;
        }
        response
    }
}
