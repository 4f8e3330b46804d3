use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{RaftError, Result};
use crate::raft::node::RaftHandle;
use crate::raft::rpc::{RaftRequest, RaftResponse};
use crate::raft::NodeId;

/// Request/response delivery between nodes.
///
/// Implementations may fail, delay or lose messages; callers bound every
/// call with their own timeout.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, target: NodeId, request: RaftRequest) -> Result<RaftResponse>;
}

#[derive(Default)]
struct NetworkInner {
    nodes: HashMap<NodeId, RaftHandle>,
    /// Directed links that drop traffic
    blocked: HashSet<(NodeId, NodeId)>,
}

impl NetworkInner {
    fn is_blocked(&self, from: NodeId, to: NodeId) -> bool {
        self.blocked.contains(&(from, to))
    }
}

/// In-process network connecting [`RaftHandle`]s, with controllable
/// partitions. Requests travel through the wire encoding.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<RwLock<NetworkInner>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for the node `from`.
    pub fn transport(&self, from: NodeId) -> InMemoryTransport {
        InMemoryTransport {
            from,
            network: self.clone(),
        }
    }

    pub async fn register(&self, handle: RaftHandle) {
        self.inner
            .write()
            .await
            .nodes
            .insert(handle.node_id(), handle);
    }

    /// Remove a node; requests to it fail as unreachable.
    pub async fn unregister(&self, node_id: NodeId) {
        self.inner.write().await.nodes.remove(&node_id);
    }

    /// Drop traffic between `a` and `b` in both directions.
    pub async fn disconnect(&self, a: NodeId, b: NodeId) {
        let mut inner = self.inner.write().await;
        inner.blocked.insert((a, b));
        inner.blocked.insert((b, a));
    }

    pub async fn reconnect(&self, a: NodeId, b: NodeId) {
        let mut inner = self.inner.write().await;
        inner.blocked.remove(&(a, b));
        inner.blocked.remove(&(b, a));
    }

    /// Cut `node_id` off from every node in `others`.
    pub async fn isolate(&self, node_id: NodeId, others: &[NodeId]) {
        for &other in others {
            if other != node_id {
                self.disconnect(node_id, other).await;
            }
        }
    }

    /// Remove every partition.
    pub async fn heal_all(&self) {
        self.inner.write().await.blocked.clear();
    }

    async fn route(&self, from: NodeId, to: NodeId) -> Result<RaftHandle> {
        let inner = self.inner.read().await;
        if inner.is_blocked(from, to) {
            return Err(RaftError::Unreachable(to));
        }
        inner
            .nodes
            .get(&to)
            .cloned()
            .ok_or(RaftError::Unreachable(to))
    }
}

/// One node's view of an [`InMemoryNetwork`].
#[derive(Clone)]
pub struct InMemoryTransport {
    from: NodeId,
    network: InMemoryNetwork,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, target: NodeId, request: RaftRequest) -> Result<RaftResponse> {
        let handle = self.network.route(self.from, target).await?;
        tracing::trace!(from = self.from, to = target, kind = request.kind(), "Sending request");

        let request = RaftRequest::decode(&request.encode()?)?;
        let response = handle.handle_rpc(request).await?;

        // The reply can be lost to a partition that formed meanwhile
        self.network.route(target, self.from).await?;
        RaftResponse::decode(&response.encode()?)
    }
}
