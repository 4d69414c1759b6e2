/// Cluster node registry
use crate::core::{ClusterNode, NodeId};
use arc_swap::ArcSwap;
use fnv::FnvHashMap;
use std::sync::Arc;

/// Immutable view of every node known so far
#[derive(Debug, Default)]
struct RegistrySnapshot {
    nodes: Vec<Arc<ClusterNode>>,
    by_addr: FnvHashMap<String, NodeId>,
}

/// Append-only registry of cluster nodes owned by one gateway instance.
///
/// Readers load a snapshot without locking. Inserts publish a new snapshot,
/// so a node id always indexes the same node.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a node by address, inserting it if it has never been seen
    pub fn get_or_insert(&self, addr: &str) -> Arc<ClusterNode> {
        if let Some(node) = self.get_by_addr(addr) {
            return node;
        }

        self.snapshot.rcu(|current| {
            if current.by_addr.contains_key(addr) {
                return Arc::clone(current);
            }
            let id = current.nodes.len() as NodeId;
            let mut nodes = current.nodes.clone();
            let mut by_addr = current.by_addr.clone();
            nodes.push(Arc::new(ClusterNode::new(id, addr.to_string())));
            by_addr.insert(addr.to_string(), id);
            Arc::new(RegistrySnapshot { nodes, by_addr })
        });

        let snapshot = self.snapshot.load();
        let id = snapshot.by_addr[addr];
        tracing::debug!(node = %addr, id, "Registered cluster node");
        Arc::clone(&snapshot.nodes[id as usize])
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<ClusterNode>> {
        self.snapshot.load().nodes.get(id as usize).cloned()
    }

    pub fn get_by_addr(&self, addr: &str) -> Option<Arc<ClusterNode>> {
        let snapshot = self.snapshot.load();
        snapshot
            .by_addr
            .get(addr)
            .map(|&id| Arc::clone(&snapshot.nodes[id as usize]))
    }

    /// All registered nodes in insertion order
    pub fn nodes(&self) -> Vec<Arc<ClusterNode>> {
        self.snapshot.load().nodes.clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
