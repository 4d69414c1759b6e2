/// Core abstractions shared by routing, pooling and the request lifecycle
pub mod connection;
pub mod frontend;
pub mod pool;
pub mod registry;

pub use connection::{BackendConnection, Connector};
pub use frontend::{CancelSignal, InboundRequest, ResponseHead, ResponseSink};
pub use pool::{Lease, LeasePool};
pub use registry::NodeRegistry;

use crate::redis::slots::SlotRange;
use arc_swap::ArcSwap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Index of a node inside its registry; stable for the life of the process
pub type NodeId = u32;

/// A Redis Cluster node as seen by the gateway.
///
/// Nodes are created on first reference (seed config, redirect, or topology
/// refresh) and are never removed; an unreachable node is only flagged.
#[derive(Debug)]
pub struct ClusterNode {
    pub id: NodeId,
    /// `host:port` exactly as the cluster advertises it
    pub addr: String,
    healthy: AtomicBool,
    /// Slot ranges from the last full refresh. May be stale after MOVED.
    slot_ranges: ArcSwap<Vec<SlotRange>>,
}

impl ClusterNode {
    pub fn new(id: NodeId, addr: String) -> Self {
        Self {
            id,
            addr,
            healthy: AtomicBool::new(true),
            slot_ranges: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Flag the node available again. Returns true if that changed anything.
    pub fn mark_healthy(&self) -> bool {
        !self.healthy.swap(true, Ordering::AcqRel)
    }

    /// Flag the node unreachable. Returns true if that changed anything.
    pub fn mark_unreachable(&self) -> bool {
        self.healthy.swap(false, Ordering::AcqRel)
    }

    pub fn slot_ranges(&self) -> Arc<Vec<SlotRange>> {
        self.slot_ranges.load_full()
    }

    pub fn set_slot_ranges(&self, ranges: Vec<SlotRange>) {
        self.slot_ranges.store(Arc::new(ranges));
    }
}

impl PartialEq for ClusterNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.addr == other.addr
    }
}

impl Eq for ClusterNode {}

impl fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}
