/// Topology discovery and periodic full slot-table refresh
use crate::core::{ClusterNode, LeasePool};
use crate::error::{GatewayError, GatewayResult};
use crate::redis::slots::parse_cluster_nodes;
use crate::redis::{FeedStatus, RespEncoder, SlotRange, SlotRouter};
use bytes::Bytes;
use lazy_static::lazy_static;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

lazy_static! {
    static ref CLUSTER_NODES: Bytes = RespEncoder::encode_command([&b"CLUSTER"[..], &b"NODES"[..]]);
}

/// Rebuilds the slot table from `CLUSTER NODES`
#[derive(Debug)]
pub struct TopologyRefresher {
    router: Arc<SlotRouter>,
    pool: Arc<LeasePool>,
    seeds: Vec<String>,
    send_timeout: Duration,
    read_timeout: Duration,
}

impl TopologyRefresher {
    pub fn new(
        router: Arc<SlotRouter>,
        pool: Arc<LeasePool>,
        seeds: Vec<String>,
        send_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            router,
            pool,
            seeds,
            send_timeout,
            read_timeout,
        }
    }

    /// Nodes to ask, in order: seeds first, then everything learned since
    fn candidates(&self) -> Vec<Arc<ClusterNode>> {
        let registry = self.router.registry();
        let mut nodes: Vec<_> = self
            .seeds
            .iter()
            .map(|addr| registry.get_or_insert(addr))
            .collect();
        for node in registry.nodes() {
            if !nodes.iter().any(|n| n.id == node.id) {
                nodes.push(node);
            }
        }
        nodes.sort_by_key(|n| !n.is_healthy());
        nodes
    }

    /// Ask known nodes in turn until one answers, then swap in the new table.
    ///
    /// Returns the number of masters found.
    pub async fn refresh(&self) -> GatewayResult<usize> {
        let mut last_error = None;

        for node in self.candidates() {
            match self.query(&node).await {
                Ok(masters) if masters.is_empty() => {
                    debug!(node = %node.addr, "CLUSTER NODES listed no slot owners");
                }
                Ok(masters) => {
                    self.router.refresh(&masters);
                    return Ok(masters.len());
                }
                Err(e) => {
                    debug!(node = %node.addr, "Topology query failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            GatewayError::desync("no node returned a usable CLUSTER NODES reply")
        }))
    }

    async fn query(&self, node: &Arc<ClusterNode>) -> GatewayResult<Vec<(String, Vec<SlotRange>)>> {
        let mut lease = self.pool.lease(node).await?;
        let result = lease
            .conn()
            .round_trip(&CLUSTER_NODES, self.send_timeout, self.read_timeout)
            .await;

        match result {
            Ok((FeedStatus::Complete, body)) => {
                lease.release(true);
                let text = String::from_utf8_lossy(&body);
                Ok(parse_cluster_nodes(&text, &node.addr))
            }
            Ok((status, _)) => {
                lease.release(true);
                Err(GatewayError::desync(format!(
                    "CLUSTER NODES answered with {:?}",
                    status
                )))
            }
            Err(e) => {
                lease.release(!e.discards_connection());
                Err(e)
            }
        }
    }

    /// Refresh the table every `interval` in the background
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.refresh().await {
                    Ok(masters) => debug!(masters, "Periodic slot refresh done"),
                    Err(e) => warn!("Periodic slot refresh failed: {}", e),
                }
            }
        })
    }

    /// Initial discovery; failures leave routing to redirects and the fallback
    pub async fn discover(&self) {
        match self.refresh().await {
            Ok(masters) => info!(masters, "Discovered cluster topology"),
            Err(e) => warn!(
                "Topology discovery failed, relying on redirects: {}",
                e
            ),
        }
    }
}
