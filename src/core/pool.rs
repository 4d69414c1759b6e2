/// Connection lease pool keyed by cluster node
///
/// Each node gets a semaphore sized to the per-node cap and a stack of idle
/// connections. A `Lease` owns one permit and one connection; the permit
/// only returns to the node once the lease is released or dropped, which is
/// what bounds concurrent requests per node.
use crate::core::{BackendConnection, ClusterNode, Connector, NodeId};
use crate::error::{GatewayError, GatewayResult};
use fnv::FnvHashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

/// Per-node slice of the pool
#[derive(Debug)]
struct NodePool {
    node: Arc<ClusterNode>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<BackendConnection>>,
}

impl NodePool {
    fn idle(&self) -> MutexGuard<'_, Vec<BackendConnection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Most recently used idle connection that is still within `max_idle`
    fn take_idle(&self, max_idle: Duration) -> Option<BackendConnection> {
        let mut idle = self.idle();
        while let Some(conn) = idle.pop() {
            if conn.idle_for() <= max_idle {
                return Some(conn);
            }
            debug!(
                node = %self.node.addr,
                conn = conn.id(),
                age = ?conn.age(),
                "Dropping expired idle connection"
            );
        }
        None
    }

    fn put_idle(&self, conn: BackendConnection) {
        self.idle().push(conn);
    }

    fn evict(&self, max_idle: Duration) -> usize {
        let mut idle = self.idle();
        let before = idle.len();
        idle.retain(|conn| conn.idle_for() <= max_idle);
        before - idle.len()
    }
}

/// Exclusive use of one backend connection by one request
#[derive(Debug)]
pub struct Lease {
    conn: Option<BackendConnection>,
    pool: Arc<NodePool>,
    reused: bool,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    /// The leased connection
    pub fn conn(&mut self) -> &mut BackendConnection {
        self.conn
            .as_mut()
            .expect("lease holds its connection until released")
    }

    pub fn node(&self) -> &Arc<ClusterNode> {
        &self.pool.node
    }

    /// Whether the connection came from the idle set rather than a fresh connect
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Hand the connection back. Unhealthy connections are closed.
    pub fn release(mut self, healthy: bool) {
        if let Some(mut conn) = self.conn.take() {
            if healthy {
                conn.touch();
                self.pool.put_idle(conn);
            } else {
                debug!(
                    node = %self.pool.node.addr,
                    conn = conn.id(),
                    age = ?conn.age(),
                    "Discarding connection"
                );
            }
        }
        // the permit goes back when `self` drops, after the connection is idle
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Dropped mid-exchange (cancellation or panic): protocol state unknown
            debug!(
                node = %self.pool.node.addr,
                conn = conn.id(),
                age = ?conn.age(),
                "Lease dropped without release, discarding connection"
            );
        }
    }
}

/// Pool of backend connections, keyed by node
#[derive(Debug)]
pub struct LeasePool {
    connector: Connector,
    max_per_node: usize,
    acquire_timeout: Duration,
    max_idle: Duration,
    pools: Mutex<FnvHashMap<NodeId, Arc<NodePool>>>,
}

impl LeasePool {
    pub fn new(
        connector: Connector,
        max_per_node: usize,
        acquire_timeout: Duration,
        max_idle: Duration,
    ) -> Self {
        Self {
            connector,
            max_per_node,
            acquire_timeout,
            max_idle,
            pools: Mutex::new(FnvHashMap::default()),
        }
    }

    fn node_pool(&self, node: &Arc<ClusterNode>) -> Arc<NodePool> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(pools.entry(node.id).or_insert_with(|| {
            Arc::new(NodePool {
                node: Arc::clone(node),
                permits: Arc::new(Semaphore::new(self.max_per_node)),
                idle: Mutex::new(Vec::new()),
            })
        }))
    }

    fn all_pools(&self) -> Vec<Arc<NodePool>> {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Lease a connection to `node`, reusing an idle one when possible.
    ///
    /// Waits for a free slot under the per-node cap for at most the acquire
    /// timeout, then fails with `PoolExhausted`.
    pub async fn lease(&self, node: &Arc<ClusterNode>) -> GatewayResult<Lease> {
        let pool = self.node_pool(node);

        let permit = match timeout(
            self.acquire_timeout,
            Arc::clone(&pool.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                debug!(node = %node.addr, cap = self.max_per_node, "No connection slot within acquire timeout");
                return Err(GatewayError::pool_exhausted(node.addr.clone()));
            }
        };

        if let Some(conn) = pool.take_idle(self.max_idle) {
            debug!(node = %node.addr, conn = conn.id(), "Reusing idle connection");
            return Ok(Lease {
                conn: Some(conn),
                pool,
                reused: true,
                _permit: permit,
            });
        }

        let conn = self.connector.connect(node).await?;
        debug!(node = %node.addr, conn = conn.id(), "Opened backend connection");
        Ok(Lease {
            conn: Some(conn),
            pool,
            reused: false,
            _permit: permit,
        })
    }

    /// Return a leased connection; `healthy == false` closes it for good
    pub fn release(&self, lease: Lease, healthy: bool) {
        lease.release(healthy);
    }

    /// Close idle connections past the max idle age. Returns how many closed.
    pub fn evict_idle(&self) -> usize {
        self.all_pools()
            .iter()
            .map(|pool| pool.evict(self.max_idle))
            .sum()
    }

    /// Start the background eviction sweep. Stops once the pool is dropped.
    pub fn spawn_evictor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                let evicted = pool.evict_idle();
                if evicted > 0 {
                    debug!("Evicted {} idle backend connections", evicted);
                }
            }
        })
    }

    pub fn idle_count(&self, node: &Arc<ClusterNode>) -> usize {
        self.node_pool(node).idle().len()
    }

    /// Connections currently leased out for `node`
    pub fn in_use(&self, node: &Arc<ClusterNode>) -> usize {
        self.max_per_node - self.node_pool(node).permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;

    /// Accepts connections and holds them open
    async fn idle_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        addr
    }

    fn pool(cap: usize, acquire_ms: u64, max_idle: Duration) -> LeasePool {
        LeasePool::new(
            Connector::default(),
            cap,
            Duration::from_millis(acquire_ms),
            max_idle,
        )
    }

    #[tokio::test]
    async fn test_healthy_release_is_reused() {
        let addr = idle_server().await;
        let node = Arc::new(ClusterNode::new(0, addr));
        let pool = pool(2, 100, Duration::from_secs(60));

        let mut lease = pool.lease(&node).await.unwrap();
        assert!(!lease.is_reused());
        let first_id = lease.conn().id();
        assert_eq!(pool.in_use(&node), 1);
        pool.release(lease, true);

        assert_eq!(pool.in_use(&node), 0);
        assert_eq!(pool.idle_count(&node), 1);

        let mut lease = pool.lease(&node).await.unwrap();
        assert!(lease.is_reused());
        assert_eq!(lease.conn().id(), first_id);
    }

    #[tokio::test]
    async fn test_unhealthy_release_is_never_handed_out() {
        let addr = idle_server().await;
        let node = Arc::new(ClusterNode::new(0, addr));
        let pool = pool(1, 100, Duration::from_secs(60));

        let mut lease = pool.lease(&node).await.unwrap();
        let broken_id = lease.conn().id();
        pool.release(lease, false);
        assert_eq!(pool.idle_count(&node), 0);

        for _ in 0..3 {
            let mut lease = pool.lease(&node).await.unwrap();
            assert_ne!(lease.conn().id(), broken_id);
            pool.release(lease, true);
        }
    }

    #[tokio::test]
    async fn test_dropped_lease_discards_connection() {
        let addr = idle_server().await;
        let node = Arc::new(ClusterNode::new(0, addr));
        let pool = pool(1, 100, Duration::from_secs(60));

        let lease = pool.lease(&node).await.unwrap();
        drop(lease);

        assert_eq!(pool.in_use(&node), 0);
        assert_eq!(pool.idle_count(&node), 0);
    }

    #[tokio::test]
    async fn test_pool_exhausted_after_acquire_timeout() {
        let addr = idle_server().await;
        let node = Arc::new(ClusterNode::new(0, addr));
        let pool = pool(1, 50, Duration::from_secs(60));

        let _held = pool.lease(&node).await.unwrap();

        let started = Instant::now();
        let result = pool.lease(&node).await;
        let waited = started.elapsed();

        assert!(matches!(result, Err(GatewayError::PoolExhausted { .. })));
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_waiter_gets_released_connection() {
        let addr = idle_server().await;
        let node = Arc::new(ClusterNode::new(0, addr));
        let pool = Arc::new(pool(1, 1000, Duration::from_secs(60)));

        let mut first = pool.lease(&node).await.unwrap();
        let first_id = first.conn().id();

        let waiter = {
            let pool = Arc::clone(&pool);
            let node = Arc::clone(&node);
            tokio::spawn(async move {
                let mut lease = pool.lease(&node).await.unwrap();
                lease.conn().id()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        first.release(true);

        assert_eq!(waiter.await.unwrap(), first_id);
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let addr = idle_server().await;
        let node = Arc::new(ClusterNode::new(0, addr));
        let pool = pool(2, 100, Duration::from_millis(20));

        let a = pool.lease(&node).await.unwrap();
        let b = pool.lease(&node).await.unwrap();
        a.release(true);
        b.release(true);
        assert_eq!(pool.idle_count(&node), 2);
        assert_eq!(pool.evict_idle(), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(pool.evict_idle(), 2);
        assert_eq!(pool.idle_count(&node), 0);
    }

    #[tokio::test]
    async fn test_expired_idle_not_reused() {
        let addr = idle_server().await;
        let node = Arc::new(ClusterNode::new(0, addr));
        let pool = pool(1, 100, Duration::from_millis(10));

        let mut lease = pool.lease(&node).await.unwrap();
        let old_id = lease.conn().id();
        lease.release(true);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let mut lease = pool.lease(&node).await.unwrap();
        assert!(!lease.is_reused());
        assert_ne!(lease.conn().id(), old_id);
    }

    #[tokio::test]
    async fn test_connect_failure_returns_permit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let node = Arc::new(ClusterNode::new(0, addr));
        let pool = pool(1, 50, Duration::from_secs(60));

        assert!(matches!(
            pool.lease(&node).await,
            Err(GatewayError::BackendUnreachable { .. })
        ));
        assert_eq!(pool.in_use(&node), 0);
    }
}
