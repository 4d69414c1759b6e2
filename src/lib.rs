/// slotgate - HTTP gateway for Redis Cluster
///
/// Routes key operations received over HTTP to the cluster node owning the
/// key's hash slot, follows MOVED/ASK redirects, and streams replies back
/// without buffering them whole.
pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod http;
pub mod redis;
pub mod upstream;
pub mod utils;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::core::{Connector, LeasePool, NodeRegistry};
use crate::error::GatewayResult;
use crate::health::redis::RedisHealthChecker;
use crate::health::HealthCheckManager;
use crate::redis::SlotRouter;
use crate::upstream::{TopologyRefresher, UpstreamController, UpstreamSettings};

/// A fully wired gateway: routing state, connection pool, controller and
/// the background tasks that keep them current
pub struct Gateway {
    config: Config,
    controller: Arc<UpstreamController>,
    refresher: Arc<TopologyRefresher>,
}

impl Gateway {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(NodeRegistry::new());
        for seed in &config.cluster.seed_nodes {
            registry.get_or_insert(seed);
        }

        let router = Arc::new(SlotRouter::new(
            Arc::clone(&registry),
            config.cluster.hash_tag_delimiters(),
            config.cluster.fallback_node.as_deref(),
        ));

        let upstream = &config.upstream;
        let pool = Arc::new(LeasePool::new(
            Connector::new(upstream.connect_timeout(), upstream.buffer_size),
            upstream.max_connections_per_node,
            upstream.acquire_timeout(),
            upstream.max_idle(),
        ));

        let controller = Arc::new(UpstreamController::new(
            Arc::clone(&router),
            Arc::clone(&pool),
            UpstreamSettings::from(upstream),
        ));

        let refresher = Arc::new(TopologyRefresher::new(
            router,
            pool,
            config.cluster.seed_nodes.clone(),
            upstream.send_timeout(),
            upstream.read_timeout(),
        ));

        Self {
            config,
            controller,
            refresher,
        }
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn controller(&self) -> &Arc<UpstreamController> {
        &self.controller
    }

    /// Discover the topology if configured, then start the idle evictor,
    /// health checks and periodic slot refresh.
    pub async fn start_background(&self) -> Vec<JoinHandle<()>> {
        if self.config.cluster.discover_on_start {
            self.refresher.discover().await;
        }

        let mut tasks = Vec::new();

        let eviction = Duration::from_secs(self.config.upstream.eviction_interval_sec);
        if !eviction.is_zero() {
            tasks.push(self.controller.pool().spawn_evictor(eviction));
        }

        if self.config.health.enabled {
            let manager = HealthCheckManager::new(Box::new(RedisHealthChecker::from_config(
                &self.config.health,
            )));
            tasks.push(manager.spawn(Arc::clone(self.controller.router().registry())));
        }

        let refresh = Duration::from_secs(self.config.cluster.slot_refresh_interval_sec);
        if !refresh.is_zero() {
            tasks.push(Arc::clone(&self.refresher).spawn(refresh));
        }

        tasks
    }

    /// Serve on `listen_addr` until ctrl-c
    pub async fn run(self) -> GatewayResult<()> {
        let listener = TcpListener::bind(&self.config.server.listen_addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tasks = self.start_background().await;

        let app = http::router(Arc::clone(&self.controller), self.config.server.enabled);
        info!(
            address = %listener.local_addr()?,
            enabled = self.config.server.enabled,
            nodes = self.controller.router().registry().len(),
            "slotgate listening"
        );

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await;

        for task in tasks {
            task.abort();
        }
        info!("slotgate stopped");

        result.map_err(Into::into)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::mock::{MockNode, Reply};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn config_for(seed: &str) -> Config {
        let mut config = Config::default();
        config.cluster.seed_nodes = vec![seed.to_string()];
        config.cluster.fallback_node = None;
        config.cluster.slot_refresh_interval_sec = 0;
        config.health.enabled = false;
        config
    }

    #[test]
    fn test_gateway_wiring() {
        let gateway = Gateway::new(config_for("127.0.0.1:7000"));
        let router = gateway.controller().router();

        assert_eq!(router.registry().len(), 1);
        assert!(router.registry().get_by_addr("127.0.0.1:7000").is_some());
        // Nothing is routable before discovery without a fallback
        assert!(router.route(b"foo").is_err());
    }

    #[test]
    fn test_config_errors_reachable_from_config_module() {
        let result = Config::load_from_file("/nonexistent/slotgate.toml");
        assert!(matches!(result, Err(config::ConfigError::IoError(_))));
    }

    #[test]
    fn test_gateway_fallback() {
        let mut config = config_for("127.0.0.1:7000");
        config.cluster.fallback_node = Some("127.0.0.1:7001".to_string());
        let gateway = Gateway::new(config);

        let route = gateway.controller().router().route(b"foo").unwrap();
        assert_eq!(route.node.addr, "127.0.0.1:7001");
        assert_eq!(route.owner, None);
    }

    #[tokio::test]
    async fn test_serve_discovers_and_proxies() {
        let node = MockNode::start(|req| match req {
            "CLUSTER\nNODES\n" => {
                let nodes = "a :7000@17000 myself,master - 0 0 1 connected 0-16383\n";
                Reply::Now(format!("${}\r\n{}\r\n", nodes.len(), nodes).into_bytes())
            }
            "GET\nfoo\n" => Reply::now(b"$3\r\nbar\r\n"),
            _ => Reply::now(b"-ERR unexpected\r\n"),
        })
        .await;

        let gateway = Gateway::new(config_for(&node.addr));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(gateway.serve(listener, async move {
            let _ = stop_rx.await;
        }));

        // The connection waits in the backlog while discovery runs
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /foo HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("\r\n\r\nbar"));

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
