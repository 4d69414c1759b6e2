/// Redis cluster node health checker
use super::{HealthChecker, HealthStatus};
use crate::config::HealthConfig;
use crate::core::{ClusterNode, Connector};
use crate::redis::{FeedStatus, RespEncoder};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// PINGs a node over a dedicated connection
pub struct RedisHealthChecker {
    connector: Connector,
    check_interval: Duration,
    check_timeout: Duration,
    ping: Bytes,
}

impl RedisHealthChecker {
    pub fn new(check_interval: Duration, check_timeout: Duration) -> Self {
        Self {
            connector: Connector::new(check_timeout, 512),
            check_interval,
            check_timeout,
            ping: RespEncoder::encode(&RespEncoder::create_command("PING", &[])),
        }
    }

    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(
            Duration::from_secs(config.interval_sec),
            Duration::from_secs(config.timeout_sec),
        )
    }

    async fn redis_ping_check(&self, node: &Arc<ClusterNode>) -> HealthStatus {
        let mut conn = match self.connector.connect(node).await {
            Ok(conn) => conn,
            Err(e) => {
                return HealthStatus::Unhealthy {
                    reason: format!("Connection failed: {}", e),
                };
            }
        };

        match conn
            .round_trip(&self.ping, self.check_timeout, self.check_timeout)
            .await
        {
            Ok((FeedStatus::Complete, body)) if &body[..] == b"PONG" => HealthStatus::Healthy,
            Ok((status, body)) => HealthStatus::Unhealthy {
                reason: format!(
                    "Unexpected PING response: {:?} {}",
                    status,
                    String::from_utf8_lossy(&body)
                ),
            },
            Err(e) => HealthStatus::Unhealthy {
                reason: format!("PING failed: {}", e),
            },
        }
    }
}

#[async_trait::async_trait]
impl HealthChecker for RedisHealthChecker {
    async fn check_health(&self, node: &Arc<ClusterNode>) -> HealthStatus {
        tracing::debug!(node = %node.addr, "Checking Redis health");
        self.redis_ping_check(node).await
    }

    fn check_interval(&self) -> Duration {
        self.check_interval
    }

    fn check_timeout(&self) -> Duration {
        self.check_timeout
    }
}

impl Default for RedisHealthChecker {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(3))
    }
}
