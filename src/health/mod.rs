/// Health checking for cluster nodes
pub mod redis;

use crate::core::{ClusterNode, NodeRegistry};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Health status of a node
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Probe one node
    async fn check_health(&self, node: &Arc<ClusterNode>) -> HealthStatus;

    fn check_interval(&self) -> Duration;

    fn check_timeout(&self) -> Duration;
}

/// Runs a checker over every registered node and flips their availability
pub struct HealthCheckManager {
    checker: Box<dyn HealthChecker>,
}

impl HealthCheckManager {
    pub fn new(checker: Box<dyn HealthChecker>) -> Self {
        Self { checker }
    }

    /// Check one node with the checker's timeout and record the result on it
    pub async fn check_node(&self, node: &Arc<ClusterNode>) -> HealthStatus {
        let status = match timeout(self.checker.check_timeout(), self.checker.check_health(node)).await {
            Ok(status) => status,
            Err(_) => HealthStatus::Timeout,
        };

        if status.is_healthy() {
            if node.mark_healthy() {
                tracing::info!(node = %node.addr, "Node is healthy again");
            }
        } else if node.mark_unreachable() {
            tracing::warn!(node = %node.addr, "Node failed health check: {}", status);
        } else {
            tracing::debug!(node = %node.addr, "Node still unhealthy: {}", status);
        }

        status
    }

    /// One sweep over every node currently registered
    pub async fn check_all(&self, registry: &NodeRegistry) -> usize {
        let mut healthy = 0;
        for node in registry.nodes() {
            if self.check_node(&node).await.is_healthy() {
                healthy += 1;
            }
        }
        healthy
    }

    /// Check every node on the checker's interval until the task is aborted
    pub fn spawn(self, registry: Arc<NodeRegistry>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.checker.check_interval());
            loop {
                interval.tick().await;
                let healthy = self.check_all(&registry).await;
                tracing::debug!(healthy, total = registry.len(), "Health sweep finished");
            }
        })
    }
}
