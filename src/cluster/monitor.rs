use super::periodic_executor::Reaper;
use super::state::{now_millis, MemberStatus, ServerRole};
use super::Cluster;
use crate::error::{DriverError, DriverResult};
use crate::operation::Dispatcher;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Thresholds for health monitoring
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub suspicion_threshold: Duration,
    pub failure_threshold: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            suspicion_threshold: Duration::from_secs(10),
            failure_threshold: Duration::from_secs(15),
        }
    }
}

/// Pings every server and keeps the cluster state's roles and health
/// current.
pub struct ServerMonitor {
    cluster: Arc<Cluster>,
    dispatcher: Dispatcher,
    config: HealthConfig,
}

impl ServerMonitor {
    pub fn new(cluster: Arc<Cluster>, dispatcher: Dispatcher, config: HealthConfig) -> Self {
        Self {
            cluster,
            dispatcher,
            config,
        }
    }

    /// Downgrade a member that has not answered for too long.
    fn age_out(&self, address: &str) {
        let Some(member) = self.cluster.state().get_member(address) else {
            return;
        };
        let elapsed = Duration::from_millis(now_millis().saturating_sub(member.last_heartbeat));

        if elapsed > self.config.failure_threshold {
            if member.status != MemberStatus::Dead {
                tracing::warn!("Server {} unreachable for {:?}, marking dead", address, elapsed);
                self.cluster.state().mark_status(address, MemberStatus::Dead);
            }
        } else if elapsed > self.config.suspicion_threshold
            && member.status == MemberStatus::Active
        {
            tracing::warn!("Server {} missed heartbeats, marking suspected", address);
            self.cluster.state().mark_status(address, MemberStatus::Suspected);
        }
    }
}

fn role_from_hello(reply: &serde_json::Value) -> ServerRole {
    let flag = |name: &str| reply.get(name).and_then(|v| v.as_bool()).unwrap_or(false);
    if flag("isWritablePrimary") || flag("ismaster") {
        ServerRole::Primary
    } else if flag("secondary") {
        ServerRole::Secondary
    } else {
        ServerRole::Unknown
    }
}

#[async_trait]
impl Reaper for ServerMonitor {
    fn name(&self) -> &str {
        "server-monitor"
    }

    async fn execute(&self) -> DriverResult<()> {
        let servers = self.cluster.servers();
        let mut unreachable = 0;

        for server in &servers {
            match self
                .dispatcher
                .run_command(server.as_ref(), "admin", json!({ "hello": 1 }))
                .await
            {
                Ok(reply) => {
                    let role = role_from_hello(&reply);
                    self.cluster.state().record_heartbeat(server.address(), role);
                }
                Err(e) => {
                    tracing::debug!("Heartbeat to {} failed: {}", server.address(), e);
                    unreachable += 1;
                    self.age_out(server.address());
                }
            }
        }

        if unreachable > 0 {
            return Err(DriverError::Connection(format!(
                "{} of {} servers unreachable",
                unreachable,
                servers.len()
            )));
        }
        Ok(())
    }
}
