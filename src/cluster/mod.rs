//! Cluster membership, server selection and background maintenance.

pub mod connection;
pub mod monitor;
pub mod periodic_executor;
pub mod server;
pub mod session;
pub mod state;

pub use connection::TcpServer;
pub use monitor::{HealthConfig, ServerMonitor};
pub use periodic_executor::{PeriodicExecutor, Reaper, ReaperFailure, DEFAULT_INTERVAL};
pub use server::{Server, ServerAddress, ServerFeatures};
pub use session::{ServerSession, SessionPool, SessionReaper};
pub use state::{ClusterMember, ClusterState, MemberStatus, ServerRole};

use crate::error::{DriverError, DriverResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Picks the server an operation runs against.
pub trait ServerSelector: Send + Sync {
    fn select_server(&self, for_write: bool) -> DriverResult<Arc<dyn Server>>;

    /// Told about a failed exchange so the next selection can avoid the
    /// server. Default: ignore.
    fn report_failure(&self, _address: &str, _error: &DriverError) {}
}

/// The set of servers a client talks to, plus their shared health state.
#[derive(Default)]
pub struct Cluster {
    state: ClusterState,
    servers: RwLock<BTreeMap<ServerAddress, Arc<dyn Server>>>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_server(&self, server: Arc<dyn Server>, role: ServerRole) {
        let address = server.address().to_string();
        self.servers.write().insert(address.clone(), server);
        if self.state.add_member(address.clone(), role) {
            tracing::info!("Added server {} to cluster as {:?}", address, role);
        }
    }

    pub fn remove_server(&self, address: &str) {
        self.servers.write().remove(address);
        self.state.remove_member(address);
    }

    pub fn server(&self, address: &str) -> Option<Arc<dyn Server>> {
        self.servers.read().get(address).cloned()
    }

    pub fn servers(&self) -> Vec<Arc<dyn Server>> {
        self.servers.read().values().cloned().collect()
    }

    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    fn first_available<'a>(
        &self,
        candidates: impl Iterator<Item = &'a ClusterMember>,
    ) -> Option<Arc<dyn Server>> {
        let servers = self.servers.read();
        candidates
            .filter_map(|member| servers.get(&member.address).cloned())
            .next()
    }
}

impl ServerSelector for Cluster {
    /// Writes go to the primary unless it is dead. Reads prefer an active
    /// primary, then any active member, then any suspected member.
    fn select_server(&self, for_write: bool) -> DriverResult<Arc<dyn Server>> {
        let members = self.state.get_all_members();
        let alive = |m: &&ClusterMember| m.status != MemberStatus::Dead;
        let primary = |m: &&ClusterMember| m.role == ServerRole::Primary;
        let active = |m: &&ClusterMember| m.status == MemberStatus::Active;

        let selected = if for_write {
            self.first_available(members.iter().filter(alive).filter(primary))
        } else {
            self.first_available(members.iter().filter(active).filter(primary))
                .or_else(|| self.first_available(members.iter().filter(active)))
                .or_else(|| self.first_available(members.iter().filter(alive)))
        };

        selected.ok_or_else(|| {
            DriverError::NoSuitableServer(format!(
                "no {} server among {} known members",
                if for_write { "writable" } else { "readable" },
                members.len()
            ))
        })
    }

    fn report_failure(&self, address: &str, error: &DriverError) {
        if error.is_network_error() {
            tracing::debug!("Marking {} suspected after: {}", address, error);
            self.state.mark_status(address, MemberStatus::Suspected);
        } else if error.is_not_primary() {
            tracing::debug!("Demoting {} after: {}", address, error);
            self.state.mark_role(address, ServerRole::Unknown);
        }
    }
}
