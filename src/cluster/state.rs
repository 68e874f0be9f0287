use super::server::ServerAddress;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerRole {
    Primary,
    Secondary,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemberStatus {
    Active,
    Suspected,
    Dead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMember {
    pub address: ServerAddress,
    pub role: ServerRole,
    pub status: MemberStatus,
    /// Unix millis of the last successful exchange
    pub last_heartbeat: u64,
}

/// Shared view of the cluster members.
///
/// Written by the background monitor and by failure reports, read by server
/// selection on caller tasks. Every operation takes the lock once, so readers
/// see either the old or the new member record, never a mix.
#[derive(Clone, Default)]
pub struct ClusterState {
    members: Arc<RwLock<BTreeMap<ServerAddress, ClusterMember>>>,
}

pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a member. Returns true if it was not known before.
    pub fn add_member(&self, address: ServerAddress, role: ServerRole) -> bool {
        let mut members = self.members.write();
        let exists = members.contains_key(&address);
        members.insert(
            address.clone(),
            ClusterMember {
                address,
                role,
                status: MemberStatus::Active,
                last_heartbeat: now_millis(),
            },
        );
        !exists
    }

    pub fn remove_member(&self, address: &str) {
        self.members.write().remove(address);
    }

    pub fn get_member(&self, address: &str) -> Option<ClusterMember> {
        self.members.read().get(address).cloned()
    }

    /// Snapshot of all members, ordered by address.
    pub fn get_all_members(&self) -> Vec<ClusterMember> {
        self.members.read().values().cloned().collect()
    }

    /// Record a successful exchange: refresh the heartbeat, set the role the
    /// server reported and bring a suspected or dead member back.
    pub fn record_heartbeat(&self, address: &str, role: ServerRole) {
        let mut members = self.members.write();
        if let Some(member) = members.get_mut(address) {
            member.last_heartbeat = now_millis();
            member.role = role;
            member.status = MemberStatus::Active;
        }
    }

    pub fn mark_status(&self, address: &str, status: MemberStatus) {
        if let Some(member) = self.members.write().get_mut(address) {
            member.status = status;
        }
    }

    pub fn mark_role(&self, address: &str, role: ServerRole) {
        if let Some(member) = self.members.write().get_mut(address) {
            member.role = role;
        }
    }

    pub fn active_members(&self) -> Vec<ClusterMember> {
        self.members
            .read()
            .values()
            .filter(|m| m.status == MemberStatus::Active)
            .cloned()
            .collect()
    }

    pub fn primary(&self) -> Option<ClusterMember> {
        self.members
            .read()
            .values()
            .find(|m| m.role == ServerRole::Primary && m.status != MemberStatus::Dead)
            .cloned()
    }
}
