//! Replica Set Membership Interface
//!
//! Membership is maintained by heartbeat/reconfiguration logic outside
//! this crate; replication components only read the current view.
//! Member records are replaced wholesale on reconfiguration, so nothing
//! here holds an owning reference to one. Consumers keep an id and
//! re-resolve on demand.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::oplog::entry::OpPosition;

/// A snapshot of one member's identity and health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRef {
    /// Numeric member id (doubles as the member's writer identity)
    pub id: u32,
    /// host:port
    pub host: String,
    /// Arbiter members hold no data and cannot serve as sync sources
    pub arbiter_only: bool,
    /// Whether this member builds indexes
    pub builds_indexes: bool,
    /// Reachable per the latest heartbeat
    pub healthy: bool,
    /// Authentication against this member succeeds
    pub auth_ok: bool,
    /// Last position reported by this member
    pub last_position: OpPosition,
}

impl MemberRef {
    pub fn new(id: u32, host: impl Into<String>) -> Self {
        Self {
            id,
            host: host.into(),
            arbiter_only: false,
            builds_indexes: true,
            healthy: true,
            auth_ok: true,
            last_position: OpPosition::ZERO,
        }
    }
}

/// Read-only membership view
pub trait Membership: Send + Sync {
    fn resolve_member(&self, id: u32) -> Option<MemberRef>;
    fn member_by_host(&self, host: &str) -> Option<MemberRef>;
    fn current_members(&self) -> Vec<MemberRef>;

    /// Highest position any member is known to have reached
    fn max_known_position(&self) -> OpPosition {
        self.current_members()
            .iter()
            .map(|m| m.last_position)
            .max()
            .unwrap_or(OpPosition::ZERO)
    }
}

/// Membership backed by an in-process map, updated by whatever drives
/// heartbeats in the embedding process (and directly by tests).
#[derive(Default)]
pub struct StaticMembership {
    members: RwLock<HashMap<u32, MemberRef>>,
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_member(&self, member: MemberRef) {
        self.members
            .write()
            .expect("membership lock poisoned")
            .insert(member.id, member);
    }

    pub fn remove_member(&self, id: u32) {
        self.members
            .write()
            .expect("membership lock poisoned")
            .remove(&id);
    }

    pub fn set_position(&self, id: u32, position: OpPosition) {
        if let Some(m) = self
            .members
            .write()
            .expect("membership lock poisoned")
            .get_mut(&id)
        {
            m.last_position = position;
        }
    }
}

impl Membership for StaticMembership {
    fn resolve_member(&self, id: u32) -> Option<MemberRef> {
        self.members
            .read()
            .expect("membership lock poisoned")
            .get(&id)
            .cloned()
    }

    fn member_by_host(&self, host: &str) -> Option<MemberRef> {
        self.members
            .read()
            .expect("membership lock poisoned")
            .values()
            .find(|m| m.host == host)
            .cloned()
    }

    fn current_members(&self) -> Vec<MemberRef> {
        self.members
            .read()
            .expect("membership lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_and_max_position() {
        let membership = StaticMembership::new();
        membership.upsert_member(MemberRef::new(1, "a:27017"));
        membership.upsert_member(MemberRef::new(2, "b:27017"));
        membership.set_position(2, OpPosition(40));

        assert_eq!(membership.resolve_member(1).unwrap().host, "a:27017");
        assert!(membership.resolve_member(9).is_none());
        assert_eq!(membership.member_by_host("b:27017").unwrap().id, 2);
        assert_eq!(membership.max_known_position(), OpPosition(40));
    }

    #[test]
    fn test_reconfiguration_replaces_records() {
        let membership = StaticMembership::new();
        membership.upsert_member(MemberRef::new(1, "a:27017"));

        let mut replacement = MemberRef::new(1, "a:27017");
        replacement.healthy = false;
        membership.upsert_member(replacement);

        assert!(!membership.resolve_member(1).unwrap().healthy);
    }
}
