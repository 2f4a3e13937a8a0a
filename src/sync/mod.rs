//! Sync State Machine Module
//!
//! Node role transitions, sync-source selection, and the continuous
//! pull/apply loop. Which node becomes primary is decided elsewhere;
//! this module only governs whether this node's apply path is active
//! and where it pulls from.

mod coordinator;
mod puller;

pub use coordinator::SyncCoordinator;
pub use puller::Puller;

use serde::{Deserialize, Serialize};

/// Replication role of this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Not yet participating in replication
    Initial,
    /// Catching up; not serving as a replica
    Recovering,
    /// Live replica, continuously applying the source's log
    Secondary,
    /// Accepting writes; does not pull
    Primary,
    /// Unrecoverable replication fault; terminal
    Fatal,
}

impl NodeState {
    pub fn is_primary(self) -> bool {
        matches!(self, NodeState::Primary)
    }

    pub fn is_secondary(self) -> bool {
        matches!(self, NodeState::Secondary)
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, NodeState::Fatal)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Initial => write!(f, "INITIAL"),
            NodeState::Recovering => write!(f, "RECOVERING"),
            NodeState::Secondary => write!(f, "SECONDARY"),
            NodeState::Primary => write!(f, "PRIMARY"),
            NodeState::Fatal => write!(f, "FATAL"),
        }
    }
}
