//! DocRepl - Document Database Replication Core
//!
//! Log-shipping replication for a distributed document database: every
//! committed write lands in a hash-chained operation log, secondaries
//! pull that log from a sync source and replay it idempotently, and
//! chained secondaries have their progress relayed upstream through
//! ghost cursors.
//!
//! # Architecture
//!
//! One node accepts writes and assigns each operation a strictly
//! increasing position plus a running chain hash, so any gap or
//! corruption in a shipped log is detected at the first bad link.
//! Secondaries run a pull loop that tails the source's oplog, verifies
//! the chain, and applies entries through an idempotent apply engine,
//! so replaying the same entry twice converges instead of erroring.
//!
//! # Features
//!
//! - Hash-chained operation log with restart-safe chain resumption
//! - Two-record checkpoint store bounding discard and replay
//! - Idempotent apply engine (inserts as upserts, classified zero-match
//!   updates, tolerant deletes, nested batches)
//! - Role state machine with blocked/maintenance gating of the pull loop
//! - Operator-forced sync source selection with validation
//! - Ghost position relay for chained secondaries

pub mod apply;
pub mod command;
pub mod config;
pub mod error;
pub mod ghost;
pub mod logging;
pub mod member;
pub mod oplog;
pub mod remote;
pub mod runtime;
pub mod storage;
pub mod sync;

pub use config::DocReplConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::apply::{ApplyCounters, ApplyEngine, ApplyOutcome};
    pub use crate::config::DocReplConfig;
    pub use crate::error::{Error, Result};
    pub use crate::ghost::GhostRegistry;
    pub use crate::member::{MemberRef, Membership, StaticMembership};
    pub use crate::oplog::{Checkpoint, LogEntry, LogOp, OpPosition, OpType, OplogWriter};
    pub use crate::runtime::{ReplRuntime, ReplStatus};
    pub use crate::sync::{NodeState, Puller, SyncCoordinator};
}
