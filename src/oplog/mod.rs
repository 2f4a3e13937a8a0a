//! Operation Log Module
//!
//! Hash-chained, totally ordered log of committed operations, plus the
//! checkpoint store bounding discard and replay.

pub mod entry;
mod writer;

pub use entry::{
    chain_hash, verify_link, Document, HashChain, LogEntry, LogOp, OpPosition, OpType, OplogRecord,
};
pub use writer::{Checkpoint, OplogWriter, KEY_MIN_LIVE, KEY_MIN_UNAPPLIED};
