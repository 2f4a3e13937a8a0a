//! Oplog Entry Types
//!
//! Defines the operation-log entry shape, the monotonic position counter,
//! and the hash chain linking consecutive entries. The hash mixing
//! constants are a compatibility contract with existing log data and must
//! not change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Document representation: a JSON object
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Totally ordered identifier assigned to every committed write.
/// Strictly increasing per writer; comparable across nodes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OpPosition(pub u64);

impl OpPosition {
    pub const ZERO: OpPosition = OpPosition(0);

    /// The position immediately after this one
    pub fn next(self) -> OpPosition {
        OpPosition(self.0 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for OpPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operation types carried by log entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    #[serde(rename = "insert")]
    Insert,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "command")]
    Command,
    #[serde(rename = "applyOps")]
    ApplyOps,
    #[serde(rename = "noop")]
    Noop,
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OpType::Insert => "insert",
            OpType::Update => "update",
            OpType::Delete => "delete",
            OpType::Command => "command",
            OpType::ApplyOps => "applyOps",
            OpType::Noop => "noop",
        };
        write!(f, "{}", s)
    }
}

/// One logical operation, without position metadata. Several of these can
/// share one physical oplog record (and therefore one position).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogOp {
    /// Operation type
    pub op: OpType,
    /// Target namespace (database.collection)
    pub ns: String,
    /// Operation payload: the document, update spec, or command body
    #[serde(default)]
    pub doc: Document,
    /// Update match criteria (update only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<Document>,
    /// Insert-if-missing semantics for updates
    #[serde(default)]
    pub upsert: bool,
    /// Affect all matching documents rather than one (delete)
    #[serde(default)]
    pub multi: bool,
}

impl LogOp {
    /// Decode a logical operation from a raw document.
    /// An unrecognized op type is a protocol error, fatal to the stream
    /// that delivered it.
    pub fn from_document(doc: Document) -> Result<Self> {
        serde_json::from_value(serde_json::Value::Object(doc))
            .map_err(|e| Error::Protocol(format!("malformed log operation: {}", e)))
    }

    /// The `_id` of the payload document, if present
    pub fn doc_id(&self) -> Option<&serde_json::Value> {
        self.doc.get("_id")
    }
}

/// A single oplog entry as seen by the apply path: one logical operation
/// stamped with its position, timestamp, and chain hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Log position assigned by the writer
    pub id: OpPosition,
    /// Creation time on the writer
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Running chain hash (see [`chain_hash`])
    #[serde(default, rename = "h")]
    pub hash: i64,
    /// Identity of the node that originally logged this entry. Entries
    /// relayed through intermediate secondaries keep it, so the chain
    /// stays verifiable off any hop.
    #[serde(default)]
    pub writer: i64,
    /// The operation itself
    #[serde(flatten)]
    pub body: LogOp,
}

impl LogEntry {
    /// Decode an entry from a raw document, as delivered by a remote tail
    pub fn from_document(doc: Document) -> Result<Self> {
        serde_json::from_value(serde_json::Value::Object(doc))
            .map_err(|e| Error::Protocol(format!("malformed log entry: {}", e)))
    }
}

/// One physical oplog row: one-or-more logical operations bundled under a
/// single position, stamped with the running hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OplogRecord {
    #[serde(rename = "_id")]
    pub id: OpPosition,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "h")]
    pub hash: i64,
    /// Identity of the node that originally logged this record
    #[serde(default)]
    pub writer: i64,
    pub ops: Vec<LogOp>,
}

impl OplogRecord {
    /// Expand into per-operation entries for the apply path. Operations in
    /// one record share the record's position and hash.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.ops
            .iter()
            .map(|op| LogEntry {
                id: self.id,
                timestamp: self.timestamp,
                hash: self.hash,
                writer: self.writer,
                body: op.clone(),
            })
            .collect()
    }
}

/// The chain mixing function. Fixed constants; reproducible everywhere a
/// chain is verified.
pub fn chain_hash(prev_hash: i64, id: OpPosition, writer_id: i64) -> i64 {
    prev_hash
        .wrapping_mul(131)
        .wrapping_add(id.get() as i64)
        .wrapping_mul(17)
        .wrapping_add(writer_id)
}

/// Running hash-chain state for one writer. All mutation happens under the
/// writer's ordering lock.
#[derive(Debug, Clone)]
pub struct HashChain {
    writer_id: i64,
    last_position: OpPosition,
    last_hash: i64,
}

impl HashChain {
    /// A fresh chain for a writer that has never logged
    pub fn new(writer_id: i64) -> Self {
        Self {
            writer_id,
            last_position: OpPosition::ZERO,
            last_hash: 0,
        }
    }

    /// Resume a chain from the last persisted entry (restart path)
    pub fn resume(writer_id: i64, last_position: OpPosition, last_hash: i64) -> Self {
        Self {
            writer_id,
            last_position,
            last_hash,
        }
    }

    /// Assign the next position and hash. Caller must hold the ordering lock.
    pub fn advance(&mut self) -> (OpPosition, i64) {
        let id = self.last_position.next();
        let hash = chain_hash(self.last_hash, id, self.writer_id);
        self.last_position = id;
        self.last_hash = hash;
        (id, hash)
    }

    /// Align the chain with a record assigned elsewhere (pulled from a
    /// remote log). Never regresses; local appends afterwards chain off
    /// the observed hash.
    pub fn fast_forward(&mut self, position: OpPosition, hash: i64) {
        if position > self.last_position {
            self.last_position = position;
            self.last_hash = hash;
        }
    }

    pub fn last_position(&self) -> OpPosition {
        self.last_position
    }

    pub fn last_hash(&self) -> i64 {
        self.last_hash
    }

    pub fn writer_id(&self) -> i64 {
        self.writer_id
    }
}

/// Verify that `entry` chains correctly onto `prev_hash` under the
/// writer identity the entry carries. A mismatch signals corruption or a
/// lost entry and is never accepted.
pub fn verify_link(prev_hash: i64, entry: &LogEntry) -> Result<()> {
    let expected = chain_hash(prev_hash, entry.id, entry.writer);
    if expected != entry.hash {
        return Err(Error::ChainBroken {
            position: entry.id.get(),
            expected,
            actual: entry.hash,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        match v {
            serde_json::Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_chain_hash_is_pure() {
        let a = chain_hash(42, OpPosition(7), 3);
        let b = chain_hash(42, OpPosition(7), 3);
        assert_eq!(a, b);
        assert_ne!(a, chain_hash(43, OpPosition(7), 3));
        assert_ne!(a, chain_hash(42, OpPosition(8), 3));
        assert_ne!(a, chain_hash(42, OpPosition(7), 4));
    }

    #[test]
    fn test_chain_advance_and_verify() {
        let mut chain = HashChain::new(5);
        let (id1, h1) = chain.advance();
        let (id2, h2) = chain.advance();
        assert_eq!(id1, OpPosition(1));
        assert_eq!(id2, OpPosition(2));

        let entry2 = LogEntry {
            id: id2,
            timestamp: Utc::now(),
            hash: h2,
            writer: 5,
            body: LogOp {
                op: OpType::Noop,
                ns: "local.oplog".into(),
                doc: Document::new(),
                criteria: None,
                upsert: false,
                multi: false,
            },
        };
        verify_link(h1, &entry2).unwrap();

        // mutating the previous hash invalidates all later links
        let err = verify_link(h1 ^ 1, &entry2).unwrap_err();
        assert!(matches!(err, Error::ChainBroken { position: 2, .. }));

        // so does claiming a different writer identity
        let mut forged = entry2.clone();
        forged.writer = 6;
        assert!(verify_link(h1, &forged).is_err());
    }

    #[test]
    fn test_resume_continues_chain() {
        let mut chain = HashChain::new(9);
        let (_, h1) = chain.advance();
        let (id2, h2) = chain.advance();

        let mut resumed = HashChain::resume(9, id2, h2);
        let (id3, h3) = resumed.advance();
        assert_eq!(id3, OpPosition(3));
        assert_eq!(h3, chain_hash(h2, id3, 9));
        assert_ne!(h3, h1);
    }

    #[test]
    fn test_fast_forward_aligns_and_never_regresses() {
        let mut chain = HashChain::new(9);
        chain.fast_forward(OpPosition(4), 77);
        assert_eq!(chain.last_position(), OpPosition(4));
        assert_eq!(chain.last_hash(), 77);

        // stale observations are ignored
        chain.fast_forward(OpPosition(2), 11);
        assert_eq!(chain.last_position(), OpPosition(4));

        // local appends chain off the observed hash with the own identity
        let (id, hash) = chain.advance();
        assert_eq!(id, OpPosition(5));
        assert_eq!(hash, chain_hash(77, OpPosition(5), 9));
    }

    #[test]
    fn test_entry_decode_sparse() {
        let entry = LogEntry::from_document(doc(json!({
            "id": 5,
            "op": "insert",
            "ns": "t",
            "doc": {"_id": "x", "v": 1}
        })))
        .unwrap();
        assert_eq!(entry.id, OpPosition(5));
        assert_eq!(entry.body.op, OpType::Insert);
        assert_eq!(entry.body.doc_id(), Some(&json!("x")));
    }

    #[test]
    fn test_unknown_op_type_is_protocol_error() {
        let err = LogEntry::from_document(doc(json!({
            "id": 1,
            "op": "z",
            "ns": "t",
            "doc": {}
        })))
        .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_record_expands_to_entries() {
        let record = OplogRecord {
            id: OpPosition(4),
            timestamp: Utc::now(),
            hash: 77,
            writer: 3,
            ops: vec![
                LogOp {
                    op: OpType::Insert,
                    ns: "app.users".into(),
                    doc: doc(json!({"_id": 1})),
                    criteria: None,
                    upsert: false,
                    multi: false,
                },
                LogOp {
                    op: OpType::Delete,
                    ns: "app.sessions".into(),
                    doc: doc(json!({"user": 1})),
                    criteria: None,
                    upsert: false,
                    multi: true,
                },
            ],
        };

        let entries = record.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.id == OpPosition(4)));
        assert!(entries.iter().all(|e| e.hash == 77));
        assert!(entries.iter().all(|e| e.writer == 3));
    }
}
