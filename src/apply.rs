//! Idempotent Apply Engine
//!
//! Replays oplog entries (local or remote) against local storage with
//! at-most-once-visible effects. Inserts are modeled as upserts so a
//! duplicate replay never errors or duplicates; updates classify a
//! zero-match by the shape of their criteria; deletes tolerate absent
//! targets. A per-entry semantic failure is recorded and returned, never
//! escalated; the retry/abort policy belongs to the caller. Storage I/O
//! faults and unrecognized operations propagate as errors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::command::CommandDispatcher;
use crate::error::{Error, Result};
use crate::oplog::entry::{Document, LogEntry, LogOp, OpType};
use crate::storage::DocumentStore;

/// Per-operation-type counters
#[derive(Debug, Default)]
pub struct OpCounters {
    pub insert: AtomicU64,
    pub update: AtomicU64,
    pub delete: AtomicU64,
    pub command: AtomicU64,
    pub apply_ops: AtomicU64,
    pub noop: AtomicU64,
}

impl OpCounters {
    fn got(&self, op: OpType) {
        let counter = match op {
            OpType::Insert => &self.insert,
            OpType::Update => &self.update,
            OpType::Delete => &self.delete,
            OpType::Command => &self.command,
            OpType::ApplyOps => &self.apply_ops,
            OpType::Noop => &self.noop,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, op: OpType) -> u64 {
        let counter = match op {
            OpType::Insert => &self.insert,
            OpType::Update => &self.update,
            OpType::Delete => &self.delete,
            OpType::Command => &self.command,
            OpType::ApplyOps => &self.apply_ops,
            OpType::Noop => &self.noop,
        };
        counter.load(Ordering::Relaxed)
    }
}

/// Counters split by operation origin
#[derive(Debug, Default)]
pub struct ApplyCounters {
    /// Operations originating on this node
    pub local: OpCounters,
    /// Operations replayed from a remote log
    pub remote: OpCounters,
}

impl ApplyCounters {
    fn for_origin(&self, from_remote: bool) -> &OpCounters {
        if from_remote {
            &self.remote
        } else {
            &self.local
        }
    }
}

/// Result of applying one entry. `applied = false` is a recorded,
/// non-fatal per-entry failure; the stream continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub applied: bool,
}

/// The apply engine
pub struct ApplyEngine {
    store: Arc<dyn DocumentStore>,
    dispatcher: Arc<dyn CommandDispatcher>,
    counters: Arc<ApplyCounters>,
    slow_warn: Duration,
}

impl ApplyEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        dispatcher: Arc<dyn CommandDispatcher>,
        counters: Arc<ApplyCounters>,
        slow_warn: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            counters,
            slow_warn,
        }
    }

    pub fn counters(&self) -> &ApplyCounters {
        &self.counters
    }

    /// Apply one entry. `convert_to_upsert` relaxes updates to upserts,
    /// which replay paths use to make re-application converge.
    pub async fn apply(
        &self,
        entry: &LogEntry,
        from_remote: bool,
        convert_to_upsert: bool,
    ) -> Result<ApplyOutcome> {
        tracing::trace!(id = %entry.id, op = %entry.body.op, ns = %entry.body.ns, "applying entry");
        let applied = self
            .apply_body(&entry.body, from_remote, convert_to_upsert)
            .await?;
        Ok(ApplyOutcome { applied })
    }

    /// Decode and apply a raw document from the wire. An unrecognized op
    /// type surfaces here as a protocol error, fatal to the replay loop.
    pub async fn apply_raw(
        &self,
        doc: Document,
        from_remote: bool,
        convert_to_upsert: bool,
    ) -> Result<ApplyOutcome> {
        let entry = LogEntry::from_document(doc)?;
        self.apply(&entry, from_remote, convert_to_upsert).await
    }

    async fn apply_body(
        &self,
        body: &LogOp,
        from_remote: bool,
        convert_to_upsert: bool,
    ) -> Result<bool> {
        self.counters.for_origin(from_remote).got(body.op);

        match body.op {
            OpType::Insert => self.apply_insert(body).await,
            OpType::Update => self.apply_update(body, convert_to_upsert).await,
            OpType::Delete => {
                self.store
                    .delete(&body.ns, &body.doc, !body.multi)
                    .await?;
                Ok(true)
            }
            OpType::Command => {
                self.dispatcher.run_command(&body.ns, &body.doc).await?;
                Ok(true)
            }
            OpType::ApplyOps => self.apply_nested(body, from_remote).await,
            OpType::Noop => Ok(true),
        }
    }

    /// Inserts replay as upserts: a target that already exists is matched,
    /// not duplicated.
    async fn apply_insert(&self, body: &LogOp) -> Result<bool> {
        match body.doc_id() {
            Some(id) => {
                let mut matcher = Document::new();
                matcher.insert("_id".to_string(), id.clone());
                self.store.upsert(&body.ns, &matcher, &body.doc, true).await?;
            }
            None => {
                // No _id: match on the full document. This scans.
                let start = Instant::now();
                self.store.upsert(&body.ns, &body.doc, &body.doc, true).await?;
                if start.elapsed() >= self.slow_warn {
                    tracing::warn!(ns = %body.ns, "slow replicated insert (no _id field)");
                }
            }
        }
        Ok(true)
    }

    async fn apply_update(&self, body: &LogOp, convert_to_upsert: bool) -> Result<bool> {
        let criteria = body
            .criteria
            .as_ref()
            .ok_or_else(|| Error::Protocol("update entry without criteria".into()))?;
        let upsert = body.upsert || convert_to_upsert;

        let result = self
            .store
            .upsert(&body.ns, criteria, &body.doc, upsert)
            .await?;

        // an upsert that inserted counts as an effect; only a zero-match
        // that changed nothing needs classifying
        if result.matched == 0 && !result.upserted {
            if result.used_modifier {
                if criteria.len() == 1 {
                    // simple single-identifier criteria: the target is
                    // genuinely missing
                    tracing::warn!(ns = %body.ns, ?criteria, "replication failed to apply update");
                    return Ok(false);
                }
                // Compound criteria: the zero-match is presumed to be a
                // duplicate replay already satisfied by an earlier
                // application. The single-field/compound split is a
                // compatibility surface.
                tracing::debug!(ns = %body.ns, "zero-match compound update treated as benign replay");
                return Ok(true);
            }
            if !upsert {
                tracing::warn!(ns = %body.ns, "replication update of non-mod failed");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Apply a nested batch. One nested failure does not stop the rest;
    /// the batch reports failure if any nested op failed.
    async fn apply_nested(&self, body: &LogOp, from_remote: bool) -> Result<bool> {
        let ops = body
            .doc
            .get("ops")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::Protocol("applyOps without ops array".into()))?;

        let mut failures = 0usize;
        for raw in ops {
            let nested = match raw {
                serde_json::Value::Object(m) => LogOp::from_document(m.clone())?,
                other => {
                    return Err(Error::Protocol(format!(
                        "applyOps element is not an object: {}",
                        other
                    )))
                }
            };
            let ok = Box::pin(self.apply_body(&nested, from_remote, false)).await?;
            if !ok {
                failures += 1;
            }
        }

        if failures > 0 {
            tracing::warn!(failures, total = ops.len(), "applyOps batch had failures");
        }
        Ok(failures == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RecordingDispatcher;
    use crate::oplog::entry::OpPosition;
    use crate::storage::MemoryStore;
    use chrono::Utc;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        match v {
            serde_json::Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        dispatcher: Arc<RecordingDispatcher>,
        engine: ApplyEngine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let engine = ApplyEngine::new(
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            Arc::clone(&dispatcher) as Arc<dyn CommandDispatcher>,
            Arc::new(ApplyCounters::default()),
            Duration::from_millis(2),
        );
        Fixture {
            store,
            dispatcher,
            engine,
        }
    }

    fn entry(id: u64, body: LogOp) -> LogEntry {
        LogEntry {
            id: OpPosition(id),
            timestamp: Utc::now(),
            hash: 0,
            writer: 0,
            body,
        }
    }

    fn insert(ns: &str, payload: serde_json::Value) -> LogOp {
        LogOp {
            op: OpType::Insert,
            ns: ns.into(),
            doc: doc(payload),
            criteria: None,
            upsert: false,
            multi: false,
        }
    }

    fn update(
        ns: &str,
        criteria: serde_json::Value,
        spec: serde_json::Value,
        upsert: bool,
    ) -> LogOp {
        LogOp {
            op: OpType::Update,
            ns: ns.into(),
            doc: doc(spec),
            criteria: Some(doc(criteria)),
            upsert,
            multi: false,
        }
    }

    #[tokio::test]
    async fn test_insert_replay_is_idempotent() {
        let f = fixture();
        let e = entry(5, insert("t", json!({"_id": "x", "v": 1})));

        let once = f.engine.apply(&e, true, true).await.unwrap();
        assert!(once.applied);
        assert_eq!(f.store.count("t").await, 1);

        let twice = f.engine.apply(&e, true, true).await.unwrap();
        assert!(twice.applied);
        assert_eq!(f.store.count("t").await, 1);

        let found = f
            .store
            .find_one("t", &doc(json!({"_id": "x"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.get("v"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_insert_without_id_matches_full_document() {
        let f = fixture();
        let e = entry(1, insert("t", json!({"k": "v"})));

        f.engine.apply(&e, true, true).await.unwrap();
        f.engine.apply(&e, true, true).await.unwrap();
        assert_eq!(f.store.count("t").await, 1);
    }

    #[tokio::test]
    async fn test_update_single_field_zero_match_fails() {
        let f = fixture();
        let e = entry(
            2,
            update("t", json!({"_id": "missing"}), json!({"$set": {"a": 1}}), false),
        );

        let outcome = f.engine.apply(&e, true, false).await.unwrap();
        assert!(!outcome.applied);
    }

    #[tokio::test]
    async fn test_update_upsert_insert_is_applied() {
        let f = fixture();
        // replay paths convert updates to upserts; a zero-match that
        // inserts its target converged and is not a failure
        let e = entry(
            2,
            update("t", json!({"_id": "missing"}), json!({"$set": {"a": 1}}), false),
        );

        let outcome = f.engine.apply(&e, true, true).await.unwrap();
        assert!(outcome.applied);
        assert_eq!(f.store.count("t").await, 1);

        let found = f
            .store
            .find_one("t", &doc(json!({"_id": "missing"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.get("a"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_update_replay_is_idempotent() {
        let f = fixture();
        f.engine
            .apply(&entry(1, insert("t", json!({"_id": "x", "v": 1}))), true, true)
            .await
            .unwrap();
        let e = entry(
            2,
            update("t", json!({"_id": "x"}), json!({"$set": {"v": 2}}), false),
        );

        let once = f.engine.apply(&e, true, true).await.unwrap();
        assert!(once.applied);
        let twice = f.engine.apply(&e, true, true).await.unwrap();
        assert!(twice.applied);

        assert_eq!(f.store.count("t").await, 1);
        let found = f
            .store
            .find_one("t", &doc(json!({"_id": "x"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.get("v"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_update_compound_zero_match_is_benign() {
        let f = fixture();
        // prior replay already satisfied the update: compound criteria no
        // longer matches, which must not count as a failure
        let e = entry(
            3,
            update("t", json!({"a": 1, "b": 2}), json!({"$set": {"a": 9}}), false),
        );

        let outcome = f.engine.apply(&e, true, false).await.unwrap();
        assert!(outcome.applied);
    }

    #[tokio::test]
    async fn test_update_non_modifier_zero_match() {
        let f = fixture();
        let e = entry(
            4,
            update("t", json!({"_id": 7}), json!({"_id": 7, "v": 2}), false),
        );

        // plain update, no upsert: the target is presumably missing
        let outcome = f.engine.apply(&e, true, false).await.unwrap();
        assert!(!outcome.applied);

        // with upsert conversion the replay converges instead
        let outcome = f.engine.apply(&e, true, true).await.unwrap();
        assert!(outcome.applied);
        assert_eq!(f.store.count("t").await, 1);
    }

    #[tokio::test]
    async fn test_delete_absent_target_is_not_an_error() {
        let f = fixture();
        let e = entry(
            5,
            LogOp {
                op: OpType::Delete,
                ns: "t".into(),
                doc: doc(json!({"_id": "gone"})),
                criteria: None,
                upsert: false,
                multi: false,
            },
        );

        let outcome = f.engine.apply(&e, true, true).await.unwrap();
        assert!(outcome.applied);
    }

    #[tokio::test]
    async fn test_delete_replay_is_idempotent() {
        let f = fixture();
        f.engine
            .apply(&entry(1, insert("t", json!({"_id": "x"}))), true, true)
            .await
            .unwrap();
        let e = entry(
            2,
            LogOp {
                op: OpType::Delete,
                ns: "t".into(),
                doc: doc(json!({"_id": "x"})),
                criteria: None,
                upsert: false,
                multi: false,
            },
        );

        let once = f.engine.apply(&e, true, true).await.unwrap();
        assert!(once.applied);
        assert_eq!(f.store.count("t").await, 0);

        // the second replay finds nothing to delete and still converges
        let twice = f.engine.apply(&e, true, true).await.unwrap();
        assert!(twice.applied);
        assert_eq!(f.store.count("t").await, 0);
    }

    #[tokio::test]
    async fn test_delete_multi() {
        let f = fixture();
        for i in 0..3 {
            let e = entry(i + 1, insert("t", json!({"_id": i, "k": "v"})));
            f.engine.apply(&e, false, false).await.unwrap();
        }

        let e = entry(
            9,
            LogOp {
                op: OpType::Delete,
                ns: "t".into(),
                doc: doc(json!({"k": "v"})),
                criteria: None,
                upsert: false,
                multi: true,
            },
        );
        f.engine.apply(&e, true, true).await.unwrap();
        assert_eq!(f.store.count("t").await, 0);
    }

    #[tokio::test]
    async fn test_command_reenters_dispatcher() {
        let f = fixture();
        let e = entry(
            6,
            LogOp {
                op: OpType::Command,
                ns: "admin.$cmd".into(),
                doc: doc(json!({"collMod": "t"})),
                criteria: None,
                upsert: false,
                multi: false,
            },
        );

        f.engine.apply(&e, true, false).await.unwrap();
        let seen = f.dispatcher.commands().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "admin.$cmd");
    }

    #[tokio::test]
    async fn test_apply_ops_nested_batch() {
        let f = fixture();
        let e = entry(
            7,
            LogOp {
                op: OpType::ApplyOps,
                ns: "t.$cmd".into(),
                doc: doc(json!({"ops": [
                    {"op": "insert", "ns": "t", "doc": {"_id": 1}},
                    {"op": "insert", "ns": "t", "doc": {"_id": 2}},
                    {"op": "update", "ns": "t", "criteria": {"_id": "nope"},
                     "doc": {"$set": {"x": 1}}}
                ]})),
                criteria: None,
                upsert: false,
                multi: false,
            },
        );

        // one nested failure: batch reports failed but the rest applied
        let outcome = f.engine.apply(&e, false, false).await.unwrap();
        assert!(!outcome.applied);
        assert_eq!(f.store.count("t").await, 2);
    }

    #[tokio::test]
    async fn test_unknown_op_type_halts_stream() {
        let f = fixture();
        let err = f
            .engine
            .apply_raw(doc(json!({"id": 1, "op": "z", "ns": "t"})), true, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.is_fatal_to_stream());
    }

    #[tokio::test]
    async fn test_noop_always_succeeds() {
        let f = fixture();
        let e = entry(
            8,
            LogOp {
                op: OpType::Noop,
                ns: "".into(),
                doc: Document::new(),
                criteria: None,
                upsert: false,
                multi: false,
            },
        );
        assert!(f.engine.apply(&e, true, false).await.unwrap().applied);
    }

    #[tokio::test]
    async fn test_counters_split_by_origin() {
        let f = fixture();
        let local = entry(1, insert("t", json!({"_id": 1})));
        let remote = entry(2, insert("t", json!({"_id": 2})));

        f.engine.apply(&local, false, false).await.unwrap();
        f.engine.apply(&remote, true, false).await.unwrap();
        f.engine.apply(&remote, true, false).await.unwrap();

        let counters = f.engine.counters();
        assert_eq!(counters.local.get(OpType::Insert), 1);
        assert_eq!(counters.remote.get(OpType::Insert), 2);
    }
}
