//! Oplog Writer
//!
//! Durable append path for locally committed operations. Position and
//! hash assignment happen under one dedicated ordering lock so no two
//! concurrent writers ever interleave ids; the physical store write
//! happens outside it. Also owns the two-record checkpoint store and the
//! log lifecycle (create/open/delete).

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::oplog::entry::{Document, HashChain, LogEntry, LogOp, OpPosition, OplogRecord, OpType};
use crate::storage::LogStore;

/// Checkpoint store key for the discard bound
pub const KEY_MIN_LIVE: &str = "minLive";
/// Checkpoint store key for the replay bound
pub const KEY_MIN_UNAPPLIED: &str = "minUnapplied";

/// Bounds on which entries may be discarded versus must still be applied.
/// `min_live <= min_unapplied` always.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub min_live: OpPosition,
    pub min_unapplied: OpPosition,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            min_live: OpPosition::ZERO,
            min_unapplied: OpPosition::ZERO,
        }
    }
}

/// Write-path phase. Before replication bring-up completes, the writer
/// rejects appends (with a diagnostic) instead of logging garbage under
/// an unestablished chain.
enum LogPhase {
    Uninitialized,
    Active(HashChain),
}

/// Writer for the append-only oplog and the checkpoint store
pub struct OplogWriter {
    store: Arc<dyn LogStore>,
    oplog_ns: String,
    replinfo_ns: String,
    /// The ordering lock. Held only for the counter/hash update.
    phase: Mutex<LogPhase>,
    /// Held across every checkpoint read-validate-write cycle, so the
    /// no-regress guard cannot be interleaved past
    checkpoints: Mutex<()>,
}

impl OplogWriter {
    pub fn new(store: Arc<dyn LogStore>, oplog_ns: String, replinfo_ns: String) -> Self {
        Self {
            store,
            oplog_ns,
            replinfo_ns,
            phase: Mutex::new(LogPhase::Uninitialized),
            checkpoints: Mutex::new(()),
        }
    }

    /// Idempotently verify both stores exist. Missing stores when expected
    /// are an operator error and fail loudly.
    pub async fn open(&self) -> Result<()> {
        if !self.store.store_exists(&self.oplog_ns).await? {
            return Err(Error::OplogMissing(self.oplog_ns.clone()));
        }
        if !self.store.store_exists(&self.replinfo_ns).await? {
            return Err(Error::OplogMissing(self.replinfo_ns.clone()));
        }
        Ok(())
    }

    /// Create both stores, exactly once
    pub async fn create(&self) -> Result<()> {
        if self.store.store_exists(&self.oplog_ns).await? {
            return Err(Error::OplogExists(self.oplog_ns.clone()));
        }
        if self.store.store_exists(&self.replinfo_ns).await? {
            return Err(Error::OplogExists(self.replinfo_ns.clone()));
        }
        tracing::info!(oplog = %self.oplog_ns, replinfo = %self.replinfo_ns, "creating replication oplog stores");
        self.store.create_store(&self.oplog_ns).await?;
        self.store.create_store(&self.replinfo_ns).await?;
        Ok(())
    }

    /// Drop both stores. Used only for full resynchronization.
    pub async fn delete(&self) -> Result<()> {
        tracing::warn!(oplog = %self.oplog_ns, "dropping oplog stores for full resync");
        self.store.drop_store(&self.oplog_ns).await?;
        self.store.drop_store(&self.replinfo_ns).await?;
        *self.phase.lock().await = LogPhase::Uninitialized;
        Ok(())
    }

    /// Bring the write path up: resume the hash chain from the last
    /// persisted entry, or start fresh on an empty log.
    pub async fn initialize(&self, writer_id: i64) -> Result<()> {
        let chain = match self.store.last_record(&self.oplog_ns).await? {
            Some(last) => {
                tracing::info!(position = %last.id, "resuming oplog chain");
                HashChain::resume(writer_id, last.id, last.hash)
            }
            None => HashChain::new(writer_id),
        };
        *self.phase.lock().await = LogPhase::Active(chain);
        Ok(())
    }

    /// Drop cached write-path state (database-close event). Appends are
    /// rejected until `initialize` runs again.
    pub async fn reset(&self) {
        *self.phase.lock().await = LogPhase::Uninitialized;
    }

    /// Append one physical record bundling `ops` under one position.
    /// Fails to the caller if the chain is not established or the store
    /// write fails; an entry is never dropped silently.
    pub async fn append(&self, ops: Vec<LogOp>) -> Result<OplogRecord> {
        let (id, hash, writer) = {
            let mut phase = self.phase.lock().await;
            match &mut *phase {
                LogPhase::Uninitialized => {
                    tracing::error!("oplog append before replication bring-up; rejecting");
                    return Err(Error::Oplog("oplog writer not initialized".into()));
                }
                LogPhase::Active(chain) => {
                    let (id, hash) = chain.advance();
                    (id, hash, chain.writer_id())
                }
            }
        };

        let record = OplogRecord {
            id,
            timestamp: Utc::now(),
            hash,
            writer,
            ops,
        };
        self.store.append_record(&self.oplog_ns, &record).await?;
        Ok(record)
    }

    /// Persist a record pulled from a remote log under the position,
    /// hash, and writer identity it already carries, and align the local
    /// chain with it so later local appends continue the sequence.
    /// Re-recording an already persisted position is a no-op.
    pub async fn record(&self, record: OplogRecord) -> Result<()> {
        {
            let mut phase = self.phase.lock().await;
            match &mut *phase {
                LogPhase::Uninitialized => {
                    return Err(Error::Oplog("oplog writer not initialized".into()));
                }
                LogPhase::Active(chain) => {
                    if record.id <= chain.last_position() {
                        return Ok(());
                    }
                    chain.fast_forward(record.id, record.hash);
                }
            }
        }
        self.store.append_record(&self.oplog_ns, &record).await
    }

    /// Records at or after `from`, in position order. This is the read
    /// surface serving chained secondaries that tail this node's log.
    pub async fn records_from(&self, from: OpPosition) -> Result<Vec<OplogRecord>> {
        self.store.records_from(&self.oplog_ns, from).await
    }

    /// Codec-style convenience: append a single logical operation and
    /// return it as an entry.
    pub async fn append_op(
        &self,
        op: OpType,
        ns: &str,
        doc: Document,
        criteria: Option<Document>,
    ) -> Result<LogEntry> {
        let record = self
            .append(vec![LogOp {
                op,
                ns: ns.to_string(),
                doc,
                criteria,
                upsert: false,
                multi: false,
            }])
            .await?;
        // single-op record always expands to exactly one entry
        Ok(record.entries().remove(0))
    }

    /// Head of the local chain: the last position written or observed and
    /// its hash. `None` before bring-up.
    pub async fn chain_state(&self) -> Option<(OpPosition, i64)> {
        match &*self.phase.lock().await {
            LogPhase::Uninitialized => None,
            LogPhase::Active(chain) => Some((chain.last_position(), chain.last_hash())),
        }
    }

    /// Overwrite the two checkpoint records. `min_live` may never regress
    /// and may never exceed `min_unapplied`.
    pub async fn record_checkpoint(
        &self,
        min_live: OpPosition,
        min_unapplied: OpPosition,
    ) -> Result<()> {
        if min_live > min_unapplied {
            return Err(Error::State(format!(
                "checkpoint minLive {} exceeds minUnapplied {}",
                min_live, min_unapplied
            )));
        }
        let _guard = self.checkpoints.lock().await;
        let current = self.read_checkpoint().await?;
        if min_live < current.min_live {
            return Err(Error::State(format!(
                "checkpoint minLive may not regress: {} < {}",
                min_live, current.min_live
            )));
        }

        self.store
            .put_keyed(&self.replinfo_ns, KEY_MIN_LIVE, &position_doc(min_live))
            .await?;
        self.store
            .put_keyed(
                &self.replinfo_ns,
                KEY_MIN_UNAPPLIED,
                &position_doc(min_unapplied),
            )
            .await?;
        Ok(())
    }

    /// Advance only the replay bound, keeping the current discard bound
    pub async fn advance_unapplied(&self, position: OpPosition) -> Result<()> {
        let _guard = self.checkpoints.lock().await;
        let current = self.read_checkpoint().await?;
        if position <= current.min_unapplied {
            return Ok(());
        }
        self.store
            .put_keyed(&self.replinfo_ns, KEY_MIN_UNAPPLIED, &position_doc(position))
            .await
    }

    /// Read both checkpoint records (ZERO bounds before the first write)
    pub async fn checkpoint(&self) -> Result<Checkpoint> {
        let _guard = self.checkpoints.lock().await;
        self.read_checkpoint().await
    }

    /// Caller holds the checkpoint lock
    async fn read_checkpoint(&self) -> Result<Checkpoint> {
        let min_live = self.read_position(KEY_MIN_LIVE).await?;
        let min_unapplied = self.read_position(KEY_MIN_UNAPPLIED).await?;
        Ok(Checkpoint {
            min_live,
            min_unapplied,
        })
    }

    async fn read_position(&self, key: &str) -> Result<OpPosition> {
        match self.store.get_keyed(&self.replinfo_ns, key).await? {
            Some(doc) => {
                let value = doc.get("position").and_then(|v| v.as_u64()).ok_or_else(|| {
                    Error::State(format!("malformed checkpoint record: {}", key))
                })?;
                Ok(OpPosition(value))
            }
            None => Ok(OpPosition::ZERO),
        }
    }

    pub fn oplog_ns(&self) -> &str {
        &self.oplog_ns
    }
}

fn position_doc(position: OpPosition) -> Document {
    let mut doc = Document::new();
    doc.insert("position".to_string(), serde_json::json!(position.get()));
    doc
}
