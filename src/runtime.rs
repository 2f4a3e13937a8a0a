//! Replication Runtime
//!
//! Explicit owner of the replication components for one node: the oplog
//! writer, apply engine, sync coordinator, pull loop, and ghost registry
//! share their collaborators through this struct instead of module-level
//! cached handles. `init` brings the write path up; `reset` drops cached
//! state on a database-close event; `resync` rebuilds the log from
//! scratch.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::apply::{ApplyCounters, ApplyEngine};
use crate::command::CommandDispatcher;
use crate::config::DocReplConfig;
use crate::error::Result;
use crate::ghost::GhostRegistry;
use crate::member::Membership;
use crate::oplog::{Checkpoint, OplogWriter};
use crate::oplog::entry::OpPosition;
use crate::remote::TailFactory;
use crate::storage::{DocumentStore, LogStore};
use crate::sync::{NodeState, Puller, SyncCoordinator};

/// Snapshot of the node's replication status
#[derive(Debug, Clone, Serialize)]
pub struct ReplStatus {
    pub state: NodeState,
    pub blocked: bool,
    pub maintenance: bool,
    pub last_applied: OpPosition,
    pub checkpoint: Checkpoint,
    pub sync_source: Option<String>,
    pub failed_ops: u64,
    pub tracked_replicas: usize,
}

/// The replication core for one node
pub struct ReplRuntime {
    config: DocReplConfig,
    writer: Arc<OplogWriter>,
    engine: Arc<ApplyEngine>,
    coordinator: Arc<SyncCoordinator>,
    puller: Arc<Puller>,
    ghosts: Arc<GhostRegistry>,
    counters: Arc<ApplyCounters>,
}

impl ReplRuntime {
    pub fn new(
        config: DocReplConfig,
        log_store: Arc<dyn LogStore>,
        doc_store: Arc<dyn DocumentStore>,
        dispatcher: Arc<dyn CommandDispatcher>,
        membership: Arc<dyn Membership>,
        factory: Arc<dyn TailFactory>,
    ) -> Self {
        let writer = Arc::new(OplogWriter::new(
            log_store,
            config.oplog.oplog_ns.clone(),
            config.oplog.replinfo_ns.clone(),
        ));
        let counters = Arc::new(ApplyCounters::default());
        let engine = Arc::new(ApplyEngine::new(
            doc_store,
            dispatcher,
            Arc::clone(&counters),
            Duration::from_millis(config.oplog.slow_apply_warn_ms),
        ));
        let coordinator = Arc::new(SyncCoordinator::new(
            config.node.name.clone(),
            Arc::clone(&membership),
            config.sync.clone(),
        ));
        let puller = Arc::new(Puller::new(
            Arc::clone(&coordinator),
            Arc::clone(&membership),
            Arc::clone(&engine),
            Arc::clone(&writer),
            Arc::clone(&factory),
            config.sync.clone(),
        ));
        let ghosts = Arc::new(GhostRegistry::new(
            membership,
            Arc::clone(&coordinator),
            factory,
            config.oplog.oplog_ns.clone(),
            config.ghost.clone(),
        ));

        Self {
            config,
            writer,
            engine,
            coordinator,
            puller,
            ghosts,
            counters,
        }
    }

    /// Create the oplog stores for a node joining replication for the
    /// first time
    pub async fn create_oplog(&self) -> Result<()> {
        self.writer.create().await
    }

    /// Bring replication up: verify the stores, resume the hash chain,
    /// and enter recovery
    pub async fn init(&self) -> Result<()> {
        self.writer.open().await?;
        self.writer.initialize(self.config.node.writer_id).await?;
        self.coordinator.begin_recovery().await;
        tracing::info!(node = %self.config.node.name, "replication initialized");
        Ok(())
    }

    /// Drop cached write-path state (database-close event). `init` must
    /// run again before the node logs or pulls.
    pub async fn reset(&self) {
        self.writer.reset().await;
        tracing::info!(node = %self.config.node.name, "replication state reset");
    }

    /// Full resynchronization: discard the local log and start a fresh
    /// chain
    pub async fn resync(&self) -> Result<()> {
        self.writer.delete().await?;
        self.writer.create().await?;
        self.writer.initialize(self.config.node.writer_id).await?;
        Ok(())
    }

    /// Run the pull loop on its own task
    pub fn spawn_puller(&self) -> JoinHandle<Result<()>> {
        let puller = Arc::clone(&self.puller);
        tokio::spawn(async move { puller.run().await })
    }

    pub async fn status(&self) -> Result<ReplStatus> {
        Ok(ReplStatus {
            state: self.coordinator.state().await,
            blocked: self.coordinator.is_blocked().await,
            maintenance: self.coordinator.in_maintenance().await,
            last_applied: self.coordinator.last_applied().await,
            checkpoint: self.writer.checkpoint().await?,
            sync_source: self.coordinator.current_source().await,
            failed_ops: self.puller.failed_ops(),
            tracked_replicas: self.ghosts.len(),
        })
    }

    pub fn writer(&self) -> &Arc<OplogWriter> {
        &self.writer
    }

    pub fn engine(&self) -> &Arc<ApplyEngine> {
        &self.engine
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn ghosts(&self) -> &Arc<GhostRegistry> {
        &self.ghosts
    }

    pub fn counters(&self) -> &Arc<ApplyCounters> {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RecordingDispatcher;
    use crate::config::{NodeConfig, SyncConfig};
    use crate::error::Error;
    use crate::member::{MemberRef, StaticMembership};
    use crate::oplog::entry::{Document, HashChain, LogEntry, LogOp, OpType};
    use crate::remote::{ChannelTailFactory, SharedOplog};
    use crate::storage::MemoryStore;
    use chrono::Utc;
    use serde_json::json;

    fn config() -> DocReplConfig {
        DocReplConfig {
            node: NodeConfig {
                writer_id: 3,
                name: "self:27017".into(),
            },
            oplog: Default::default(),
            sync: SyncConfig {
                pull_wait_ms: 5,
                retry_backoff_ms: 10,
                source_lag_warn: 10_000,
            },
            ghost: Default::default(),
            logging: Default::default(),
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        source: Arc<SharedOplog>,
        runtime: ReplRuntime,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let source = SharedOplog::new();
        let membership = Arc::new(StaticMembership::new());
        membership.upsert_member(MemberRef::new(7, "src:27017"));

        let runtime = ReplRuntime::new(
            config(),
            Arc::clone(&store) as Arc<dyn LogStore>,
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            Arc::new(RecordingDispatcher::new()) as Arc<dyn CommandDispatcher>,
            Arc::clone(&membership) as Arc<dyn Membership>,
            Arc::new(ChannelTailFactory::new(Arc::clone(&source))) as Arc<dyn TailFactory>,
        );

        Fixture {
            store,
            source,
            runtime,
        }
    }

    #[tokio::test]
    async fn test_lifecycle_create_init_reset() {
        let f = fixture();

        // init before the stores exist fails loudly
        assert!(matches!(f.runtime.init().await, Err(Error::OplogMissing(_))));

        f.runtime.create_oplog().await.unwrap();
        f.runtime.init().await.unwrap();
        assert_eq!(f.runtime.status().await.unwrap().state, NodeState::Recovering);

        let mut doc = Document::new();
        doc.insert("_id".to_string(), json!(1));
        f.runtime
            .writer()
            .append_op(OpType::Insert, "t", doc.clone(), None)
            .await
            .unwrap();

        // reset drops the write path; appends are rejected until re-init
        f.runtime.reset().await;
        assert!(f
            .runtime
            .writer()
            .append_op(OpType::Insert, "t", doc.clone(), None)
            .await
            .is_err());

        // re-init resumes the chain where it left off
        f.runtime.init().await.unwrap();
        let entry = f
            .runtime
            .writer()
            .append_op(OpType::Insert, "t", doc, None)
            .await
            .unwrap();
        assert_eq!(entry.id, OpPosition(2));
    }

    #[tokio::test]
    async fn test_resync_starts_fresh_chain() {
        let f = fixture();
        f.runtime.create_oplog().await.unwrap();
        f.runtime.init().await.unwrap();

        let mut doc = Document::new();
        doc.insert("_id".to_string(), json!(1));
        f.runtime
            .writer()
            .append_op(OpType::Insert, "t", doc.clone(), None)
            .await
            .unwrap();

        f.runtime.resync().await.unwrap();
        let entry = f
            .runtime
            .writer()
            .append_op(OpType::Insert, "t", doc, None)
            .await
            .unwrap();
        assert_eq!(entry.id, OpPosition(1));
    }

    #[tokio::test]
    async fn test_end_to_end_pull_and_status() {
        let f = fixture();
        f.runtime.create_oplog().await.unwrap();
        f.runtime.init().await.unwrap();

        // entries as the upstream (member 7) would have chained them
        let mut chain = HashChain::new(7);
        for i in 1..=3 {
            let (id, hash) = chain.advance();
            let mut doc = Document::new();
            doc.insert("_id".to_string(), json!(i));
            f.source.push(LogEntry {
                id,
                timestamp: Utc::now(),
                hash,
                writer: 7,
                body: LogOp {
                    op: OpType::Insert,
                    ns: "t".into(),
                    doc,
                    criteria: None,
                    upsert: false,
                    multi: false,
                },
            });
        }

        let coordinator = Arc::clone(f.runtime.coordinator());
        coordinator.note_source("src:27017", OpPosition::ZERO).await;
        assert!(coordinator.try_promote().await);

        let handle = f.runtime.spawn_puller();
        for _ in 0..200 {
            if f.store.count("t").await == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(f.store.count("t").await, 3);

        let status = f.runtime.status().await.unwrap();
        assert_eq!(status.state, NodeState::Secondary);
        assert!(!status.blocked);
        assert!(!status.maintenance);
        assert_eq!(status.last_applied, OpPosition(3));
        assert_eq!(status.checkpoint.min_unapplied, OpPosition(4));
        assert_eq!(status.sync_source, Some("src:27017".into()));
        assert_eq!(status.failed_ops, 0);
        assert_eq!(status.tracked_replicas, 0);
        assert_eq!(
            f.runtime.counters().remote.get(OpType::Insert),
            3
        );

        // pulled entries were persisted into this node's own log
        let records = f
            .runtime
            .writer()
            .records_from(OpPosition(1))
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.writer == 7));

        handle.abort();
    }
}
