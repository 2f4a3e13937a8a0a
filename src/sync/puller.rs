//! Pull Loop
//!
//! Continuously tails the current sync source's oplog and replays
//! entries through the apply engine. Transient source faults reset the
//! cursor and retry with jittered backoff; a broken hash chain or a
//! protocol violation is fatal and halts replication. Per-entry apply
//! failures are tallied and the stream continues.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::apply::ApplyEngine;
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::member::Membership;
use crate::oplog::entry::{verify_link, OpPosition, OplogRecord};
use crate::oplog::OplogWriter;
use crate::remote::{OplogTail, TailFactory};
use crate::sync::SyncCoordinator;

/// The pull/apply loop for one node
pub struct Puller {
    coordinator: Arc<SyncCoordinator>,
    membership: Arc<dyn Membership>,
    engine: Arc<ApplyEngine>,
    writer: Arc<OplogWriter>,
    factory: Arc<dyn TailFactory>,
    config: SyncConfig,
    /// Entries that failed to apply (recorded, not fatal)
    failed_ops: AtomicU64,
}

impl Puller {
    pub fn new(
        coordinator: Arc<SyncCoordinator>,
        membership: Arc<dyn Membership>,
        engine: Arc<ApplyEngine>,
        writer: Arc<OplogWriter>,
        factory: Arc<dyn TailFactory>,
        config: SyncConfig,
    ) -> Self {
        Self {
            coordinator,
            membership,
            engine,
            writer,
            factory,
            config,
            failed_ops: AtomicU64::new(0),
        }
    }

    pub fn failed_ops(&self) -> u64 {
        self.failed_ops.load(Ordering::Relaxed)
    }

    /// Run until the gate closes for good or a fatal fault occurs.
    /// The gate is observed at entry boundaries only; an entry mid-apply
    /// always completes.
    pub async fn run(&self) -> Result<()> {
        let mut gate = self.coordinator.subscribe_gate();
        let mut tail: Option<Box<dyn OplogTail + Send>> = None;
        // hash of the predecessor of the next expected entry; None when no
        // predecessor is known to verify against
        let mut prev_hash: Option<i64> = None;

        loop {
            if !*gate.borrow() {
                tail = None;
                prev_hash = None;
                if gate.changed().await.is_err() {
                    return Ok(());
                }
                continue;
            }

            let Some(source) = self.coordinator.current_source().await else {
                self.backoff().await;
                continue;
            };
            if self.membership.member_by_host(&source).is_none() {
                tracing::warn!(source, "sync source is not a known member; waiting");
                self.backoff().await;
                continue;
            }

            if tail.as_ref().map_or(true, |t| !t.has_cursor()) {
                let mut fresh = self.factory.new_tail();
                let connected = match fresh.connect(&source).await {
                    Ok(c) => c,
                    Err(e) if e.is_transient() => {
                        self.backoff().await;
                        continue;
                    }
                    Err(e) => return self.fail(e).await,
                };
                if !connected {
                    tracing::warn!(source, "sync source unreachable; retrying");
                    self.backoff().await;
                    continue;
                }

                let resume_at = self.coordinator.last_applied().await;
                match fresh
                    .tail_from(self.writer.oplog_ns(), resume_at.next())
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_transient() => {
                        self.backoff().await;
                        continue;
                    }
                    Err(e) => return self.fail(e).await,
                }
                // seed verification from the local log; when recorded
                // entries ran ahead of apply the predecessor hash comes
                // off the recorded entry, not the chain head
                prev_hash = match self.resume_hash(resume_at).await {
                    Ok(hash) => hash,
                    Err(e) => return self.fail(e).await,
                };
                tracing::info!(source, resume_from = %resume_at.next(), "tailing sync source");
                tail = Some(fresh);
            }
            let Some(cursor) = tail.as_mut() else {
                continue;
            };

            let wait = Duration::from_millis(self.config.pull_wait_ms);
            match cursor.next_entry(wait).await {
                Ok(Some(entry)) => {
                    let last = self.coordinator.last_applied().await;
                    if entry.id <= last {
                        // already applied; keep the chain position current
                        tracing::debug!(id = %entry.id, "skipping duplicate entry");
                        prev_hash = Some(entry.hash);
                        continue;
                    }

                    // entries relayed through an intermediate secondary
                    // carry their original writer; verify against that,
                    // not against whichever hop delivered them
                    if let Some(ph) = prev_hash {
                        if let Err(e) = verify_link(ph, &entry) {
                            tracing::error!(id = %entry.id, source, "oplog hash chain broken");
                            return self.fail(e).await;
                        }
                    }
                    prev_hash = Some(entry.hash);

                    // persist into the local log first, so this node can
                    // serve its own chained secondaries
                    let record = OplogRecord {
                        id: entry.id,
                        timestamp: entry.timestamp,
                        hash: entry.hash,
                        writer: entry.writer,
                        ops: vec![entry.body.clone()],
                    };
                    if let Err(e) = self.writer.record(record).await {
                        return self.fail(e).await;
                    }

                    match self.engine.apply(&entry, true, true).await {
                        Ok(outcome) => {
                            if !outcome.applied {
                                self.failed_ops.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(id = %entry.id, "entry failed to apply; continuing");
                            }
                            self.coordinator.note_applied(entry.id).await;
                            if let Err(e) = self.writer.advance_unapplied(entry.id.next()).await {
                                return self.fail(e).await;
                            }
                        }
                        Err(e) if e.is_transient() => {
                            if let Some(t) = tail.as_mut() {
                                t.reset();
                            }
                            self.backoff().await;
                        }
                        Err(e) => return self.fail(e).await,
                    }
                }
                Ok(None) => {
                    // caught up; a recovering node can promote now
                    self.coordinator.try_promote().await;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(source, error = %e, "transient source fault; resetting cursor");
                    if let Some(t) = tail.as_mut() {
                        t.reset();
                    }
                    self.backoff().await;
                }
                Err(e) => return self.fail(e).await,
            }
        }
    }

    /// Hash of the local record at `position`, which the next pulled
    /// entry must verify its link against. The chain head moves past
    /// `position` when a record lands but its apply is still pending, so
    /// the hash is read back from the record store then. `None` only
    /// when the local log no longer holds the record.
    async fn resume_hash(&self, position: OpPosition) -> Result<Option<i64>> {
        if position == OpPosition::ZERO {
            return Ok(Some(0));
        }
        if let Some((head, hash)) = self.writer.chain_state().await {
            if head == position {
                return Ok(Some(hash));
            }
        }
        Ok(self
            .writer
            .records_from(position)
            .await?
            .first()
            .filter(|r| r.id == position)
            .map(|r| r.hash))
    }

    async fn fail(&self, error: Error) -> Result<()> {
        self.coordinator.set_fatal(&error.to_string()).await;
        Err(error)
    }

    async fn backoff(&self) {
        let base = self.config.retry_backoff_ms;
        let jitter = rand::thread_rng().gen_range(0..=base / 2 + 1);
        tokio::time::sleep(Duration::from_millis(base + jitter)).await;
    }
}
