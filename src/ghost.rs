//! Ghost Sync Tracker
//!
//! Position relay for chained secondaries. When a downstream replica
//! syncs through this node instead of directly from the upstream source,
//! its progress still has to become visible upstream. Each downstream
//! replica gets a ghost cursor on this node's own upstream; advancing
//! that cursor as the replica acknowledges positions is what carries the
//! progress up the chain.
//!
//! The registry is bounded: past capacity the least-recently-updated
//! replica is evicted and will re-register on its next handshake.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::GhostConfig;
use crate::error::Result;
use crate::member::Membership;
use crate::oplog::entry::OpPosition;
use crate::remote::{OplogTail, TailFactory};
use crate::sync::SyncCoordinator;

/// Bounded wait per ghost cursor read; percolation is opportunistic and
/// never blocks a handshake for long
const PERCOLATE_WAIT: Duration = Duration::from_millis(10);

struct GhostSlave {
    /// Resolved member identity; `None` until association succeeds
    member_id: Option<u32>,
    /// Highest position the replica has acknowledged
    last_acked: OpPosition,
    /// Ghost cursor on this node's upstream, opened lazily
    tail: Option<Box<dyn OplogTail + Send>>,
}

struct GhostHandle {
    touched: StdMutex<Instant>,
    slave: Mutex<GhostSlave>,
}

impl GhostHandle {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            touched: StdMutex::new(Instant::now()),
            slave: Mutex::new(GhostSlave {
                member_id: None,
                last_acked: OpPosition::ZERO,
                tail: None,
            }),
        })
    }

    fn touch(&self) {
        *self.touched.lock().expect("ghost touch lock poisoned") = Instant::now();
    }

    fn touched_at(&self) -> Instant {
        *self.touched.lock().expect("ghost touch lock poisoned")
    }
}

/// Registry of downstream replicas chaining through this node
pub struct GhostRegistry {
    membership: Arc<dyn Membership>,
    coordinator: Arc<SyncCoordinator>,
    factory: Arc<dyn TailFactory>,
    oplog_ns: String,
    config: GhostConfig,
    slaves: RwLock<HashMap<Uuid, Arc<GhostHandle>>>,
}

impl GhostRegistry {
    pub fn new(
        membership: Arc<dyn Membership>,
        coordinator: Arc<SyncCoordinator>,
        factory: Arc<dyn TailFactory>,
        oplog_ns: String,
        config: GhostConfig,
    ) -> Self {
        Self {
            membership,
            coordinator,
            factory,
            oplog_ns,
            config,
            slaves: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.slaves.read().expect("ghost registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register (or re-register) a downstream replica and try to resolve
    /// its member identity. A failed resolution leaves the entry
    /// unassociated; a later call retries against the then-current
    /// membership.
    pub async fn associate(&self, replica: Uuid, member_id: u32) {
        let handle = self.handle_for(replica);
        let mut slave = handle.slave.lock().await;

        match self.membership.resolve_member(member_id) {
            Some(member) => {
                if slave.member_id != Some(member_id) {
                    tracing::info!(%replica, member = member_id, host = %member.host,
                        "associated chained replica");
                }
                slave.member_id = Some(member_id);
            }
            None => {
                tracing::warn!(%replica, member = member_id,
                    "cannot associate chained replica: member not found");
            }
        }
        handle.touch();
    }

    /// Record the replica's acknowledged position. Unknown or
    /// unassociated replicas are logged and ignored; stale positions
    /// never regress the record.
    pub async fn update_position(&self, replica: Uuid, position: OpPosition) {
        let Some(handle) = self.lookup(replica) else {
            tracing::warn!(%replica, "position update for unknown replica");
            return;
        };
        let mut slave = handle.slave.lock().await;
        if slave.member_id.is_none() {
            tracing::warn!(%replica, "position update for unassociated replica");
            return;
        }
        if position > slave.last_acked {
            slave.last_acked = position;
        }
        handle.touch();
    }

    /// Forward the replica's progress upstream by advancing its ghost
    /// cursor until it reaches `target`. Retryable conditions (no
    /// upstream, primary role, unreachable source, transient read fault)
    /// return `Ok` and leave the next call to make progress.
    pub async fn percolate(&self, replica: Uuid, target: OpPosition) -> Result<()> {
        let Some(handle) = self.lookup(replica) else {
            tracing::warn!(%replica, "percolate for unknown replica");
            return Ok(());
        };
        let mut slave = handle.slave.lock().await;
        let Some(member_id) = slave.member_id else {
            tracing::warn!(%replica, "percolate for unassociated replica");
            return Ok(());
        };
        if target <= slave.last_acked {
            return Ok(());
        }

        // a primary is the root of the chain; there is nowhere to forward
        if self.coordinator.state().await.is_primary() {
            return Ok(());
        }
        let Some(upstream) = self.coordinator.current_source().await else {
            return Ok(());
        };
        if self
            .membership
            .member_by_host(&upstream)
            .map(|m| m.id)
            == Some(member_id)
        {
            tracing::warn!(%replica, upstream, "replication loop: upstream is the tracked replica");
            return Ok(());
        }

        if slave.tail.as_ref().map_or(true, |t| !t.has_cursor()) {
            let mut tail = self.factory.new_tail();
            match tail.connect(&upstream).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(%replica, upstream, "ghost cursor: upstream unreachable");
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(%replica, error = %e, "ghost cursor connect fault");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
            if let Err(e) = tail.tail_from(&self.oplog_ns, slave.last_acked.next()).await {
                if e.is_transient() {
                    return Ok(());
                }
                return Err(e);
            }
            slave.tail = Some(tail);
        }
        let Some(mut tail) = slave.tail.take() else {
            return Ok(());
        };

        let mut reached = slave.last_acked;
        let mut keep_cursor = true;
        loop {
            match tail.next_entry(PERCOLATE_WAIT).await {
                Ok(Some(entry)) => {
                    reached = entry.id;
                    if entry.id >= target {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) if e.is_transient() => {
                    tracing::warn!(%replica, error = %e, "ghost cursor read fault; resetting");
                    keep_cursor = false;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        if keep_cursor {
            slave.tail = Some(tail);
        }

        if reached > slave.last_acked {
            tracing::trace!(%replica, position = %reached, "percolated replica progress");
            slave.last_acked = reached;
        }
        handle.touch();
        Ok(())
    }

    /// Drop a replica's tracking state (disconnect / resync handshake)
    pub fn forget(&self, replica: Uuid) {
        self.slaves
            .write()
            .expect("ghost registry poisoned")
            .remove(&replica);
    }

    /// The replica's last acknowledged position, if tracked
    pub async fn last_acked(&self, replica: Uuid) -> Option<OpPosition> {
        let handle = self.lookup(replica)?;
        let slave = handle.slave.lock().await;
        Some(slave.last_acked)
    }

    fn lookup(&self, replica: Uuid) -> Option<Arc<GhostHandle>> {
        self.slaves
            .read()
            .expect("ghost registry poisoned")
            .get(&replica)
            .cloned()
    }

    fn handle_for(&self, replica: Uuid) -> Arc<GhostHandle> {
        if let Some(handle) = self.lookup(replica) {
            return handle;
        }

        let mut slaves = self.slaves.write().expect("ghost registry poisoned");
        if let Some(handle) = slaves.get(&replica) {
            return Arc::clone(handle);
        }

        if slaves.len() >= self.config.capacity {
            let oldest = slaves
                .iter()
                .min_by_key(|(_, h)| h.touched_at())
                .map(|(id, _)| *id);
            if let Some(evicted) = oldest {
                slaves.remove(&evicted);
                tracing::warn!(replica = %evicted, capacity = self.config.capacity,
                    "ghost registry full; evicting least-recently-updated replica");
            }
        }

        let handle = GhostHandle::new();
        slaves.insert(replica, Arc::clone(&handle));
        if slaves.len() > self.config.warn_threshold {
            tracing::warn!(tracked = slaves.len(), "large number of chained replicas tracked");
        }
        handle
    }
}
