//! Sync Coordinator
//!
//! Owns the node's replication role and sync source. All transitions
//! serialize through one state lock, shared between operator calls and
//! heartbeat-driven updates; the pull loop is gated through a watch
//! channel so it observes stops at entry boundaries.

use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::member::Membership;
use crate::oplog::entry::OpPosition;
use crate::sync::NodeState;

struct CoordInner {
    state: NodeState,
    blocked: bool,
    maintenance: u32,
    /// Operator-forced source; always wins over the heartbeat choice
    forced_source: Option<String>,
    /// Source chosen by heartbeat logic
    chosen_source: Option<String>,
    /// Source's last known position, from heartbeats
    source_position: OpPosition,
}

/// Role state machine and sync-source registry for one node
pub struct SyncCoordinator {
    self_name: String,
    config: SyncConfig,
    membership: Arc<dyn Membership>,
    inner: Mutex<CoordInner>,
    gate: watch::Sender<bool>,
    last_applied: RwLock<OpPosition>,
}

impl SyncCoordinator {
    pub fn new(self_name: String, membership: Arc<dyn Membership>, config: SyncConfig) -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            self_name,
            config,
            membership,
            inner: Mutex::new(CoordInner {
                state: NodeState::Initial,
                blocked: false,
                maintenance: 0,
                forced_source: None,
                chosen_source: None,
                source_position: OpPosition::ZERO,
            }),
            gate,
            last_applied: RwLock::new(OpPosition::ZERO),
        }
    }

    pub async fn state(&self) -> NodeState {
        self.inner.lock().await.state
    }

    pub async fn is_blocked(&self) -> bool {
        self.inner.lock().await.blocked
    }

    pub async fn in_maintenance(&self) -> bool {
        self.inner.lock().await.maintenance > 0
    }

    /// Enter recovery from the initial state
    pub async fn begin_recovery(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == NodeState::Initial {
            inner.state = NodeState::Recovering;
        }
    }

    /// Attempt the recovering -> secondary transition. A no-op unless the
    /// state is exactly `Recovering`, unblocked, out of maintenance, and
    /// caught up to the source's position at this moment.
    pub async fn try_promote(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state != NodeState::Recovering {
            return false;
        }
        if inner.blocked || inner.maintenance > 0 {
            return false;
        }
        let applied = *self.last_applied.read().await;
        if applied < inner.source_position {
            tracing::debug!(
                %applied,
                source = %inner.source_position,
                "not promoting: still behind sync source"
            );
            return false;
        }

        inner.state = NodeState::Secondary;
        self.gate.send_replace(true);
        tracing::info!("transitioning to SECONDARY");
        true
    }

    /// Block or unblock sync. Blocking stops the pull loop (observed at
    /// the next entry boundary) and forces recovering; unblocking
    /// re-attempts promotion.
    pub async fn set_blocked(&self, block: bool) {
        {
            let mut inner = self.inner.lock().await;
            if block && !inner.blocked {
                self.gate.send_replace(false);
                if inner.state == NodeState::Secondary {
                    inner.state = NodeState::Recovering;
                }
            }
            inner.blocked = block;
        }
        if !block {
            self.try_promote().await;
        }
    }

    /// Enter or leave maintenance. Depth-counted; behaves like blocking
    /// while the depth is nonzero.
    pub async fn set_maintenance(&self, enter: bool) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if enter {
                inner.maintenance += 1;
                if inner.maintenance == 1 {
                    self.gate.send_replace(false);
                    if inner.state == NodeState::Secondary {
                        inner.state = NodeState::Recovering;
                    }
                }
            } else {
                if inner.maintenance == 0 {
                    return Err(Error::State("not in maintenance mode".into()));
                }
                inner.maintenance -= 1;
            }
            if inner.maintenance > 0 || enter {
                return Ok(());
            }
        }
        self.try_promote().await;
        Ok(())
    }

    /// Record an unrecoverable replication fault. Terminal.
    pub async fn set_fatal(&self, reason: &str) {
        let mut inner = self.inner.lock().await;
        tracing::error!(reason, "replication entering FATAL state");
        inner.state = NodeState::Fatal;
        self.gate.send_replace(false);
    }

    /// Become primary (decided by election logic outside this crate).
    /// Primaries do not pull.
    pub async fn force_primary(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == NodeState::Fatal {
            return;
        }
        inner.state = NodeState::Primary;
        self.gate.send_replace(false);
    }

    /// Heartbeat-driven source selection and position report
    pub async fn note_source(&self, host: &str, position: OpPosition) {
        let mut inner = self.inner.lock().await;
        inner.chosen_source = Some(host.to_string());
        if position > inner.source_position {
            inner.source_position = position;
        }
    }

    /// The source the pull loop should use right now. An operator-forced
    /// source always wins.
    pub async fn current_source(&self) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.forced_source.clone().or_else(|| inner.chosen_source.clone())
    }

    /// Force a sync source. Rejects invalid choices synchronously with a
    /// reason and no state change; warns about (but honors) a source that
    /// lags the known maximum position. Returns the previous source for
    /// observability.
    pub async fn choose_sync_source(&self, host: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;

        if let Some(me) = self.membership.member_by_host(&self.self_name) {
            if me.arbiter_only {
                return Err(Error::Config("arbiters don't sync".into()));
            }
        }
        if inner.state == NodeState::Primary {
            return Err(Error::Config("primaries don't sync".into()));
        }
        if host == self.self_name {
            return Err(Error::Config("I cannot sync from myself".into()));
        }

        let target = self
            .membership
            .member_by_host(host)
            .ok_or_else(|| Error::Config("could not find member in replica set".into()))?;

        if target.arbiter_only {
            return Err(Error::Config("I cannot sync from an arbiter".into()));
        }
        let my_builds_indexes = self
            .membership
            .member_by_host(&self.self_name)
            .map(|m| m.builds_indexes)
            .unwrap_or(true);
        if !target.builds_indexes && my_builds_indexes {
            return Err(Error::Config(
                "I cannot sync from a member who does not build indexes".into(),
            ));
        }
        if !target.auth_ok {
            return Err(Error::Config(
                "I cannot authenticate against the requested member".into(),
            ));
        }
        if !target.healthy {
            return Err(Error::Config("I cannot reach the requested member".into()));
        }

        let max_known = self.membership.max_known_position();
        if target.last_position.get() + self.config.source_lag_warn < max_known.get() {
            // explicit operator override wins over the lag heuristic
            tracing::warn!(
                source = host,
                source_position = %target.last_position,
                %max_known,
                "requested sync source is far behind; honoring anyway"
            );
        }

        let previous = inner.forced_source.clone().or_else(|| inner.chosen_source.clone());
        inner.forced_source = Some(host.to_string());
        tracing::info!(source = host, "sync source forced");
        Ok(previous)
    }

    /// Pull-loop gate: `true` while the apply path should run
    pub fn subscribe_gate(&self) -> watch::Receiver<bool> {
        self.gate.subscribe()
    }

    pub async fn last_applied(&self) -> OpPosition {
        *self.last_applied.read().await
    }

    pub async fn note_applied(&self, position: OpPosition) {
        let mut applied = self.last_applied.write().await;
        if position > *applied {
            *applied = position;
        }
    }
}
