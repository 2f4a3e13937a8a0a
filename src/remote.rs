//! Remote Oplog Tailing Interface
//!
//! Transport and connection management live outside this crate; the pull
//! loop and the ghost tracker only need a restartable tailing cursor over
//! a source's oplog. [`ChannelTail`] feeds from an in-process buffer for
//! tests and local loopback.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::oplog::entry::{LogEntry, OpPosition};

/// A tailing cursor over one source's oplog. Infinite while connected;
/// restartable after reconnect via `tail_from`.
#[async_trait]
pub trait OplogTail: Send {
    /// Connect to a source. `false` means unreachable (logged by the
    /// transport); callers retry later.
    async fn connect(&mut self, target: &str) -> Result<bool>;

    /// Position the cursor at the first entry with id >= `position`
    async fn tail_from(&mut self, ns: &str, position: OpPosition) -> Result<()>;

    /// Next entry, waiting at most `wait` for one to arrive.
    /// `Ok(None)` is a liveness tick, not end of stream.
    async fn next_entry(&mut self, wait: Duration) -> Result<Option<LogEntry>>;

    fn has_cursor(&self) -> bool;

    /// Drop the cursor and connection; the next use reconnects
    fn reset(&mut self);
}

/// Opens tails toward this node's current upstream
pub trait TailFactory: Send + Sync {
    fn new_tail(&self) -> Box<dyn OplogTail + Send>;
}

/// Shared in-process oplog buffer that [`ChannelTail`] cursors read from
#[derive(Default)]
pub struct SharedOplog {
    entries: Mutex<Vec<LogEntry>>,
    /// Remaining injected transient faults (tests)
    faults: AtomicUsize,
    /// Whether connect attempts succeed
    reachable: AtomicBool,
}

impl SharedOplog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            faults: AtomicUsize::new(0),
            reachable: AtomicBool::new(true),
        })
    }

    pub fn push(&self, entry: LogEntry) {
        self.entries.lock().expect("oplog buffer poisoned").push(entry);
    }

    /// Swap the stored entry at the same position for `entry`. Lets
    /// tests model a source whose history diverges between cursors.
    pub fn replace(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().expect("oplog buffer poisoned");
        if let Some(slot) = entries.iter_mut().find(|e| e.id == entry.id) {
            *slot = entry;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("oplog buffer poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next `n` reads fail with a transient fault
    pub fn inject_faults(&self, n: usize) {
        self.faults.store(n, Ordering::SeqCst);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn take_fault(&self) -> bool {
        self.faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Tail over a [`SharedOplog`] buffer
pub struct ChannelTail {
    source: Arc<SharedOplog>,
    connected: Option<String>,
    cursor: Option<usize>,
}

impl ChannelTail {
    pub fn new(source: Arc<SharedOplog>) -> Self {
        Self {
            source,
            connected: None,
            cursor: None,
        }
    }
}

#[async_trait]
impl OplogTail for ChannelTail {
    async fn connect(&mut self, target: &str) -> Result<bool> {
        if !self.source.reachable.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.connected = Some(target.to_string());
        Ok(true)
    }

    async fn tail_from(&mut self, _ns: &str, position: OpPosition) -> Result<()> {
        if self.connected.is_none() {
            return Err(Error::State("tail_from before connect".into()));
        }
        let entries = self.source.entries.lock().expect("oplog buffer poisoned");
        let idx = entries
            .iter()
            .position(|e| e.id >= position)
            .unwrap_or(entries.len());
        self.cursor = Some(idx);
        Ok(())
    }

    async fn next_entry(&mut self, wait: Duration) -> Result<Option<LogEntry>> {
        let Some(idx) = self.cursor else {
            return Err(Error::State("no cursor".into()));
        };
        if self.source.take_fault() {
            return Err(Error::TransientSource("injected read fault".into()));
        }

        // one bounded wait, then a liveness tick
        for attempt in 0..2 {
            {
                let entries = self.source.entries.lock().expect("oplog buffer poisoned");
                if idx < entries.len() {
                    let entry = entries[idx].clone();
                    self.cursor = Some(idx + 1);
                    return Ok(Some(entry));
                }
            }
            if attempt == 0 {
                tokio::time::sleep(wait).await;
            }
        }
        Ok(None)
    }

    fn has_cursor(&self) -> bool {
        self.cursor.is_some()
    }

    fn reset(&mut self) {
        self.cursor = None;
        self.connected = None;
    }
}

/// Factory handing out [`ChannelTail`] cursors over one shared buffer
pub struct ChannelTailFactory {
    source: Arc<SharedOplog>,
}

impl ChannelTailFactory {
    pub fn new(source: Arc<SharedOplog>) -> Self {
        Self { source }
    }
}

impl TailFactory for ChannelTailFactory {
    fn new_tail(&self) -> Box<dyn OplogTail + Send> {
        Box::new(ChannelTail::new(Arc::clone(&self.source)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::entry::{Document, LogOp, OpType};
    use chrono::Utc;

    fn entry(id: u64) -> LogEntry {
        LogEntry {
            id: OpPosition(id),
            timestamp: Utc::now(),
            hash: id as i64,
            writer: 0,
            body: LogOp {
                op: OpType::Noop,
                ns: "local.oplog".into(),
                doc: Document::new(),
                criteria: None,
                upsert: false,
                multi: false,
            },
        }
    }

    #[tokio::test]
    async fn test_tail_from_position() {
        let source = SharedOplog::new();
        for i in 1..=5 {
            source.push(entry(i));
        }

        let mut tail = ChannelTail::new(Arc::clone(&source));
        assert!(tail.connect("upstream:27017").await.unwrap());
        tail.tail_from("local.oplog", OpPosition(3)).await.unwrap();

        let first = tail.next_entry(Duration::from_millis(1)).await.unwrap();
        assert_eq!(first.unwrap().id, OpPosition(3));
    }

    #[tokio::test]
    async fn test_liveness_tick_when_caught_up() {
        let source = SharedOplog::new();
        source.push(entry(1));

        let mut tail = ChannelTail::new(Arc::clone(&source));
        tail.connect("upstream:27017").await.unwrap();
        tail.tail_from("local.oplog", OpPosition(1)).await.unwrap();

        assert!(tail
            .next_entry(Duration::from_millis(1))
            .await
            .unwrap()
            .is_some());
        assert!(tail
            .next_entry(Duration::from_millis(1))
            .await
            .unwrap()
            .is_none());

        // new entries show up on the next wait
        source.push(entry(2));
        let next = tail.next_entry(Duration::from_millis(1)).await.unwrap();
        assert_eq!(next.unwrap().id, OpPosition(2));
    }

    #[tokio::test]
    async fn test_injected_fault_is_transient() {
        let source = SharedOplog::new();
        source.push(entry(1));
        source.inject_faults(1);

        let mut tail = ChannelTail::new(Arc::clone(&source));
        tail.connect("upstream:27017").await.unwrap();
        tail.tail_from("local.oplog", OpPosition(1)).await.unwrap();

        let err = tail.next_entry(Duration::from_millis(1)).await.unwrap_err();
        assert!(err.is_transient());

        // recovered on the next read
        assert!(tail
            .next_entry(Duration::from_millis(1))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_replace_swaps_stored_entry() {
        let source = SharedOplog::new();
        source.push(entry(1));
        source.push(entry(2));

        let mut swapped = entry(2);
        swapped.hash = 99;
        source.replace(swapped);
        assert_eq!(source.len(), 2);

        let mut tail = ChannelTail::new(Arc::clone(&source));
        tail.connect("upstream:27017").await.unwrap();
        tail.tail_from("local.oplog", OpPosition(2)).await.unwrap();
        let got = tail
            .next_entry(Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.hash, 99);
    }

    #[tokio::test]
    async fn test_unreachable_source() {
        let source = SharedOplog::new();
        source.set_reachable(false);

        let mut tail = ChannelTail::new(source);
        assert!(!tail.connect("upstream:27017").await.unwrap());
    }
}
