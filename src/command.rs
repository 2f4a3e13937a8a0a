//! Command Dispatch Interface
//!
//! Replicated `command` entries re-enter the generic command dispatcher,
//! which is an external collaborator. The apply engine only needs this
//! narrow seam.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::oplog::entry::Document;

#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// Run a command scoped to the given namespace
    async fn run_command(&self, ns: &str, cmd: &Document) -> Result<Document>;
}

/// Dispatcher that records every command it sees and reports success.
/// Used in tests and single-node bring-up.
#[derive(Default)]
pub struct RecordingDispatcher {
    seen: Mutex<Vec<(String, Document)>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn commands(&self) -> Vec<(String, Document)> {
        self.seen.lock().await.clone()
    }
}

#[async_trait]
impl CommandDispatcher for RecordingDispatcher {
    async fn run_command(&self, ns: &str, cmd: &Document) -> Result<Document> {
        self.seen.lock().await.push((ns.to_string(), cmd.clone()));
        let mut ok = Document::new();
        ok.insert("ok".to_string(), serde_json::json!(1));
        Ok(ok)
    }
}
