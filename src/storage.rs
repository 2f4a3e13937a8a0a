//! Storage Engine Interface
//!
//! The local storage engine is an external collaborator: the apply path
//! consumes raw upsert/delete primitives, and the oplog writer persists
//! through two logical stores (an append-only record sequence and a keyed
//! checkpoint store). Physical durability lives behind these traits.
//!
//! [`MemoryStore`] implements both traits in memory and backs the test
//! suite and local loopback setups.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::oplog::entry::{Document, OpPosition, OplogRecord};

/// Result of an upsert against the storage engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertResult {
    /// Number of existing documents matched by the criteria
    pub matched: u64,
    /// Whether a zero-match call inserted a new document
    pub upserted: bool,
    /// Whether the update spec was modifier-style (`$set`, `$inc`, ...)
    /// rather than a whole-document replacement
    pub used_modifier: bool,
}

/// Document-level primitives consumed by the apply engine.
/// Both operations tolerate zero-match calls.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Update the first document matching `matcher` with `spec`, inserting
    /// when nothing matches and `upsert` is set.
    async fn upsert(
        &self,
        ns: &str,
        matcher: &Document,
        spec: &Document,
        upsert: bool,
    ) -> Result<UpsertResult>;

    /// Delete matching documents; `just_one` stops after the first.
    /// Returns the number removed (zero for an absent target).
    async fn delete(&self, ns: &str, matcher: &Document, just_one: bool) -> Result<u64>;

    /// Fetch one matching document, if any
    async fn find_one(&self, ns: &str, matcher: &Document) -> Result<Option<Document>>;
}

/// Store-level primitives consumed by the oplog writer
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn store_exists(&self, ns: &str) -> Result<bool>;

    /// Create a store; error if it already exists
    async fn create_store(&self, ns: &str) -> Result<()>;

    /// Drop a store; absent stores are not an error
    async fn drop_store(&self, ns: &str) -> Result<()>;

    /// Append one physical oplog record
    async fn append_record(&self, ns: &str, record: &OplogRecord) -> Result<()>;

    /// Overwrite (never append) a keyed record
    async fn put_keyed(&self, ns: &str, key: &str, doc: &Document) -> Result<()>;

    async fn get_keyed(&self, ns: &str, key: &str) -> Result<Option<Document>>;

    /// The most recently appended record, used to resume the hash chain
    async fn last_record(&self, ns: &str) -> Result<Option<OplogRecord>>;

    /// Records at or after `from`, in position order
    async fn records_from(&self, ns: &str, from: OpPosition) -> Result<Vec<OplogRecord>>;
}

/// In-memory storage engine.
///
/// Each namespace carries its own write lock; the outer map lock only
/// guards namespace creation and lookup. Writes to different namespaces
/// proceed concurrently, writes to the same namespace serialize.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Arc<Mutex<Vec<Document>>>>>,
    records: RwLock<HashMap<String, Vec<OplogRecord>>>,
    keyed: RwLock<HashMap<(String, String), Document>>,
    stores: RwLock<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespace handle, created on first touch
    async fn namespace(&self, ns: &str) -> Arc<Mutex<Vec<Document>>> {
        if let Some(existing) = self.collections.read().await.get(ns) {
            return Arc::clone(existing);
        }
        let mut collections = self.collections.write().await;
        Arc::clone(collections.entry(ns.to_string()).or_default())
    }

    /// Namespace handle if the namespace exists
    async fn namespace_if_present(&self, ns: &str) -> Option<Arc<Mutex<Vec<Document>>>> {
        self.collections.read().await.get(ns).map(Arc::clone)
    }

    /// Number of documents currently in a namespace
    pub async fn count(&self, ns: &str) -> usize {
        match self.namespace_if_present(ns).await {
            Some(collection) => collection.lock().await.len(),
            None => 0,
        }
    }
}

/// True when every field of `matcher` is present and equal in `doc`
fn matches(doc: &Document, matcher: &Document) -> bool {
    matcher.iter().all(|(k, v)| doc.get(k) == Some(v))
}

/// Modifier-style specs have every top-level key starting with `$`
fn is_modifier(spec: &Document) -> bool {
    !spec.is_empty() && spec.keys().all(|k| k.starts_with('$'))
}

/// Apply a modifier spec to a document in place. Only `$set` and `$unset`
/// are modeled; that covers what the replication tests exercise.
fn apply_modifier(doc: &mut Document, spec: &Document) {
    if let Some(serde_json::Value::Object(fields)) = spec.get("$set") {
        for (k, v) in fields {
            doc.insert(k.clone(), v.clone());
        }
    }
    if let Some(serde_json::Value::Object(fields)) = spec.get("$unset") {
        for k in fields.keys() {
            doc.remove(k);
        }
    }
}

/// Build the document inserted by an upsert with no match: the equality
/// fields of the matcher plus the modifier's effects (or the replacement
/// document itself).
fn upsert_seed(matcher: &Document, spec: &Document) -> Document {
    if is_modifier(spec) {
        let mut seed = matcher.clone();
        apply_modifier(&mut seed, spec);
        seed
    } else {
        let mut seed = spec.clone();
        if !seed.contains_key("_id") {
            if let Some(id) = matcher.get("_id") {
                seed.insert("_id".to_string(), id.clone());
            }
        }
        seed
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn upsert(
        &self,
        ns: &str,
        matcher: &Document,
        spec: &Document,
        upsert: bool,
    ) -> Result<UpsertResult> {
        let used_modifier = is_modifier(spec);
        let collection = self.namespace(ns).await;
        let mut docs = collection.lock().await;

        if let Some(doc) = docs.iter_mut().find(|d| matches(d, matcher)) {
            if used_modifier {
                apply_modifier(doc, spec);
            } else {
                *doc = spec.clone();
                if !doc.contains_key("_id") {
                    if let Some(id) = matcher.get("_id") {
                        doc.insert("_id".to_string(), id.clone());
                    }
                }
            }
            return Ok(UpsertResult {
                matched: 1,
                upserted: false,
                used_modifier,
            });
        }

        if upsert {
            docs.push(upsert_seed(matcher, spec));
        }

        Ok(UpsertResult {
            matched: 0,
            upserted: upsert,
            used_modifier,
        })
    }

    async fn delete(&self, ns: &str, matcher: &Document, just_one: bool) -> Result<u64> {
        let Some(collection) = self.namespace_if_present(ns).await else {
            return Ok(0);
        };
        let mut docs = collection.lock().await;

        let before = docs.len();
        if just_one {
            if let Some(idx) = docs.iter().position(|d| matches(d, matcher)) {
                docs.remove(idx);
            }
        } else {
            docs.retain(|d| !matches(d, matcher));
        }
        Ok((before - docs.len()) as u64)
    }

    async fn find_one(&self, ns: &str, matcher: &Document) -> Result<Option<Document>> {
        let Some(collection) = self.namespace_if_present(ns).await else {
            return Ok(None);
        };
        let docs = collection.lock().await;
        Ok(docs.iter().find(|d| matches(d, matcher)).cloned())
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn store_exists(&self, ns: &str) -> Result<bool> {
        Ok(self.stores.read().await.contains(ns))
    }

    async fn create_store(&self, ns: &str) -> Result<()> {
        let mut stores = self.stores.write().await;
        if !stores.insert(ns.to_string()) {
            return Err(Error::Storage(format!("store already exists: {}", ns)));
        }
        Ok(())
    }

    async fn drop_store(&self, ns: &str) -> Result<()> {
        self.stores.write().await.remove(ns);
        self.records.write().await.remove(ns);
        let mut keyed = self.keyed.write().await;
        keyed.retain(|(store_ns, _), _| store_ns != ns);
        Ok(())
    }

    async fn append_record(&self, ns: &str, record: &OplogRecord) -> Result<()> {
        if !self.stores.read().await.contains(ns) {
            return Err(Error::Storage(format!("no such store: {}", ns)));
        }
        let mut records = self.records.write().await;
        let list = records.entry(ns.to_string()).or_default();
        // writers assign positions under an ordering lock they release
        // before this write, so arrivals can be out of position order
        let at = list.partition_point(|r| r.id < record.id);
        list.insert(at, record.clone());
        Ok(())
    }

    async fn put_keyed(&self, ns: &str, key: &str, doc: &Document) -> Result<()> {
        if !self.stores.read().await.contains(ns) {
            return Err(Error::Storage(format!("no such store: {}", ns)));
        }
        self.keyed
            .write()
            .await
            .insert((ns.to_string(), key.to_string()), doc.clone());
        Ok(())
    }

    async fn get_keyed(&self, ns: &str, key: &str) -> Result<Option<Document>> {
        Ok(self
            .keyed
            .read()
            .await
            .get(&(ns.to_string(), key.to_string()))
            .cloned())
    }

    async fn last_record(&self, ns: &str) -> Result<Option<OplogRecord>> {
        Ok(self
            .records
            .read()
            .await
            .get(ns)
            .and_then(|r| r.last().cloned()))
    }

    async fn records_from(&self, ns: &str, from: OpPosition) -> Result<Vec<OplogRecord>> {
        Ok(self
            .records
            .read()
            .await
            .get(ns)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.id >= from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
