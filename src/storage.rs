use crate::document::{Document, DocumentKey, DocumentStore, Fields, Query, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::fs;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const UPDATED_AT: &str = "updatedAt";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoredData {
    pub collections: BTreeMap<String, BTreeMap<String, Fields>>,
}

impl StoredData {
    fn document(&self, key: &DocumentKey) -> Option<Document> {
        self.collections
            .get(&key.collection)
            .and_then(|docs| docs.get(&key.id))
            .map(|fields| Document {
                id: key.id.clone(),
                fields: fields.clone(),
            })
    }

    fn insert(&mut self, key: &DocumentKey, fields: Fields) {
        self.collections
            .entry(key.collection.clone())
            .or_default()
            .insert(key.id.clone(), fields);
    }

    fn run_query(&self, query: &Query) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .collections
            .get(&query.collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| Document {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        query.apply(&mut docs);
        docs
    }
}

#[derive(Default)]
struct Inner {
    data: StoredData,
    live: HashMap<DocumentKey, watch::Sender<Option<Document>>>,
    queries: Vec<(Query, watch::Sender<Vec<Document>>)>,
    last_stamp: Option<DateTime<Utc>>,
}

impl Inner {
    /// Server clock for `updatedAt`, strictly increasing across writes.
    fn next_stamp(&mut self) -> String {
        let mut now = Utc::now();
        if let Some(last) = self.last_stamp {
            if now <= last {
                now = last + Duration::nanoseconds(1);
            }
        }
        self.last_stamp = Some(now);
        format_timestamp(now)
    }

    fn notify(&mut self, key: &DocumentKey) {
        if let Some(tx) = self.live.get(key) {
            tx.send_replace(self.data.document(key));
        }
        self.live.retain(|_, tx| tx.receiver_count() > 0);

        self.queries.retain(|(_, tx)| !tx.is_closed());
        for (query, tx) in &self.queries {
            if query.collection == key.collection {
                tx.send_replace(self.data.run_query(query));
            }
        }
    }
}

/// In-process document store with live subscriptions, optionally backed by
/// a JSON file that is rewritten after every merge.
pub struct LocalDocumentStore {
    path: Option<PathBuf>,
    inner: Mutex<Inner>,
    write_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl LocalDocumentStore {
    pub fn in_memory() -> Self {
        Self::with_data(None, StoredData::default())
    }

    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let data = load_data(&path).await;
        info!(
            path = %path.display(),
            collections = data.collections.len(),
            "opened document store"
        );
        Ok(Self::with_data(Some(path), data))
    }

    fn with_data(path: Option<PathBuf>, data: StoredData) -> Self {
        Self {
            path,
            inner: Mutex::new(Inner {
                data,
                ..Inner::default()
            }),
            write_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Rejects further writes and ends every live subscription.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut inner = self.lock();
        inner.live.clear();
        inner.queries.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn read_once(&self, key: &DocumentKey) -> StoreResult<Option<Document>> {
        Ok(self.lock().data.document(key))
    }

    async fn write_merge(&self, key: &DocumentKey, fields: Fields) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }

        // Held from merge to commit so writers cannot interleave.
        let _write = self.write_lock.lock().await;
        let (merged, payload) = {
            let mut inner = self.lock();
            let stamp = inner.next_stamp();
            let mut merged = inner
                .data
                .collections
                .get(&key.collection)
                .and_then(|docs| docs.get(&key.id))
                .cloned()
                .unwrap_or_default();
            merged.extend(fields);
            merged.insert(UPDATED_AT.to_string(), Value::String(stamp));

            let payload = match self.path {
                Some(_) => {
                    let mut next = inner.data.clone();
                    next.insert(key, merged.clone());
                    Some(serde_json::to_vec_pretty(&next)?)
                }
                None => None,
            };
            (merged, payload)
        };

        // Nothing becomes visible unless it reached the file.
        if let (Some(path), Some(payload)) = (&self.path, payload) {
            persist_data(path, payload).await?;
        }

        let mut inner = self.lock();
        inner.data.insert(key, merged);
        inner.notify(key);
        debug!(collection = %key.collection, id = %key.id, "merged document");
        Ok(())
    }

    fn subscribe_live(&self, key: &DocumentKey) -> watch::Receiver<Option<Document>> {
        let mut inner = self.lock();
        if let Some(tx) = inner.live.get(key) {
            return tx.subscribe();
        }
        let (tx, rx) = watch::channel(inner.data.document(key));
        inner.live.insert(key.clone(), tx);
        rx
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>> {
        Ok(self.lock().data.run_query(query))
    }

    fn subscribe_query(&self, query: &Query) -> watch::Receiver<Vec<Document>> {
        let mut inner = self.lock();
        let (tx, rx) = watch::channel(inner.data.run_query(query));
        inner.queries.push((query.clone(), tx));
        rx
    }
}

/// RFC 3339 in UTC with fixed precision so string order matches time order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub async fn load_data(path: &Path) -> StoredData {
    match fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(data) => data,
            Err(err) => {
                error!("failed to parse data file: {err}");
                StoredData::default()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoredData::default(),
        Err(err) => {
            error!("failed to read data file: {err}");
            StoredData::default()
        }
    }
}

async fn persist_data(path: &Path, payload: Vec<u8>) -> StoreResult<()> {
    fs::write(path, payload).await?;
    Ok(())
}
