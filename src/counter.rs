use crate::document::{Direction, Document, DocumentKey, DocumentStore, Fields, Filter, Query};
use crate::models::{date_key, CounterField, CounterKey, DailyStats, SalesDocument, SALES_COLLECTION};
use crate::stats::{aggregate, MemberRecord, TeamStats};
use crate::storage::UPDATED_AT;
use chrono::NaiveDate;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Snapshot stream; the first `next` yields the current value. Dropping it
/// unsubscribes.
pub struct Subscription<T> {
    rx: watch::Receiver<T>,
    primed: bool,
    task: Option<JoinHandle<()>>,
    _lease: Option<SlotLease>,
}

impl<T: Clone> Subscription<T> {
    fn new(rx: watch::Receiver<T>, task: Option<JoinHandle<()>>, lease: Option<SlotLease>) -> Self {
        Self {
            rx,
            primed: false,
            task,
            _lease: lease,
        }
    }

    pub fn current(&self) -> T {
        self.rx.borrow().clone()
    }

    /// `None` once the source has shut down.
    pub async fn next(&mut self) -> Option<T> {
        if !self.primed {
            return Some(self.take_current());
        }
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    fn take_current(&mut self) -> T {
        self.primed = true;
        self.rx.borrow_and_update().clone()
    }

    pub fn unsubscribe(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {}
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// One per counter subscription. The last lease on a slot stops its
// backend forwarder and lets the slot be evicted.
struct SlotLease {
    inner: Weak<Inner>,
    key: CounterKey,
    slot: Option<Arc<Slot>>,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let idle = {
            let mut live = slot.lock_live();
            live.subscribers = live.subscribers.saturating_sub(1);
            if live.subscribers == 0 {
                if let Some(forwarder) = live.forwarder.take() {
                    forwarder.abort();
                }
            }
            live.subscribers == 0
        };
        drop(slot);
        if idle {
            if let Some(inner) = self.inner.upgrade() {
                inner.release(&self.key);
            }
        }
    }
}

#[derive(Default)]
struct Live {
    subscribers: usize,
    forwarder: Option<JoinHandle<()>>,
}

struct Slot {
    tx: watch::Sender<DailyStats>,
    write: tokio::sync::Mutex<()>,
    // Set when the last write failed; the local value is ahead of the backend.
    unsynced: AtomicBool,
    written: AtomicBool,
    live: Mutex<Live>,
}

impl Slot {
    fn new() -> Self {
        Self {
            tx: watch::Sender::new(DailyStats::default()),
            write: tokio::sync::Mutex::new(()),
            unsynced: AtomicBool::new(false),
            written: AtomicBool::new(false),
            live: Mutex::new(Live::default()),
        }
    }

    fn value(&self) -> DailyStats {
        *self.tx.borrow()
    }

    fn publish(&self, stats: DailyStats) {
        self.tx.send_if_modified(|current| {
            if *current == stats {
                return false;
            }
            *current = stats;
            true
        });
    }

    fn is_unsynced(&self) -> bool {
        self.unsynced.load(Ordering::SeqCst)
    }

    fn lock_live(&self) -> MutexGuard<'_, Live> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Inner {
    backend: Option<Arc<dyn DocumentStore>>,
    slots: Mutex<HashMap<CounterKey, Arc<Slot>>>,
    revision: watch::Sender<u64>,
}

/// Without a backend, counters live in memory only (degraded mode).
#[derive(Clone)]
pub struct CounterStore {
    inner: Arc<Inner>,
}

impl CounterStore {
    pub fn new(backend: Option<Arc<dyn DocumentStore>>) -> Self {
        if backend.is_none() {
            info!("no document store configured, counters are kept in memory only");
        }
        Self {
            inner: Arc::new(Inner {
                backend,
                slots: Mutex::new(HashMap::new()),
                revision: watch::Sender::new(0),
            }),
        }
    }

    pub fn connected(backend: Arc<dyn DocumentStore>) -> Self {
        Self::new(Some(backend))
    }

    pub fn offline() -> Self {
        Self::new(None)
    }

    pub fn is_persistent(&self) -> bool {
        self.inner.backend.is_some()
    }

    /// A missing or malformed record reads as zero.
    pub async fn get(&self, user_id: &str, date: NaiveDate) -> DailyStats {
        let key = CounterKey::new(user_id, date);
        let cached = self
            .inner
            .lock_slots()
            .get(&key)
            .map(|slot| (slot.value(), slot.is_unsynced()));
        let Some(backend) = &self.inner.backend else {
            return cached.map(|(stats, _)| stats).unwrap_or_default();
        };
        if let Some((stats, true)) = cached {
            return stats;
        }

        match backend.read_once(&document_key(&key)).await {
            Ok(doc) => decode(doc.as_ref()).stats(),
            Err(err) => {
                warn!(user_id, date = %date, "failed to read counters, using last known value: {err}");
                cached.map(|(stats, _)| stats).unwrap_or_default()
            }
        }
    }

    /// Applies `delta` to one counter, clamped at zero, and persists it.
    ///
    /// Adjustments to the same key are serialized. The mutation runs on its
    /// own task and finishes even if the caller is dropped. A failed write
    /// keeps the optimistic value (no rollback) and the next adjustment
    /// writes every counter.
    pub async fn adjust(
        &self,
        user_id: &str,
        date: NaiveDate,
        field: CounterField,
        delta: i64,
    ) -> DailyStats {
        let inner = Arc::clone(&self.inner);
        let key = CounterKey::new(user_id, date);
        let task = tokio::spawn(async move {
            let stats = inner.apply(&key, field, delta).await;
            inner.release(&key);
            stats
        });

        match task.await {
            Ok(stats) => stats,
            Err(err) => {
                error!(user_id, date = %date, %field, "counter update task failed: {err}");
                self.get(user_id, date).await
            }
        }
    }

    pub fn subscribe(&self, user_id: &str, date: NaiveDate) -> Subscription<DailyStats> {
        let key = CounterKey::new(user_id, date);
        let slot = self.inner.slot(&key);
        {
            let mut live = slot.lock_live();
            live.subscribers += 1;
            if let Some(backend) = &self.inner.backend {
                if live.forwarder.is_none() {
                    live.forwarder = Some(start_forwarder(&key, &slot, backend.as_ref()));
                }
            }
        }
        let rx = slot.tx.subscribe();
        let lease = SlotLease {
            inner: Arc::downgrade(&self.inner),
            key,
            slot: Some(slot),
        };
        Subscription::new(rx, None, Some(lease))
    }

    /// Calls `callback` with the current value right away and again after
    /// every change, until the handle is unsubscribed or dropped.
    pub fn subscribe_with<F>(
        &self,
        user_id: &str,
        date: NaiveDate,
        mut callback: F,
    ) -> SubscriptionHandle
    where
        F: FnMut(DailyStats) + Send + 'static,
    {
        let mut subscription = self.subscribe(user_id, date);
        callback(subscription.take_current());
        let task = tokio::spawn(async move {
            while let Some(stats) = subscription.next().await {
                callback(stats);
            }
        });
        SubscriptionHandle { task }
    }

    pub fn has_unsynced_changes(&self, user_id: &str, date: NaiveDate) -> bool {
        self.inner
            .lock_slots()
            .get(&CounterKey::new(user_id, date))
            .is_some_and(|slot| slot.is_unsynced())
    }

    pub async fn team(&self, date: NaiveDate) -> TeamStats {
        aggregate(&self.team_records(date).await)
    }

    /// Most recently updated first when a backend is present, by user id
    /// otherwise.
    pub async fn team_records(&self, date: NaiveDate) -> Vec<MemberRecord> {
        let Some(backend) = &self.inner.backend else {
            return self.inner.local_records(date);
        };
        match backend.query(&team_query(date)).await {
            Ok(docs) => member_records(&docs),
            Err(err) => {
                warn!(date = %date, "team query failed, using local records: {err}");
                self.inner.local_records(date)
            }
        }
    }

    pub fn subscribe_team(&self, date: NaiveDate) -> Subscription<TeamStats> {
        match &self.inner.backend {
            Some(backend) => {
                let mut source = backend.subscribe_query(&team_query(date));
                let initial = aggregate(&member_records(&source.borrow_and_update()));
                let (tx, rx) = watch::channel(initial);
                let task = tokio::spawn(async move {
                    while source.changed().await.is_ok() {
                        let team = aggregate(&member_records(&source.borrow_and_update()));
                        tx.send_replace(team);
                    }
                });
                Subscription::new(rx, Some(task), None)
            }
            None => {
                let mut revision = self.inner.revision.subscribe();
                let (tx, rx) = watch::channel(aggregate(&self.inner.local_records(date)));
                let inner = Arc::clone(&self.inner);
                let task = tokio::spawn(async move {
                    while revision.changed().await.is_ok() {
                        tx.send_replace(aggregate(&inner.local_records(date)));
                    }
                });
                Subscription::new(rx, Some(task), None)
            }
        }
    }

    pub async fn shutdown(&self) {
        let slots: Vec<Arc<Slot>> = self.inner.lock_slots().values().cloned().collect();
        for slot in slots {
            drop(slot.write.lock().await);
            if let Some(forwarder) = slot.lock_live().forwarder.take() {
                forwarder.abort();
            }
        }
        info!("counter store shut down");
    }
}

impl Inner {
    fn lock_slots(&self) -> MutexGuard<'_, HashMap<CounterKey, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, key: &CounterKey) -> Arc<Slot> {
        Arc::clone(
            self.lock_slots()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Slot::new())),
        )
    }

    // With a backend, slots are only a cache: drop one once nothing holds
    // it, nobody subscribes to it and its value has reached the backend.
    // Degraded mode keeps every slot since it is the only copy.
    fn release(&self, key: &CounterKey) {
        if self.backend.is_none() {
            return;
        }
        let mut slots = self.lock_slots();
        let idle = slots.get(key).is_some_and(|slot| {
            Arc::strong_count(slot) == 1 && !slot.is_unsynced() && slot.lock_live().subscribers == 0
        });
        if idle {
            slots.remove(key);
        }
    }

    async fn apply(&self, key: &CounterKey, field: CounterField, delta: i64) -> DailyStats {
        let slot = self.slot(key);
        let _write = slot.write.lock().await;
        let unsynced = slot.is_unsynced();
        let doc_key = document_key(key);

        let (current, malformed) = match &self.backend {
            Some(backend) if !unsynced => match backend.read_once(&doc_key).await {
                Ok(doc) => {
                    let decoded = decode(doc.as_ref());
                    (decoded.stats(), decoded.is_malformed())
                }
                Err(err) => {
                    warn!(
                        user_id = %key.user_id,
                        date = %key.date,
                        "failed to read counters before update: {err}"
                    );
                    (slot.value(), false)
                }
            },
            _ => (slot.value(), false),
        };

        let updated = current.adjusted(field, delta);
        slot.publish(updated);
        slot.written.store(true, Ordering::SeqCst);
        self.revision.send_modify(|revision| *revision = revision.wrapping_add(1));

        let Some(backend) = &self.backend else {
            return updated;
        };
        // A malformed document is replaced wholesale, otherwise its bad
        // fields would survive the merge.
        let fields = if unsynced || malformed {
            merge_fields(key, &updated, &CounterField::ALL)
        } else {
            merge_fields(key, &updated, &[field])
        };
        match backend.write_merge(&doc_key, fields).await {
            Ok(()) => {
                slot.unsynced.store(false, Ordering::SeqCst);
                debug!(user_id = %key.user_id, date = %key.date, %field, delta, "counter updated");
            }
            Err(err) => {
                slot.unsynced.store(true, Ordering::SeqCst);
                error!(
                    user_id = %key.user_id,
                    date = %key.date,
                    %field,
                    "failed to persist counter update, keeping local value: {err}"
                );
            }
        }
        updated
    }

    fn local_records(&self, date: NaiveDate) -> Vec<MemberRecord> {
        let mut records: Vec<MemberRecord> = self
            .lock_slots()
            .iter()
            .filter(|(key, slot)| key.date == date && slot.written.load(Ordering::SeqCst))
            .map(|(key, slot)| MemberRecord::new(key.user_id.clone(), slot.value()))
            .collect();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        records
    }
}

// The task only holds a weak reference, so it never keeps an evicted slot
// alive.
fn start_forwarder(key: &CounterKey, slot: &Arc<Slot>, backend: &dyn DocumentStore) -> JoinHandle<()> {
    let mut source = backend.subscribe_live(&document_key(key));
    let initial = decode(source.borrow_and_update().as_ref()).stats();
    if !slot.is_unsynced() {
        slot.publish(initial);
    }

    let slot = Arc::downgrade(slot);
    tokio::spawn(async move {
        while source.changed().await.is_ok() {
            let stats = decode(source.borrow_and_update().as_ref()).stats();
            let Some(slot) = slot.upgrade() else {
                break;
            };
            // Snapshots replace the local value unless a failed write left
            // it ahead of the backend.
            if !slot.is_unsynced() {
                slot.publish(stats);
            }
        }
    })
}

fn document_key(key: &CounterKey) -> DocumentKey {
    DocumentKey::new(SALES_COLLECTION, key.document_id())
}

fn team_query(date: NaiveDate) -> Query {
    Query::collection(SALES_COLLECTION)
        .filter(Filter::eq("date", date_key(date)))
        .order_by(UPDATED_AT, Direction::Desc)
}

enum Decoded {
    Missing,
    Valid(DailyStats),
    Malformed,
}

impl Decoded {
    fn stats(&self) -> DailyStats {
        match self {
            Decoded::Valid(stats) => *stats,
            Decoded::Missing | Decoded::Malformed => DailyStats::default(),
        }
    }

    fn is_malformed(&self) -> bool {
        matches!(self, Decoded::Malformed)
    }
}

fn decode(doc: Option<&Document>) -> Decoded {
    let Some(doc) = doc else {
        return Decoded::Missing;
    };
    match doc.decode::<SalesDocument>() {
        Some(sales) => Decoded::Valid(sales.stats()),
        None => {
            warn!(id = %doc.id, "malformed sales document, treating as empty");
            Decoded::Malformed
        }
    }
}

fn member_records(docs: &[Document]) -> Vec<MemberRecord> {
    docs.iter()
        .filter_map(|doc| match doc.decode::<SalesDocument>() {
            Some(sales) => Some(MemberRecord::new(sales.user_id.clone(), sales.stats())),
            None => {
                warn!(id = %doc.id, "skipping malformed sales document");
                None
            }
        })
        .collect()
}

fn merge_fields(key: &CounterKey, stats: &DailyStats, fields: &[CounterField]) -> Fields {
    let mut out = Fields::new();
    out.insert("userId".to_string(), Value::from(key.user_id.clone()));
    out.insert("date".to_string(), Value::from(key.date_key()));
    for field in fields {
        out.insert(field.as_str().to_string(), Value::from(stats.get(*field)));
    }
    out
}

#[cfg(test)]
impl CounterStore {
    fn tracked_keys(&self) -> usize {
        self.inner.lock_slots().len()
    }

    fn running_forwarders(&self) -> usize {
        self.inner
            .lock_slots()
            .values()
            .filter(|slot| slot.lock_live().forwarder.is_some())
            .count()
    }
}
