//! In-memory record source for the Tether sync engine.
//!
//! `MemorySource` implements the full [`RecordSource`] surface over a
//! concurrent map: CRUD calls mutate the map and fan the resulting
//! change events out to every live subscription, in the order the
//! mutations were applied. It backs the integration test suites and
//! works as a process-local store for single-node setups.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use tether_engine::{
    merge_fields, ChangeEvent, ChangeFeed, EventStream, FieldPatch, KeyFn, ListOptions,
    ListResponse, RecordSource, SourceError, UpdatePayload,
};

type EventResult<K, R> = Result<ChangeEvent<K, R>, SourceError>;

struct Subscriber<K, R> {
    /// `Some` restricts delivery to events for that key.
    key: Option<K>,
    sender: mpsc::UnboundedSender<EventResult<K, R>>,
}

struct Inner<K, R> {
    get_key: KeyFn<R, K>,
    records: DashMap<K, R>,
    subscribers: DashMap<String, Subscriber<K, R>>,
    /// Serializes mutate-then-publish so every subscriber sees events
    /// in the order the mutations were applied.
    publish_order: Mutex<()>,
    /// How many subscriptions have been released (cancel or drop).
    released: AtomicUsize,
    /// Echo this source's own `update` calls as partial events instead
    /// of full records.
    partial_echo: bool,
}

/// An in-memory keyed record store with a live change feed.
///
/// Clones are cheap and share state.
pub struct MemorySource<K, R> {
    inner: Arc<Inner<K, R>>,
}

impl<K, R> Clone for MemorySource<K, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, R> MemorySource<K, R>
where
    K: Clone + Eq + Hash + Ord + fmt::Debug + Send + Sync + 'static,
    R: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    pub fn new(get_key: impl Fn(&R) -> K + Send + Sync + 'static) -> Self {
        Self::build(Arc::new(get_key), false)
    }

    /// Like [`MemorySource::new`], but `update` calls are echoed as
    /// partial field-patch events rather than full records.
    pub fn with_partial_echo(get_key: impl Fn(&R) -> K + Send + Sync + 'static) -> Self {
        Self::build(Arc::new(get_key), true)
    }

    fn build(get_key: KeyFn<R, K>, partial_echo: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                get_key,
                records: DashMap::new(),
                subscribers: DashMap::new(),
                publish_order: Mutex::new(()),
                released: AtomicUsize::new(0),
                partial_echo,
            }),
        }
    }

    /// Load records without emitting change events. Intended for data
    /// that predates any subscription.
    pub fn seed(&self, records: impl IntoIterator<Item = R>) {
        for record in records {
            let key = (self.inner.get_key)(&record);
            self.inner.records.insert(key, record);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// How many subscriptions have been released so far, whether by
    /// cancellation or by their reader going away.
    pub fn released_count(&self) -> usize {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Drop every live feed so subscribers observe a natural
    /// end-of-stream.
    pub fn close(&self) {
        self.inner.subscribers.clear();
    }

    fn publish(&self, event: ChangeEvent<K, R>) {
        let event_key = event.key(|record| (self.inner.get_key)(record));
        let mut dead = Vec::new();

        for entry in self.inner.subscribers.iter() {
            let subscriber = entry.value();
            if let Some(key) = &subscriber.key {
                if *key != event_key {
                    continue;
                }
            }
            if subscriber.sender.send(Ok(event.clone())).is_err() {
                dead.push(entry.key().clone());
            }
        }

        for id in dead {
            tracing::debug!(subscription = %id, "dropping dead subscriber");
            self.inner.subscribers.remove(&id);
        }
    }
}

#[async_trait]
impl<K, R> RecordSource for MemorySource<K, R>
where
    K: Clone + Eq + Hash + Ord + fmt::Debug + Send + Sync + 'static,
    R: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    type Record = R;
    type Key = K;

    async fn list(&self, options: ListOptions) -> Result<ListResponse<R>, SourceError> {
        let mut entries: Vec<(K, R)> = self
            .inner
            .records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let total = entries.len();
        let mut records: Vec<R> = entries.into_iter().map(|(_, record)| record).collect();

        if let Some(pagination) = &options.pagination {
            if let Some(offset) = pagination.offset {
                records = records.into_iter().skip(offset).collect();
            }
            if let Some(limit) = pagination.limit {
                records.truncate(limit);
            }
        }

        Ok(ListResponse {
            records,
            total_count: options.count.then_some(total),
        })
    }

    async fn create(&self, record: R) -> Result<K, SourceError> {
        let mut keys = self.create_bulk(vec![record]).await?;
        keys.pop()
            .ok_or_else(|| SourceError::Rejected("bulk create returned no key".into()))
    }

    async fn create_bulk(&self, records: Vec<R>) -> Result<Vec<K>, SourceError> {
        let _order = self.inner.publish_order.lock();

        let keys: Vec<K> = records.iter().map(|r| (self.inner.get_key)(r)).collect();
        for key in &keys {
            if self.inner.records.contains_key(key) {
                return Err(SourceError::Rejected(format!(
                    "record already exists: {key:?}"
                )));
            }
        }

        for (key, record) in keys.iter().zip(records) {
            self.inner.records.insert(key.clone(), record.clone());
            self.publish(ChangeEvent::Insert(record));
        }

        Ok(keys)
    }

    async fn update(&self, key: K, fields: FieldPatch) -> Result<(), SourceError> {
        let _order = self.inner.publish_order.lock();

        let current = self
            .inner
            .records
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SourceError::Rejected(format!("record not found: {key:?}")))?;

        let merged = merge_fields(&current, &fields)
            .map_err(|err| SourceError::Rejected(format!("unmergeable patch: {err}")))?;
        self.inner.records.insert(key.clone(), merged.clone());

        let event = if self.inner.partial_echo {
            ChangeEvent::Update(UpdatePayload::Partial { key, fields })
        } else {
            ChangeEvent::Update(UpdatePayload::Full(merged))
        };
        self.publish(event);

        Ok(())
    }

    async fn delete(&self, key: K) -> Result<(), SourceError> {
        let _order = self.inner.publish_order.lock();

        let (_, record) = self
            .inner
            .records
            .remove(&key)
            .ok_or_else(|| SourceError::Rejected(format!("record not found: {key:?}")))?;
        self.publish(ChangeEvent::Delete(record));

        Ok(())
    }

    async fn subscribe(&self, key: Option<K>) -> Result<ChangeFeed<K, R>, SourceError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4().to_string();

        self.inner
            .subscribers
            .insert(id.clone(), Subscriber { key, sender });
        tracing::debug!(subscription = %id, "subscription registered");

        let events: EventStream<K, R> = Box::pin(futures::stream::unfold(
            receiver,
            |mut receiver| async move { receiver.recv().await.map(|event| (event, receiver)) },
        ));

        let inner = Arc::clone(&self.inner);
        let feed = ChangeFeed::new(events).with_cancel(Box::new(move || {
            inner.subscribers.remove(&id);
            inner.released.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(subscription = %id, "subscription released");
        }));

        Ok(feed)
    }
}
