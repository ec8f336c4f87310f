//! The sync engine core.
//!
//! Owns the authoritative local snapshot, performs the initial load,
//! applies streamed change events, and applies/forwards local
//! mutations. The snapshot has exactly two writers: the event loop
//! driven here and the local mutation calls below. Safety comes from
//! idempotent per-event transactions, not from mutual exclusion of the
//! two writers.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::collection::Collection;
use crate::error::{Error, Result, SourceError};
use crate::event::{ChangeEvent, UpdatePayload};
use crate::record::{changed_fields, merge_fields, KeyFn};
use crate::source::{ListOptions, RecordSource};
use crate::stream::{CancelToken, ChangeStreamReader};

/// Lifecycle of a synced collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncState {
    Uninitialized = 0,
    /// Initial `list()` in flight; nothing committed yet.
    Loading = 1,
    /// Seed batch committed; change events are being applied.
    Streaming = 2,
    /// Terminal. The snapshot is retained but no longer maintained.
    Canceled = 3,
}

impl SyncState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SyncState::Loading,
            2 => SyncState::Streaming,
            3 => SyncState::Canceled,
            _ => SyncState::Uninitialized,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Uninitialized => "uninitialized",
            SyncState::Loading => "loading",
            SyncState::Streaming => "streaming",
            SyncState::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

struct Lifecycle {
    state: AtomicU8,
    token: CancelToken,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SyncState::Uninitialized as u8),
            token: CancelToken::new(),
        }
    }

    fn state(&self) -> SyncState {
        SyncState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set(&self, state: SyncState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Transition only if the current state matches `from`.
    fn try_transition(&self, from: SyncState, to: SyncState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state() {
            SyncState::Canceled => Err(Error::Canceled),
            _ => Ok(()),
        }
    }
}

/// Configuration for [`SyncedCollection::start`].
pub struct SyncConfig<S: RecordSource> {
    pub source: Arc<S>,
    pub get_key: KeyFn<S::Record, S::Key>,
    /// Passed through opaquely to the initial `list()` call.
    pub list_options: ListOptions,
}

impl<S: RecordSource> SyncConfig<S> {
    pub fn new(
        source: Arc<S>,
        get_key: impl Fn(&S::Record) -> S::Key + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            get_key: Arc::new(get_key),
            list_options: ListOptions::default(),
        }
    }

    pub fn with_list_options(mut self, options: ListOptions) -> Self {
        self.list_options = options;
        self
    }
}

/// A keyed collection kept consistent with a record source.
///
/// Created via [`SyncedCollection::start`]; observed through
/// [`SyncedCollection::collection`]; torn down with
/// [`SyncedCollection::cancel`].
pub struct SyncedCollection<S: RecordSource> {
    collection: Collection<S::Key, S::Record>,
    source: Arc<S>,
    get_key: KeyFn<S::Record, S::Key>,
    lifecycle: Arc<Lifecycle>,
    driver: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl<S: RecordSource> SyncedCollection<S> {
    /// Start syncing: subscribe, load, seed, then stream.
    ///
    /// The subscription is established first so change events produced
    /// during the load window queue behind the unpolled feed; they are
    /// replayed in order once the seed batch commits. If `list()`
    /// fails, the error is returned, nothing is committed, and the
    /// subscription is released.
    pub async fn start(config: SyncConfig<S>) -> Result<Self> {
        let SyncConfig {
            source,
            get_key,
            list_options,
        } = config;

        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.set(SyncState::Loading);

        let feed = source
            .subscribe(None)
            .await
            .map_err(Error::Stream)?;
        let reader = ChangeStreamReader::new(feed, lifecycle.token.clone());

        let response = source.list(list_options).await.map_err(Error::Load)?;

        let collection = Collection::new();
        let mut seed = collection.begin();
        let seeded = response.records.len();
        for record in response.records {
            seed.upsert((get_key)(&record), record);
        }
        seed.commit();
        tracing::info!(
            records = seeded,
            total_count = ?response.total_count,
            "initial load committed"
        );

        // A cancel that landed during the load wins; the reader is
        // dropped here and the subscription released.
        let driver = if lifecycle.try_transition(SyncState::Loading, SyncState::Streaming) {
            Some(tokio::spawn(drive(
                reader,
                collection.clone(),
                get_key.clone(),
            )))
        } else {
            None
        };

        Ok(Self {
            collection,
            source,
            get_key,
            lifecycle,
            driver: Mutex::new(driver),
        })
    }

    /// The observable snapshot this engine maintains.
    pub fn collection(&self) -> &Collection<S::Key, S::Record> {
        &self.collection
    }

    pub fn sync_state(&self) -> SyncState {
        self.lifecycle.state()
    }

    /// Insert one record: optimistic apply, then `create_bulk` upstream.
    pub async fn insert(&self, record: S::Record) -> Result<S::Key> {
        let mut keys = self.insert_many(vec![record]).await?;
        keys.pop().ok_or_else(|| {
            Error::Mutation(SourceError::Rejected(
                "source returned no key for created record".into(),
            ))
        })
    }

    /// Insert a batch of records.
    ///
    /// The optimistic apply commits as one transaction before the
    /// network call is issued; the confirming `Insert` echo later
    /// re-asserts (or corrects) each record.
    pub async fn insert_many(&self, records: Vec<S::Record>) -> Result<Vec<S::Key>> {
        self.lifecycle.ensure_active()?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut batch = self.collection.begin();
        for record in &records {
            batch.upsert((self.get_key)(record), record.clone());
        }
        batch.commit();

        self.source
            .create_bulk(records)
            .await
            .map_err(Error::Mutation)
    }

    /// Update the record under `key` in place.
    ///
    /// The snapshot immediately holds the fully mutated record; only
    /// the changed top-level fields are forwarded upstream. A mutation
    /// that changes nothing is not forwarded at all.
    pub async fn update(
        &self,
        key: S::Key,
        mutate: impl FnOnce(&mut S::Record),
    ) -> Result<()> {
        self.lifecycle.ensure_active()?;

        let current = self
            .collection
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("{key:?}")))?;
        let mut updated = current.clone();
        mutate(&mut updated);

        let fields = changed_fields(&current, &updated)?;
        if fields.is_empty() {
            return Ok(());
        }

        let mut batch = self.collection.begin();
        batch.upsert(key.clone(), updated);
        batch.commit();

        self.source
            .update(key, fields)
            .await
            .map_err(Error::Mutation)
    }

    /// Remove the record under `key`: optimistic remove, then `delete`
    /// upstream. Removing an absent key is not an error locally.
    pub async fn delete(&self, key: S::Key) -> Result<()> {
        self.lifecycle.ensure_active()?;

        let mut batch = self.collection.begin();
        batch.remove(key.clone());
        batch.commit();

        self.source.delete(key).await.map_err(Error::Mutation)
    }

    /// Cancel syncing. Terminal and idempotent: the underlying stream
    /// cancellation runs exactly once no matter how many times this is
    /// called. The snapshot keeps its contents.
    pub fn cancel(&self) {
        self.lifecycle.set(SyncState::Canceled);
        if self.lifecycle.token.cancel() {
            tracing::info!("sync canceled");
        }
    }

    /// Wait for the event loop to finish, surfacing a stream failure if
    /// one stopped it. Resolves immediately once the driver has been
    /// reaped or never ran.
    pub async fn closed(&self) -> Result<()> {
        let handle = self.driver.lock().take();
        match handle {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(err) => Err(Error::Driver(err.to_string())),
            },
            None => Ok(()),
        }
    }
}

/// The event loop: read one event, apply it in its own transaction,
/// repeat. Stops on end-of-stream, cancellation, or a stream error.
async fn drive<K, R>(
    mut reader: ChangeStreamReader<K, R>,
    collection: Collection<K, R>,
    get_key: KeyFn<R, K>,
) -> Result<()>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    R: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    loop {
        match reader.next().await {
            Some(Ok(event)) => apply_event(&collection, &get_key, event),
            Some(Err(err)) => {
                tracing::warn!(error = %err, "change stream failed; stopping event application");
                return Err(Error::Stream(err));
            }
            None => {
                tracing::debug!("change stream closed");
                return Ok(());
            }
        }
    }
}

/// Apply one change event per the collection's upsert/merge/remove
/// rules. Total on valid input: conflicts resolve as upserts, removes
/// of absent keys are no-ops, and an unmergeable or unmatched field
/// patch is dropped with a log line rather than failing the loop.
fn apply_event<K, R>(
    collection: &Collection<K, R>,
    get_key: &KeyFn<R, K>,
    event: ChangeEvent<K, R>,
) where
    K: Clone + Eq + Hash + fmt::Debug,
    R: Clone + Serialize + DeserializeOwned,
{
    tracing::trace!(kind = event.kind(), "applying change event");

    let mut batch = collection.begin();
    match event {
        ChangeEvent::Insert(record) | ChangeEvent::Update(UpdatePayload::Full(record)) => {
            batch.upsert((get_key)(&record), record);
        }
        ChangeEvent::Update(UpdatePayload::Partial { key, fields }) => {
            match collection.get(&key) {
                Some(current) => match merge_fields(&current, &fields) {
                    Ok(merged) => batch.upsert(key, merged),
                    Err(err) => {
                        tracing::warn!(key = ?key, error = %err, "dropping unmergeable field patch");
                    }
                },
                None => {
                    tracing::debug!(key = ?key, "field patch for absent key; skipped");
                }
            }
        }
        ChangeEvent::Delete(record) => {
            batch.remove((get_key)(&record));
        }
    }

    if !batch.is_empty() {
        batch.commit();
    }
}
