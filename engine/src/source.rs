//! The record source trait - the remote store the engine syncs against.
//!
//! Implementations own all transport and wire concerns; the engine only
//! sees keyed records, an ordered change feed, and the CRUD surface
//! below.

use std::fmt;
use std::hash::Hash;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::event::ChangeEvent;
use crate::record::FieldPatch;

/// Pagination parameters passed through to `list`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Options for [`RecordSource::list`]. The engine passes these through
/// opaquely; interpretation belongs to the source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    pub pagination: Option<Pagination>,
    pub order: Option<Vec<String>>,
    pub filters: Option<Vec<String>>,
    /// Ask the source to report a total record count.
    pub count: bool,
}

/// Result of a `list` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse<R> {
    pub records: Vec<R>,
    pub total_count: Option<usize>,
}

/// An ordered, cancelable sequence of change events.
pub type EventStream<K, R> =
    Pin<Box<dyn Stream<Item = Result<ChangeEvent<K, R>, SourceError>> + Send>>;

/// The source's own cancellation hook; invoked exactly once when the
/// attachment is released.
pub type CancelHook = Box<dyn FnOnce() + Send>;

/// One live attachment to a record source's change feed.
pub struct ChangeFeed<K, R> {
    /// Events in the exact order the source produced them.
    pub events: EventStream<K, R>,
    /// Release hook for the underlying subscription, if the source
    /// needs one.
    pub on_cancel: Option<CancelHook>,
}

impl<K, R> ChangeFeed<K, R> {
    /// A feed with no release hook.
    pub fn new(events: EventStream<K, R>) -> Self {
        Self {
            events,
            on_cancel: None,
        }
    }

    /// Attach a release hook.
    pub fn with_cancel(mut self, hook: CancelHook) -> Self {
        self.on_cancel = Some(hook);
        self
    }
}

impl<K, R> fmt::Debug for ChangeFeed<K, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("on_cancel", &self.on_cancel.is_some())
            .finish_non_exhaustive()
    }
}

/// A remote store of keyed records: CRUD plus an ordered change feed.
#[async_trait]
pub trait RecordSource: Send + Sync + 'static {
    type Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static;
    type Key: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Fetch records. Options are opaque to the engine.
    async fn list(
        &self,
        options: ListOptions,
    ) -> Result<ListResponse<Self::Record>, SourceError>;

    /// Create one record, returning its (possibly source-assigned) key.
    async fn create(&self, record: Self::Record) -> Result<Self::Key, SourceError>;

    /// Create a batch of records, returning their keys in order.
    async fn create_bulk(
        &self,
        records: Vec<Self::Record>,
    ) -> Result<Vec<Self::Key>, SourceError>;

    /// Apply a field patch to the record under `key`.
    async fn update(&self, key: Self::Key, fields: FieldPatch) -> Result<(), SourceError>;

    /// Delete the record under `key`.
    async fn delete(&self, key: Self::Key) -> Result<(), SourceError>;

    /// Subscribe to changes for one record, or for the whole store when
    /// `key` is `None`. Delivery order must match production order.
    async fn subscribe(
        &self,
        key: Option<Self::Key>,
    ) -> Result<ChangeFeed<Self::Key, Self::Record>, SourceError>;
}
