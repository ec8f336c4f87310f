//! # Tether Engine
//!
//! A synchronized local collection engine: keeps an in-memory keyed
//! collection consistent with a remote record store.
//!
//! The engine combines three inputs over one snapshot:
//!
//! - an initial bulk `list()` that seeds the collection as a single
//!   atomic batch,
//! - a live change-event subscription whose events are applied one
//!   transaction at a time, in arrival order,
//! - optimistic local mutations that commit immediately and are
//!   forwarded upstream, later confirmed (or corrected) by the same
//!   change stream.
//!
//! ## Design Principles
//!
//! - **Two writers, one snapshot**: the event loop and local mutation
//!   calls are the only mutation entry points. Their interleavings are
//!   safe because every event application is an idempotent, total
//!   operation wrapped in its own transaction.
//! - **No policy**: no retries, no reconnects, no rollback of failed
//!   optimistic writes. Failures surface to the caller; policy belongs
//!   there or in the record source.
//! - **Cooperative cancellation**: reading the next event is the only
//!   suspension point, cancellation is observed there, and the
//!   underlying subscription is released exactly once on every exit
//!   path.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_engine::{SyncConfig, SyncedCollection};
//!
//! let config = SyncConfig::new(Arc::new(source), |todo: &Todo| todo.id);
//! let synced = SyncedCollection::start(config).await?;
//!
//! synced.insert(Todo { id: 42, text: "ship it".into() }).await?;
//! assert!(synced.collection().contains(&42));
//!
//! synced.cancel(); // idempotent; snapshot contents are retained
//! ```
//!
//! The remote store is abstracted as a [`RecordSource`]: CRUD plus an
//! ordered, cancelable [`ChangeFeed`]. See the `tether-memory` crate
//! for an in-memory implementation.

pub mod collection;
pub mod engine;
pub mod error;
pub mod event;
pub mod record;
pub mod source;
pub mod stream;

// Re-export main types at crate root
pub use collection::Collection;
pub use engine::{SyncConfig, SyncState, SyncedCollection};
pub use error::{Error, Result, SourceError};
pub use event::{ChangeEvent, UpdatePayload};
pub use record::{changed_fields, merge_fields, FieldPatch, KeyFn};
pub use source::{
    CancelHook, ChangeFeed, EventStream, ListOptions, ListResponse, Pagination, RecordSource,
};
pub use stream::{CancelToken, ChangeStreamReader};
