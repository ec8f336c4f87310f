//! Error types for the Tether engine.

use thiserror::Error;

/// Failures reported by a [`RecordSource`](crate::RecordSource) implementation.
///
/// These are the only failures a collaborator can hand the engine; the
/// engine wraps them in [`Error`] with the phase they occurred in.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The source could not be reached or timed out.
    #[error("record source unavailable: {0}")]
    Unavailable(String),

    /// The source understood the request and refused it.
    #[error("record source rejected the request: {0}")]
    Rejected(String),

    /// The change stream errored or closed unexpectedly.
    #[error("change stream failed: {0}")]
    Stream(String),
}

/// All possible errors surfaced by the sync engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The initial `list()` call failed; nothing was committed.
    #[error("initial load failed: {0}")]
    Load(#[source] SourceError),

    /// The change stream failed after streaming started. Applied events
    /// remain in the snapshot; the engine does not reconnect.
    #[error("change stream failed: {0}")]
    Stream(#[source] SourceError),

    /// A forwarded create/update/delete was rejected after the
    /// optimistic apply already committed. The optimistic state is left
    /// in place until a later change event corrects it.
    #[error("mutation rejected by record source: {0}")]
    Mutation(#[source] SourceError),

    /// A local update targeted a key with no record in the snapshot.
    #[error("record not found: {0}")]
    NotFound(String),

    /// The engine was canceled; further local mutations are refused.
    #[error("sync engine is canceled")]
    Canceled,

    /// A record could not be represented as a JSON object for patching.
    #[error("record cannot be patched: {0}")]
    Patch(String),

    /// Record (de)serialization failed while merging or diffing fields.
    #[error("record serialization failed: {0}")]
    Codec(#[from] serde_json::Error),

    /// The background driver task terminated abnormally.
    #[error("sync driver task failed: {0}")]
    Driver(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
