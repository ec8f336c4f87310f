//! Change stream reader and cancellation plumbing.
//!
//! The reader wraps the record source's change feed. Reading the next
//! event is the engine's sole suspension point, and the point at which
//! cancellation is observed. The underlying subscription is released
//! exactly once on every exit path: explicit cancel, natural
//! end-of-stream, or drop.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::SourceError;
use crate::event::ChangeEvent;
use crate::source::{CancelHook, ChangeFeed, EventStream};

struct CancelInner {
    flag: watch::Sender<bool>,
    hook: Mutex<Option<CancelHook>>,
}

/// Cancellation capability for one change feed attachment.
///
/// Clones share the same state. `cancel` is idempotent: the first call
/// flips the flag and runs the release hook; every later call is a
/// silent no-op.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            inner: Arc::new(CancelInner {
                flag,
                hook: Mutex::new(None),
            }),
        }
    }

    /// Store the release hook for the underlying subscription.
    pub(crate) fn set_hook(&self, hook: Option<CancelHook>) {
        *self.inner.hook.lock() = hook;
    }

    /// Cancel the attachment. Returns `true` only for the call that
    /// actually performed the cancellation.
    pub fn cancel(&self) -> bool {
        let was_canceled = self.inner.flag.send_replace(true);
        self.release();
        !was_canceled
    }

    /// Run the release hook if it has not run yet. Taking it under the
    /// lock guarantees at-most-once invocation across cancel and drop.
    pub(crate) fn release(&self) {
        let hook = self.inner.hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn is_canceled(&self) -> bool {
        *self.inner.flag.borrow()
    }

    /// Resolve once the token is canceled.
    pub async fn canceled(&self) {
        let mut rx = self.inner.flag.subscribe();
        // wait_for checks the current value first, so a cancel that
        // happened before this call still resolves immediately.
        let _ = rx.wait_for(|canceled| *canceled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumes a record source change feed in production order.
pub struct ChangeStreamReader<K, R> {
    events: EventStream<K, R>,
    token: CancelToken,
}

impl<K, R> ChangeStreamReader<K, R> {
    /// Attach to a feed. The feed's release hook moves into the token
    /// so cancel and drop funnel through the same at-most-once path.
    pub fn new(feed: ChangeFeed<K, R>, token: CancelToken) -> Self {
        token.set_hook(feed.on_cancel);
        Self {
            events: feed.events,
            token,
        }
    }

    /// Read the next event, or `None` on end-of-stream or cancellation.
    ///
    /// This is the sole suspension point of the event loop. A cancel
    /// that lands while a read is in flight abandons the read.
    pub async fn next(&mut self) -> Option<Result<ChangeEvent<K, R>, SourceError>> {
        if self.token.is_canceled() {
            return None;
        }

        tokio::select! {
            biased;
            _ = self.token.canceled() => None,
            event = self.events.next() => event,
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }
}

impl<K, R> Drop for ChangeStreamReader<K, R> {
    fn drop(&mut self) {
        // Covers natural completion: the subscription is released even
        // when nobody called cancel.
        self.token.release();
    }
}
