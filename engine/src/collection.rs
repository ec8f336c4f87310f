//! The collection facade - the reactive keyed container the engine
//! writes into and downstream consumers observe.
//!
//! All writes go through begin/commit batches so observers never see a
//! partially applied transaction. The write surface is crate-private:
//! the only mutation entry points are the engine's event loop and its
//! local mutation calls.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;

struct Inner<K, R> {
    state: RwLock<HashMap<K, R>>,
    version: watch::Sender<u64>,
}

/// A shared, observable keyed snapshot of records.
///
/// Clones are cheap and share state.
pub struct Collection<K, R> {
    inner: Arc<Inner<K, R>>,
}

impl<K, R> Clone for Collection<K, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, R> Default for Collection<K, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, R> Collection<K, R> {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(HashMap::new()),
                version,
            }),
        }
    }

    /// Number of committed transactions so far.
    pub fn version(&self) -> u64 {
        *self.inner.version.borrow()
    }

    /// Observe commits. The receiver yields the version after each
    /// committed transaction, coalescing under load.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }
}

impl<K, R> Collection<K, R>
where
    K: Eq + Hash + Clone,
    R: Clone,
{
    pub fn get(&self, key: &K) -> Option<R> {
        self.inner.state.read().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.state.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.read().is_empty()
    }

    /// Clone out the full keyed state.
    pub fn snapshot(&self) -> HashMap<K, R> {
        self.inner.state.read().clone()
    }

    /// Open a write batch. Staged writes become visible all at once on
    /// [`Batch::commit`].
    pub(crate) fn begin(&self) -> Batch<K, R> {
        Batch {
            collection: self.clone(),
            ops: Vec::new(),
        }
    }
}

enum BatchOp<K, R> {
    Upsert(K, R),
    Remove(K),
}

/// A staged transaction against a [`Collection`].
pub(crate) struct Batch<K, R> {
    collection: Collection<K, R>,
    ops: Vec<BatchOp<K, R>>,
}

impl<K, R> Batch<K, R>
where
    K: Eq + Hash + Clone,
    R: Clone,
{
    /// Stage an insert-or-replace under `key`.
    pub(crate) fn upsert(&mut self, key: K, record: R) {
        self.ops.push(BatchOp::Upsert(key, record));
    }

    /// Stage a removal. Removing an absent key is a no-op at commit.
    pub(crate) fn remove(&mut self, key: K) {
        self.ops.push(BatchOp::Remove(key));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply all staged writes under one write lock and notify
    /// observers once.
    pub(crate) fn commit(self) {
        {
            let mut state = self.collection.inner.state.write();
            for op in self.ops {
                match op {
                    BatchOp::Upsert(key, record) => {
                        state.insert(key, record);
                    }
                    BatchOp::Remove(key) => {
                        state.remove(&key);
                    }
                }
            }
        }
        self.collection
            .inner
            .version
            .send_modify(|version| *version += 1);
    }
}
