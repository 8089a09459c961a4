//! Keyed registry of live change-feed subscriptions.
//!
//! At most one subscription exists per [`SubscriptionKey`]. Acquiring a held
//! key tears the old one down first, and a guard only releases the
//! subscription it created, so a stale guard dropped late cannot cancel its
//! replacement.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::backend::{Backend, BackendError, FeedItem, Filter};
use crate::event::UserId;
use crate::model::Table;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub user: UserId,
    pub table: Table,
    pub purpose: &'static str,
}

impl SubscriptionKey {
    #[must_use]
    pub fn new(user: UserId, table: Table, purpose: &'static str) -> Self {
        Self { user, table, purpose }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.user, self.table, self.purpose)
    }
}

struct Slot {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    slots: Mutex<HashMap<SubscriptionKey, Slot>>,
    next_generation: AtomicU64,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<SubscriptionKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, key: &SubscriptionKey, generation: u64) {
        let mut slots = self.slots();
        if slots.get(key).is_some_and(|slot| slot.generation == generation) {
            if let Some(slot) = slots.remove(key) {
                slot.task.abort();
                debug!(%key, "subscription released");
            }
        } else {
            trace!(%key, generation, "stale guard dropped");
        }
    }
}

#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Inner>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a feed for `key` and forwards every item to `on_item` from a
    /// spawned task. Must be called inside a Tokio runtime.
    pub fn acquire<B, F>(
        &self,
        backend: &B,
        key: SubscriptionKey,
        filter: Option<Filter>,
        mut on_item: F,
    ) -> Result<SubscriptionGuard, BackendError>
    where
        B: Backend + ?Sized,
        F: FnMut(FeedItem) + Send + 'static,
    {
        if let Some(previous) = self.inner.slots().remove(&key) {
            previous.task.abort();
            debug!(%key, "replacing subscription");
        }

        let mut feed = backend.subscribe(key.table, filter)?;
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            while let Some(item) = feed.recv().await {
                on_item(item);
            }
            debug!(key = %task_key, "change feed closed");
        });

        // A concurrent acquire for the same key may have slipped in.
        if let Some(raced) = self.inner.slots().insert(key.clone(), Slot { generation, task }) {
            raced.task.abort();
        }
        debug!(%key, generation, "subscription acquired");

        Ok(SubscriptionGuard {
            inner: Arc::clone(&self.inner),
            key,
            generation,
        })
    }

    pub fn cancel(&self, key: &SubscriptionKey) -> bool {
        match self.inner.slots().remove(key) {
            Some(slot) => {
                slot.task.abort();
                true
            }
            None => false,
        }
    }

    /// Tears down every subscription. Returns how many were live.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.inner.slots().drain().collect();
        for (key, slot) in &drained {
            slot.task.abort();
            trace!(%key, "subscription cancelled");
        }
        drained.len()
    }

    #[must_use]
    pub fn is_active(&self, key: &SubscriptionKey) -> bool {
        self.inner
            .slots()
            .get(key)
            .is_some_and(|slot| !slot.task.is_finished())
    }

    #[must_use]
    pub fn active(&self) -> Vec<SubscriptionKey> {
        self.inner
            .slots()
            .iter()
            .filter(|(_, slot)| !slot.task.is_finished())
            .map(|(key, _)| key.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.slots().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its subscription on drop, unless it has since been replaced.
#[must_use = "dropping the guard cancels the subscription"]
pub struct SubscriptionGuard {
    inner: Arc<Inner>,
    key: SubscriptionKey,
    generation: u64,
}

impl SubscriptionGuard {
    #[must_use]
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }
}

impl fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.inner.release(&self.key, self.generation);
    }
}
