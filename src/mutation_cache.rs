//! Store of tracked mutations.
//!
//! Mutations do not share a keyed slot: every build appends a new entry, and
//! concurrent mutations with identical keys coexist. Settled, unobserved
//! mutations are retained for their `cache_time` and then dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::key::QueryKey;
use crate::mutation::{Mutation, MutationStatus};
use crate::options::MutationOptions;

/// Lifecycle event emitted by a [`MutationCache`].
#[derive(Debug, Clone)]
pub enum MutationCacheEvent {
    /// A mutation was inserted.
    Added(Arc<Mutation>),
    /// A mutation was dropped.
    Removed(Arc<Mutation>),
    /// A mutation's state changed.
    Updated(Arc<Mutation>),
}

/// Mutation cache event listener.
pub type MutationCacheListener = Arc<dyn Fn(&MutationCacheEvent) + Send + Sync>;

/// Criteria for selecting mutations; all set fields must match (AND).
#[derive(Clone, Default)]
pub struct MutationFilters {
    /// Key to match, with the same prefix semantics as query filters.
    pub mutation_key: Option<QueryKey>,
    /// Require full key equality.
    pub exact: bool,
    /// Match on whether the mutate function is currently running.
    pub fetching: Option<bool>,
    /// Arbitrary predicate.
    pub predicate: Option<Arc<dyn Fn(&Mutation) -> bool + Send + Sync>>,
}

impl MutationFilters {
    /// Filters matching the given key.
    #[must_use]
    pub fn key(key: impl Into<QueryKey>) -> Self {
        Self {
            mutation_key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Require full key equality.
    #[must_use]
    pub fn exact(mut self) -> Self {
        self.exact = true;
        self
    }

    /// Match on running mutations.
    #[must_use]
    pub fn fetching(mut self, fetching: bool) -> Self {
        self.fetching = Some(fetching);
        self
    }

    /// Add an arbitrary predicate.
    #[must_use]
    pub fn predicate(
        mut self,
        predicate: impl Fn(&Mutation) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Whether `mutation` satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, mutation: &Mutation) -> bool {
        if let Some(key) = &self.mutation_key {
            let Some(candidate) = mutation.options().mutation_key else {
                return false;
            };
            if self.exact {
                if key.canonical_hash() != candidate.canonical_hash() {
                    return false;
                }
            } else if !key.is_prefix_of(&candidate) {
                return false;
            }
        }
        if let Some(fetching) = self.fetching {
            let running = mutation.state().status == MutationStatus::Loading;
            if running != fetching {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(mutation) {
                return false;
            }
        }
        true
    }
}

/// Insertion-ordered store of mutations.
pub struct MutationCache {
    mutations: Mutex<Vec<Arc<Mutation>>>,
    next_mutation_id: AtomicU64,
    listeners: Mutex<Vec<(u64, MutationCacheListener)>>,
    next_listener_id: AtomicU64,
}

impl MutationCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mutations: Mutex::new(Vec::new()),
            next_mutation_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        })
    }

    /// Appends a new mutation. Never deduplicates.
    pub(crate) fn build(self: &Arc<Self>, options: MutationOptions) -> Arc<Mutation> {
        let id = self.next_mutation_id.fetch_add(1, Ordering::SeqCst);
        let mutation = Mutation::new(Arc::downgrade(self), id, options);
        self.mutations.lock().push(Arc::clone(&mutation));
        tracing::debug!(mutation_id = id, "mutation added");
        self.notify(&MutationCacheEvent::Added(Arc::clone(&mutation)));
        mutation
    }

    /// Drops a mutation from the store.
    pub fn remove(&self, mutation: &Arc<Mutation>) {
        let removed = {
            let mut mutations = self.mutations.lock();
            let before = mutations.len();
            mutations.retain(|m| !Arc::ptr_eq(m, mutation));
            before > mutations.len()
        };
        if removed {
            mutation.destroy();
            self.notify(&MutationCacheEvent::Removed(Arc::clone(mutation)));
        }
    }

    /// Drops every mutation.
    pub fn clear(&self) {
        crate::notify::batch(|| {
            for mutation in self.get_all() {
                self.remove(&mutation);
            }
        });
    }

    /// All mutations in enqueue order.
    #[must_use]
    pub fn get_all(&self) -> Vec<Arc<Mutation>> {
        self.mutations.lock().clone()
    }

    /// All mutations matching the filters, in enqueue order.
    #[must_use]
    pub fn find_all(&self, filters: &MutationFilters) -> Vec<Arc<Mutation>> {
        self.get_all()
            .into_iter()
            .filter(|mutation| filters.matches(mutation))
            .collect()
    }

    /// Registers a lifecycle listener; returns its id.
    pub fn subscribe(&self, listener: MutationCacheListener) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push((id, listener));
        id
    }

    /// Removes a listener by id.
    pub fn unsubscribe(&self, id: u64) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    pub(crate) fn notify(&self, event: &MutationCacheEvent) {
        let listeners: Vec<MutationCacheListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Re-runs mutations parked by offline state, strictly FIFO by enqueue
    /// order: each paused mutation settles before the next resumes.
    /// Failures are reflected in mutation state, not returned.
    pub async fn resume_paused_mutations(&self) {
        let paused: Vec<Arc<Mutation>> = self
            .get_all()
            .into_iter()
            .filter(|mutation| mutation.is_paused())
            .collect();
        if paused.is_empty() {
            return;
        }
        tracing::debug!(count = paused.len(), "resuming paused mutations");
        for mutation in paused {
            let promise = mutation.inflight_promise();
            mutation.continue_execute();
            if let Some(promise) = promise {
                let _ = promise.await;
            }
        }
    }

    /// Focus/online transition: resume paused mutations in the background.
    pub(crate) fn resume_detached(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let cache = Arc::clone(self);
        handle.spawn(async move {
            cache.resume_paused_mutations().await;
        });
    }

    /// Number of tracked mutations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mutations.lock().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutations.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_never_deduplicates() {
        let cache = MutationCache::new();
        let options = MutationOptions::new().mutation_key("save-todo");
        let first = cache.build(options.clone());
        let second = cache.build(options);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 2);
        assert!(first.mutation_id() < second.mutation_id());
    }

    #[test]
    fn test_find_all_by_key() {
        let cache = MutationCache::new();
        cache.build(MutationOptions::new().mutation_key(json!(["todos", 1])));
        cache.build(MutationOptions::new().mutation_key(json!(["todos", 2])));
        cache.build(MutationOptions::new().mutation_key(json!(["users"])));
        cache.build(MutationOptions::new());

        let todos = cache.find_all(&MutationFilters::key(json!(["todos"])));
        assert_eq!(todos.len(), 2);

        let exact = cache.find_all(&MutationFilters::key(json!(["todos", 1])).exact());
        assert_eq!(exact.len(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = MutationCache::new();
        let mutation = cache.build(MutationOptions::new());
        cache.build(MutationOptions::new());
        cache.remove(&mutation);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_subscribe_receives_events() {
        let cache = MutationCache::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        cache.subscribe(Arc::new(move |event| {
            let label = match event {
                MutationCacheEvent::Added(_) => "added",
                MutationCacheEvent::Removed(_) => "removed",
                MutationCacheEvent::Updated(_) => "updated",
            };
            sink.lock().push(label);
        }));
        let mutation = cache.build(MutationOptions::new());
        cache.remove(&mutation);
        assert_eq!(*events.lock(), vec!["added", "removed"]);
    }
}
