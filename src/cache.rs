//! Keyed store of queries.
//!
//! The cache owns every [`Query`] for its lifetime, keyed by canonical hash.
//! At most one query exists per hash; building an existing hash returns the
//! same entry. Lifecycle transitions emit [`QueryCacheEvent`]s to subscribed
//! listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::QueryError;
use crate::key::QueryKey;
use crate::notify;
use crate::options::QueryOptions;
use crate::query::{Query, QueryState};

/// Lifecycle event emitted by a [`QueryCache`].
#[derive(Debug, Clone)]
pub enum QueryCacheEvent {
    /// A query was inserted.
    Added(Arc<Query>),
    /// A query was detached and destroyed.
    Removed(Arc<Query>),
    /// A query's state changed.
    Updated(Arc<Query>),
}

impl QueryCacheEvent {
    /// The query this event concerns.
    #[must_use]
    pub fn query(&self) -> &Arc<Query> {
        match self {
            Self::Added(query) | Self::Removed(query) | Self::Updated(query) => query,
        }
    }
}

/// Cache event listener.
pub type CacheListener = Arc<dyn Fn(&QueryCacheEvent) + Send + Sync>;

/// Criteria for selecting queries; all set fields must match (AND).
#[derive(Clone, Default)]
pub struct QueryFilters {
    /// Key to match. Without `exact`, array keys match at a prefix with deep
    /// partial equality for map elements.
    pub query_key: Option<QueryKey>,
    /// Require full key equality (by canonical hash).
    pub exact: bool,
    /// `Some(true)`: only queries with an enabled observer; `Some(false)`:
    /// only queries without one.
    pub active: Option<bool>,
    /// Match on staleness.
    pub stale: Option<bool>,
    /// Match on whether a fetch is in flight.
    pub fetching: Option<bool>,
    /// Arbitrary predicate.
    pub predicate: Option<Arc<dyn Fn(&Query) -> bool + Send + Sync>>,
}

impl QueryFilters {
    /// Filters matching the given key (prefix semantics unless
    /// [`exact`](Self::exact) is set).
    #[must_use]
    pub fn key(key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Require full key equality.
    #[must_use]
    pub fn exact(mut self) -> Self {
        self.exact = true;
        self
    }

    /// Match only (in)active queries.
    #[must_use]
    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    /// Match on staleness.
    #[must_use]
    pub fn stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    /// Match on in-flight fetches.
    #[must_use]
    pub fn fetching(mut self, fetching: bool) -> Self {
        self.fetching = Some(fetching);
        self
    }

    /// Add an arbitrary predicate.
    #[must_use]
    pub fn predicate(mut self, predicate: impl Fn(&Query) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Whether `query` satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, query: &Query) -> bool {
        if let Some(key) = &self.query_key {
            if self.exact {
                if key.canonical_hash() != query.query_hash() {
                    return false;
                }
            } else if !key.is_prefix_of(query.query_key()) {
                return false;
            }
        }
        if let Some(active) = self.active {
            if query.is_active() != active {
                return false;
            }
        }
        if let Some(stale) = self.stale {
            if query.is_stale() != stale {
                return false;
            }
        }
        if let Some(fetching) = self.fetching {
            if query.is_fetching() != fetching {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(query) {
                return false;
            }
        }
        true
    }
}

/// The keyed store: canonical hash → [`Query`].
pub struct QueryCache {
    queries: DashMap<String, Arc<Query>>,
    // insertion order of hashes, for deterministic iteration
    order: Mutex<Vec<String>>,
    listeners: Mutex<Vec<(u64, CacheListener)>>,
    next_listener_id: AtomicU64,
}

impl QueryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queries: DashMap::new(),
            order: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        })
    }

    /// Returns the query for `options.query_key`, creating it if absent.
    /// Existing entries absorb the new options.
    pub(crate) fn build(
        self: &Arc<Self>,
        options: QueryOptions,
        state: Option<QueryState>,
    ) -> Result<Arc<Query>, QueryError> {
        let Some(key) = options.query_key.clone() else {
            return Err(QueryError::MissingQueryKey);
        };
        let hash = key.canonical_hash();

        let created = match self.queries.entry(hash.clone()) {
            Entry::Occupied(entry) => {
                let query = Arc::clone(entry.get());
                drop(entry);
                query.set_options(&options);
                return Ok(query);
            }
            Entry::Vacant(entry) => {
                let query = Query::new(Arc::downgrade(self), key, hash.clone(), options, state);
                entry.insert(Arc::clone(&query));
                query
            }
        };

        self.order.lock().push(hash);
        created.schedule_gc();
        tracing::debug!(hash = %created.query_hash(), "query added");
        self.notify(&QueryCacheEvent::Added(Arc::clone(&created)));
        Ok(created)
    }

    /// Looks up a query by canonical hash.
    #[must_use]
    pub fn get(&self, query_hash: &str) -> Option<Arc<Query>> {
        self.queries
            .get(query_hash)
            .map(|entry| Arc::clone(&entry))
    }

    /// All queries in insertion order.
    #[must_use]
    pub fn get_all(&self) -> Vec<Arc<Query>> {
        let order = self.order.lock().clone();
        order
            .iter()
            .filter_map(|hash| self.get(hash))
            .collect()
    }

    /// Finds the query with exactly this key.
    #[must_use]
    pub fn find(&self, key: impl Into<QueryKey>) -> Option<Arc<Query>> {
        self.get(&key.into().canonical_hash())
    }

    /// All queries matching the filters, in insertion order.
    #[must_use]
    pub fn find_all(&self, filters: &QueryFilters) -> Vec<Arc<Query>> {
        self.get_all()
            .into_iter()
            .filter(|query| filters.matches(query))
            .collect()
    }

    /// Detaches and destroys a query. No-op if the entry was already
    /// replaced or removed.
    pub fn remove(&self, query: &Arc<Query>) {
        let removed = self
            .queries
            .remove_if(query.query_hash(), |_, current| Arc::ptr_eq(current, query));
        if removed.is_some() {
            self.order.lock().retain(|hash| hash != query.query_hash());
            query.destroy();
            self.notify(&QueryCacheEvent::Removed(Arc::clone(query)));
        }
    }

    /// Removes every query.
    pub fn clear(&self) {
        notify::batch(|| {
            for query in self.get_all() {
                self.remove(&query);
            }
        });
    }

    /// Registers a lifecycle listener; returns its id for
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, listener: CacheListener) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push((id, listener));
        id
    }

    /// Removes a listener by id.
    pub fn unsubscribe(&self, id: u64) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    pub(crate) fn notify(&self, event: &QueryCacheEvent) {
        let listeners: Vec<CacheListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Window regained focus: give each query a chance to revalidate.
    pub fn on_focus(&self) {
        notify::batch(|| {
            for query in self.get_all() {
                query.on_focus();
            }
        });
    }

    /// Connectivity returned: give each query a chance to revalidate.
    pub fn on_online(&self) {
        notify::batch(|| {
            for query in self.get_all() {
                query.on_online();
            }
        });
    }

    /// Number of cached queries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_build_deduplicates_by_hash() {
        let cache = QueryCache::new();
        let first = cache
            .build(QueryOptions::new("todos"), None)
            .expect("build");
        let second = cache
            .build(QueryOptions::new("todos"), None)
            .expect("build");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_build_requires_key() {
        let cache = QueryCache::new();
        let error = cache
            .build(QueryOptions::default(), None)
            .expect_err("no key");
        assert_eq!(error, QueryError::MissingQueryKey);
    }

    #[test]
    fn test_equivalent_keys_collide() {
        let cache = QueryCache::new();
        let a = cache
            .build(
                QueryOptions::new(json!(["todos", {"page": 1, "done": true}])),
                None,
            )
            .expect("build");
        let b = cache
            .build(
                QueryOptions::new(json!(["todos", {"done": true, "page": 1}])),
                None,
            )
            .expect("build");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_find_is_exact() {
        let cache = QueryCache::new();
        cache
            .build(QueryOptions::new(json!(["todos", 1])), None)
            .expect("build");
        assert!(cache.find(json!(["todos", 1])).is_some());
        assert!(cache.find(json!(["todos"])).is_none());
    }

    #[test]
    fn test_find_all_prefix_matching() {
        let cache = QueryCache::new();
        cache
            .build(QueryOptions::new(json!(["todos", 1])), None)
            .expect("build");
        cache
            .build(QueryOptions::new(json!(["todos", 2])), None)
            .expect("build");
        cache
            .build(QueryOptions::new(json!(["users"])), None)
            .expect("build");

        let todos = cache.find_all(&QueryFilters::key(json!(["todos"])));
        assert_eq!(todos.len(), 2);

        let exact = cache.find_all(&QueryFilters::key(json!(["todos", 1])).exact());
        assert_eq!(exact.len(), 1);
    }

    #[test]
    fn test_remove_ignores_replaced_entries() {
        let cache = QueryCache::new();
        let query = cache.build(QueryOptions::new("a"), None).expect("build");
        cache.remove(&query);
        assert!(cache.is_empty());

        // Removing again is a no-op.
        cache.remove(&query);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_subscribe_receives_lifecycle_events() {
        let cache = QueryCache::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let id = cache.subscribe(Arc::new(move |event| {
            let label = match event {
                QueryCacheEvent::Added(_) => "added",
                QueryCacheEvent::Removed(_) => "removed",
                QueryCacheEvent::Updated(_) => "updated",
            };
            sink.lock().push(label);
        }));

        let query = cache.build(QueryOptions::new("a"), None).expect("build");
        cache.remove(&query);
        cache.unsubscribe(id);
        cache.build(QueryOptions::new("b"), None).expect("build");

        assert_eq!(*events.lock(), vec!["added", "removed"]);
    }

    #[test]
    fn test_clear_removes_everything() {
        let cache = QueryCache::new();
        cache.build(QueryOptions::new("a"), None).expect("build");
        cache.build(QueryOptions::new("b"), None).expect("build");
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get_all().is_empty());
    }

    #[test]
    fn test_filters_on_state() {
        let cache = QueryCache::new();
        cache.build(QueryOptions::new("a"), None).expect("build");

        // A never-fetched query is stale and not fetching.
        assert_eq!(cache.find_all(&QueryFilters::default().stale(true)).len(), 1);
        assert_eq!(
            cache.find_all(&QueryFilters::default().fetching(true)).len(),
            0
        );
        assert_eq!(
            cache
                .find_all(&QueryFilters::default().predicate(|q| q.query_hash() == "\"a\""))
                .len(),
            1
        );
    }
}
