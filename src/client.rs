//! The client facade.
//!
//! A [`QueryClient`] aggregates a query cache and a mutation cache and
//! exposes the consumer-facing operations: fetch, prefetch, read and write
//! cached data, invalidate, cancel, refetch, observe, mutate, and defaults
//! management. The client is cheap to clone; clones share the same caches.
//!
//! # Example
//!
//! ```rust,ignore
//! use freshet::{QueryClient, QueryOptions};
//!
//! let client = QueryClient::new();
//! client.mount();
//!
//! let user = client
//!     .fetch_query_data(
//!         QueryOptions::new("user-123").query_fn(|| async { fetch_user().await }),
//!     )
//!     .await?;
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::bus::{self, FocusManager, OnlineManager};
use crate::cache::{QueryCache, QueryFilters};
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::mutation_cache::MutationCache;
use crate::mutation_observer::MutationObserver;
use crate::notify;
use crate::observer::QueryObserver;
use crate::options::{DefaultOptions, MutationOptions, QueryOptions};
use crate::queries_observer::QueriesObserver;
use crate::query::QueryState;
use crate::retry::{CancelOptions, FetchPromise, RetryPolicy};

/// How `invalidate_queries` refetches after marking entries stale.
#[derive(Debug, Clone, Copy)]
pub struct InvalidateOptions {
    /// Refetch matching queries that have an enabled observer.
    pub refetch_active: bool,
    /// Refetch matching queries without one.
    pub refetch_inactive: bool,
}

impl Default for InvalidateOptions {
    fn default() -> Self {
        Self {
            refetch_active: true,
            refetch_inactive: false,
        }
    }
}

struct ClientInner {
    query_cache: Arc<QueryCache>,
    mutation_cache: Arc<MutationCache>,
    default_options: Mutex<DefaultOptions>,
    query_defaults: Mutex<Vec<(QueryKey, QueryOptions)>>,
    mutation_defaults: Mutex<Vec<(QueryKey, MutationOptions)>>,
    focus_subscription: Mutex<Option<u64>>,
    online_subscription: Mutex<Option<u64>>,
}

/// Entry point to the cache: the consumer-facing API surface.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    /// Creates a client with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::with_default_options(DefaultOptions::default())
    }

    /// Creates a client with the given defaults for queries and mutations.
    #[must_use]
    pub fn with_default_options(default_options: DefaultOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                query_cache: QueryCache::new(),
                mutation_cache: MutationCache::new(),
                default_options: Mutex::new(default_options),
                query_defaults: Mutex::new(Vec::new()),
                mutation_defaults: Mutex::new(Vec::new()),
                focus_subscription: Mutex::new(None),
                online_subscription: Mutex::new(None),
            }),
        }
    }

    /// The query cache.
    #[must_use]
    pub fn query_cache(&self) -> &Arc<QueryCache> {
        &self.inner.query_cache
    }

    /// The mutation cache.
    #[must_use]
    pub fn mutation_cache(&self) -> &Arc<MutationCache> {
        &self.inner.mutation_cache
    }

    /// Registers with the focus/online bus so the caches revalidate on
    /// visibility and connectivity transitions. Idempotent.
    pub fn mount(&self) {
        {
            let mut subscription = self.inner.focus_subscription.lock();
            if subscription.is_none() {
                let client = self.clone();
                *subscription = Some(FocusManager::global().subscribe(Arc::new(move |focused| {
                    if focused && bus::is_visible_and_online() {
                        client.inner.mutation_cache.resume_detached();
                        client.inner.query_cache.on_focus();
                    }
                })));
            }
        }
        let mut subscription = self.inner.online_subscription.lock();
        if subscription.is_none() {
            let client = self.clone();
            *subscription = Some(OnlineManager::global().subscribe(Arc::new(move |online| {
                if online && bus::is_visible_and_online() {
                    client.inner.mutation_cache.resume_detached();
                    client.inner.query_cache.on_online();
                }
            })));
        }
    }

    /// Unregisters from the focus/online bus. Idempotent.
    pub fn unmount(&self) {
        if let Some(id) = self.inner.focus_subscription.lock().take() {
            FocusManager::global().unsubscribe(id);
        }
        if let Some(id) = self.inner.online_subscription.lock().take() {
            OnlineManager::global().unsubscribe(id);
        }
    }

    /// Fetches a query and returns its settled data, serving fresh cached
    /// data without a fetch.
    ///
    /// Unlike observer-driven fetches, `retry` defaults to
    /// [`RetryPolicy::Never`] here, so explicit fetches cannot hang across
    /// long backoff schedules unless the caller opts in.
    ///
    /// # Errors
    ///
    /// [`QueryError::MissingQueryKey`] / [`QueryError::MissingQueryFn`] for
    /// incomplete options, otherwise whatever the fetch settles with.
    pub async fn fetch_query_data(&self, options: QueryOptions) -> Result<Arc<Value>, QueryError> {
        let mut defaulted = self.defaulted_query_options(&options);
        if defaulted.retry.is_none() {
            defaulted.retry = Some(RetryPolicy::Never);
        }
        let query = self.inner.query_cache.build(defaulted.clone(), None)?;
        if !query.is_stale_by_time(defaulted.resolved_stale_time()) {
            if let Some(data) = query.state().data {
                return Ok(data);
            }
        }
        query.fetch(Some(&defaulted)).await
    }

    /// Like [`fetch_query_data`](Self::fetch_query_data), but swallows the
    /// outcome. Used to warm the cache ahead of rendering.
    pub async fn prefetch_query(&self, options: QueryOptions) {
        if let Err(error) = self.fetch_query_data(options).await {
            tracing::debug!(%error, "prefetch error swallowed");
        }
    }

    /// Cached data for the exact key, if any.
    #[must_use]
    pub fn get_query_data(&self, key: impl Into<QueryKey>) -> Option<Arc<Value>> {
        self.inner
            .query_cache
            .find(key)
            .and_then(|query| query.state().data)
    }

    /// Full state for the exact key, if the query exists.
    #[must_use]
    pub fn get_query_state(&self, key: impl Into<QueryKey>) -> Option<QueryState> {
        self.inner.query_cache.find(key).map(|query| query.state())
    }

    /// Writes data for a key, creating the query if needed. The entry
    /// transitions to `Success` and observers are notified.
    ///
    /// # Errors
    ///
    /// Never fails for a valid key; surfaces cache build errors.
    pub fn set_query_data(
        &self,
        key: impl Into<QueryKey>,
        data: Value,
    ) -> Result<Arc<Value>, QueryError> {
        self.set_query_data_with_updated_at(key, data, None)
    }

    /// Like [`set_query_data`](Self::set_query_data), with an explicit
    /// timestamp (which never lowers the entry's `updated_at`).
    pub fn set_query_data_with_updated_at(
        &self,
        key: impl Into<QueryKey>,
        data: Value,
        updated_at: Option<u64>,
    ) -> Result<Arc<Value>, QueryError> {
        let options = self.defaulted_query_options(&QueryOptions::new(key));
        let query = self.inner.query_cache.build(options, None)?;
        Ok(query.set_data(data, updated_at))
    }

    /// Updates data for a key from its current value.
    pub fn update_query_data(
        &self,
        key: impl Into<QueryKey>,
        updater: impl FnOnce(Option<&Value>) -> Value,
    ) -> Result<Arc<Value>, QueryError> {
        let options = self.defaulted_query_options(&QueryOptions::new(key));
        let query = self.inner.query_cache.build(options, None)?;
        let current = query.state().data;
        let next = updater(current.as_deref());
        Ok(query.set_data(next, None))
    }

    /// Removes matching queries from the cache.
    pub fn remove_queries(&self, filters: &QueryFilters) {
        notify::batch(|| {
            for query in self.inner.query_cache.find_all(filters) {
                self.inner.query_cache.remove(&query);
            }
        });
    }

    /// Cancels in-flight fetches of matching queries and waits for them to
    /// settle. By default state reverts to the pre-fetch snapshot.
    pub async fn cancel_queries(&self, filters: &QueryFilters, options: CancelOptions) {
        let promises: Vec<FetchPromise> = notify::batch(|| {
            self.inner
                .query_cache
                .find_all(filters)
                .into_iter()
                .filter_map(|query| {
                    let promise = query.inflight_promise();
                    query.cancel(options);
                    promise
                })
                .collect()
        });
        for promise in promises {
            let _ = promise.await;
        }
    }

    /// Marks matching queries stale and, by default, refetches the active
    /// ones, resolving when those fetches settle.
    pub async fn invalidate_queries(&self, filters: &QueryFilters, options: InvalidateOptions) {
        notify::batch(|| {
            for query in self.inner.query_cache.find_all(filters) {
                query.invalidate();
            }
        });

        let active = match (options.refetch_active, options.refetch_inactive) {
            (true, true) => None,
            (true, false) => Some(true),
            (false, true) => Some(false),
            (false, false) => return,
        };
        let mut refetch_filters = filters.clone();
        refetch_filters.active = active;
        self.refetch_queries(&refetch_filters).await;
    }

    /// Refetches matching queries, resolving when all of them settle.
    /// Fetch errors stay in query state.
    pub async fn refetch_queries(&self, filters: &QueryFilters) {
        let promises: Vec<FetchPromise> = notify::batch(|| {
            self.inner
                .query_cache
                .find_all(filters)
                .into_iter()
                .map(|query| query.fetch(None))
                .collect()
        });
        for promise in promises {
            let _ = promise.await;
        }
    }

    /// Creates an observer for one query.
    ///
    /// # Errors
    ///
    /// [`QueryError::MissingQueryKey`] when the options carry no key.
    pub fn watch_query(&self, options: QueryOptions) -> Result<Arc<QueryObserver>, QueryError> {
        QueryObserver::new(self, options)
    }

    /// Creates a fan-out observer over an ordered list of queries.
    pub fn watch_queries(
        &self,
        queries: Vec<QueryOptions>,
    ) -> Result<Arc<QueriesObserver>, QueryError> {
        QueriesObserver::new(self, queries)
    }

    /// Creates an observer for mutations started through it.
    #[must_use]
    pub fn watch_mutation(&self, options: MutationOptions) -> Arc<MutationObserver> {
        MutationObserver::new(self, options)
    }

    /// Builds and executes a mutation.
    ///
    /// # Errors
    ///
    /// [`QueryError::MissingMutationFn`] for incomplete options, otherwise
    /// whatever the mutation settles with.
    pub async fn mutate(
        &self,
        options: MutationOptions,
        variables: Value,
    ) -> Result<Arc<Value>, QueryError> {
        let defaulted = self.defaulted_mutation_options(&options);
        let mutation = self.inner.mutation_cache.build(defaulted);
        mutation.execute(variables).await
    }

    /// Re-runs mutations parked by offline state, FIFO by enqueue order.
    pub async fn resume_paused_mutations(&self) {
        self.inner.mutation_cache.resume_paused_mutations().await;
    }

    /// Replaces the client-wide defaults.
    pub fn set_default_options(&self, options: DefaultOptions) {
        *self.inner.default_options.lock() = options;
    }

    /// Snapshot of the client-wide defaults.
    #[must_use]
    pub fn default_options(&self) -> DefaultOptions {
        self.inner.default_options.lock().clone()
    }

    /// Registers defaults for all queries whose key matches `key` at a
    /// prefix. Re-registering the same key replaces the entry.
    pub fn set_query_defaults(&self, key: impl Into<QueryKey>, options: QueryOptions) {
        let key = key.into();
        let mut defaults = self.inner.query_defaults.lock();
        if let Some(entry) = defaults
            .iter_mut()
            .find(|(existing, _)| existing.canonical_hash() == key.canonical_hash())
        {
            entry.1 = options;
        } else {
            defaults.push((key, options));
        }
    }

    /// Defaults for the first registered key matching `key` at a prefix.
    #[must_use]
    pub fn get_query_defaults(&self, key: &QueryKey) -> Option<QueryOptions> {
        self.inner
            .query_defaults
            .lock()
            .iter()
            .find(|(registered, _)| registered.is_prefix_of(key))
            .map(|(_, options)| options.clone())
    }

    /// Registers defaults for mutations whose key matches `key` at a prefix.
    pub fn set_mutation_defaults(&self, key: impl Into<QueryKey>, options: MutationOptions) {
        let key = key.into();
        let mut defaults = self.inner.mutation_defaults.lock();
        if let Some(entry) = defaults
            .iter_mut()
            .find(|(existing, _)| existing.canonical_hash() == key.canonical_hash())
        {
            entry.1 = options;
        } else {
            defaults.push((key, options));
        }
    }

    /// Defaults for the first registered mutation key matching at a prefix.
    #[must_use]
    pub fn get_mutation_defaults(&self, key: &QueryKey) -> Option<MutationOptions> {
        self.inner
            .mutation_defaults
            .lock()
            .iter()
            .find(|(registered, _)| registered.is_prefix_of(key))
            .map(|(_, options)| options.clone())
    }

    /// Empties both caches.
    pub fn clear(&self) {
        notify::batch(|| {
            self.inner.query_cache.clear();
            self.inner.mutation_cache.clear();
        });
    }

    /// Resolves the effective options for a query: explicit values, then
    /// key-matched defaults, then client defaults.
    pub(crate) fn defaulted_query_options(&self, options: &QueryOptions) -> QueryOptions {
        let mut merged = options.clone();
        if let Some(key) = &options.query_key {
            if let Some(key_defaults) = self.get_query_defaults(key) {
                merged = merged.merged_over(&key_defaults);
            }
        }
        merged.merged_over(&self.inner.default_options.lock().queries)
    }

    /// Resolves the effective options for a mutation.
    pub(crate) fn defaulted_mutation_options(&self, options: &MutationOptions) -> MutationOptions {
        let mut merged = options.clone();
        if let Some(key) = &options.mutation_key {
            if let Some(key_defaults) = self.get_mutation_defaults(key) {
                merged = merged.merged_over(&key_defaults);
            }
        }
        merged.merged_over(&self.inner.default_options.lock().mutations)
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("queries", &self.inner.query_cache.len())
            .field("mutations", &self.inner.mutation_cache.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_query_defaults_first_partial_match_wins() {
        let client = QueryClient::new();
        client.set_query_defaults(
            json!(["todos"]),
            QueryOptions::default().stale_time(Duration::from_secs(10)),
        );
        client.set_query_defaults(
            json!(["todos", 1]),
            QueryOptions::default().stale_time(Duration::from_secs(99)),
        );

        let key = QueryKey::from(json!(["todos", 1]));
        let defaults = client.get_query_defaults(&key).expect("match");
        assert_eq!(defaults.resolved_stale_time(), Duration::from_secs(10));
    }

    #[test]
    fn test_defaulted_options_layering() {
        let client = QueryClient::with_default_options(DefaultOptions {
            queries: QueryOptions::default()
                .stale_time(Duration::from_secs(1))
                .cache_time(Duration::from_secs(2)),
            mutations: MutationOptions::default(),
        });
        client.set_query_defaults(
            "todos",
            QueryOptions::default().stale_time(Duration::from_secs(30)),
        );

        let resolved = client.defaulted_query_options(&QueryOptions::new("todos"));
        // key defaults beat client defaults; client defaults fill the rest
        assert_eq!(resolved.resolved_stale_time(), Duration::from_secs(30));
        assert_eq!(resolved.resolved_cache_time(), Duration::from_secs(2));
    }

    #[test]
    fn test_set_query_defaults_replaces_same_key() {
        let client = QueryClient::new();
        client.set_query_defaults(
            "todos",
            QueryOptions::default().stale_time(Duration::from_secs(1)),
        );
        client.set_query_defaults(
            "todos",
            QueryOptions::default().stale_time(Duration::from_secs(2)),
        );
        let key = QueryKey::from("todos");
        let defaults = client.get_query_defaults(&key).expect("match");
        assert_eq!(defaults.resolved_stale_time(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_set_and_get_query_data() {
        let client = QueryClient::new();
        assert!(client.get_query_data("todo").is_none());
        client
            .set_query_data("todo", json!({"title": "write tests"}))
            .expect("set");
        let data = client.get_query_data("todo").expect("cached");
        assert_eq!(*data, json!({"title": "write tests"}));

        client
            .update_query_data("todo", |current| {
                let mut next = current.cloned().unwrap_or_else(|| json!({}));
                next["done"] = json!(true);
                next
            })
            .expect("update");
        let data = client.get_query_data("todo").expect("cached");
        assert_eq!(data["done"], json!(true));
    }

    #[tokio::test]
    async fn test_fetch_query_data_requires_key_and_fn() {
        let client = QueryClient::new();
        let error = client
            .fetch_query_data(QueryOptions::default())
            .await
            .expect_err("no key");
        assert_eq!(error, QueryError::MissingQueryKey);

        let error = client
            .fetch_query_data(QueryOptions::new("k"))
            .await
            .expect_err("no fetch function");
        assert_eq!(error, QueryError::MissingQueryFn);
    }

    #[tokio::test]
    async fn test_mount_unmount_idempotent() {
        let client = QueryClient::new();
        client.mount();
        client.mount();
        client.unmount();
        client.unmount();
    }
}
