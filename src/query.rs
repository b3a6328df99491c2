//! Per-key query state machine.
//!
//! A [`Query`] is one cache entry: it owns the current [`QueryState`], the
//! effective options, the observer set, the in-flight retryer, and the
//! retention timer. State transitions are events reduced over the previous
//! state; every transition notifies observers and the owning cache through
//! one notification batch.
//!
//! # Lifecycle
//!
//! A query is created on first build (explicit prefetch/fetch or first
//! observer) and destroyed when its observer set is empty and its retention
//! timer elapses. Subscribing an observer cancels a pending retention timer;
//! unsubscribing the last observer starts one.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::cache::{QueryCache, QueryCacheEvent};
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::notify;
use crate::observer::QueryObserver;
use crate::options::{QueryOptions, CACHE_TIME_FOREVER};
use crate::retry::{settled_promise, CancelOptions, FetchPromise, Retryer, RetryerConfig};
use crate::time::{duration_ms, now_ms};

use futures::FutureExt;

/// Lifecycle phase of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// Never fetched and no seed data.
    Idle,
    /// Fetching with no data yet.
    Loading,
    /// Last fetch (or seed) produced data.
    Success,
    /// Last fetch settled with an error.
    Error,
}

/// Observable state of one query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
    /// Last successful payload.
    pub data: Option<Arc<Value>>,
    /// Wall-clock ms of the last success, 0 if never.
    pub data_updated_at: u64,
    /// Last failure.
    pub error: Option<QueryError>,
    /// Wall-clock ms of the last failure, 0 if never.
    pub error_updated_at: u64,
    /// Consecutive failed attempts of the current fetch.
    pub fetch_failure_count: u32,
    /// Whether a fetch is in flight.
    pub is_fetching: bool,
    /// Marked stale on demand by `invalidate`.
    pub is_invalidated: bool,
    /// Whether the in-flight fetch is parked waiting for focus/online.
    pub is_paused: bool,
    /// Lifecycle phase.
    pub status: QueryStatus,
}

impl QueryState {
    /// Timestamp of the most recent settled transition; used for hydration
    /// freshness comparisons.
    #[must_use]
    pub fn updated_at(&self) -> u64 {
        self.data_updated_at.max(self.error_updated_at)
    }

    fn initial(options: &QueryOptions) -> Self {
        let (data, data_updated_at, status) = match &options.initial_data {
            Some(seed) => (
                Some(Arc::new(seed.clone())),
                options.initial_data_updated_at.unwrap_or_else(now_ms),
                QueryStatus::Success,
            ),
            None => (None, 0, QueryStatus::Idle),
        };
        Self {
            data,
            data_updated_at,
            error: None,
            error_updated_at: 0,
            fetch_failure_count: 0,
            is_fetching: false,
            is_invalidated: false,
            is_paused: false,
            status,
        }
    }
}

/// Events driving the query state machine.
#[derive(Debug, Clone)]
pub(crate) enum QueryEvent {
    /// A fetch began.
    Fetch,
    /// One fetch attempt failed; more may follow.
    Failed,
    /// The in-flight fetch parked waiting for focus/online.
    Pause,
    /// The parked fetch resumed.
    Continue,
    /// A fetch settled with data, or data was set externally.
    Success {
        data: Arc<Value>,
        updated_at: Option<u64>,
    },
    /// A fetch settled with an error.
    Error { error: QueryError },
    /// Marked stale on demand.
    Invalidate,
    /// State replaced wholesale (hydration, revert).
    SetState { state: QueryState },
    /// Back to the initial state.
    Reset,
}

/// A cache entry: the per-key state machine of a memoized asynchronous read.
pub struct Query {
    cache: Weak<QueryCache>,
    query_key: QueryKey,
    query_hash: String,
    options: Mutex<QueryOptions>,
    state: Mutex<QueryState>,
    initial_state: QueryState,
    revert_state: Mutex<Option<QueryState>>,
    observers: Mutex<Vec<Arc<QueryObserver>>>,
    retryer: Mutex<Option<Retryer>>,
    promise: Mutex<Option<FetchPromise>>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl Query {
    pub(crate) fn new(
        cache: Weak<QueryCache>,
        query_key: QueryKey,
        query_hash: String,
        options: QueryOptions,
        state: Option<QueryState>,
    ) -> Arc<Self> {
        let initial_state = QueryState::initial(&options);
        let state = state.unwrap_or_else(|| initial_state.clone());
        Arc::new(Self {
            cache,
            query_key,
            query_hash,
            options: Mutex::new(options),
            state: Mutex::new(state),
            initial_state,
            revert_state: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
            retryer: Mutex::new(None),
            promise: Mutex::new(None),
            gc_task: Mutex::new(None),
        })
    }

    /// The structured key identifying this entry.
    #[must_use]
    pub fn query_key(&self) -> &QueryKey {
        &self.query_key
    }

    /// Canonical hash of the key.
    #[must_use]
    pub fn query_hash(&self) -> &str {
        &self.query_hash
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> QueryState {
        self.state.lock().clone()
    }

    /// Snapshot of the effective options.
    #[must_use]
    pub fn options(&self) -> QueryOptions {
        self.options.lock().clone()
    }

    /// Merges new options in. Retention only ever extends: the longest
    /// `cache_time` seen wins.
    pub(crate) fn set_options(&self, options: &QueryOptions) {
        let mut current = self.options.lock();
        let mut next = options.clone();
        next.cache_time = Some(
            next.resolved_cache_time()
                .max(current.resolved_cache_time()),
        );
        *current = next;
    }

    /// Whether any subscribed observer has fetching enabled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.observers
            .lock()
            .iter()
            .any(|observer| observer.options().is_enabled())
    }

    /// Whether a fetch is currently in flight.
    #[must_use]
    pub fn is_fetching(&self) -> bool {
        self.state.lock().is_fetching
    }

    /// Whether the entry is stale: invalidated, never fetched, or older than
    /// the relevant freshness window.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        let state = self.state.lock().clone();
        if state.is_invalidated || state.data_updated_at == 0 {
            return true;
        }
        let observers = self.observers();
        if observers.is_empty() {
            self.is_stale_by_time(self.options().resolved_stale_time())
        } else {
            observers
                .iter()
                .any(|observer| observer.current_result_is_stale())
        }
    }

    /// Whether the entry is stale for a specific freshness window.
    #[must_use]
    pub fn is_stale_by_time(&self, stale_time: Duration) -> bool {
        let state = self.state.lock().clone();
        state.is_invalidated
            || state.data_updated_at == 0
            || now_ms() >= state.data_updated_at.saturating_add(duration_ms(stale_time))
    }

    /// Number of subscribed observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    pub(crate) fn observers(&self) -> Vec<Arc<QueryObserver>> {
        self.observers.lock().clone()
    }

    pub(crate) fn add_observer(self: &Arc<Self>, observer: &Arc<QueryObserver>) {
        let added = {
            let mut observers = self.observers.lock();
            if observers.iter().any(|o| Arc::ptr_eq(o, observer)) {
                false
            } else {
                observers.push(Arc::clone(observer));
                true
            }
        };
        if added {
            // An observed query is never garbage-collected.
            self.clear_gc();
        }
    }

    pub(crate) fn remove_observer(self: &Arc<Self>, observer: &Arc<QueryObserver>) {
        let now_empty = {
            let mut observers = self.observers.lock();
            let before = observers.len();
            observers.retain(|o| !Arc::ptr_eq(o, observer));
            before > observers.len() && observers.is_empty()
        };
        if now_empty {
            self.schedule_gc();
        }
    }

    /// Starts a fetch, or returns the in-flight promise (single-flight).
    ///
    /// Options from an overlapping call update this query's options but do
    /// not restart the fetch.
    pub(crate) fn fetch(self: &Arc<Self>, options: Option<&QueryOptions>) -> FetchPromise {
        notify::batch(|| {
            if let Some(options) = options {
                self.set_options(options);
            }

            if self.state.lock().is_fetching {
                if let Some(promise) = self.promise.lock().clone() {
                    return promise;
                }
            }

            let current = self.options();
            let Some(query_fn) = current.query_fn.clone() else {
                return settled_promise(Err(QueryError::MissingQueryFn));
            };

            *self.revert_state.lock() = Some(self.state());
            self.dispatch(QueryEvent::Fetch);

            let on_fail = Arc::downgrade(self);
            let on_pause = Arc::downgrade(self);
            let on_continue = Arc::downgrade(self);
            let on_success = Arc::downgrade(self);
            let on_error = Arc::downgrade(self);

            let retryer = Retryer::new(RetryerConfig {
                operation: Some(Arc::new(move || {
                    let query_fn = Arc::clone(&query_fn);
                    async move { query_fn().await.map(Arc::new) }.boxed()
                })),
                retry: current.resolved_retry(),
                retry_delay: current.resolved_retry_delay(),
                on_fail: Some(Arc::new(move |_error, _count| {
                    if let Some(query) = on_fail.upgrade() {
                        query.dispatch(QueryEvent::Failed);
                    }
                })),
                on_pause: Some(Arc::new(move || {
                    if let Some(query) = on_pause.upgrade() {
                        query.dispatch(QueryEvent::Pause);
                    }
                })),
                on_continue: Some(Arc::new(move || {
                    if let Some(query) = on_continue.upgrade() {
                        query.dispatch(QueryEvent::Continue);
                    }
                })),
                on_success: Some(Arc::new(move |data| {
                    if let Some(query) = on_success.upgrade() {
                        query.on_fetch_success(Arc::clone(data));
                    }
                })),
                on_error: Some(Arc::new(move |error| {
                    if let Some(query) = on_error.upgrade() {
                        query.on_fetch_error(error.clone());
                    }
                })),
            });

            let promise = retryer.promise();
            *self.promise.lock() = Some(promise.clone());
            *self.retryer.lock() = Some(retryer);
            promise
        })
    }

    fn on_fetch_success(self: &Arc<Self>, data: Arc<Value>) {
        self.dispatch(QueryEvent::Success {
            data,
            updated_at: None,
        });
        self.settle_fetch();
    }

    fn on_fetch_error(self: &Arc<Self>, error: QueryError) {
        match &error {
            QueryError::Cancelled { revert: true, .. } => {
                let previous = self.revert_state.lock().take();
                match previous {
                    Some(state) => self.dispatch(QueryEvent::SetState { state }),
                    None => self.dispatch(QueryEvent::Error { error }),
                }
            }
            QueryError::Cancelled { silent: true, .. } => {
                // Settle without recording an error; only the fetching flag
                // changes.
                let mut state = self.state();
                state.is_fetching = false;
                state.is_paused = false;
                self.dispatch(QueryEvent::SetState { state });
            }
            _ => self.dispatch(QueryEvent::Error { error }),
        }
        self.settle_fetch();
    }

    fn settle_fetch(self: &Arc<Self>) {
        *self.promise.lock() = None;
        *self.retryer.lock() = None;
        *self.revert_state.lock() = None;
        if self.observers.lock().is_empty() {
            self.schedule_gc();
        }
    }

    /// Promise of the in-flight fetch, if any.
    pub(crate) fn inflight_promise(&self) -> Option<FetchPromise> {
        self.promise.lock().clone()
    }

    /// Cancels the in-flight fetch, if any.
    pub fn cancel(&self, options: CancelOptions) {
        if let Some(retryer) = &*self.retryer.lock() {
            retryer.cancel(options);
        }
    }

    /// Marks the entry stale on demand.
    pub fn invalidate(self: &Arc<Self>) {
        if !self.state.lock().is_invalidated {
            self.dispatch(QueryEvent::Invalidate);
        }
    }

    /// Returns the entry to its initial state.
    pub fn reset(self: &Arc<Self>) {
        self.cancel(CancelOptions {
            revert: false,
            silent: true,
        });
        self.dispatch(QueryEvent::Reset);
    }

    /// Sets data externally, as from `set_query_data`.
    pub(crate) fn set_data(self: &Arc<Self>, data: Value, updated_at: Option<u64>) -> Arc<Value> {
        let data = Arc::new(data);
        self.dispatch(QueryEvent::Success {
            data: Arc::clone(&data),
            updated_at,
        });
        data
    }

    /// Replaces state from a dehydrated snapshot iff strictly fresher.
    /// Returns whether the snapshot was applied.
    pub(crate) fn set_state_if_newer(self: &Arc<Self>, state: QueryState) -> bool {
        if state.updated_at() <= self.state.lock().updated_at() {
            tracing::debug!(hash = %self.query_hash, "dropping stale hydration state");
            return false;
        }
        self.dispatch(QueryEvent::SetState { state });
        true
    }

    /// Focus revalidation: the first willing observer refetches.
    pub(crate) fn on_focus(self: &Arc<Self>) {
        let observer = self
            .observers()
            .into_iter()
            .find(|observer| observer.should_fetch_on_window_focus());
        if let Some(observer) = observer {
            observer.trigger_refetch();
        }
    }

    /// Reconnect revalidation: the first willing observer refetches.
    pub(crate) fn on_online(self: &Arc<Self>) {
        let observer = self
            .observers()
            .into_iter()
            .find(|observer| observer.should_fetch_on_reconnect());
        if let Some(observer) = observer {
            observer.trigger_refetch();
        }
    }

    /// Arms the retention timer. No-op for `cache_time == CACHE_TIME_FOREVER`
    /// or outside a tokio runtime.
    pub(crate) fn schedule_gc(self: &Arc<Self>) {
        self.clear_gc();
        let cache_time = self.options().resolved_cache_time();
        if cache_time == CACHE_TIME_FOREVER {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let task = handle.spawn(async move {
            sleep(cache_time).await;
            if let Some(query) = weak.upgrade() {
                query.optional_remove();
            }
        });
        *self.gc_task.lock() = Some(task);
    }

    fn clear_gc(&self) {
        if let Some(task) = self.gc_task.lock().take() {
            task.abort();
        }
    }

    fn optional_remove(self: &Arc<Self>) {
        if !self.observers.lock().is_empty() || self.state.lock().is_fetching {
            return;
        }
        if let Some(cache) = self.cache.upgrade() {
            tracing::debug!(hash = %self.query_hash, "retention elapsed, removing query");
            cache.remove(self);
        }
    }

    /// Cancels timers and the in-flight fetch and detaches observers. Called
    /// when the cache detaches this entry.
    pub(crate) fn destroy(&self) {
        self.clear_gc();
        if let Some(retryer) = &*self.retryer.lock() {
            retryer.cancel(CancelOptions {
                revert: false,
                silent: true,
            });
        }
        // Break the query/observer reference cycle; detached observers keep
        // their last derived view and settle gracefully.
        self.observers.lock().clear();
    }

    fn dispatch(self: &Arc<Self>, event: QueryEvent) {
        {
            let mut state = self.state.lock();
            let next = self.reduce(&state, &event);
            *state = next;
        }
        let observers = self.observers();
        notify::batch(|| {
            for observer in &observers {
                observer.on_query_update(&event);
            }
            if let Some(cache) = self.cache.upgrade() {
                cache.notify(&QueryCacheEvent::Updated(Arc::clone(self)));
            }
        });
    }

    fn reduce(&self, state: &QueryState, event: &QueryEvent) -> QueryState {
        match event {
            QueryEvent::Fetch => {
                let mut next = state.clone();
                next.is_fetching = true;
                next.is_paused = false;
                next.fetch_failure_count = 0;
                if state.data_updated_at == 0 {
                    next.status = QueryStatus::Loading;
                    next.error = None;
                }
                next
            }
            QueryEvent::Failed => {
                let mut next = state.clone();
                next.fetch_failure_count += 1;
                next
            }
            QueryEvent::Pause => {
                let mut next = state.clone();
                next.is_paused = true;
                next
            }
            QueryEvent::Continue => {
                let mut next = state.clone();
                next.is_paused = false;
                next
            }
            QueryEvent::Success { data, updated_at } => {
                let mut next = state.clone();
                next.data = Some(Arc::clone(data));
                // updated_at never decreases
                next.data_updated_at = updated_at
                    .unwrap_or_else(now_ms)
                    .max(state.data_updated_at);
                next.error = None;
                next.fetch_failure_count = 0;
                next.is_fetching = false;
                next.is_invalidated = false;
                next.is_paused = false;
                next.status = QueryStatus::Success;
                next
            }
            QueryEvent::Error { error } => {
                let mut next = state.clone();
                next.error = Some(error.clone());
                next.error_updated_at = now_ms().max(state.error_updated_at);
                next.fetch_failure_count += 1;
                next.is_fetching = false;
                next.is_paused = false;
                next.status = QueryStatus::Error;
                next
            }
            QueryEvent::Invalidate => {
                let mut next = state.clone();
                next.is_invalidated = true;
                next
            }
            QueryEvent::SetState { state: replacement } => replacement.clone(),
            QueryEvent::Reset => self.initial_state.clone(),
        }
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("query_hash", &self.query_hash)
            .field("state", &self.state.lock())
            .finish_non_exhaustive()
    }
}
