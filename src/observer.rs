//! Query observation: result views and subscriptions.
//!
//! A [`QueryObserver`] bridges one consumer to one [`Query`]. It derives a
//! [`QueryObserverResult`] view from the query state and the observer's own
//! options, pushes the view to subscribed listeners when it changes, and
//! drives automatic refetching (on subscribe, on focus/reconnect via the
//! cache, and on a periodic interval).
//!
//! Listener notifications are routed through the notification batch: many
//! state changes inside one batch collapse into a single notification that
//! observes the post-batch state.
//!
//! Consumers that prefer streams over callbacks can use
//! [`QueryObserver::stream`], which yields each new result view and
//! unsubscribes when dropped.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::bus::FocusManager;
use crate::client::QueryClient;
use crate::error::QueryError;
use crate::options::{NotifyOnChangeProps, QueryOptions, RefetchPolicy, ResultField};
use crate::query::{Query, QueryEvent, QueryStatus};
use crate::time::{duration_ms, now_ms};

/// Derived view of one query for one consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryObserverResult {
    /// Observer-visible data (after `select`, and possibly the previous
    /// query's data under `keep_previous_data`).
    pub data: Option<Arc<Value>>,
    /// Timestamp of the exposed data.
    pub data_updated_at: u64,
    /// Last failure.
    pub error: Option<QueryError>,
    /// Timestamp of the last failure.
    pub error_updated_at: u64,
    /// Consecutive failed attempts of the current fetch.
    pub failure_count: u32,
    /// Lifecycle phase.
    pub status: QueryStatus,
    /// Whether a fetch is in flight.
    pub is_fetching: bool,
    /// Fetching with no data to show.
    pub is_loading: bool,
    /// `status == Success`.
    pub is_success: bool,
    /// `status == Error`.
    pub is_error: bool,
    /// `status == Idle`.
    pub is_idle: bool,
    /// Whether the exposed data is older than the freshness window.
    pub is_stale: bool,
    /// Whether `data` comes from the previously observed query.
    pub is_previous_data: bool,
}

impl QueryObserverResult {
    fn empty() -> Self {
        Self {
            data: None,
            data_updated_at: 0,
            error: None,
            error_updated_at: 0,
            failure_count: 0,
            status: QueryStatus::Idle,
            is_fetching: false,
            is_loading: false,
            is_success: false,
            is_error: false,
            is_idle: true,
            is_stale: true,
            is_previous_data: false,
        }
    }
}

fn changed_fields(old: &QueryObserverResult, new: &QueryObserverResult) -> Vec<ResultField> {
    let mut fields = Vec::new();
    if old.data != new.data {
        fields.push(ResultField::Data);
    }
    if old.data_updated_at != new.data_updated_at {
        fields.push(ResultField::DataUpdatedAt);
    }
    if old.error != new.error {
        fields.push(ResultField::Error);
    }
    if old.error_updated_at != new.error_updated_at {
        fields.push(ResultField::ErrorUpdatedAt);
    }
    if old.failure_count != new.failure_count {
        fields.push(ResultField::FailureCount);
    }
    if old.status != new.status {
        fields.push(ResultField::Status);
    }
    if old.is_fetching != new.is_fetching {
        fields.push(ResultField::IsFetching);
    }
    if old.is_loading != new.is_loading {
        fields.push(ResultField::IsLoading);
    }
    if old.is_success != new.is_success {
        fields.push(ResultField::IsSuccess);
    }
    if old.is_error != new.is_error {
        fields.push(ResultField::IsError);
    }
    if old.is_idle != new.is_idle {
        fields.push(ResultField::IsIdle);
    }
    if old.is_stale != new.is_stale {
        fields.push(ResultField::IsStale);
    }
    if old.is_previous_data != new.is_previous_data {
        fields.push(ResultField::IsPreviousData);
    }
    fields
}

/// Listener invoked with each changed result view.
pub type ObserverListener = Arc<dyn Fn(&QueryObserverResult) + Send + Sync>;

/// Subscription from one consumer to one query.
pub struct QueryObserver {
    client: QueryClient,
    query: Mutex<Arc<Query>>,
    options: Mutex<QueryOptions>,
    result: Mutex<QueryObserverResult>,
    previous_query_result: Mutex<Option<QueryObserverResult>>,
    // (raw payload, derived view); re-run select only when raw changes
    select_cache: Mutex<Option<(Arc<Value>, Arc<Value>)>>,
    listeners: Mutex<Vec<(u64, ObserverListener)>>,
    next_listener_id: AtomicU64,
    stale_task: Mutex<Option<JoinHandle<()>>>,
    interval_task: Mutex<Option<JoinHandle<()>>>,
    tracked: Mutex<HashSet<ResultField>>,
    notify_pending: AtomicBool,
}

impl QueryObserver {
    pub(crate) fn new(client: &QueryClient, options: QueryOptions) -> Result<Arc<Self>, QueryError> {
        let defaulted = client.defaulted_query_options(&options);
        let query = client.query_cache().build(defaulted.clone(), None)?;
        let observer = Arc::new(Self {
            client: client.clone(),
            query: Mutex::new(query),
            options: Mutex::new(defaulted),
            result: Mutex::new(QueryObserverResult::empty()),
            previous_query_result: Mutex::new(None),
            select_cache: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            stale_task: Mutex::new(None),
            interval_task: Mutex::new(None),
            tracked: Mutex::new(HashSet::new()),
            notify_pending: AtomicBool::new(false),
        });
        let initial = observer.compute_result(&observer.current_query());
        *observer.result.lock() = initial;
        Ok(observer)
    }

    /// The query currently observed.
    #[must_use]
    pub fn query(&self) -> Arc<Query> {
        self.current_query()
    }

    /// Snapshot of the observer's options.
    #[must_use]
    pub fn options(&self) -> QueryOptions {
        self.options.lock().clone()
    }

    /// The latest derived result view.
    #[must_use]
    pub fn get_current_result(&self) -> QueryObserverResult {
        self.result.lock().clone()
    }

    /// Like [`get_current_result`](Self::get_current_result), but records the
    /// fields the consumer reads so `NotifyOnChangeProps::Tracked` can limit
    /// notifications to them.
    #[must_use]
    pub fn tracked_result(&self) -> TrackedResult<'_> {
        TrackedResult {
            observer: self,
            result: self.get_current_result(),
        }
    }

    /// Registers a listener; returns its id. The first subscription attaches
    /// the observer to the query (cancelling any pending retention timer) and
    /// evaluates the refetch-on-mount policy.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&QueryObserverResult) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let first = {
            let mut listeners = self.listeners.lock();
            let first = listeners.is_empty();
            listeners.push((id, Arc::new(listener)));
            first
        };
        if first {
            self.on_subscribe();
        }
        id
    }

    /// Removes a listener. When the last one goes, the observer detaches from
    /// the query, which may start its retention timer.
    pub fn unsubscribe(self: &Arc<Self>, id: u64) {
        let now_empty = {
            let mut listeners = self.listeners.lock();
            let before = listeners.len();
            listeners.retain(|(lid, _)| *lid != id);
            before > listeners.len() && listeners.is_empty()
        };
        if now_empty {
            self.on_unsubscribe();
        }
    }

    /// Unsubscribes everything and releases references.
    pub fn destroy(self: &Arc<Self>) {
        let had_listeners = {
            let mut listeners = self.listeners.lock();
            let had = !listeners.is_empty();
            listeners.clear();
            had
        };
        if had_listeners {
            self.on_unsubscribe();
        } else {
            self.clear_timers();
        }
    }

    /// Subscription as a stream of result views. Subscribes on creation and
    /// unsubscribes when the stream is dropped.
    #[must_use]
    pub fn stream(self: &Arc<Self>) -> ObserverStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener_id = self.subscribe(move |result| {
            let _ = tx.send(result.clone());
        });
        ObserverStream {
            observer: Arc::clone(self),
            listener_id,
            rx: UnboundedReceiverStream::new(rx),
        }
    }

    /// Replaces the observer's options, switching queries when the key hash
    /// changes (keeping the old result available for `keep_previous_data`).
    pub fn set_options(self: &Arc<Self>, options: QueryOptions) -> Result<(), QueryError> {
        let defaulted = self.client.defaulted_query_options(&options);
        let old_query = self.current_query();
        let old_options = {
            let mut current = self.options.lock();
            std::mem::replace(&mut *current, defaulted.clone())
        };
        let new_query = self.client.query_cache().build(defaulted.clone(), None)?;
        let has_listeners = !self.listeners.lock().is_empty();

        if Arc::ptr_eq(&new_query, &old_query) {
            // Same entry; a disabled observer coming alive behaves as a mount.
            if has_listeners
                && !old_options.is_enabled()
                && defaulted.is_enabled()
                && self.should_fetch_on_mount()
            {
                self.trigger_refetch();
            }
        } else {
            *self.previous_query_result.lock() = Some(self.get_current_result());
            *self.select_cache.lock() = None;
            *self.query.lock() = Arc::clone(&new_query);
            if has_listeners {
                old_query.remove_observer(self);
                new_query.add_observer(self);
                if self.should_fetch_on_mount() {
                    self.trigger_refetch();
                }
            }
        }

        self.update_result();
        if has_listeners {
            self.update_timers();
        }
        Ok(())
    }

    /// Fetches the observed query and returns its settled data.
    pub async fn refetch(self: &Arc<Self>) -> Result<Arc<Value>, QueryError> {
        let query = self.current_query();
        let options = self.options();
        query.fetch(Some(&options)).await
    }

    /// Removes the observed query from the cache.
    pub fn remove(&self) {
        let query = self.current_query();
        self.client.query_cache().remove(&query);
    }

    pub(crate) fn trigger_refetch(self: &Arc<Self>) {
        let query = self.current_query();
        let options = self.options();
        // Fire and forget: the result surfaces through state updates.
        let _ = query.fetch(Some(&options));
    }

    pub(crate) fn should_fetch_on_window_focus(&self) -> bool {
        self.should_fetch_on_trigger(self.options().focus_policy())
    }

    pub(crate) fn should_fetch_on_reconnect(&self) -> bool {
        self.should_fetch_on_trigger(self.options().reconnect_policy())
    }

    pub(crate) fn current_result_is_stale(&self) -> bool {
        self.current_query()
            .is_stale_by_time(self.options().resolved_stale_time())
    }

    pub(crate) fn on_query_update(self: &Arc<Self>, event: &QueryEvent) {
        let options = self.options();
        match event {
            QueryEvent::Success { data, .. } => {
                if let Some(callback) = &options.on_success {
                    callback(data);
                }
                if let Some(callback) = &options.on_settled {
                    callback(Some(data), None);
                }
            }
            QueryEvent::Error { error } if !error.is_silent_cancel() => {
                if let Some(callback) = &options.on_error {
                    callback(error);
                }
                if let Some(callback) = &options.on_settled {
                    callback(None, Some(error));
                }
            }
            _ => {}
        }
        self.update_result();
        if matches!(event, QueryEvent::Success { .. }) {
            self.update_timers();
        }
    }

    fn current_query(&self) -> Arc<Query> {
        Arc::clone(&self.query.lock())
    }

    fn on_subscribe(self: &Arc<Self>) {
        let query = self.current_query();
        query.add_observer(self);
        if self.should_fetch_on_mount() {
            self.trigger_refetch();
        } else {
            self.update_result();
        }
        self.update_timers();
    }

    fn on_unsubscribe(self: &Arc<Self>) {
        self.clear_timers();
        self.current_query().remove_observer(self);
    }

    fn should_fetch_on_mount(&self) -> bool {
        let options = self.options();
        if !options.is_enabled() {
            return false;
        }
        let query = self.current_query();
        if query.state().data_updated_at == 0 {
            // Never fetched: always load.
            return true;
        }
        match options.mount_policy() {
            RefetchPolicy::Always => true,
            RefetchPolicy::IfStale => query.is_stale_by_time(options.resolved_stale_time()),
            RefetchPolicy::Never => false,
        }
    }

    fn should_fetch_on_trigger(&self, policy: RefetchPolicy) -> bool {
        let options = self.options();
        if !options.is_enabled() {
            return false;
        }
        match policy {
            RefetchPolicy::Always => true,
            RefetchPolicy::IfStale => self
                .current_query()
                .is_stale_by_time(options.resolved_stale_time()),
            RefetchPolicy::Never => false,
        }
    }

    fn update_result(self: &Arc<Self>) {
        let query = self.current_query();
        let new_result = self.compute_result(&query);
        let changed = {
            let mut result = self.result.lock();
            if *result == new_result {
                None
            } else {
                let fields = changed_fields(&result, &new_result);
                *result = new_result;
                Some(fields)
            }
        };
        let Some(fields) = changed else { return };
        if self.should_notify(&fields) {
            self.schedule_notify();
        }
    }

    fn should_notify(&self, fields: &[ResultField]) -> bool {
        match self.options().notify_props() {
            NotifyOnChangeProps::All => true,
            NotifyOnChangeProps::List(props) => fields.iter().any(|field| props.contains(field)),
            NotifyOnChangeProps::Tracked => {
                let tracked = self.tracked.lock();
                fields.iter().any(|field| tracked.contains(field))
            }
        }
    }

    /// At most one pending notification; it reads the result at flush time,
    /// so listeners observe the post-batch state exactly once per batch.
    fn schedule_notify(self: &Arc<Self>) {
        if self.notify_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        crate::notify::schedule(move || {
            let Some(observer) = weak.upgrade() else {
                return;
            };
            observer.notify_pending.store(false, Ordering::SeqCst);
            let result = observer.get_current_result();
            let listeners: Vec<ObserverListener> = observer
                .listeners
                .lock()
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect();
            for listener in listeners {
                if catch_unwind(AssertUnwindSafe(|| listener(&result))).is_err() {
                    tracing::error!("observer listener panicked");
                }
            }
        });
    }

    fn compute_result(&self, query: &Arc<Query>) -> QueryObserverResult {
        let options = self.options();
        let state = query.state();
        let mut data = state.data.clone();
        let mut data_updated_at = state.data_updated_at;
        let mut status = state.status;
        let mut is_previous_data = false;

        // Bridge key switches: show the outgoing query's data until the new
        // one produces some.
        if options.keeps_previous_data()
            && data.is_none()
            && matches!(status, QueryStatus::Loading | QueryStatus::Idle)
        {
            let previous = self.previous_query_result.lock().clone();
            if let Some(previous) = previous {
                if let Some(previous_data) = previous.data {
                    data = Some(previous_data);
                    data_updated_at = previous.data_updated_at;
                    status = QueryStatus::Success;
                    is_previous_data = true;
                }
            }
        }

        if let (Some(select), Some(raw)) = (&options.select, &data) {
            let mut cache = self.select_cache.lock();
            let selected = match &*cache {
                Some((cached_raw, cached_view)) if Arc::ptr_eq(cached_raw, raw) => {
                    Arc::clone(cached_view)
                }
                _ => {
                    let view = Arc::new(select(raw));
                    *cache = Some((Arc::clone(raw), Arc::clone(&view)));
                    view
                }
            };
            data = Some(selected);
        }

        // Keep the previous reference when the payload is unchanged, so
        // downstream diffing sees no data change.
        if let Some(is_equal) = &options.is_data_equal {
            if let Some(new_data) = &data {
                let previous = self.result.lock().data.clone();
                if let Some(previous) = previous {
                    if is_equal(Some(&previous), new_data) {
                        data = Some(previous);
                    }
                }
            }
        }

        let is_stale = query.is_stale_by_time(options.resolved_stale_time());
        QueryObserverResult {
            data,
            data_updated_at,
            error: state.error.clone(),
            error_updated_at: state.error_updated_at,
            failure_count: state.fetch_failure_count,
            status,
            is_fetching: state.is_fetching,
            is_loading: status == QueryStatus::Loading,
            is_success: status == QueryStatus::Success,
            is_error: status == QueryStatus::Error,
            is_idle: status == QueryStatus::Idle,
            is_stale,
            is_previous_data,
        }
    }

    fn update_timers(self: &Arc<Self>) {
        self.clear_timers();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let options = self.options();
        let query = self.current_query();

        // Re-derive the view when the freshness window expires; refetching
        // stays with the focus/interval triggers.
        let stale_time = options.resolved_stale_time();
        let state = query.state();
        if stale_time > Duration::ZERO
            && stale_time != Duration::MAX
            && state.data_updated_at > 0
            && !query.is_stale_by_time(stale_time)
        {
            let deadline = state
                .data_updated_at
                .saturating_add(duration_ms(stale_time))
                .saturating_add(1);
            let delay = Duration::from_millis(deadline.saturating_sub(now_ms()));
            let weak = Arc::downgrade(self);
            *self.stale_task.lock() = Some(handle.spawn(async move {
                sleep(delay).await;
                if let Some(observer) = weak.upgrade() {
                    observer.update_result();
                }
            }));
        }

        if let Some(interval) = options.refetch_interval {
            if interval > Duration::ZERO {
                let in_background = options.interval_in_background();
                let weak = Arc::downgrade(self);
                *self.interval_task.lock() = Some(handle.spawn(async move {
                    loop {
                        sleep(interval).await;
                        let Some(observer) = weak.upgrade() else {
                            break;
                        };
                        if !in_background && !FocusManager::global().is_focused() {
                            continue;
                        }
                        if observer.options().is_enabled() {
                            observer.trigger_refetch();
                        }
                    }
                }));
            }
        }
    }

    fn clear_timers(&self) {
        if let Some(task) = self.stale_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.interval_task.lock().take() {
            task.abort();
        }
    }

    pub(crate) fn track(&self, field: ResultField) {
        self.tracked.lock().insert(field);
    }
}

impl std::fmt::Debug for QueryObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryObserver")
            .field("query_hash", &self.current_query().query_hash().to_owned())
            .field("listeners", &self.listeners.lock().len())
            .finish_non_exhaustive()
    }
}

/// Result view that records which fields the consumer reads.
pub struct TrackedResult<'a> {
    observer: &'a QueryObserver,
    result: QueryObserverResult,
}

impl TrackedResult<'_> {
    /// The exposed data.
    pub fn data(&self) -> Option<&Arc<Value>> {
        self.observer.track(ResultField::Data);
        self.result.data.as_ref()
    }

    /// The last failure.
    pub fn error(&self) -> Option<&QueryError> {
        self.observer.track(ResultField::Error);
        self.result.error.as_ref()
    }

    /// Lifecycle phase.
    pub fn status(&self) -> QueryStatus {
        self.observer.track(ResultField::Status);
        self.result.status
    }

    /// Whether a fetch is in flight.
    pub fn is_fetching(&self) -> bool {
        self.observer.track(ResultField::IsFetching);
        self.result.is_fetching
    }

    /// Fetching with no data to show.
    pub fn is_loading(&self) -> bool {
        self.observer.track(ResultField::IsLoading);
        self.result.is_loading
    }

    /// `status == Success`.
    pub fn is_success(&self) -> bool {
        self.observer.track(ResultField::IsSuccess);
        self.result.is_success
    }

    /// `status == Error`.
    pub fn is_error(&self) -> bool {
        self.observer.track(ResultField::IsError);
        self.result.is_error
    }

    /// Whether the exposed data is stale.
    pub fn is_stale(&self) -> bool {
        self.observer.track(ResultField::IsStale);
        self.result.is_stale
    }
}

/// Stream adapter over an observer subscription; unsubscribes on drop.
pub struct ObserverStream {
    observer: Arc<QueryObserver>,
    listener_id: u64,
    rx: UnboundedReceiverStream<QueryObserverResult>,
}

impl Stream for ObserverStream {
    type Item = QueryObserverResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().rx).poll_next(cx)
    }
}

impl Drop for ObserverStream {
    fn drop(&mut self) {
        self.observer.unsubscribe(self.listener_id);
    }
}
