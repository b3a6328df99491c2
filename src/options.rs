//! Query and mutation configuration.
//!
//! All consumer-facing operations accept a single options record; unset
//! fields fall back to client defaults, then to the engine defaults below.
//! This replaces positional argument overloads: normalization happens once at
//! the facade boundary and the rest of the engine only sees resolved records.
//!
//! Engine defaults: `stale_time = 0` (immediately stale), `cache_time = 5`
//! minutes, `retry = 3` with exponential backoff capped at 30 s, refetch on
//! mount/focus/reconnect when stale, no interval refetching.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::error::QueryError;
use crate::key::QueryKey;
use crate::retry::{RetryDelay, RetryPolicy};

/// How long data is considered fresh before becoming stale.
pub const DEFAULT_STALE_TIME: Duration = Duration::ZERO;

/// How long an unobserved query is retained before garbage collection.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(5 * 60);

/// Sentinel `cache_time`: never garbage-collect.
pub const CACHE_TIME_FOREVER: Duration = Duration::MAX;

/// Async function producing a query's data.
pub type QueryFunction =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Value, QueryError>> + Send + Sync>;

/// Async function performing a mutation, given its variables.
pub type MutationFunction =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, QueryError>> + Send + Sync>;

/// Derives the observer-visible `data` view from the raw payload.
pub type SelectFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Custom data equality for notification suppression: `(previous, next)`.
pub type DataEqualFn = Arc<dyn Fn(Option<&Value>, &Value) -> bool + Send + Sync>;

/// Observer success callback.
pub type DataCallback = Arc<dyn Fn(&Arc<Value>) + Send + Sync>;

/// Observer error callback.
pub type ErrorCallback = Arc<dyn Fn(&QueryError) + Send + Sync>;

/// Observer settled callback: `(data, error)`, exactly one is `Some`.
pub type SettledCallback = Arc<dyn Fn(Option<&Arc<Value>>, Option<&QueryError>) + Send + Sync>;

/// Pre-mutation hook: receives the variables, may return a rollback context.
pub type MutateHook = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// Mutation success hook: `(data, variables, context)`.
pub type MutationSuccessHook = Arc<dyn Fn(&Arc<Value>, &Value, Option<&Value>) + Send + Sync>;

/// Mutation error hook: `(error, variables, context)`.
pub type MutationErrorHook = Arc<dyn Fn(&QueryError, &Value, Option<&Value>) + Send + Sync>;

/// Mutation settled hook: `(data, error, variables, context)`.
pub type MutationSettledHook =
    Arc<dyn Fn(Option<&Arc<Value>>, Option<&QueryError>, &Value, Option<&Value>) + Send + Sync>;

/// When an automatic refetch trigger (mount, focus, reconnect) fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefetchPolicy {
    /// Refetch unconditionally.
    Always,
    /// Refetch only when the query is stale.
    #[default]
    IfStale,
    /// Never refetch from this trigger.
    Never,
}

/// Fields of a derived result view, used for notification filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultField {
    Data,
    Error,
    Status,
    IsFetching,
    IsLoading,
    IsSuccess,
    IsError,
    IsIdle,
    IsStale,
    IsPreviousData,
    DataUpdatedAt,
    ErrorUpdatedAt,
    FailureCount,
}

/// Which result-view changes notify the subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NotifyOnChangeProps {
    /// Any field change notifies.
    #[default]
    All,
    /// Only changes to the listed fields notify.
    List(Vec<ResultField>),
    /// Learn the fields the consumer actually reads through
    /// tracked-result accessors; only those notify.
    Tracked,
}

/// Per-query configuration.
///
/// Unset fields inherit client defaults, then engine defaults. Built in the
/// chained style:
///
/// ```
/// use freshet::{QueryOptions, QueryError};
/// use std::time::Duration;
///
/// let options = QueryOptions::new("todos")
///     .query_fn(|| async { Ok(serde_json::json!(["a", "b"])) })
///     .stale_time(Duration::from_secs(30));
/// ```
#[derive(Clone, Default)]
pub struct QueryOptions {
    pub query_key: Option<QueryKey>,
    pub query_fn: Option<QueryFunction>,
    pub enabled: Option<bool>,
    pub stale_time: Option<Duration>,
    pub cache_time: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub retry_delay: Option<RetryDelay>,
    pub refetch_on_mount: Option<RefetchPolicy>,
    pub refetch_on_window_focus: Option<RefetchPolicy>,
    pub refetch_on_reconnect: Option<RefetchPolicy>,
    pub refetch_interval: Option<Duration>,
    pub refetch_interval_in_background: Option<bool>,
    pub keep_previous_data: Option<bool>,
    pub initial_data: Option<Value>,
    pub initial_data_updated_at: Option<u64>,
    pub select: Option<SelectFn>,
    pub is_data_equal: Option<DataEqualFn>,
    pub notify_on_change_props: Option<NotifyOnChangeProps>,
    pub on_success: Option<DataCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_settled: Option<SettledCallback>,
}

impl QueryOptions {
    /// Creates options for the given key.
    #[must_use]
    pub fn new(key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Sets the fetch function.
    #[must_use]
    pub fn query_fn<F, Fut>(mut self, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
    {
        self.query_fn = Some(Arc::new(move || fetch().boxed()));
        self
    }

    /// Disables or enables automatic fetching.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Freshness window for cached data.
    #[must_use]
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Retention window after the last observer unsubscribes.
    /// Pass [`CACHE_TIME_FOREVER`] to disable garbage collection.
    #[must_use]
    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = Some(cache_time);
        self
    }

    /// Retry policy for failed fetches.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Delay between retry attempts.
    #[must_use]
    pub fn retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    /// Refetch behavior when an observer subscribes.
    #[must_use]
    pub fn refetch_on_mount(mut self, policy: RefetchPolicy) -> Self {
        self.refetch_on_mount = Some(policy);
        self
    }

    /// Refetch behavior on window focus.
    #[must_use]
    pub fn refetch_on_window_focus(mut self, policy: RefetchPolicy) -> Self {
        self.refetch_on_window_focus = Some(policy);
        self
    }

    /// Refetch behavior when connectivity returns.
    #[must_use]
    pub fn refetch_on_reconnect(mut self, policy: RefetchPolicy) -> Self {
        self.refetch_on_reconnect = Some(policy);
        self
    }

    /// Periodic background refetch interval.
    #[must_use]
    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    /// Whether interval refetches fire while the window is unfocused.
    #[must_use]
    pub fn refetch_interval_in_background(mut self, in_background: bool) -> Self {
        self.refetch_interval_in_background = Some(in_background);
        self
    }

    /// Expose the previous query's data while a new key loads.
    #[must_use]
    pub fn keep_previous_data(mut self, keep: bool) -> Self {
        self.keep_previous_data = Some(keep);
        self
    }

    /// Seed data for a never-fetched query.
    #[must_use]
    pub fn initial_data(mut self, data: Value) -> Self {
        self.initial_data = Some(data);
        self
    }

    /// Timestamp for `initial_data`, controlling its staleness.
    #[must_use]
    pub fn initial_data_updated_at(mut self, updated_at: u64) -> Self {
        self.initial_data_updated_at = Some(updated_at);
        self
    }

    /// Derives the observer-visible data from the raw payload. Re-run only
    /// when the raw payload reference changes.
    #[must_use]
    pub fn select(mut self, select: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.select = Some(Arc::new(select));
        self
    }

    /// Custom data equality used when diffing result views.
    #[must_use]
    pub fn is_data_equal(
        mut self,
        eq: impl Fn(Option<&Value>, &Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_data_equal = Some(Arc::new(eq));
        self
    }

    /// Restricts which result fields trigger notifications.
    #[must_use]
    pub fn notify_on_change_props(mut self, props: NotifyOnChangeProps) -> Self {
        self.notify_on_change_props = Some(props);
        self
    }

    /// Called once per successful fetch observed by this subscription.
    #[must_use]
    pub fn on_success(mut self, callback: impl Fn(&Arc<Value>) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    /// Called once per failed fetch observed by this subscription.
    #[must_use]
    pub fn on_error(mut self, callback: impl Fn(&QueryError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Called after every settled fetch observed by this subscription.
    #[must_use]
    pub fn on_settled(
        mut self,
        callback: impl Fn(Option<&Arc<Value>>, Option<&QueryError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(callback));
        self
    }

    /// Fills unset fields from `defaults`.
    #[must_use]
    pub(crate) fn merged_over(&self, defaults: &QueryOptions) -> QueryOptions {
        QueryOptions {
            query_key: self.query_key.clone().or_else(|| defaults.query_key.clone()),
            query_fn: self.query_fn.clone().or_else(|| defaults.query_fn.clone()),
            enabled: self.enabled.or(defaults.enabled),
            stale_time: self.stale_time.or(defaults.stale_time),
            cache_time: self.cache_time.or(defaults.cache_time),
            retry: self.retry.clone().or_else(|| defaults.retry.clone()),
            retry_delay: self
                .retry_delay
                .clone()
                .or_else(|| defaults.retry_delay.clone()),
            refetch_on_mount: self.refetch_on_mount.or(defaults.refetch_on_mount),
            refetch_on_window_focus: self
                .refetch_on_window_focus
                .or(defaults.refetch_on_window_focus),
            refetch_on_reconnect: self.refetch_on_reconnect.or(defaults.refetch_on_reconnect),
            refetch_interval: self.refetch_interval.or(defaults.refetch_interval),
            refetch_interval_in_background: self
                .refetch_interval_in_background
                .or(defaults.refetch_interval_in_background),
            keep_previous_data: self.keep_previous_data.or(defaults.keep_previous_data),
            initial_data: self
                .initial_data
                .clone()
                .or_else(|| defaults.initial_data.clone()),
            initial_data_updated_at: self
                .initial_data_updated_at
                .or(defaults.initial_data_updated_at),
            select: self.select.clone().or_else(|| defaults.select.clone()),
            is_data_equal: self
                .is_data_equal
                .clone()
                .or_else(|| defaults.is_data_equal.clone()),
            notify_on_change_props: self
                .notify_on_change_props
                .clone()
                .or_else(|| defaults.notify_on_change_props.clone()),
            on_success: self
                .on_success
                .clone()
                .or_else(|| defaults.on_success.clone()),
            on_error: self.on_error.clone().or_else(|| defaults.on_error.clone()),
            on_settled: self
                .on_settled
                .clone()
                .or_else(|| defaults.on_settled.clone()),
        }
    }

    // Resolved accessors: unset fields fall back to engine defaults.

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub(crate) fn resolved_stale_time(&self) -> Duration {
        self.stale_time.unwrap_or(DEFAULT_STALE_TIME)
    }

    pub(crate) fn resolved_cache_time(&self) -> Duration {
        self.cache_time.unwrap_or(DEFAULT_CACHE_TIME)
    }

    pub(crate) fn resolved_retry(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_default()
    }

    pub(crate) fn resolved_retry_delay(&self) -> RetryDelay {
        self.retry_delay.clone().unwrap_or_default()
    }

    pub(crate) fn mount_policy(&self) -> RefetchPolicy {
        self.refetch_on_mount.unwrap_or_default()
    }

    pub(crate) fn focus_policy(&self) -> RefetchPolicy {
        self.refetch_on_window_focus.unwrap_or_default()
    }

    pub(crate) fn reconnect_policy(&self) -> RefetchPolicy {
        self.refetch_on_reconnect.unwrap_or_default()
    }

    pub(crate) fn keeps_previous_data(&self) -> bool {
        self.keep_previous_data.unwrap_or(false)
    }

    pub(crate) fn interval_in_background(&self) -> bool {
        self.refetch_interval_in_background.unwrap_or(false)
    }

    pub(crate) fn notify_props(&self) -> NotifyOnChangeProps {
        self.notify_on_change_props.clone().unwrap_or_default()
    }
}

/// Per-mutation configuration. Mutations default to `retry = Never`.
#[derive(Clone, Default)]
pub struct MutationOptions {
    pub mutation_key: Option<QueryKey>,
    pub mutation_fn: Option<MutationFunction>,
    pub retry: Option<RetryPolicy>,
    pub retry_delay: Option<RetryDelay>,
    pub cache_time: Option<Duration>,
    pub on_mutate: Option<MutateHook>,
    pub on_success: Option<MutationSuccessHook>,
    pub on_error: Option<MutationErrorHook>,
    pub on_settled: Option<MutationSettledHook>,
}

impl MutationOptions {
    /// Creates empty options; set a function with
    /// [`mutation_fn`](Self::mutation_fn).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifying key, used for default lookup and filtering (mutations are
    /// not deduplicated by key).
    #[must_use]
    pub fn mutation_key(mut self, key: impl Into<QueryKey>) -> Self {
        self.mutation_key = Some(key.into());
        self
    }

    /// Sets the mutation function.
    #[must_use]
    pub fn mutation_fn<F, Fut>(mut self, mutate: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
    {
        self.mutation_fn = Some(Arc::new(move |variables| mutate(variables).boxed()));
        self
    }

    /// Retry policy for failed attempts.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Delay between retry attempts.
    #[must_use]
    pub fn retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    /// Retention window for settled, unobserved mutations.
    #[must_use]
    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = Some(cache_time);
        self
    }

    /// Runs before the mutation function; its return value becomes the
    /// rollback context passed to the other hooks.
    #[must_use]
    pub fn on_mutate(
        mut self,
        hook: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.on_mutate = Some(Arc::new(hook));
        self
    }

    /// Runs after a successful mutation.
    #[must_use]
    pub fn on_success(
        mut self,
        hook: impl Fn(&Arc<Value>, &Value, Option<&Value>) + Send + Sync + 'static,
    ) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    /// Runs after a failed mutation.
    #[must_use]
    pub fn on_error(
        mut self,
        hook: impl Fn(&QueryError, &Value, Option<&Value>) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Runs after the mutation settles either way.
    #[must_use]
    pub fn on_settled(
        mut self,
        hook: impl Fn(Option<&Arc<Value>>, Option<&QueryError>, &Value, Option<&Value>)
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(hook));
        self
    }

    /// Fills unset fields from `defaults`.
    #[must_use]
    pub(crate) fn merged_over(&self, defaults: &MutationOptions) -> MutationOptions {
        MutationOptions {
            mutation_key: self
                .mutation_key
                .clone()
                .or_else(|| defaults.mutation_key.clone()),
            mutation_fn: self
                .mutation_fn
                .clone()
                .or_else(|| defaults.mutation_fn.clone()),
            retry: self.retry.clone().or_else(|| defaults.retry.clone()),
            retry_delay: self
                .retry_delay
                .clone()
                .or_else(|| defaults.retry_delay.clone()),
            cache_time: self.cache_time.or(defaults.cache_time),
            on_mutate: self.on_mutate.clone().or_else(|| defaults.on_mutate.clone()),
            on_success: self
                .on_success
                .clone()
                .or_else(|| defaults.on_success.clone()),
            on_error: self.on_error.clone().or_else(|| defaults.on_error.clone()),
            on_settled: self
                .on_settled
                .clone()
                .or_else(|| defaults.on_settled.clone()),
        }
    }

    pub(crate) fn resolved_retry(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or(RetryPolicy::Never)
    }

    pub(crate) fn resolved_retry_delay(&self) -> RetryDelay {
        self.retry_delay.clone().unwrap_or_default()
    }

    pub(crate) fn resolved_cache_time(&self) -> Duration {
        self.cache_time.unwrap_or(DEFAULT_CACHE_TIME)
    }
}

/// Client-wide defaults applied to every query and mutation.
#[derive(Clone, Default)]
pub struct DefaultOptions {
    pub queries: QueryOptions,
    pub mutations: MutationOptions,
}
