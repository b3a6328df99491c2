//! One-shot asynchronous writes with lifecycle tracking.
//!
//! A [`Mutation`] tracks a single write operation through
//! `idle → loading → success | error`, driving the user's mutate function
//! through the same retry runner queries use. Unlike queries, mutations are
//! not keyed for deduplication: concurrent mutations with identical keys
//! coexist. After a successful mutation, callers typically invalidate the
//! queries it affected to trigger refetching.

use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::error::QueryError;
use crate::mutation_cache::{MutationCache, MutationCacheEvent};
use crate::mutation_observer::MutationObserver;
use crate::options::{MutationOptions, CACHE_TIME_FOREVER};
use crate::retry::{FetchPromise, Retryer, RetryerConfig};

/// Lifecycle phase of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    /// Not started.
    Idle,
    /// The mutate function is running (or parked offline).
    Loading,
    /// Settled with data.
    Success,
    /// Settled with an error.
    Error,
}

/// Observable state of one mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationState {
    /// Lifecycle phase.
    pub status: MutationStatus,
    /// Result of a successful mutation.
    pub data: Option<Arc<Value>>,
    /// Last failure.
    pub error: Option<QueryError>,
    /// Variables the mutation ran with.
    pub variables: Option<Value>,
    /// Rollback context produced by the `on_mutate` hook.
    pub context: Option<Value>,
    /// Consecutive failed attempts of the current run.
    pub failure_count: u32,
    /// Whether the run is parked waiting for focus/online.
    pub is_paused: bool,
}

impl MutationState {
    fn initial() -> Self {
        Self {
            status: MutationStatus::Idle,
            data: None,
            error: None,
            variables: None,
            context: None,
            failure_count: 0,
            is_paused: false,
        }
    }
}

/// Events driving the mutation state machine.
#[derive(Debug, Clone)]
pub(crate) enum MutationEvent {
    Loading {
        variables: Value,
        context: Option<Value>,
    },
    Failed,
    Pause,
    Continue,
    Success {
        data: Arc<Value>,
    },
    Error {
        error: QueryError,
    },
}

/// A tracked write operation.
pub struct Mutation {
    mutation_id: u64,
    cache: Weak<MutationCache>,
    options: Mutex<MutationOptions>,
    state: Mutex<MutationState>,
    observers: Mutex<Vec<Arc<MutationObserver>>>,
    retryer: Mutex<Option<Retryer>>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl Mutation {
    pub(crate) fn new(
        cache: Weak<MutationCache>,
        mutation_id: u64,
        options: MutationOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            mutation_id,
            cache,
            options: Mutex::new(options),
            state: Mutex::new(MutationState::initial()),
            observers: Mutex::new(Vec::new()),
            retryer: Mutex::new(None),
            gc_task: Mutex::new(None),
        })
    }

    /// Monotonic id; enqueue order within the owning cache.
    #[must_use]
    pub fn mutation_id(&self) -> u64 {
        self.mutation_id
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> MutationState {
        self.state.lock().clone()
    }

    /// Snapshot of the effective options.
    #[must_use]
    pub fn options(&self) -> MutationOptions {
        self.options.lock().clone()
    }

    /// Whether the run is parked waiting for focus/online.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state.lock().is_paused
    }

    pub(crate) fn add_observer(self: &Arc<Self>, observer: &Arc<MutationObserver>) {
        let mut observers = self.observers.lock();
        if !observers.iter().any(|o| Arc::ptr_eq(o, observer)) {
            observers.push(Arc::clone(observer));
            drop(observers);
            self.clear_gc();
        }
    }

    pub(crate) fn remove_observer(self: &Arc<Self>, observer: &Arc<MutationObserver>) {
        self.observers.lock().retain(|o| !Arc::ptr_eq(o, observer));
        self.maybe_schedule_gc();
    }

    /// Runs the mutate function through the retry runner, firing lifecycle
    /// hooks around it.
    pub(crate) async fn execute(self: &Arc<Self>, variables: Value) -> Result<Arc<Value>, QueryError> {
        let options = self.options();
        let Some(mutation_fn) = options.mutation_fn.clone() else {
            return Err(QueryError::MissingMutationFn);
        };

        let context = options.on_mutate.as_ref().and_then(|hook| hook(&variables));
        self.dispatch(MutationEvent::Loading {
            variables: variables.clone(),
            context: context.clone(),
        });

        let on_fail = Arc::downgrade(self);
        let on_pause = Arc::downgrade(self);
        let on_continue = Arc::downgrade(self);
        let operation_variables = variables.clone();

        let retryer = Retryer::new(RetryerConfig {
            operation: Some(Arc::new(move || {
                let mutate = Arc::clone(&mutation_fn);
                let variables = operation_variables.clone();
                async move { mutate(variables).await.map(Arc::new) }.boxed()
            })),
            retry: options.resolved_retry(),
            retry_delay: options.resolved_retry_delay(),
            on_fail: Some(Arc::new(move |_error, _count| {
                if let Some(mutation) = on_fail.upgrade() {
                    mutation.dispatch(MutationEvent::Failed);
                }
            })),
            on_pause: Some(Arc::new(move || {
                if let Some(mutation) = on_pause.upgrade() {
                    mutation.dispatch(MutationEvent::Pause);
                }
            })),
            on_continue: Some(Arc::new(move || {
                if let Some(mutation) = on_continue.upgrade() {
                    mutation.dispatch(MutationEvent::Continue);
                }
            })),
            ..Default::default()
        });

        let promise = retryer.promise();
        *self.retryer.lock() = Some(retryer);
        let result = promise.await;
        *self.retryer.lock() = None;

        match &result {
            Ok(data) => {
                self.dispatch(MutationEvent::Success {
                    data: Arc::clone(data),
                });
                if let Some(hook) = &options.on_success {
                    hook(data, &variables, context.as_ref());
                }
                if let Some(hook) = &options.on_settled {
                    hook(Some(data), None, &variables, context.as_ref());
                }
            }
            Err(error) => {
                self.dispatch(MutationEvent::Error {
                    error: error.clone(),
                });
                if let Some(hook) = &options.on_error {
                    hook(error, &variables, context.as_ref());
                }
                if let Some(hook) = &options.on_settled {
                    hook(None, Some(error), &variables, context.as_ref());
                }
            }
        }

        self.maybe_schedule_gc();
        result
    }

    /// Resumes a paused run without waiting for the focus/online bus.
    pub(crate) fn continue_execute(&self) {
        if let Some(retryer) = &*self.retryer.lock() {
            retryer.continue_retry();
        }
    }

    /// Promise of the in-flight run, if any.
    pub(crate) fn inflight_promise(&self) -> Option<FetchPromise> {
        self.retryer.lock().as_ref().map(Retryer::promise)
    }

    /// Arms removal once settled and unobserved.
    pub(crate) fn maybe_schedule_gc(self: &Arc<Self>) {
        if !self.observers.lock().is_empty() {
            return;
        }
        if !matches!(
            self.state.lock().status,
            MutationStatus::Success | MutationStatus::Error
        ) {
            return;
        }
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
            let Some(mutation) = weak.upgrade() else {
                return;
            };
            if mutation.observers.lock().is_empty() {
                if let Some(cache) = mutation.cache.upgrade() {
                    cache.remove(&mutation);
                }
            }
        });
        *self.gc_task.lock() = Some(task);
    }

    fn clear_gc(&self) {
        if let Some(task) = self.gc_task.lock().take() {
            task.abort();
        }
    }

    pub(crate) fn destroy(&self) {
        self.clear_gc();
        if let Some(retryer) = &*self.retryer.lock() {
            retryer.cancel(crate::retry::CancelOptions {
                revert: false,
                silent: true,
            });
        }
    }

    fn dispatch(self: &Arc<Self>, event: MutationEvent) {
        {
            let mut state = self.state.lock();
            let next = reduce(&state, &event);
            *state = next;
        }
        let observers = self.observers.lock().clone();
        crate::notify::batch(|| {
            for observer in &observers {
                observer.on_mutation_update(&event);
            }
            if let Some(cache) = self.cache.upgrade() {
                cache.notify(&MutationCacheEvent::Updated(Arc::clone(self)));
            }
        });
    }
}

impl std::fmt::Debug for Mutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation")
            .field("mutation_id", &self.mutation_id)
            .field("state", &self.state.lock())
            .finish_non_exhaustive()
    }
}

fn reduce(state: &MutationState, event: &MutationEvent) -> MutationState {
    match event {
        MutationEvent::Loading { variables, context } => MutationState {
            status: MutationStatus::Loading,
            data: None,
            error: None,
            variables: Some(variables.clone()),
            context: context.clone(),
            failure_count: 0,
            is_paused: false,
        },
        MutationEvent::Failed => {
            let mut next = state.clone();
            next.failure_count += 1;
            next
        }
        MutationEvent::Pause => {
            let mut next = state.clone();
            next.is_paused = true;
            next
        }
        MutationEvent::Continue => {
            let mut next = state.clone();
            next.is_paused = false;
            next
        }
        MutationEvent::Success { data } => {
            let mut next = state.clone();
            next.status = MutationStatus::Success;
            next.data = Some(Arc::clone(data));
            next.error = None;
            next.is_paused = false;
            next
        }
        MutationEvent::Error { error } => {
            let mut next = state.clone();
            next.status = MutationStatus::Error;
            next.error = Some(error.clone());
            next.failure_count += 1;
            next.is_paused = false;
            next
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_initial_state_is_idle() {
        let state = MutationState::initial();
        assert_eq!(state.status, MutationStatus::Idle);
        assert!(state.data.is_none());
        assert!(state.variables.is_none());
    }

    #[test]
    fn test_reduce_loading_resets_previous_run() {
        let mut state = MutationState::initial();
        state.status = MutationStatus::Error;
        state.error = Some(QueryError::fetch("old"));
        state.failure_count = 2;

        let next = reduce(
            &state,
            &MutationEvent::Loading {
                variables: json!({"id": 1}),
                context: Some(json!("ctx")),
            },
        );
        assert_eq!(next.status, MutationStatus::Loading);
        assert!(next.error.is_none());
        assert_eq!(next.failure_count, 0);
        assert_eq!(next.variables, Some(json!({"id": 1})));
        assert_eq!(next.context, Some(json!("ctx")));
    }

    #[test]
    fn test_reduce_success_and_error() {
        let loading = reduce(
            &MutationState::initial(),
            &MutationEvent::Loading {
                variables: json!(1),
                context: None,
            },
        );

        let success = reduce(
            &loading,
            &MutationEvent::Success {
                data: Arc::new(json!("done")),
            },
        );
        assert_eq!(success.status, MutationStatus::Success);
        assert_eq!(*success.data.clone().expect("data"), json!("done"));

        let failed = reduce(&loading, &MutationEvent::Failed);
        let error = reduce(
            &failed,
            &MutationEvent::Error {
                error: QueryError::fetch("boom"),
            },
        );
        assert_eq!(error.status, MutationStatus::Error);
        assert_eq!(error.failure_count, 2);
    }

    #[test]
    fn test_reduce_pause_continue() {
        let state = reduce(&MutationState::initial(), &MutationEvent::Pause);
        assert!(state.is_paused);
        let state = reduce(&state, &MutationEvent::Continue);
        assert!(!state.is_paused);
    }
}
