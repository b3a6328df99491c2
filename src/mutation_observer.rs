//! Mutation observation: result views and subscriptions.
//!
//! A [`MutationObserver`] tracks the most recent mutation it started and
//! derives a [`MutationObserverResult`] view for its subscribers, mirroring
//! the query observer protocol.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::mutation::{Mutation, MutationEvent, MutationStatus};
use crate::options::MutationOptions;

/// Derived view of one mutation for one consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationObserverResult {
    /// Lifecycle phase.
    pub status: MutationStatus,
    /// Result of a successful mutation.
    pub data: Option<Arc<Value>>,
    /// Last failure.
    pub error: Option<QueryError>,
    /// Variables of the current run.
    pub variables: Option<Value>,
    /// Consecutive failed attempts of the current run.
    pub failure_count: u32,
    /// Whether the run is parked waiting for focus/online.
    pub is_paused: bool,
    /// `status == Idle`.
    pub is_idle: bool,
    /// `status == Loading`.
    pub is_loading: bool,
    /// `status == Success`.
    pub is_success: bool,
    /// `status == Error`.
    pub is_error: bool,
}

impl MutationObserverResult {
    fn idle() -> Self {
        Self {
            status: MutationStatus::Idle,
            data: None,
            error: None,
            variables: None,
            failure_count: 0,
            is_paused: false,
            is_idle: true,
            is_loading: false,
            is_success: false,
            is_error: false,
        }
    }

    fn from_mutation(mutation: &Mutation) -> Self {
        let state = mutation.state();
        Self {
            status: state.status,
            data: state.data,
            error: state.error,
            variables: state.variables,
            failure_count: state.failure_count,
            is_paused: state.is_paused,
            is_idle: state.status == MutationStatus::Idle,
            is_loading: state.status == MutationStatus::Loading,
            is_success: state.status == MutationStatus::Success,
            is_error: state.status == MutationStatus::Error,
        }
    }
}

/// Listener invoked with each changed mutation view.
pub type MutationListener = Arc<dyn Fn(&MutationObserverResult) + Send + Sync>;

/// Subscription to the mutations started through it.
pub struct MutationObserver {
    client: QueryClient,
    options: Mutex<MutationOptions>,
    mutation: Mutex<Option<Arc<Mutation>>>,
    result: Mutex<MutationObserverResult>,
    listeners: Mutex<Vec<(u64, MutationListener)>>,
    next_listener_id: AtomicU64,
    notify_pending: AtomicBool,
}

impl MutationObserver {
    pub(crate) fn new(client: &QueryClient, options: MutationOptions) -> Arc<Self> {
        let defaulted = client.defaulted_mutation_options(&options);
        Arc::new(Self {
            client: client.clone(),
            options: Mutex::new(defaulted),
            mutation: Mutex::new(None),
            result: Mutex::new(MutationObserverResult::idle()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            notify_pending: AtomicBool::new(false),
        })
    }

    /// Snapshot of the observer's options.
    #[must_use]
    pub fn options(&self) -> MutationOptions {
        self.options.lock().clone()
    }

    /// Replaces the observer's options for subsequent mutations.
    pub fn set_options(&self, options: MutationOptions) {
        *self.options.lock() = self.client.defaulted_mutation_options(&options);
    }

    /// The latest derived result view.
    #[must_use]
    pub fn get_current_result(&self) -> MutationObserverResult {
        self.result.lock().clone()
    }

    /// Registers a listener; returns its id.
    pub fn subscribe(
        &self,
        listener: impl Fn(&MutationObserverResult) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener by id.
    pub fn unsubscribe(&self, id: u64) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    /// Builds a mutation with the observer's options and executes it.
    pub async fn mutate(self: &Arc<Self>, variables: Value) -> Result<Arc<Value>, QueryError> {
        if let Some(previous) = self.mutation.lock().take() {
            previous.remove_observer(self);
        }
        let mutation = self.client.mutation_cache().build(self.options());
        mutation.add_observer(self);
        *self.mutation.lock() = Some(Arc::clone(&mutation));
        self.update_result();
        mutation.execute(variables).await
    }

    /// Detaches from the current mutation and returns to the idle view.
    pub fn reset(self: &Arc<Self>) {
        if let Some(mutation) = self.mutation.lock().take() {
            mutation.remove_observer(self);
        }
        *self.result.lock() = MutationObserverResult::idle();
        self.schedule_notify();
    }

    /// Unsubscribes everything and detaches from the current mutation.
    pub fn destroy(self: &Arc<Self>) {
        self.listeners.lock().clear();
        if let Some(mutation) = self.mutation.lock().take() {
            mutation.remove_observer(self);
        }
    }

    pub(crate) fn on_mutation_update(self: &Arc<Self>, _event: &MutationEvent) {
        self.update_result();
    }

    fn update_result(self: &Arc<Self>) {
        let new_result = {
            let mutation = self.mutation.lock();
            match &*mutation {
                Some(mutation) => MutationObserverResult::from_mutation(mutation),
                None => MutationObserverResult::idle(),
            }
        };
        let changed = {
            let mut result = self.result.lock();
            if *result == new_result {
                false
            } else {
                *result = new_result;
                true
            }
        };
        if changed {
            self.schedule_notify();
        }
    }

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
            let listeners: Vec<MutationListener> = observer
                .listeners
                .lock()
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect();
            for listener in listeners {
                listener(&result);
            }
        });
    }
}

impl std::fmt::Debug for MutationObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationObserver")
            .field("result", &self.result.lock())
            .finish_non_exhaustive()
    }
}
