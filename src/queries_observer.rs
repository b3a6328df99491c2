//! Fan-out observation over an ordered list of queries.
//!
//! A [`QueriesObserver`] maintains one child [`QueryObserver`] per options
//! slot. Updating the list diffs slots by query hash: existing observers are
//! reused, removed ones destroyed, added ones created. Subscribers receive
//! one combined result list per notification batch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::observer::{QueryObserver, QueryObserverResult};
use crate::options::QueryOptions;

/// Listener invoked with the combined result list.
pub type QueriesListener = Arc<dyn Fn(&[QueryObserverResult]) + Send + Sync>;

struct ChildEntry {
    observer: Arc<QueryObserver>,
    listener_id: Option<u64>,
}

/// Observer over an ordered set of queries.
pub struct QueriesObserver {
    client: QueryClient,
    children: Mutex<Vec<ChildEntry>>,
    listeners: Mutex<Vec<(u64, QueriesListener)>>,
    next_listener_id: AtomicU64,
    notify_pending: AtomicBool,
}

impl QueriesObserver {
    pub(crate) fn new(
        client: &QueryClient,
        queries: Vec<QueryOptions>,
    ) -> Result<Arc<Self>, QueryError> {
        let observer = Arc::new(Self {
            client: client.clone(),
            children: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            notify_pending: AtomicBool::new(false),
        });
        observer.set_queries(queries)?;
        Ok(observer)
    }

    /// The combined result list, one view per slot in order.
    #[must_use]
    pub fn get_current_result(&self) -> Vec<QueryObserverResult> {
        self.children
            .lock()
            .iter()
            .map(|child| child.observer.get_current_result())
            .collect()
    }

    /// Replaces the observed list, diffing slots by query hash.
    ///
    /// Runs inside one notification batch, so subscribers see a single
    /// combined emission for the whole diff.
    pub fn set_queries(self: &Arc<Self>, queries: Vec<QueryOptions>) -> Result<(), QueryError> {
        crate::notify::batch(|| {
            let subscribed = !self.listeners.lock().is_empty();
            let previous = std::mem::take(&mut *self.children.lock());
            let mut by_hash: HashMap<String, ChildEntry> = previous
                .into_iter()
                .map(|child| (child.observer.query().query_hash().to_owned(), child))
                .collect();

            let mut next = Vec::with_capacity(queries.len());
            for options in queries {
                let defaulted = self.client.defaulted_query_options(&options);
                let Some(key) = defaulted.query_key.clone() else {
                    // Restore survivors before bailing out.
                    self.children.lock().extend(by_hash.into_values());
                    return Err(QueryError::MissingQueryKey);
                };
                let hash = key.canonical_hash();
                let child = match by_hash.remove(&hash) {
                    Some(existing) => {
                        existing.observer.set_options(defaulted)?;
                        existing
                    }
                    None => {
                        let observer = QueryObserver::new(&self.client, defaulted)?;
                        let listener_id = subscribed.then(|| self.attach(&observer));
                        ChildEntry {
                            observer,
                            listener_id,
                        }
                    }
                };
                next.push(child);
            }

            for (_, removed) in by_hash {
                removed.observer.destroy();
            }
            *self.children.lock() = next;
            self.schedule_emit();
            Ok(())
        })
    }

    /// Registers a listener for the combined result list; returns its id.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&[QueryObserverResult]) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let first = {
            let mut listeners = self.listeners.lock();
            let first = listeners.is_empty();
            listeners.push((id, Arc::new(listener)));
            first
        };
        if first {
            // Attach outside the children lock: a child subscription can
            // flush notifications that read the combined result.
            let pending: Vec<(usize, Arc<QueryObserver>)> = {
                let children = self.children.lock();
                children
                    .iter()
                    .enumerate()
                    .filter(|(_, child)| child.listener_id.is_none())
                    .map(|(index, child)| (index, Arc::clone(&child.observer)))
                    .collect()
            };
            for (index, observer) in pending {
                let listener_id = self.attach(&observer);
                if let Some(child) = self.children.lock().get_mut(index) {
                    child.listener_id = Some(listener_id);
                }
            }
        }
        id
    }

    /// Removes a listener by id; the last removal detaches every child.
    pub fn unsubscribe(self: &Arc<Self>, id: u64) {
        let now_empty = {
            let mut listeners = self.listeners.lock();
            let before = listeners.len();
            listeners.retain(|(lid, _)| *lid != id);
            before > listeners.len() && listeners.is_empty()
        };
        if now_empty {
            self.detach_children();
        }
    }

    /// Destroys every child observer and releases references.
    pub fn destroy(self: &Arc<Self>) {
        self.listeners.lock().clear();
        self.detach_children();
        for child in self.children.lock().drain(..) {
            child.observer.destroy();
        }
    }

    fn attach(self: &Arc<Self>, child: &Arc<QueryObserver>) -> u64 {
        let weak = Arc::downgrade(self);
        child.subscribe(move |_result| {
            if let Some(parent) = weak.upgrade() {
                parent.schedule_emit();
            }
        })
    }

    fn detach_children(self: &Arc<Self>) {
        let mut children = self.children.lock();
        for child in children.iter_mut() {
            if let Some(listener_id) = child.listener_id.take() {
                child.observer.unsubscribe(listener_id);
            }
        }
    }

    fn schedule_emit(self: &Arc<Self>) {
        if self.notify_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        crate::notify::schedule(move || {
            let Some(observer) = weak.upgrade() else {
                return;
            };
            observer.notify_pending.store(false, Ordering::SeqCst);
            let combined = observer.get_current_result();
            let listeners: Vec<QueriesListener> = observer
                .listeners
                .lock()
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect();
            for listener in listeners {
                listener(&combined);
            }
        });
    }
}

impl std::fmt::Debug for QueriesObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueriesObserver")
            .field("children", &self.children.lock().len())
            .finish_non_exhaustive()
    }
}
