//! Coalesced notification scheduling.
//!
//! Many state changes in one logical step should yield one round of observer
//! notifications. Callers wrap compound operations in [`batch`]; callbacks
//! queued through [`schedule`] while a batch is open are deferred and flushed
//! in enqueue order when the outermost batch closes. Outside a batch,
//! scheduled callbacks run immediately.
//!
//! Batches are per-thread: the engine's scheduling model is cooperative and
//! single-threaded, and state changes performed on another thread flush on
//! that thread.
//!
//! # Example
//!
//! ```
//! use freshet::notify;
//!
//! let value = notify::batch(|| {
//!     notify::schedule(|| { /* deferred until the batch closes */ });
//!     42
//! });
//! assert_eq!(value, 42);
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// A queued notification callback.
pub type BatchCallback = Box<dyn FnOnce() + Send>;

/// Outer wrapper invoked around each flushed callback.
///
/// UI bindings install one to wrap notifications in a render transaction.
pub type BatchNotifyFn = Arc<dyn Fn(BatchCallback) + Send + Sync>;

static BATCH_NOTIFY_FN: Lazy<Mutex<Option<BatchNotifyFn>>> = Lazy::new(|| Mutex::new(None));

struct BatchState {
    depth: usize,
    queue: VecDeque<BatchCallback>,
}

thread_local! {
    static BATCH: RefCell<BatchState> = RefCell::new(BatchState {
        depth: 0,
        queue: VecDeque::new(),
    });
}

/// Runs `f` inside a notification batch and returns its value.
///
/// Callbacks scheduled while the batch is open fire in enqueue order, exactly
/// once each, after `f` returns. Nested calls share the outermost batch.
pub fn batch<T>(f: impl FnOnce() -> T) -> T {
    BATCH.with(|state| state.borrow_mut().depth += 1);
    let _guard = BatchGuard;
    f()
}

/// Enqueues `f` into the open batch, or runs it immediately if none is open.
pub fn schedule(f: impl FnOnce() + Send + 'static) {
    let mut callback: Option<BatchCallback> = Some(Box::new(f));
    BATCH.with(|state| {
        let mut state = state.borrow_mut();
        if state.depth > 0 {
            if let Some(cb) = callback.take() {
                state.queue.push_back(cb);
            }
        }
    });
    if let Some(cb) = callback {
        run_one(cb);
    }
}

/// Lifts `f` so that each invocation is deferred through [`schedule`].
pub fn batch_calls<A>(f: impl Fn(A) + Send + Sync + 'static) -> impl Fn(A) + Send + Sync + 'static
where
    A: Send + 'static,
{
    let f = Arc::new(f);
    move |arg: A| {
        let f = Arc::clone(&f);
        schedule(move || f(arg));
    }
}

/// Installs an outer wrapper invoked around every flushed callback.
pub fn set_batch_notify_fn(wrapper: BatchNotifyFn) {
    *BATCH_NOTIFY_FN.lock() = Some(wrapper);
}

/// Removes a previously installed wrapper.
pub fn clear_batch_notify_fn() {
    *BATCH_NOTIFY_FN.lock() = None;
}

/// Closes the batch on drop so callbacks flush even if the batch body panics.
struct BatchGuard;

impl Drop for BatchGuard {
    fn drop(&mut self) {
        let ready = BATCH.with(|state| {
            let mut state = state.borrow_mut();
            state.depth -= 1;
            if state.depth == 0 {
                Some(std::mem::take(&mut state.queue))
            } else {
                None
            }
        });
        if let Some(queue) = ready {
            for cb in queue {
                run_one(cb);
            }
        }
    }
}

fn run_one(cb: BatchCallback) {
    let wrapper = BATCH_NOTIFY_FN.lock().clone();
    let invoke = move || match wrapper {
        Some(wrap) => wrap(cb),
        None => cb(),
    };
    // A panicking callback must not prevent later callbacks from running.
    if catch_unwind(AssertUnwindSafe(invoke)).is_err() {
        tracing::error!("notification callback panicked");
    }
}
