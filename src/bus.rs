//! Process-wide focus and online signals.
//!
//! The host environment reports window visibility and network connectivity
//! here; mounted clients subscribe and revalidate their caches on transitions,
//! and paused retry runners park until [`resume_events`] fires.
//!
//! Both managers default to the usable state (focused, online) so the engine
//! behaves normally in headless and test environments that never install an
//! event source.
//!
//! # Example
//!
//! ```
//! use freshet::bus::{FocusManager, OnlineManager, is_visible_and_online};
//!
//! OnlineManager::global().set_online(false);
//! assert!(!is_visible_and_online());
//! OnlineManager::global().set_online(true);
//! assert!(is_visible_and_online());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Callback invoked with the new state on every transition.
pub type BusListener = Arc<dyn Fn(bool) + Send + Sync>;

/// Hook that installs a platform event source.
///
/// The hook receives a setter; platform code calls it on every
/// visibility/connectivity transition.
pub type EventSource = Box<dyn FnOnce(Arc<dyn Fn(bool) + Send + Sync>) + Send>;

static RESUME_TX: Lazy<broadcast::Sender<()>> = Lazy::new(|| broadcast::channel(16).0);

/// Subscribes to resume events, fired whenever the process becomes visible
/// and online again. Paused retry runners wait on this channel.
pub(crate) fn resume_events() -> broadcast::Receiver<()> {
    RESUME_TX.subscribe()
}

fn emit_resume_if_usable() {
    if is_visible_and_online() {
        let _ = RESUME_TX.send(());
    }
}

/// Returns `true` when the process is both focused and online.
#[must_use]
pub fn is_visible_and_online() -> bool {
    FocusManager::global().is_focused() && OnlineManager::global().is_online()
}

struct BusState {
    value: bool,
    listeners: Vec<(u64, BusListener)>,
}

/// Shared implementation behind the focus and online managers.
struct SignalManager {
    state: Mutex<BusState>,
    next_id: AtomicU64,
}

impl SignalManager {
    fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                value: true,
                listeners: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    fn get(&self) -> bool {
        self.state.lock().value
    }

    fn set(&self, value: bool) {
        let listeners: Vec<BusListener> = {
            let mut state = self.state.lock();
            state.value = value;
            state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            listener(value);
        }
        emit_resume_if_usable();
    }

    fn subscribe(&self, listener: BusListener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.state.lock().listeners.push((id, listener));
        id
    }

    fn unsubscribe(&self, id: u64) {
        self.state.lock().listeners.retain(|(lid, _)| *lid != id);
    }
}

/// Window focus signal.
pub struct FocusManager {
    inner: SignalManager,
}

impl FocusManager {
    /// The process-wide focus manager.
    pub fn global() -> &'static FocusManager {
        static INSTANCE: Lazy<FocusManager> = Lazy::new(|| FocusManager {
            inner: SignalManager::new(),
        });
        &INSTANCE
    }

    /// Whether the window is currently focused.
    #[must_use]
    pub fn is_focused(&self) -> bool {
        self.inner.get()
    }

    /// Reports a focus transition. Safe to call from tests.
    pub fn set_focused(&self, focused: bool) {
        tracing::trace!(focused, "focus transition");
        self.inner.set(focused);
    }

    /// Installs the platform focus event source.
    ///
    /// The hook is called once with a setter it should invoke on every
    /// visibility transition.
    pub fn set_event_source(&self, source: EventSource) {
        source(Arc::new(|focused| {
            FocusManager::global().set_focused(focused);
        }));
    }

    /// Registers a listener invoked on every transition; returns its id.
    pub fn subscribe(&self, listener: BusListener) -> u64 {
        self.inner.subscribe(listener)
    }

    /// Removes a listener by id.
    pub fn unsubscribe(&self, id: u64) {
        self.inner.unsubscribe(id);
    }
}

/// Network connectivity signal.
pub struct OnlineManager {
    inner: SignalManager,
}

impl OnlineManager {
    /// The process-wide online manager.
    pub fn global() -> &'static OnlineManager {
        static INSTANCE: Lazy<OnlineManager> = Lazy::new(|| OnlineManager {
            inner: SignalManager::new(),
        });
        &INSTANCE
    }

    /// Whether the network is currently reachable.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.inner.get()
    }

    /// Reports a connectivity transition. Safe to call from tests.
    pub fn set_online(&self, online: bool) {
        tracing::trace!(online, "connectivity transition");
        self.inner.set(online);
    }

    /// Installs the platform connectivity event source.
    pub fn set_event_source(&self, source: EventSource) {
        source(Arc::new(|online| {
            OnlineManager::global().set_online(online);
        }));
    }

    /// Registers a listener invoked on every transition; returns its id.
    pub fn subscribe(&self, listener: BusListener) -> u64 {
        self.inner.subscribe(listener)
    }

    /// Removes a listener by id.
    pub fn unsubscribe(&self, id: u64) {
        self.inner.unsubscribe(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::BUS_LOCK;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_defaults_to_usable() {
        let _guard = BUS_LOCK.lock();
        FocusManager::global().set_focused(true);
        OnlineManager::global().set_online(true);
        assert!(is_visible_and_online());
    }

    #[test]
    fn test_listener_receives_transitions() {
        let _guard = BUS_LOCK.lock();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = FocusManager::global().subscribe(Arc::new(move |v| sink.lock().push(v)));

        FocusManager::global().set_focused(false);
        FocusManager::global().set_focused(true);
        FocusManager::global().unsubscribe(id);
        FocusManager::global().set_focused(true);

        assert_eq!(*seen.lock(), vec![false, true], "unsubscribed before the last transition");
    }

    #[test]
    fn test_event_source_drives_manager() {
        let _guard = BUS_LOCK.lock();
        let installs = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&installs);
        OnlineManager::global().set_event_source(Box::new(move |set_online| {
            count.fetch_add(1, Ordering::SeqCst);
            set_online(true);
        }));
        assert_eq!(installs.load(Ordering::SeqCst), 1);
        assert!(OnlineManager::global().is_online());
    }

    #[tokio::test]
    async fn test_resume_event_fires_when_usable_again() {
        let _guard = BUS_LOCK.lock();
        FocusManager::global().set_focused(true);
        OnlineManager::global().set_online(false);
        let mut rx = resume_events();
        OnlineManager::global().set_online(true);
        tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv())
            .await
            .expect("resume event within timeout")
            .expect("channel open");
    }
}
