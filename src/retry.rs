//! Retry with backoff, pause, and cancellation.
//!
//! A [`Retryer`] drives one fallible async operation to a settled result,
//! re-invoking it under a retry policy with a backoff delay between attempts.
//! While the process is hidden or offline a pending retry parks instead of
//! burning the timer; it resumes (restarting the full delay) when the
//! focus/online bus reports the process usable again, or when explicitly
//! continued.
//!
//! The settled result is exposed as a clonable [`Shared`] future, which is
//! what makes overlapping fetches for one query share a single in-flight
//! operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::time::sleep;

use crate::bus;
use crate::error::QueryError;

/// Result of a settled fetch or mutation attempt.
pub(crate) type FetchResult = Result<Arc<Value>, QueryError>;

/// Clonable handle to an in-flight operation's eventual result.
pub(crate) type FetchPromise = Shared<BoxFuture<'static, FetchResult>>;

/// Builds an already-settled promise, used for synchronous validation errors.
pub(crate) fn settled_promise(result: FetchResult) -> FetchPromise {
    futures::future::ready(result).boxed().shared()
}

/// Whether a failed attempt should be retried.
#[derive(Clone)]
pub enum RetryPolicy {
    /// Never retry.
    Never,
    /// Retry indefinitely.
    Always,
    /// Retry while the consecutive failure count is below the bound.
    Count(u32),
    /// Custom predicate over `(failure_count, error)`.
    Predicate(Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Count(3)
    }
}

impl RetryPolicy {
    /// Evaluates the policy after a failure. `failure_count` counts the
    /// failure that just occurred (1 on the first).
    #[must_use]
    pub fn should_retry(&self, failure_count: u32, error: &QueryError) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::Count(bound) => failure_count < *bound,
            Self::Predicate(predicate) => predicate(failure_count, error),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Never => write!(f, "Never"),
            Self::Always => write!(f, "Always"),
            Self::Count(bound) => write!(f, "Count({bound})"),
            Self::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Delay between a failed attempt and the next one.
#[derive(Clone)]
pub enum RetryDelay {
    /// The same delay after every failure.
    Fixed(Duration),
    /// `base * 2^failure_count`, capped at `max`.
    Exponential {
        /// Delay unit doubled per consecutive failure.
        base: Duration,
        /// Upper bound on the computed delay.
        max: Duration,
    },
    /// Custom function of the consecutive failure count.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl RetryDelay {
    /// Delay to wait after the given consecutive failure count.
    #[must_use]
    pub fn for_failure(&self, failure_count: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(failure_count.min(20));
                base.saturating_mul(factor).min(*max)
            }
            Self::Custom(delay_fn) => delay_fn(failure_count),
        }
    }
}

impl std::fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(delay) => write!(f, "Fixed({delay:?})"),
            Self::Exponential { base, max } => write!(f, "Exponential({base:?}, {max:?})"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// How a cancellation settles the owning operation.
#[derive(Debug, Clone, Copy)]
pub struct CancelOptions {
    /// Roll state back to the pre-fetch snapshot when prior data exists.
    pub revert: bool,
    /// Suppress observer error notifications.
    pub silent: bool,
}

impl Default for CancelOptions {
    fn default() -> Self {
        Self {
            revert: true,
            silent: false,
        }
    }
}

type AttemptFn = Arc<dyn Fn() -> BoxFuture<'static, FetchResult> + Send + Sync>;
type FailHook = Arc<dyn Fn(&QueryError, u32) + Send + Sync>;
type PauseHook = Arc<dyn Fn() + Send + Sync>;
type SuccessHook = Arc<dyn Fn(&Arc<Value>) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&QueryError) + Send + Sync>;

/// Configuration for one retryer run. Hooks feed the owning query or
/// mutation state machine and may be omitted.
#[derive(Default)]
pub(crate) struct RetryerConfig {
    pub operation: Option<AttemptFn>,
    pub retry: RetryPolicy,
    pub retry_delay: RetryDelay,
    pub on_fail: Option<FailHook>,
    pub on_pause: Option<PauseHook>,
    pub on_continue: Option<PauseHook>,
    pub on_success: Option<SuccessHook>,
    pub on_error: Option<ErrorHook>,
}

struct RetryerState {
    cancel_options: Mutex<Option<CancelOptions>>,
    cancel_notify: Notify,
    continue_notify: Notify,
    is_paused: AtomicBool,
    is_resolved: AtomicBool,
}

impl RetryerState {
    fn cancel_error(&self) -> QueryError {
        let options = self.cancel_options.lock().unwrap_or_default();
        QueryError::cancelled(options.revert, options.silent)
    }
}

/// Runs a fallible async operation under a retry/backoff/cancel policy.
pub(crate) struct Retryer {
    state: Arc<RetryerState>,
    promise: FetchPromise,
}

impl Retryer {
    /// Spawns the attempt loop. Must be called from within a tokio runtime.
    pub fn new(config: RetryerConfig) -> Self {
        let state = Arc::new(RetryerState {
            cancel_options: Mutex::new(None),
            cancel_notify: Notify::new(),
            continue_notify: Notify::new(),
            is_paused: AtomicBool::new(false),
            is_resolved: AtomicBool::new(false),
        });

        let (tx, rx) = oneshot::channel::<FetchResult>();
        let promise: FetchPromise = rx
            .map(|received| received.unwrap_or_else(|_| Err(QueryError::cancelled(false, true))))
            .boxed()
            .shared();

        let task_state = Arc::clone(&state);
        tokio::spawn(async move {
            let result = run_attempts(&config, &task_state).await;
            task_state.is_resolved.store(true, Ordering::SeqCst);
            match &result {
                Ok(value) => {
                    if let Some(hook) = &config.on_success {
                        hook(value);
                    }
                }
                Err(error) => {
                    if let Some(hook) = &config.on_error {
                        hook(error);
                    }
                }
            }
            let _ = tx.send(result);
        });

        Self { state, promise }
    }

    /// Clonable handle to the eventual result.
    pub fn promise(&self) -> FetchPromise {
        self.promise.clone()
    }

    /// Cancels the run: aborts the in-flight attempt (by dropping its
    /// future) or the pending delay, and settles with a cancellation error.
    pub fn cancel(&self, options: CancelOptions) {
        if self.state.is_resolved.load(Ordering::SeqCst) {
            return;
        }
        *self.state.cancel_options.lock() = Some(options);
        self.state.cancel_notify.notify_one();
    }

    /// Resumes a paused run without waiting for the focus/online bus.
    pub fn continue_retry(&self) {
        self.state.continue_notify.notify_one();
    }

    /// Whether the run is parked waiting for focus/online.
    pub fn is_paused(&self) -> bool {
        self.state.is_paused.load(Ordering::SeqCst)
    }

    /// Whether the run has settled.
    pub fn is_resolved(&self) -> bool {
        self.state.is_resolved.load(Ordering::SeqCst)
    }
}

async fn run_attempts(config: &RetryerConfig, state: &RetryerState) -> FetchResult {
    let Some(operation) = &config.operation else {
        return Err(QueryError::MissingQueryFn);
    };
    let mut failure_count = 0u32;
    loop {
        if state.cancel_options.lock().is_some() {
            return Err(state.cancel_error());
        }

        let mut attempt = operation();
        let outcome = tokio::select! {
            _ = state.cancel_notify.notified() => return Err(state.cancel_error()),
            result = &mut attempt => result,
        };

        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(error) if error.is_cancelled() => return Err(error),
            Err(error) => error,
        };

        failure_count += 1;
        if let Some(hook) = &config.on_fail {
            hook(&error, failure_count);
        }
        if !config.retry.should_retry(failure_count, &error) {
            return Err(error);
        }

        let delay = config.retry_delay.for_failure(failure_count);
        tracing::debug!(failure_count, ?delay, "attempt failed, backing off");
        if let Err(error) = wait_for_retry(config, state, delay).await {
            return Err(error);
        }
    }
}

/// Waits out the backoff delay, parking while the process is hidden or
/// offline. Resuming restarts the full delay. An explicit
/// [`Retryer::continue_retry`] resumes unconditionally.
async fn wait_for_retry(
    config: &RetryerConfig,
    state: &RetryerState,
    delay: Duration,
) -> Result<(), QueryError> {
    loop {
        let mut forced = false;
        if !bus::is_visible_and_online() {
            state.is_paused.store(true, Ordering::SeqCst);
            if let Some(hook) = &config.on_pause {
                hook();
            }
            let mut resume = bus::resume_events();
            let cancelled = loop {
                tokio::select! {
                    _ = state.cancel_notify.notified() => break true,
                    _ = state.continue_notify.notified() => {
                        forced = true;
                        break false;
                    }
                    event = resume.recv() => {
                        if event.is_err() || bus::is_visible_and_online() {
                            break false;
                        }
                    }
                }
            };
            state.is_paused.store(false, Ordering::SeqCst);
            if cancelled {
                return Err(state.cancel_error());
            }
            if let Some(hook) = &config.on_continue {
                hook();
            }
        }

        tokio::select! {
            _ = state.cancel_notify.notified() => return Err(state.cancel_error()),
            () = sleep(delay) => {}
        }

        if forced || bus::is_visible_and_online() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_operation(
        failures_before_success: u32,
        attempts: Arc<AtomicU32>,
    ) -> AttemptFn {
        Arc::new(move || {
            let attempts = Arc::clone(&attempts);
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= failures_before_success {
                    Err(QueryError::fetch(format!("failure {attempt}")))
                } else {
                    Ok(Arc::new(Value::from(attempt)))
                }
            }
            .boxed()
        })
    }

    #[test]
    fn test_retry_policy_evaluation() {
        let err = QueryError::fetch("x");
        assert!(!RetryPolicy::Never.should_retry(1, &err));
        assert!(RetryPolicy::Always.should_retry(999, &err));
        assert!(RetryPolicy::Count(3).should_retry(2, &err));
        assert!(!RetryPolicy::Count(3).should_retry(3, &err));

        let only_network =
            RetryPolicy::Predicate(Arc::new(|_, e| matches!(e, QueryError::Fetch(_))));
        assert!(only_network.should_retry(10, &err));
        assert!(!only_network.should_retry(1, &QueryError::MissingQueryFn));
    }

    #[test]
    fn test_exponential_delay_caps() {
        let delay = RetryDelay::default();
        assert_eq!(delay.for_failure(1), Duration::from_secs(2));
        assert_eq!(delay.for_failure(3), Duration::from_secs(8));
        assert_eq!(delay.for_failure(10), Duration::from_secs(30));
    }

    #[test]
    fn test_fixed_delay() {
        let delay = RetryDelay::Fixed(Duration::from_millis(5));
        assert_eq!(delay.for_failure(7), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let _guard = crate::test_support::BUS_LOCK.lock();
        let attempts = Arc::new(AtomicU32::new(0));
        let retryer = Retryer::new(RetryerConfig {
            operation: Some(counting_operation(2, Arc::clone(&attempts))),
            retry: RetryPolicy::Count(5),
            retry_delay: RetryDelay::Fixed(Duration::from_millis(1)),
            ..Default::default()
        });
        let result = retryer.promise().await.expect("eventual success");
        assert_eq!(*result, Value::from(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(retryer.is_resolved());
    }

    #[tokio::test]
    async fn test_exhausted_retries_settle_with_error() {
        let _guard = crate::test_support::BUS_LOCK.lock();
        let attempts = Arc::new(AtomicU32::new(0));
        let failures = Arc::new(AtomicU32::new(0));
        let failures_seen = Arc::clone(&failures);
        let retryer = Retryer::new(RetryerConfig {
            operation: Some(counting_operation(u32::MAX, Arc::clone(&attempts))),
            retry: RetryPolicy::Count(2),
            retry_delay: RetryDelay::Fixed(Duration::from_millis(1)),
            on_fail: Some(Arc::new(move |_, count| {
                failures_seen.store(count, Ordering::SeqCst);
            })),
            ..Default::default()
        });
        let error = retryer.promise().await.expect_err("should exhaust");
        assert_eq!(error, QueryError::fetch("failure 2"));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_during_delay() {
        let attempts = Arc::new(AtomicU32::new(0));
        let retryer = Retryer::new(RetryerConfig {
            operation: Some(counting_operation(u32::MAX, Arc::clone(&attempts))),
            retry: RetryPolicy::Always,
            retry_delay: RetryDelay::Fixed(Duration::from_secs(60)),
            ..Default::default()
        });
        // Give the first attempt time to fail and enter the backoff delay.
        sleep(Duration::from_millis(20)).await;
        retryer.cancel(CancelOptions {
            revert: false,
            silent: true,
        });
        let error = retryer.promise().await.expect_err("cancelled");
        assert!(error.is_silent_cancel());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_promise_is_shareable() {
        let attempts = Arc::new(AtomicU32::new(0));
        let retryer = Retryer::new(RetryerConfig {
            operation: Some(counting_operation(0, Arc::clone(&attempts))),
            retry: RetryPolicy::Never,
            ..Default::default()
        });
        let first = retryer.promise();
        let second = retryer.promise();
        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.expect("ok"), b.expect("ok"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_operation_settles_immediately() {
        let retryer = Retryer::new(RetryerConfig::default());
        let error = retryer.promise().await.expect_err("no operation");
        assert_eq!(error, QueryError::MissingQueryFn);
    }
}
