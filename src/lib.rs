//! # Freshet - Asynchronous Query Caching Engine
//!
//! Freshet is an in-process asynchronous data cache for client applications,
//! built on top of [tokio](https://tokio.rs/). It mediates between UI
//! components and remote data sources by memoizing the in-flight and settled
//! results of user-supplied fetch functions, keyed by structured identifiers,
//! and by notifying interested observers when cached state changes.
//!
//! ## Architecture
//!
//! The engine is built from small cooperating parts:
//!
//! 1. **Key**: structured identifiers with a canonical hash, so semantically
//!    equal keys share one cache entry
//! 2. **Query**: the per-key state machine (fetch, retry, cancel,
//!    stale/fresh, garbage collection)
//! 3. **Query cache**: the keyed store and lifecycle event source
//! 4. **Observers**: subscriptions that derive result views and drive
//!    automatic refetching
//! 5. **Mutations**: symmetric storage for write operations
//! 6. **Client**: the consumer-facing facade over both caches
//!
//! ## Core Components
//!
//! - [`client::QueryClient`]: the facade exposing fetch, prefetch,
//!   invalidate, cancel, refetch, and defaults management
//! - [`observer::QueryObserver`]: a subscription from one consumer to one
//!   query, with callback and stream delivery
//! - [`notify`]: the coalesced notification scheduler
//! - [`hydration`]: dehydrate/hydrate across a serialization boundary
//!
//! ## Example
//!
//! ```rust,no_run
//! use freshet::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), QueryError> {
//! let client = QueryClient::new();
//! client.mount();
//!
//! // Explicit fetch: fresh cached data short-circuits the network.
//! let todos = client
//!     .fetch_query_data(
//!         QueryOptions::new("todos").query_fn(|| async { Ok(json!(["learn freshet"])) }),
//!     )
//!     .await?;
//!
//! // Observation: the listener fires on every result-view change.
//! let observer = client.watch_query(
//!     QueryOptions::new("todos").query_fn(|| async { Ok(json!(["learn freshet"])) }),
//! )?;
//! let subscription = observer.subscribe(|result| {
//!     println!("todos changed: {:?}", result.data);
//! });
//! # observer.unsubscribe(subscription);
//! # let _ = todos;
//! # Ok(())
//! # }
//! ```
//!
//! ## Revalidation
//!
//! Stale queries refetch automatically on observer subscribe, window focus,
//! reconnect, and on a configurable interval. The host wires visibility and
//! connectivity transitions into [`bus::FocusManager`] and
//! [`bus::OnlineManager`]; mounted clients revalidate on transitions, and
//! paused retries resume.

pub mod bus;
pub mod cache;
pub mod client;
pub mod error;
pub mod hydration;
pub mod key;
pub mod mutation;
pub mod mutation_cache;
pub mod mutation_observer;
pub mod notify;
pub mod observer;
pub mod options;
pub mod prelude;
pub mod queries_observer;
pub mod query;
pub mod retry;
pub mod time;

// Re-export commonly used types
pub use cache::{CacheListener, QueryCache, QueryCacheEvent, QueryFilters};
pub use client::{InvalidateOptions, QueryClient};
pub use error::QueryError;
pub use futures::stream::BoxStream;
pub use hydration::{
    dehydrate, hydrate, DehydrateOptions, DehydratedQuery, DehydratedState, HydrateOptions,
};
pub use key::QueryKey;
pub use mutation::{Mutation, MutationState, MutationStatus};
pub use mutation_cache::{MutationCache, MutationCacheEvent, MutationFilters};
pub use mutation_observer::{MutationObserver, MutationObserverResult};
pub use observer::{ObserverStream, QueryObserver, QueryObserverResult, TrackedResult};
pub use options::{
    DefaultOptions, MutationOptions, NotifyOnChangeProps, QueryOptions, RefetchPolicy, ResultField,
    CACHE_TIME_FOREVER, DEFAULT_CACHE_TIME, DEFAULT_STALE_TIME,
};
pub use queries_observer::QueriesObserver;
pub use query::{Query, QueryState, QueryStatus};
pub use retry::{CancelOptions, RetryDelay, RetryPolicy};

#[cfg(test)]
pub(crate) mod test_support {
    use parking_lot::Mutex;

    // Unit tests that read or flip the process-wide focus/online state take
    // this lock so concurrent tests observe a consistent bus.
    pub static BUS_LOCK: Mutex<()> = Mutex::new(());
}
