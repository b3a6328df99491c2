//! Prelude module for convenient imports.
//!
//! ```
//! use freshet::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryClient`] - The consumer-facing facade
//! - [`QueryOptions`] / [`MutationOptions`] - Configuration records
//! - [`QueryKey`] - Structured cache keys
//! - [`QueryFilters`] - Query selection criteria
//! - [`QueryError`] - The crate error type
//! - [`RetryPolicy`] / [`RetryDelay`] - Retry configuration

pub use crate::cache::QueryFilters;
pub use crate::client::{InvalidateOptions, QueryClient};
pub use crate::error::QueryError;
pub use crate::key::QueryKey;
pub use crate::observer::{QueryObserver, QueryObserverResult};
pub use crate::options::{DefaultOptions, MutationOptions, QueryOptions, RefetchPolicy};
pub use crate::query::QueryStatus;
pub use crate::retry::{CancelOptions, RetryDelay, RetryPolicy};
