//! Error types shared by queries and mutations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for query and mutation operations.
///
/// Errors are stored inside query state and cloned into every derived result
/// view, so the type is `Clone` and carries owned message strings rather than
/// source errors.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryError {
    /// The user-supplied fetch function rejected.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// The operation was cancelled before it settled.
    ///
    /// `revert` records whether the owning query rolled back to its pre-fetch
    /// state; `silent` suppresses observer error notifications.
    #[error("operation cancelled")]
    Cancelled {
        /// Whether state was reverted to the pre-fetch snapshot.
        revert: bool,
        /// Whether observer notifications were suppressed.
        silent: bool,
    },

    /// An operation requiring a query key was invoked without one.
    #[error("a query key is required")]
    MissingQueryKey,

    /// A fetch was requested for a query that has no fetch function.
    #[error("a query function is required")]
    MissingQueryFn,

    /// A mutation was executed without a mutation function.
    #[error("a mutation function is required")]
    MissingMutationFn,
}

impl QueryError {
    /// Creates a fetch error from any displayable message.
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch(message.into())
    }

    /// Returns `true` if this error is a cancellation marker.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns `true` for a cancellation that suppresses notifications.
    #[must_use]
    pub const fn is_silent_cancel(&self) -> bool {
        matches!(self, Self::Cancelled { silent: true, .. })
    }

    pub(crate) const fn cancelled(revert: bool, silent: bool) -> Self {
        Self::Cancelled { revert, silent }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        let err = QueryError::fetch("boom");
        assert_eq!(err.to_string(), "fetch failed: boom");
    }

    #[test]
    fn test_cancelled_predicates() {
        let err = QueryError::cancelled(true, false);
        assert!(err.is_cancelled());
        assert!(!err.is_silent_cancel());

        let err = QueryError::cancelled(false, true);
        assert!(err.is_silent_cancel());

        assert!(!QueryError::MissingQueryKey.is_cancelled());
    }

    #[test]
    fn test_serde_round_trip() {
        let err = QueryError::fetch("network down");
        let json = serde_json::to_string(&err).expect("serialize");
        let back: QueryError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, err);
    }
}
