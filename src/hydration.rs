//! Dehydrate/hydrate: cache transport across a serialization boundary.
//!
//! [`dehydrate`] snapshots a subset of the query cache (by default, the
//! successful entries) into a plain serializable tree; [`hydrate`] merges
//! such a tree into another cache, resolving conflicts by freshness — a
//! dehydrated entry only overwrites an existing query when it is strictly
//! newer.
//!
//! The payload round-trips through any serializer restricted to strings,
//! numbers, booleans, nulls, arrays, and objects. A `cache_time` of
//! "retain forever" is encoded as `-1`, since such formats cannot represent
//! infinity. Hydration is lenient at this trust boundary: non-object
//! payloads and unparseable entries are skipped, not errors.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::notify;
use crate::options::{QueryOptions, CACHE_TIME_FOREVER};
use crate::query::{Query, QueryState, QueryStatus};
use crate::time::duration_ms;

/// Serialized snapshot of part of a query cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DehydratedState {
    /// The dehydrated queries, in cache insertion order.
    pub queries: Vec<DehydratedQuery>,
}

/// One serialized query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedQuery {
    /// The structured key.
    pub query_key: Value,
    /// Canonical hash of the key.
    pub query_hash: String,
    /// Settled state fields.
    pub state: DehydratedQueryState,
    /// Configuration that must survive the boundary.
    pub config: DehydratedQueryConfig,
}

/// Serialized query state. Transient fields (`is_fetching`, `is_paused`) are
/// not transported; a restored query is never mid-fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedQueryState {
    pub data: Option<Value>,
    pub data_updated_at: u64,
    pub error: Option<QueryError>,
    pub error_updated_at: u64,
    pub status: QueryStatus,
    pub is_invalidated: bool,
    pub fetch_failure_count: u32,
    pub updated_at: u64,
}

/// Serialized per-query configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedQueryConfig {
    /// Retention window in milliseconds; `-1` means retain forever.
    pub cache_time: i64,
}

/// Options for [`dehydrate`].
#[derive(Clone, Default)]
pub struct DehydrateOptions {
    /// Which queries to include. Defaults to `status == Success`.
    pub should_dehydrate: Option<Arc<dyn Fn(&Query) -> bool + Send + Sync>>,
}

impl DehydrateOptions {
    /// Sets the inclusion predicate.
    #[must_use]
    pub fn should_dehydrate(
        mut self,
        predicate: impl Fn(&Query) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_dehydrate = Some(Arc::new(predicate));
        self
    }
}

/// Options for [`hydrate`].
#[derive(Clone, Default)]
pub struct HydrateOptions {
    /// Options applied to queries restored by hydration (the key and
    /// `cache_time` come from the payload).
    pub default_options: Option<QueryOptions>,
}

impl HydrateOptions {
    /// Sets the options applied to restored queries.
    #[must_use]
    pub fn default_options(mut self, options: QueryOptions) -> Self {
        self.default_options = Some(options);
        self
    }
}

/// Snapshots the client's query cache.
#[must_use]
pub fn dehydrate(client: &QueryClient, options: &DehydrateOptions) -> DehydratedState {
    let mut queries = Vec::new();
    for query in client.query_cache().get_all() {
        let keep = match &options.should_dehydrate {
            Some(predicate) => predicate(&query),
            None => query.state().status == QueryStatus::Success,
        };
        if keep {
            queries.push(dehydrate_query(&query));
        }
    }
    DehydratedState { queries }
}

/// Merges a serialized snapshot into the client's query cache.
///
/// Existing queries are overwritten only by strictly fresher state; restored
/// queries start their retention timers at hydration time.
pub fn hydrate(client: &QueryClient, payload: &Value, options: &HydrateOptions) {
    let Some(object) = payload.as_object() else {
        tracing::debug!("hydration payload is not an object, skipping");
        return;
    };
    let Some(queries) = object.get("queries").and_then(Value::as_array) else {
        return;
    };
    notify::batch(|| {
        for entry in queries {
            match serde_json::from_value::<DehydratedQuery>(entry.clone()) {
                Ok(dehydrated) => restore_query(client, dehydrated, options),
                Err(error) => {
                    tracing::debug!(%error, "skipping unparseable dehydrated query");
                }
            }
        }
    });
}

fn dehydrate_query(query: &Query) -> DehydratedQuery {
    let state = query.state();
    DehydratedQuery {
        query_key: query.query_key().value().clone(),
        query_hash: query.query_hash().to_owned(),
        state: DehydratedQueryState {
            data: state.data.as_deref().cloned(),
            data_updated_at: state.data_updated_at,
            error: state.error.clone(),
            error_updated_at: state.error_updated_at,
            status: state.status,
            is_invalidated: state.is_invalidated,
            fetch_failure_count: state.fetch_failure_count,
            updated_at: state.updated_at(),
        },
        config: DehydratedQueryConfig {
            cache_time: encode_cache_time(query.options().resolved_cache_time()),
        },
    }
}

fn restore_query(client: &QueryClient, dehydrated: DehydratedQuery, options: &HydrateOptions) {
    let state = QueryState {
        data: dehydrated.state.data.map(Arc::new),
        data_updated_at: dehydrated.state.data_updated_at,
        error: dehydrated.state.error,
        error_updated_at: dehydrated.state.error_updated_at,
        fetch_failure_count: dehydrated.state.fetch_failure_count,
        is_fetching: false,
        is_invalidated: dehydrated.state.is_invalidated,
        is_paused: false,
        status: dehydrated.state.status,
    };

    if let Some(existing) = client.query_cache().get(&dehydrated.query_hash) {
        existing.set_state_if_newer(state);
        return;
    }

    let mut build_options = options.default_options.clone().unwrap_or_default();
    build_options.query_key = Some(QueryKey::new(dehydrated.query_key));
    build_options.cache_time = Some(decode_cache_time(dehydrated.config.cache_time));
    if let Err(error) = client.query_cache().build(build_options, Some(state)) {
        tracing::debug!(%error, "skipping unrestorable dehydrated query");
    }
}

fn encode_cache_time(cache_time: Duration) -> i64 {
    if cache_time == CACHE_TIME_FOREVER {
        -1
    } else {
        i64::try_from(duration_ms(cache_time)).unwrap_or(i64::MAX)
    }
}

fn decode_cache_time(encoded: i64) -> Duration {
    if encoded < 0 {
        CACHE_TIME_FOREVER
    } else {
        Duration::from_millis(encoded as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_time_encoding() {
        assert_eq!(encode_cache_time(Duration::from_secs(300)), 300_000);
        assert_eq!(encode_cache_time(CACHE_TIME_FOREVER), -1);
        assert_eq!(decode_cache_time(300_000), Duration::from_secs(300));
        assert_eq!(decode_cache_time(-1), CACHE_TIME_FOREVER);
    }

    #[tokio::test]
    async fn test_default_predicate_keeps_only_success() {
        let client = QueryClient::new();
        client.set_query_data("good", json!(1)).expect("set");
        // An idle query with no data.
        client
            .query_cache()
            .build(QueryOptions::new("idle"), None)
            .expect("build");

        let snapshot = dehydrate(&client, &DehydrateOptions::default());
        assert_eq!(snapshot.queries.len(), 1);
        assert_eq!(snapshot.queries[0].query_hash, "\"good\"");
    }

    #[tokio::test]
    async fn test_hydrate_skips_garbage() {
        let client = QueryClient::new();
        hydrate(&client, &json!("not an object"), &HydrateOptions::default());
        hydrate(&client, &json!({"queries": "nope"}), &HydrateOptions::default());
        hydrate(
            &client,
            &json!({"queries": [{"bogus": true}]}),
            &HydrateOptions::default(),
        );
        assert!(client.query_cache().is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_restores_data() {
        let source = QueryClient::new();
        source.set_query_data("todos", json!(["a", "b"])).expect("set");

        let payload =
            serde_json::to_value(dehydrate(&source, &DehydrateOptions::default())).expect("ser");

        let target = QueryClient::new();
        hydrate(&target, &payload, &HydrateOptions::default());
        let restored = target.get_query_data("todos").expect("restored");
        assert_eq!(*restored, json!(["a", "b"]));
    }
}
