// Integration tests for invalidation and refetching through the facade.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use freshet::{InvalidateOptions, QueryClient, QueryFilters, QueryOptions};
use serde_json::json;
use tokio::time::sleep;

async fn wait_until(timeout_ms: u64, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    predicate()
}

fn counting_options(key: serde_json::Value, calls: Arc<AtomicU32>) -> QueryOptions {
    QueryOptions::new(key)
        .stale_time(Duration::from_secs(3600))
        .query_fn(move || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(json!(call)) }
        })
}

#[tokio::test]
async fn test_invalidate_refetches_active_queries() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));

    let observer = client
        .watch_query(counting_options(json!(["todos", 1]), Arc::clone(&calls)))
        .expect("observer");
    observer.subscribe(|_result| {});
    let observer_ready = Arc::clone(&observer);
    assert!(wait_until(1000, move || observer_ready.get_current_result().is_success).await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    client
        .invalidate_queries(
            &QueryFilters::key(json!(["todos"])),
            InvalidateOptions::default(),
        )
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 2, "active query refetched");
    assert_eq!(
        *observer.get_current_result().data.expect("data"),
        json!(2)
    );
    assert!(
        !client
            .query_cache()
            .find(json!(["todos", 1]))
            .expect("query")
            .state()
            .is_invalidated,
        "successful refetch clears the invalidation mark"
    );
}

#[tokio::test]
async fn test_invalidate_skips_inactive_queries_by_default() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));

    client
        .prefetch_query(counting_options(json!(["orphan"]), Arc::clone(&calls)))
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    client
        .invalidate_queries(&QueryFilters::key(json!(["orphan"])), InvalidateOptions::default())
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1, "no observers, no refetch");
    assert!(
        client
            .query_cache()
            .find(json!(["orphan"]))
            .expect("query")
            .state()
            .is_invalidated
    );
}

#[tokio::test]
async fn test_prefix_invalidation_spares_other_trees() {
    let client = QueryClient::new();
    let todo_calls = Arc::new(AtomicU32::new(0));
    let user_calls = Arc::new(AtomicU32::new(0));

    client
        .prefetch_query(counting_options(json!(["todos", 1]), Arc::clone(&todo_calls)))
        .await;
    client
        .prefetch_query(counting_options(json!(["users", 1]), Arc::clone(&user_calls)))
        .await;

    client
        .invalidate_queries(&QueryFilters::key(json!(["todos"])), InvalidateOptions::default())
        .await;

    let todos = client.query_cache().find(json!(["todos", 1])).expect("todos");
    let users = client.query_cache().find(json!(["users", 1])).expect("users");
    assert!(todos.state().is_invalidated);
    assert!(!users.state().is_invalidated);
}

#[tokio::test]
async fn test_refetch_queries_refetches_matches() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));

    client
        .prefetch_query(counting_options(json!(["stats"]), Arc::clone(&calls)))
        .await;
    client
        .refetch_queries(&QueryFilters::key(json!(["stats"])))
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        *client.get_query_data(json!(["stats"])).expect("data"),
        json!(2)
    );
}

#[tokio::test]
async fn test_remove_queries_by_filter() {
    let client = QueryClient::new();
    client.set_query_data(json!(["a", 1]), json!(1)).expect("seed");
    client.set_query_data(json!(["a", 2]), json!(2)).expect("seed");
    client.set_query_data(json!(["b"]), json!(3)).expect("seed");

    client.remove_queries(&QueryFilters::key(json!(["a"])));

    assert!(client.get_query_data(json!(["a", 1])).is_none());
    assert!(client.get_query_data(json!(["a", 2])).is_none());
    assert!(client.get_query_data(json!(["b"])).is_some());
}
