// Integration tests for retry policies and cooperative cancellation
// observed through the client facade.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use freshet::{
    CancelOptions, QueryClient, QueryError, QueryFilters, QueryOptions, QueryStatus, RetryDelay,
    RetryPolicy,
};
use serde_json::json;
use tokio::time::sleep;

#[tokio::test]
async fn test_explicit_fetch_does_not_retry_by_default() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let error = client
        .fetch_query_data(QueryOptions::new("flaky").query_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(QueryError::fetch("down")) }
        }))
        .await
        .expect_err("fetch fails");

    assert_eq!(error, QueryError::fetch("down"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let state = client.get_query_state("flaky").expect("state");
    assert_eq!(state.status, QueryStatus::Error);
    assert_eq!(state.fetch_failure_count, 1);
    assert!(state.error_updated_at > 0);
}

#[tokio::test]
async fn test_bounded_retries_then_error_state() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let error = client
        .fetch_query_data(
            QueryOptions::new("retrying")
                .retry(RetryPolicy::Count(3))
                .retry_delay(RetryDelay::Fixed(Duration::from_millis(1)))
                .query_fn(move || {
                    let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Err(QueryError::fetch(format!("attempt {call}"))) }
                }),
        )
        .await
        .expect_err("exhausts retries");

    assert_eq!(error, QueryError::fetch("attempt 3"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_recovers_and_keeps_data() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let data = client
        .fetch_query_data(
            QueryOptions::new("recovering")
                .retry(RetryPolicy::Count(5))
                .retry_delay(RetryDelay::Fixed(Duration::from_millis(1)))
                .query_fn(move || {
                    let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if call < 3 {
                            Err(QueryError::fetch("transient"))
                        } else {
                            Ok(json!("recovered"))
                        }
                    }
                }),
        )
        .await
        .expect("eventually succeeds");

    assert_eq!(*data, json!("recovered"));
    let state = client.get_query_state("recovering").expect("state");
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.fetch_failure_count, 0, "reset on success");
}

#[tokio::test]
async fn test_cancel_queries_reverts_to_cached_data() {
    let client = QueryClient::new();
    client.set_query_data("slow", json!("cached")).expect("seed");

    let fetch_client = client.clone();
    tokio::spawn(async move {
        let _ = fetch_client
            .fetch_query_data(QueryOptions::new("slow").query_fn(|| async {
                sleep(Duration::from_secs(60)).await;
                Ok(json!("late"))
            }))
            .await;
    });
    sleep(Duration::from_millis(20)).await;
    assert!(client.get_query_state("slow").expect("state").is_fetching);

    client
        .cancel_queries(&QueryFilters::key("slow"), CancelOptions::default())
        .await;

    let state = client.get_query_state("slow").expect("state");
    assert!(!state.is_fetching);
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(*state.data.expect("reverted"), json!("cached"));
}

#[tokio::test]
async fn test_cancel_without_revert_records_error() {
    let client = QueryClient::new();

    let fetch_client = client.clone();
    tokio::spawn(async move {
        let _ = fetch_client
            .fetch_query_data(QueryOptions::new("doomed").query_fn(|| async {
                sleep(Duration::from_secs(60)).await;
                Ok(json!("late"))
            }))
            .await;
    });
    sleep(Duration::from_millis(20)).await;

    client
        .cancel_queries(
            &QueryFilters::key("doomed"),
            CancelOptions {
                revert: false,
                silent: false,
            },
        )
        .await;

    let state = client.get_query_state("doomed").expect("state");
    assert_eq!(state.status, QueryStatus::Error);
    assert!(state.error.expect("error").is_cancelled());
}
