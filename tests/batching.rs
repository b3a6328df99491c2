// Integration tests for coalesced notifications.
// Many state changes in one batch must yield one observer notification that
// sees the final state.

use std::sync::Arc;

use freshet::{notify, QueryClient, QueryObserverResult, QueryOptions, RefetchPolicy};
use parking_lot::Mutex;
use serde_json::json;

fn observe(
    client: &QueryClient,
    key: &str,
    seen: Arc<Mutex<Vec<QueryObserverResult>>>,
) -> Arc<freshet::QueryObserver> {
    let observer = client
        .watch_query(QueryOptions::new(key).refetch_on_mount(RefetchPolicy::Never))
        .expect("observer");
    observer.subscribe(move |result| seen.lock().push(result.clone()));
    observer
}

#[tokio::test]
async fn test_batched_writes_notify_once_with_final_value() {
    let client = QueryClient::new();
    client.set_query_data("counter", json!(0)).expect("seed");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _observer = observe(&client, "counter", Arc::clone(&seen));

    notify::batch(|| {
        client.set_query_data("counter", json!(1)).expect("set");
        client.set_query_data("counter", json!(2)).expect("set");
        client.set_query_data("counter", json!(3)).expect("set");
        // Nothing flushed while the batch is open.
        assert!(seen.lock().is_empty());
    });

    let seen = seen.lock();
    assert_eq!(seen.len(), 1, "exactly one notification per batch");
    assert_eq!(
        *seen[0].data.clone().expect("data"),
        json!(3),
        "the notification observes the post-batch state"
    );
}

#[tokio::test]
async fn test_unbatched_writes_notify_each_time() {
    let client = QueryClient::new();
    client.set_query_data("counter", json!(0)).expect("seed");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _observer = observe(&client, "counter", Arc::clone(&seen));

    client.set_query_data("counter", json!(1)).expect("set");
    client.set_query_data("counter", json!(2)).expect("set");

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(*seen[0].data.clone().expect("data"), json!(1));
    assert_eq!(*seen[1].data.clone().expect("data"), json!(2));
}

#[tokio::test]
async fn test_all_observers_converge_on_cache_state() {
    let client = QueryClient::new();
    client.set_query_data("shared", json!("seed")).expect("seed");

    let seen_a = Arc::new(Mutex::new(Vec::new()));
    let seen_b = Arc::new(Mutex::new(Vec::new()));
    let observer_a = observe(&client, "shared", Arc::clone(&seen_a));
    let observer_b = observe(&client, "shared", Arc::clone(&seen_b));

    notify::batch(|| {
        client.set_query_data("shared", json!("mid")).expect("set");
        client.set_query_data("shared", json!("final")).expect("set");
    });

    // Both observers saw one notification with the final value, and both
    // current views agree with the cache.
    for seen in [&seen_a, &seen_b] {
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(*seen[0].data.clone().expect("data"), json!("final"));
    }
    let cached = client.get_query_data("shared").expect("cached");
    assert_eq!(
        observer_a.get_current_result().data.expect("a data"),
        cached
    );
    assert_eq!(
        observer_b.get_current_result().data.expect("b data"),
        cached
    );
}

#[tokio::test]
async fn test_panicking_listener_does_not_block_others() {
    let client = QueryClient::new();
    client.set_query_data("risky", json!(0)).expect("seed");

    let observer_bad = client
        .watch_query(QueryOptions::new("risky").refetch_on_mount(RefetchPolicy::Never))
        .expect("observer");
    observer_bad.subscribe(|_result| panic!("listener bug"));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let _observer_good = observe(&client, "risky", Arc::clone(&seen));

    client.set_query_data("risky", json!(1)).expect("set");

    assert_eq!(seen.lock().len(), 1, "healthy listener still notified");
}
