//! End-to-end tests: a real StreamManager dispatching scripted broker records
//! through composed middleware into route handlers, with the dead-letter
//! store and commit order observed via a shared call log.

use std::sync::Arc;
use std::time::Duration;

use streambus::config::{DispatchMode, StreamConfig};
use streambus::handler::ProcessStatus;
use streambus::manager::StreamManager;
use streambus::middleware::{HandlerMetrics, JsonDeserializer, MessageLogger};
use streambus::replay::Replayer;
use streambus::router::Router;
use streambus::test_utils::{
    routed_record, wait_until, CallLog, FakeBroker, FakeFactory, RecordingRetryStore,
    ScriptedHandler,
};

fn stream_config(route: &str) -> StreamConfig {
    let mut config = StreamConfig::new(
        route,
        "localhost:9092",
        vec!["events".to_string()],
        "test-group",
    );
    config.poll_timeout = Duration::from_millis(10);
    config
}

struct Fixture {
    log: Arc<CallLog>,
    broker: Arc<FakeBroker>,
    factory: Arc<FakeFactory>,
    store: Arc<RecordingRetryStore>,
}

impl Fixture {
    fn new() -> Self {
        let log = CallLog::new();
        let broker = Arc::new(FakeBroker::new(log.clone()));
        let factory = Arc::new(FakeFactory::new(log.clone()));
        factory.push(broker.clone());
        let store = Arc::new(RecordingRetryStore::new(log.clone()));
        Self {
            log,
            broker,
            factory,
            store,
        }
    }
}

#[tokio::test]
async fn success_commits_once_and_never_touches_the_retry_store() {
    let fixture = Fixture::new();
    let handler = ScriptedHandler::new(ProcessStatus::Success, fixture.log.clone());

    let mut router = Router::new();
    router.register("orders", handler.clone());
    let chain = router.compose(vec![
        Arc::new(MessageLogger),
        Arc::new(HandlerMetrics),
        Arc::new(JsonDeserializer),
    ]);

    fixture
        .broker
        .push_record(routed_record("events", 0, 0, "orders", b"abc"));

    let manager = StreamManager::new(fixture.factory.clone(), fixture.store.clone());
    let handle = manager.start(vec![stream_config("orders")], chain).unwrap();

    assert!(
        wait_until(
            || fixture.broker.commits().len() == 1,
            Duration::from_secs(1)
        )
        .await
    );
    handle.shutdown().await;

    assert_eq!(handler.calls(), 1);
    assert_eq!(fixture.broker.commits(), vec![("events".to_string(), 0, 0)]);
    assert_eq!(fixture.store.len("orders").await, 0);
}

#[tokio::test]
async fn retry_appends_the_payload_before_the_commit() {
    let fixture = Fixture::new();
    let handler = ScriptedHandler::new(ProcessStatus::Retry, fixture.log.clone());

    let mut router = Router::new();
    router.register("orders", handler);
    let chain = router.compose(vec![Arc::new(MessageLogger)]);

    fixture
        .broker
        .push_record(routed_record("events", 0, 5, "orders", b"abc"));

    let manager = StreamManager::new(fixture.factory.clone(), fixture.store.clone());
    let handle = manager.start(vec![stream_config("orders")], chain).unwrap();

    assert!(
        wait_until(
            || fixture.broker.commits().len() == 1,
            Duration::from_secs(1)
        )
        .await
    );
    handle.shutdown().await;

    let entries = fixture.log.entries();
    let append_at = entries
        .iter()
        .position(|e| e == "append orders abc")
        .expect("a dead-letter append must happen");
    let commit_at = entries
        .iter()
        .position(|e| e == "commit events:0@5")
        .expect("the offset must still be committed");
    assert!(
        append_at < commit_at,
        "append must precede commit: {entries:?}"
    );

    let payloads = fixture.store.payloads("orders").await;
    assert_eq!(payloads.len(), 1);
    assert_eq!(&payloads[0].value[..], b"abc");
}

#[tokio::test]
async fn unknown_route_hits_the_not_found_handler_and_commits() {
    let fixture = Fixture::new();
    let registered = ScriptedHandler::new(ProcessStatus::Success, fixture.log.clone());
    let not_found = ScriptedHandler::new(ProcessStatus::Skip, fixture.log.clone());

    let mut router = Router::new().with_not_found(not_found.clone());
    router.register("orders", registered.clone());
    let chain = router.compose(vec![]);

    fixture
        .broker
        .push_record(routed_record("events", 0, 9, "unknown", b"abc"));

    let manager = StreamManager::new(fixture.factory.clone(), fixture.store.clone());
    let handle = manager.start(vec![stream_config("orders")], chain).unwrap();

    assert!(
        wait_until(
            || fixture.broker.commits().len() == 1,
            Duration::from_secs(1)
        )
        .await
    );
    handle.shutdown().await;

    assert_eq!(not_found.calls(), 1);
    assert_eq!(registered.calls(), 0);
    assert_eq!(fixture.store.len("unknown").await, 0);
    assert_eq!(fixture.store.len("orders").await, 0);
}

#[tokio::test]
async fn pooled_concurrency_one_matches_ordered_commit_order() {
    async fn commit_order(dispatch: DispatchMode) -> Vec<(String, i32, i64)> {
        let fixture = Fixture::new();
        let handler = ScriptedHandler::new(ProcessStatus::Success, fixture.log.clone());

        let mut router = Router::new();
        router.register("orders", handler);
        let chain = router.compose(vec![]);

        for offset in 0..100 {
            fixture
                .broker
                .push_record(routed_record("events", 0, offset, "orders", b"x"));
        }

        let mut config = stream_config("orders");
        config.dispatch = dispatch;
        let manager = StreamManager::new(fixture.factory.clone(), fixture.store.clone());
        let handle = manager.start(vec![config], chain).unwrap();

        assert!(
            wait_until(
                || fixture.broker.commits().len() == 100,
                Duration::from_secs(5)
            )
            .await
        );
        handle.shutdown().await;
        fixture.broker.commits()
    }

    let ordered = commit_order(DispatchMode::Ordered).await;
    let pooled = commit_order(DispatchMode::Pooled { concurrency: 1 }).await;

    assert_eq!(ordered.len(), 100);
    assert_eq!(ordered, pooled);
}

#[tokio::test]
async fn idle_instance_stops_promptly_after_the_shutdown_signal() {
    let fixture = Fixture::new();
    let handler = ScriptedHandler::new(ProcessStatus::Success, fixture.log.clone());

    let mut router = Router::new();
    router.register("orders", handler);
    let chain = router.compose(vec![]);

    let manager = StreamManager::new(fixture.factory.clone(), fixture.store.clone());
    let handle = manager.start(vec![stream_config("orders")], chain).unwrap();

    // Let the instance reach its idle poll loop.
    assert!(
        wait_until(
            || fixture
                .log
                .entries()
                .iter()
                .any(|e| e.starts_with("connect ")),
            Duration::from_secs(1)
        )
        .await
    );

    let started = std::time::Instant::now();
    handle.shutdown().await;
    // One 10ms poll interval plus scheduling slack.
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "idle instance took {:?} to stop",
        started.elapsed()
    );
    assert_eq!(
        fixture
            .log
            .entries()
            .iter()
            .filter(|e| *e == "close")
            .count(),
        1,
        "completion is signaled exactly once"
    );
}

#[tokio::test]
async fn in_flight_dispatch_finishes_before_the_instance_stops() {
    let fixture = Fixture::new();
    let handler = ScriptedHandler::with_delay(
        ProcessStatus::Success,
        Duration::from_millis(200),
        fixture.log.clone(),
    );

    let mut router = Router::new();
    router.register("orders", handler.clone());
    let chain = router.compose(vec![]);

    fixture
        .broker
        .push_record(routed_record("events", 0, 0, "orders", b"slow"));

    let manager = StreamManager::new(fixture.factory.clone(), fixture.store.clone());
    let handle = manager.start(vec![stream_config("orders")], chain).unwrap();

    // Give the instance time to pull the record and enter the handler, then
    // fire shutdown mid-dispatch.
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown().await;

    assert_eq!(handler.calls(), 1, "the in-flight dispatch must complete");
    assert_eq!(
        fixture.broker.commits(),
        vec![("events".to_string(), 0, 0)],
        "the completed dispatch must still be committed"
    );
}

#[tokio::test]
async fn replay_after_retry_goes_through_the_same_chain() {
    let fixture = Fixture::new();
    let log = fixture.log.clone();

    // First delivery fails, replay succeeds: script the statuses by draining
    // the call log between phases instead of swapping handlers.
    let handler = ScriptedHandler::new(ProcessStatus::Retry, log.clone());
    let mut router = Router::new();
    router.register("orders", handler);
    let chain = router.compose(vec![Arc::new(JsonDeserializer)]);

    fixture
        .broker
        .push_record(routed_record("events", 0, 1, "orders", b"{\"id\":7}"));

    let manager = StreamManager::new(fixture.factory.clone(), fixture.store.clone());
    let handle = manager
        .start(vec![stream_config("orders")], chain.clone())
        .unwrap();
    assert!(
        wait_until(
            || fixture.broker.commits().len() == 1,
            Duration::from_secs(1)
        )
        .await
    );
    handle.shutdown().await;
    assert_eq!(fixture.store.len("orders").await, 1);

    let replayer = Replayer::new(fixture.store.clone(), chain);
    let replayed = replayer.replay("orders", 10).await.unwrap();

    assert_eq!(replayed, 1);
    // The handler still answers Retry, so the payload lands back in the
    // store after passing through the same deserialization middleware.
    assert_eq!(fixture.store.len("orders").await, 1);
    let handled: Vec<String> = fixture
        .log
        .entries()
        .into_iter()
        .filter(|e| e.starts_with("handle orders"))
        .collect();
    assert_eq!(handled.len(), 2, "live delivery plus one replay");
    assert_eq!(handled[0], handled[1]);
}
