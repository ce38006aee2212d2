use httpmock::{Method::GET, MockServer};
use serial_test::serial;
use std::time::Duration;

mod common;

use stampede::config::TestConfiguration;
use stampede::logger::{EngineEvent, Severity};
use stampede::metrics::RunStatus;
use stampede::{LoadEngine, LoadError};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
// Only one run can be active at a time, and a new one can start once it ends.
async fn test_second_run_rejected() {
    let server = MockServer::start_async().await;
    let index = server
        .mock_async(|when, then| {
            when.method(GET).path(common::INDEX_PATH);
            then.status(200);
        })
        .await;

    let (engine, events) = LoadEngine::new(common::local_options()).unwrap();
    let configuration =
        common::build_configuration(&server, common::INDEX_PATH).set_duration(Duration::from_secs(30));

    let handle = engine.start(configuration.clone()).unwrap();
    assert!(engine.is_running());
    match engine.start(configuration.clone()) {
        Err(LoadError::RunActive) => (),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("a second run must be rejected"),
    }
    assert!(common::logged(
        &common::drain_events(&events),
        Severity::Warning,
        "already running"
    ));

    // The first run is unaffected.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert!(handle.is_running());
    let summary = engine.stop().unwrap();
    assert_eq!(summary.status, RunStatus::Interrupted);
    assert!(!engine.is_running());
    handle.wait().await.unwrap();

    // A new run can start once the previous one ended.
    let handle = engine
        .start(configuration.set_duration(Duration::from_secs(1)))
        .unwrap();
    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert!(index.hits_async().await > 0);
}

#[tokio::test]
// Invalid configurations are rejected before a run starts.
async fn test_invalid_configuration() {
    let (engine, _events) = LoadEngine::new(common::local_options()).unwrap();

    match engine.start(TestConfiguration::new("not a url")) {
        Err(LoadError::InvalidUrl { url, .. }) => assert_eq!(url, "not a url"),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("an invalid url must be rejected"),
    }

    let error = engine
        .start(TestConfiguration::new("https://example.com/").set_users(0))
        .err()
        .unwrap();
    assert!(error.is_invalid_config());

    let error = engine
        .start(TestConfiguration::new("https://example.com/").set_duration(Duration::from_secs(0)))
        .err()
        .unwrap();
    assert!(error.is_invalid_config());

    assert!(!engine.is_running());
    assert!(engine.stop().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
// Stopping a run produces exactly one summary covering everything recorded
// until the stop.
async fn test_stop_mid_run() {
    let server = MockServer::start_async().await;
    let index = server
        .mock_async(|when, then| {
            when.method(GET).path(common::INDEX_PATH);
            then.status(200).delay(Duration::from_millis(20));
        })
        .await;

    let (engine, events) = LoadEngine::new(common::local_options()).unwrap();
    let configuration = common::build_configuration(&server, common::INDEX_PATH)
        .set_users(3)
        .set_duration(Duration::from_secs(30));
    let handle = engine.start(configuration).unwrap();

    tokio::time::sleep(Duration::from_millis(2_200)).await;
    let summary = handle.stop().unwrap();
    assert_eq!(summary.status, RunStatus::Interrupted);
    assert!(summary.total_requests > 0);
    common::assert_consistent(&summary);
    assert!(summary.elapsed_secs < 30.0);

    // Only the first stop produces a summary.
    assert!(handle.stop().is_none());
    assert!(engine.stop().is_none());
    assert!(!handle.is_running());

    let waited = handle.wait().await.unwrap();
    assert_eq!(waited, summary);

    // Requests in flight at the stop may complete later, but none are lost.
    assert!(index.hits_async().await >= summary.total_requests);

    let events = common::drain_events(&events);
    assert_eq!(common::summaries(&events), vec![summary]);
    assert!(common::logged(&events, Severity::Warning, "interrupted by user"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
// A run ends on its own at its deadline, reporting samples along the way.
async fn test_natural_completion() {
    let server = MockServer::start_async().await;
    let index = server
        .mock_async(|when, then| {
            when.method(GET).path("/status");
            then.status(204);
        })
        .await;

    let (engine, events) = LoadEngine::new(common::local_options()).unwrap();
    let configuration = common::build_configuration(&server, "/status")
        .set_users(2)
        .set_duration(Duration::from_secs(3))
        .set_think_time(Duration::from_millis(200));
    let handle = engine.start(configuration).unwrap();
    let summary = handle.wait().await.unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert!(summary.elapsed_secs >= 3.0);
    assert_eq!(summary.success_rate_pct, 100.0);
    assert_eq!(summary.users, 2);
    common::assert_consistent(&summary);
    assert!(index.hits_async().await >= summary.total_requests);
    assert!(!engine.is_running());

    let events = common::drain_events(&events);
    let samples = common::samples(&events);
    assert!(samples.len() >= 2);
    assert!(samples.iter().all(|sample| sample.active_users <= 2));
    assert!(common::logged(&events, Severity::Success, "Load test completed"));
    assert!(common::logged(&events, Severity::Info, "users active"));
    assert_eq!(common::summaries(&events).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
// A chart point is added every two seconds, and live counters stay consistent.
async fn test_chart_cadence() {
    let server = MockServer::start_async().await;
    let index = server
        .mock_async(|when, then| {
            when.method(GET).path(common::INDEX_PATH);
            then.status(200);
        })
        .await;

    let (engine, events) = LoadEngine::new(common::local_options()).unwrap();
    assert!(!engine.options().failover);
    assert!(engine.options().relays.is_empty());

    let configuration = common::build_configuration(&server, common::INDEX_PATH)
        .set_users(2)
        .set_duration(Duration::from_secs(7))
        .set_think_time(Duration::from_millis(200));
    let handle = engine.start(configuration).unwrap();

    tokio::time::sleep(Duration::from_millis(6_500)).await;
    let elapsed: Vec<u64> = handle.chart().iter().map(|point| point.elapsed_secs).collect();
    assert_eq!(elapsed, vec![2, 4, 6]);
    assert_eq!(handle.active_users(), 2);
    let counters = handle.counters();
    assert!(counters.total > 0);
    assert_eq!(counters.total, counters.successful + counters.failed);
    assert_eq!(counters.failed, 0);

    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert!(index.hits_async().await >= summary.total_requests);

    let events = common::drain_events(&events);
    let charts = events
        .iter()
        .filter(|event| matches!(event, EngineEvent::Chart(_)))
        .count();
    assert_eq!(charts, 3);
    assert!(common::samples(&events).len() >= 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
// The first failure is logged as an error, then every tenth as a warning.
async fn test_failure_logs() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(common::INDEX_PATH);
            then.status(404);
        })
        .await;

    let (engine, events) = LoadEngine::new(common::local_options()).unwrap();
    let configuration =
        common::build_configuration(&server, common::INDEX_PATH).set_users(2);
    let summary = engine.start(configuration).unwrap().wait().await.unwrap();
    assert!(summary.failed >= 20);

    let logs = common::logs(&common::drain_events(&events));
    let errors: Vec<_> = logs
        .iter()
        .filter(|log| log.severity == Severity::Error && log.message.starts_with("Request to"))
        .collect();
    assert_eq!(errors.len(), 1);

    // Sessions log concurrently, so the counts may arrive out of order.
    let mut warnings: Vec<usize> = logs
        .iter()
        .filter(|log| log.severity == Severity::Warning)
        .filter(|log| log.message.contains("requests failed so far"))
        .map(|log| log.message.split(' ').next().unwrap().parse().unwrap())
        .collect();
    warnings.sort_unstable();
    assert_eq!(warnings.first(), Some(&10));
    assert!(warnings.iter().all(|failed| failed % 10 == 0));
    assert!(warnings.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
// Starting a run outside a Tokio runtime is an error, not a panic.
fn test_start_outside_runtime() {
    let (engine, _events) = LoadEngine::new(common::local_options()).unwrap();
    match engine.start(TestConfiguration::new("http://127.0.0.1/")) {
        Err(LoadError::Runtime(_)) => (),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("a run needs a runtime"),
    }
    assert!(!engine.is_running());
}
