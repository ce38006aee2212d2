use httpmock::{Method::GET, MockServer};
use serial_test::serial;
use std::path::PathBuf;
use std::time::Duration;

mod common;

use stampede::config::EngineOptions;
use stampede::logger::LogFormat;
use stampede::LoadEngine;

fn log_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("stampede-{}-{}", std::process::id(), name))
}

// Run against a mock server, writing a request log in the given format.
// Returns the log's lines and the number of requests the server received.
async fn run_with_request_log(format: LogFormat, name: &str) -> (Vec<String>, usize) {
    let path = log_path(name);
    let server = MockServer::start_async().await;
    let index = server
        .mock_async(|when, then| {
            when.method(GET).path(common::INDEX_PATH);
            then.status(200);
        })
        .await;

    let options = EngineOptions {
        request_log: Some(path.clone()),
        request_format: format,
        ..common::local_options()
    };
    let (engine, _events) = LoadEngine::new(options).unwrap();
    let handle = engine
        .start(
            common::build_configuration(&server, common::INDEX_PATH)
                .set_users(2)
                .set_think_time(Duration::from_millis(100)),
        )
        .unwrap();
    let summary = handle.wait().await.unwrap();
    assert!(summary.total_requests > 0);

    let contents = std::fs::read_to_string(&path).unwrap();
    let _ = std::fs::remove_file(&path);
    let lines = contents.lines().map(str::to_string).collect();
    (lines, index.hits_async().await)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
// Every request is logged as one JSON object per line.
async fn test_json_request_log() {
    let (lines, hits) = run_with_request_log(LogFormat::Json, "requests.json").await;
    assert_eq!(lines.len(), hits);

    for line in &lines {
        let outcome: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(outcome["success"], true);
        assert_eq!(outcome["status_code"], 200);
        assert_eq!(outcome["method"], "GET");
        assert_eq!(outcome["route"], "Direct");
        let session = outcome["session"].as_u64().unwrap();
        assert!(session == 1 || session == 2);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
// The CSV request log starts with a header.
async fn test_csv_request_log() {
    let (lines, hits) = run_with_request_log(LogFormat::Csv, "requests.csv").await;
    assert_eq!(lines.len(), hits + 1);
    assert_eq!(
        lines[0],
        "elapsed,session,method,route,status_code,success,failure,latency"
    );
    for line in &lines[1..] {
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields.len(), 8);
        assert_eq!(fields[2], "GET");
        assert_eq!(fields[3], "direct");
        assert_eq!(fields[4], "200");
        assert_eq!(fields[5], "true");
        assert_eq!(fields[6], "");
    }
}
