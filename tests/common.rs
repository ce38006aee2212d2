use httpmock::MockServer;
use std::time::Duration;

use stampede::config::{EngineOptions, TestConfiguration};
use stampede::logger::{EngineEvent, LogEvent, Severity};
use stampede::metrics::{MetricSample, RunSummary};

/// Not all functions are used by all tests, so we enable allow(dead_code) to avoid
/// compiler warnings during testing.

pub const INDEX_PATH: &str = "/";

/// Engine options that never route requests through the public relays.
#[allow(dead_code)]
pub fn local_options() -> EngineOptions {
    EngineOptions {
        failover: false,
        relays: Vec::new(),
        ..Default::default()
    }
}

/// The following options are configured by default, and can be overridden
/// with the chained setters of TestConfiguration:
///  url <mock-server><path>
///  users 1
///  duration 2s
///  ramp-up 0s
///  think-time 0s
#[allow(dead_code)]
pub fn build_configuration(server: &MockServer, path: &str) -> TestConfiguration {
    TestConfiguration::new(server.url(path))
        .set_users(1)
        .set_duration(Duration::from_secs(2))
        .set_ramp_up(Duration::from_secs(0))
        .set_think_time(Duration::from_secs(0))
}

/// Collect every event emitted so far.
#[allow(dead_code)]
pub fn drain_events(events: &flume::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    events.try_iter().collect()
}

#[allow(dead_code)]
pub fn samples(events: &[EngineEvent]) -> Vec<MetricSample> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Sample(sample) => Some(sample.clone()),
            _ => None,
        })
        .collect()
}

#[allow(dead_code)]
pub fn logs(events: &[EngineEvent]) -> Vec<LogEvent> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Log(log) => Some(log.clone()),
            _ => None,
        })
        .collect()
}

#[allow(dead_code)]
pub fn summaries(events: &[EngineEvent]) -> Vec<RunSummary> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Summary(summary) => Some(summary.clone()),
            _ => None,
        })
        .collect()
}

/// Whether a log line of the given severity contains `needle`.
#[allow(dead_code)]
pub fn logged(events: &[EngineEvent], severity: Severity, needle: &str) -> bool {
    logs(events)
        .iter()
        .any(|log| log.severity == severity && log.message.contains(needle))
}

/// Confirm the counters of a summary add up.
#[allow(dead_code)]
pub fn assert_consistent(summary: &RunSummary) {
    assert_eq!(
        summary.total_requests,
        summary.successful + summary.failed,
        "successful and failed requests must add up to the total"
    );
}
