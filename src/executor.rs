//! Issue one request, time it, classify it and record it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use strum_macros::{AsRefStr, Display};

use crate::config::{HttpMethod, TestConfiguration};
use crate::logger::Severity;
use crate::metrics::Counters;
use crate::proxy::Route;
use crate::util;
use crate::RunState;

/// Substrings of a transport error that indicate name resolution failed.
const DNS_SIGNALS: &[&str] = &[
    "dns error",
    "failed to lookup address",
    "name or service not known",
    "nodename nor servname",
    "getaddrinfo",
    "enotfound",
    "no such host",
];

/// Substrings of a transport error that indicate an explicit cross-origin rejection.
const CORS_SIGNALS: &[&str] = &["cors", "cross-origin", "access-control"];

/// Log a warning every this many failed requests.
const FAILURE_WARNING_INTERVAL: usize = 10;

/// Why a request failed before a response was received.
#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Timeout,
    Dns,
    Cors,
    Network,
}

impl FailureKind {
    /// A short suggestion shown with the first failure of a run.
    pub fn hint(self) -> &'static str {
        match self {
            FailureKind::Timeout => "the server did not respond before the request timeout",
            FailureKind::Dns => "check that the host name is spelled correctly and resolves",
            FailureKind::Cors => "the target appears to block cross-origin requests, trying relays",
            FailureKind::Network => "check that the server is reachable",
        }
    }
}

/// The request a run sends on every iteration, before any relay rewrites it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogicalRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl LogicalRequest {
    /// Merge the configured headers over `Content-Type: application/json`, and
    /// serialize the body if the method carries one.
    pub fn from_configuration(configuration: &TestConfiguration) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        for (name, value) in &configuration.advanced.headers {
            headers.retain(|existing: &String, _| !existing.eq_ignore_ascii_case(name));
            headers.insert(name.clone(), value.clone());
        }

        let body = if configuration.method.allows_body() {
            configuration.advanced.body.as_ref().map(|body| body.to_string())
        } else {
            None
        };

        LogicalRequest {
            url: configuration.url.clone(),
            method: configuration.method,
            headers,
            body,
        }
    }
}

/// The request actually dispatched, after the failover controller chose a route.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EffectiveRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub route: Route,
}

/// The result of one request. Never modified once recorded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    /// Id of the session that sent the request.
    pub session: usize,
    /// Milliseconds between the start of the run and the moment this was recorded.
    pub elapsed: u64,
    /// Milliseconds from dispatch to response headers, failure or timeout.
    pub latency: u64,
    pub success: bool,
    pub status_code: Option<u16>,
    pub failure: Option<FailureKind>,
    pub method: HttpMethod,
    pub route: Route,
}

impl RequestOutcome {
    /// A short description for log lines.
    pub fn describe(&self) -> String {
        match (self.failure, self.status_code) {
            (Some(failure), _) => format!("{} error", failure),
            (None, Some(status)) => format!("HTTP {}", status),
            (None, None) => "unknown error".to_string(),
        }
    }
}

/// Classify a transport failure, first match wins.
///
/// With `cors_heuristic` enabled, a generic failure before any request of the
/// run has succeeded is treated as cross-origin blocking.
///
/// ```rust
/// use stampede::executor::{classify_failure, FailureKind};
///
/// let message = "error sending request: dns error: failed to lookup address information";
/// assert_eq!(classify_failure(message, false, 0, true), FailureKind::Dns);
/// assert_eq!(classify_failure("connection refused", false, 0, true), FailureKind::Cors);
/// assert_eq!(classify_failure("connection refused", false, 3, true), FailureKind::Network);
/// assert_eq!(classify_failure("connection refused", true, 0, true), FailureKind::Timeout);
/// ```
pub fn classify_failure(
    message: &str,
    timed_out: bool,
    successes: usize,
    cors_heuristic: bool,
) -> FailureKind {
    let message = message.to_lowercase();
    if timed_out {
        FailureKind::Timeout
    } else if DNS_SIGNALS.iter().any(|signal| message.contains(signal)) {
        FailureKind::Dns
    } else if CORS_SIGNALS.iter().any(|signal| message.contains(signal)) {
        FailureKind::Cors
    } else if cors_heuristic && successes == 0 {
        FailureKind::Cors
    } else {
        FailureKind::Network
    }
}

/// Flatten an error and all of its sources into one message.
pub(crate) fn error_chain(error: &dyn Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Send one request for a session and record its outcome.
///
/// The outcome is recorded into the run's accumulator before it is returned,
/// whether the request succeeded or not. The failover controller then observes
/// it and may switch routes for subsequent requests.
pub(crate) async fn execute(run: &RunState, session: usize) -> RequestOutcome {
    let request = util::lock(&run.failover).resolve(&run.request);

    let mut builder = run
        .client
        .request(request.method.into(), request.url.as_str())
        .timeout(run.timeout);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body.as_ref() {
        builder = builder.body(body.clone());
    }

    let dispatched = std::time::Instant::now();
    let result = builder.send().await;
    let latency = dispatched.elapsed().as_millis() as u64;

    let (status_code, transport_error) = match result {
        Ok(response) => {
            let status = response.status();
            // Drain the body so the connection can be reused.
            let _ = response.bytes().await;
            (Some(status), None)
        }
        Err(e) => (None, Some(e)),
    };

    let mut outcome = RequestOutcome {
        session,
        elapsed: 0,
        latency,
        success: status_code.map_or(false, |status| status.is_success()),
        status_code: status_code.map(|status| status.as_u16()),
        failure: None,
        method: request.method,
        route: request.route,
    };

    let counters = {
        let mut metrics = util::lock(&run.metrics);
        if let Some(error) = transport_error.as_ref() {
            outcome.failure = Some(classify_failure(
                &error_chain(error),
                error.is_timeout(),
                metrics.counters().successful,
                run.cors_heuristic,
            ));
        }
        outcome.elapsed = run.elapsed_ms();
        metrics.record(&outcome)
    };

    if let Some(request_log) = run.request_log.as_ref() {
        let _ = request_log.send(Some(outcome.clone()));
    }

    if run.is_active() {
        report_failure(run, &outcome, counters, transport_error.as_ref());
    }

    let notice = util::lock(&run.failover).observe(&outcome);
    if let Some(notice) = notice {
        if run.is_active() {
            run.log(notice.severity(), notice.to_string());
        }
    }

    outcome
}

/// Log the first failure of a run in detail, then a running count every few failures.
fn report_failure(
    run: &RunState,
    outcome: &RequestOutcome,
    counters: Counters,
    error: Option<&reqwest::Error>,
) {
    if outcome.success {
        return;
    }

    if counters.failed == 1 {
        let message = match (outcome.failure, error) {
            (Some(failure), Some(error)) => format!(
                "Request to {} failed with {} error ({}): {}",
                run.request.url,
                failure,
                error_chain(error),
                failure.hint()
            ),
            _ => format!(
                "Request to {} failed with {}",
                run.request.url,
                outcome.describe()
            ),
        };
        run.log(Severity::Error, message);
    } else if counters.failed % FAILURE_WARNING_INTERVAL == 0 {
        run.log(
            Severity::Warning,
            format!(
                "{} of {} requests failed so far, latest with {}",
                counters.failed,
                counters.total,
                outcome.describe()
            ),
        );
    }
}
