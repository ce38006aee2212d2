//! # Stampede
//!
//! Stampede is an HTTP load generator. It drives a configurable number of
//! concurrent virtual users against one target endpoint for a bounded duration,
//! ramps concurrency up linearly, classifies transport failures, routes around
//! cross-origin blocking with an automatic relay failover, and reports windowed
//! throughput, latency and success metrics while the run is in progress.
//!
//! Stampede uses [`reqwest`](https://docs.rs/reqwest/) for HTTP and
//! [`tokio`](https://docs.rs/tokio/) to multiplex virtual users.
//!
//! ## Running a load test
//!
//! A [`LoadEngine`] owns at most one active run. Starting a run returns a
//! [`RunHandle`], and every sample, chart point, log line and the final summary
//! are delivered on the [`EngineEvent`](logger::EngineEvent) channel returned by
//! [`LoadEngine::new`].
//!
//! ```rust,no_run
//! use stampede::config::{EngineOptions, TestConfiguration};
//! use stampede::{LoadEngine, LoadError};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), LoadError> {
//!     let (engine, events) = LoadEngine::new(EngineOptions::default())?;
//!     let configuration = TestConfiguration::new("https://example.com/")
//!         .set_users(10)
//!         .set_duration(Duration::from_secs(30))
//!         .set_ramp_up(Duration::from_secs(5));
//!
//!     let handle = engine.start(configuration)?;
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv_async().await {
//!             println!("{:?}", event);
//!         }
//!     });
//!
//!     let summary = handle.wait().await?;
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```
//!
//! ## License
//!
//! Copyright 2020-2026 Stampede contributors
//!
//! Licensed under the Apache License, Version 2.0 (the "License");
//! you may not use this file except in compliance with the License.
//! You may obtain a copy of the License at
//!
//! <http://www.apache.org/licenses/LICENSE-2.0>
//!
//! Unless required by applicable law or agreed to in writing, software
//! distributed under the License is distributed on an "AS IS" BASIS,
//! WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//! See the License for the specific language governing permissions and
//! limitations under the License.

#[macro_use]
extern crate log;

pub mod config;
pub mod executor;
pub mod history;
pub mod logger;
pub mod metrics;
pub mod proxy;
pub mod scheduler;
pub mod session;
pub mod util;

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{fmt, io};
use tokio::task::JoinHandle;

use crate::config::{EngineOptions, TestConfiguration};
use crate::executor::{LogicalRequest, RequestOutcome};
use crate::logger::{EngineEvent, LogEvent, Severity};
use crate::metrics::{ChartPoint, ChartSeries, Counters, MetricsAccumulator, RunStatus, RunSummary};
use crate::proxy::{ProxyFailover, RelayReport, Route};

/// User agent sent with every request that doesn't override it.
const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// An enumeration of all errors a [`LoadEngine`] can return.
#[derive(Debug)]
pub enum LoadError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a ['tokio::task::JoinError'](https://tokio-rs.github.io/tokio/doc/tokio/task/struct.JoinError.html).
    TokioJoin(tokio::task::JoinError),
    /// Wraps a [`serde_json::Error`](https://docs.rs/serde_json/*/serde_json/struct.Error.html).
    Json(serde_json::Error),
    /// Wraps a [`tokio::runtime::TryCurrentError`](https://docs.rs/tokio/*/tokio/runtime/struct.TryCurrentError.html),
    /// returned when a run is started outside a Tokio runtime.
    Runtime(tokio::runtime::TryCurrentError),
    /// Failed to parse the target URL.
    InvalidUrl {
        /// The invalid URL that caused this error.
        url: String,
        /// An optional explanation of the error.
        detail: String,
        /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
        parse_error: url::ParseError,
    },
    /// Invalid option or value specified, may only be invalid in context.
    InvalidConfig {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// A run is already active on this engine.
    RunActive,
    /// The run ended without producing a summary.
    RunAborted {
        /// An optional explanation of the error.
        detail: String,
    },
}
/// Implement a helper to provide a text description of all possible types of errors.
impl LoadError {
    fn describe(&self) -> &str {
        match *self {
            LoadError::Io(_) => "io::Error",
            LoadError::Reqwest(_) => "reqwest::Error",
            LoadError::TokioJoin(_) => "tokio::task::JoinError",
            LoadError::Json(_) => "serde_json::Error",
            LoadError::Runtime(_) => "tokio::runtime::TryCurrentError",
            LoadError::InvalidUrl { .. } => "failed to parse url",
            LoadError::InvalidConfig { .. } => "invalid option or value specified",
            LoadError::RunActive => "a load test is already running",
            LoadError::RunAborted { .. } => "load test ended without a summary",
        }
    }

    /// Configuration errors are rejected before a run starts and are never retried.
    pub fn is_invalid_config(&self) -> bool {
        matches!(
            self,
            LoadError::InvalidUrl { .. } | LoadError::InvalidConfig { .. }
        )
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            LoadError::Io(ref source) => write!(f, "LoadError: {} ({})", self.describe(), source),
            LoadError::Reqwest(ref source) => {
                write!(f, "LoadError: {} ({})", self.describe(), source)
            }
            LoadError::TokioJoin(ref source) => {
                write!(f, "LoadError: {} ({})", self.describe(), source)
            }
            LoadError::Json(ref source) => {
                write!(f, "LoadError: {} ({})", self.describe(), source)
            }
            LoadError::Runtime(ref source) => {
                write!(f, "LoadError: {} ({})", self.describe(), source)
            }
            LoadError::InvalidUrl {
                ref url,
                ref parse_error,
                ..
            } => write!(f, "LoadError: {} {} ({})", self.describe(), url, parse_error),
            LoadError::InvalidConfig {
                ref option,
                ref value,
                ref detail,
            } => write!(
                f,
                "LoadError: {}: {} = {:?} ({})",
                self.describe(),
                option,
                value,
                detail
            ),
            LoadError::RunAborted { ref detail } => {
                write!(f, "LoadError: {} ({})", self.describe(), detail)
            }
            LoadError::RunActive => write!(f, "LoadError: {}", self.describe()),
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            LoadError::Io(ref source) => Some(source),
            LoadError::Reqwest(ref source) => Some(source),
            LoadError::TokioJoin(ref source) => Some(source),
            LoadError::Json(ref source) => Some(source),
            LoadError::Runtime(ref source) => Some(source),
            LoadError::InvalidUrl {
                ref parse_error, ..
            } => Some(parse_error),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for LoadError {
    fn from(err: reqwest::Error) -> LoadError {
        LoadError::Reqwest(err)
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for LoadError {
    fn from(err: io::Error) -> LoadError {
        LoadError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for LoadError {
    fn from(err: tokio::task::JoinError) -> LoadError {
        LoadError::TokioJoin(err)
    }
}

/// Auto-convert missing runtime errors.
impl From<tokio::runtime::TryCurrentError> for LoadError {
    fn from(err: tokio::runtime::TryCurrentError) -> LoadError {
        LoadError::Runtime(err)
    }
}

/// Auto-convert serde_json errors.
impl From<serde_json::Error> for LoadError {
    fn from(err: serde_json::Error) -> LoadError {
        LoadError::Json(err)
    }
}

/// Everything shared between the tasks of one run.
///
/// Sessions, the ramp-up scheduler and the metrics aggregator each hold an
/// `Arc<RunState>`. The accumulator and the failover state are the only values
/// mutated by more than one task, each behind its own lock, and the two locks
/// are never held at the same time.
pub(crate) struct RunState {
    pub(crate) config: TestConfiguration,
    pub(crate) request: LogicalRequest,
    pub(crate) client: reqwest::Client,
    pub(crate) timeout: Duration,
    pub(crate) cors_heuristic: bool,
    pub(crate) started: tokio::time::Instant,
    pub(crate) started_at: DateTime<Utc>,
    active: AtomicBool,
    pub(crate) sessions: AtomicUsize,
    pub(crate) metrics: Mutex<MetricsAccumulator>,
    pub(crate) failover: Mutex<ProxyFailover>,
    pub(crate) chart: Mutex<ChartSeries>,
    events: flume::Sender<EngineEvent>,
    pub(crate) request_log: Option<flume::Sender<Option<RequestOutcome>>>,
    summary: flume::Sender<RunSummary>,
}

impl RunState {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Milliseconds since the run started.
    pub(crate) fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }

    pub(crate) fn duration_ms(&self) -> u64 {
        self.config.duration.as_millis() as u64
    }

    /// True while the run is active and its deadline hasn't passed.
    pub(crate) fn in_progress(&self) -> bool {
        self.is_active() && self.elapsed_ms() < self.duration_ms()
    }

    pub(crate) fn active_users(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Events are best effort: nobody listening is not an error.
    pub(crate) fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Send a log event to the event stream and mirror it to the log facade.
    pub(crate) fn log<S: Into<String>>(&self, severity: Severity, message: S) {
        let event = LogEvent::new(severity, message);
        event.mirror();
        self.emit(EngineEvent::Log(event));
    }

    /// End the run, returning its summary.
    ///
    /// Only the first caller wins, so a stop racing natural completion still
    /// produces exactly one summary. The summary reflects every outcome recorded
    /// before the active flag was cleared.
    pub(crate) fn finish(&self, status: RunStatus) -> Option<RunSummary> {
        if self
            .active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }

        let summary = {
            let metrics = util::lock(&self.metrics);
            RunSummary::new(&self.config, status, self.started_at, self.elapsed(), &metrics)
        };

        match status {
            RunStatus::Completed => self.log(Severity::Success, "Load test completed"),
            RunStatus::Interrupted => self.log(Severity::Warning, "Load test interrupted by user"),
        }
        self.log(Severity::Info, summary.headline());

        let (route, reports) = {
            let failover = util::lock(&self.failover);
            (failover.current(), failover.report())
        };
        if route != Route::Direct {
            self.log(Severity::Info, format!("Requests were last routed {}", route));
            for report in reports.iter().filter(|r| r.requests > 0) {
                self.log(Severity::Info, report.to_string());
            }
        }

        self.emit(EngineEvent::Summary(summary.clone()));
        let _ = self.summary.try_send(summary.clone());
        Some(summary)
    }
}

/// Runs load tests, one at a time.
///
/// The engine owns the HTTP client, the options shared by every run, and the
/// sending side of the event channel. It is `Send + Sync`, so it can be wrapped
/// in an `Arc` and stopped from a signal handler.
pub struct LoadEngine {
    options: EngineOptions,
    client: reqwest::Client,
    events: flume::Sender<EngineEvent>,
    current: Mutex<Option<Arc<RunState>>>,
}

impl LoadEngine {
    /// Create an engine and the receiving side of its event channel.
    pub fn new(options: EngineOptions) -> Result<(LoadEngine, flume::Receiver<EngineEvent>), LoadError> {
        let client = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .build()?;
        let (events, receiver) = flume::unbounded();

        Ok((
            LoadEngine {
                options,
                client,
                events,
                current: Mutex::new(None),
            },
            receiver,
        ))
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Start a run.
    ///
    /// Returns [`LoadError::RunActive`] if a run is already active, and a
    /// configuration error if the target or any value is invalid. The run's
    /// tasks are spawned on the current Tokio runtime, and
    /// [`LoadError::Runtime`] is returned if there is none.
    pub fn start(&self, configuration: TestConfiguration) -> Result<RunHandle, LoadError> {
        let mut current = util::lock(&self.current);
        if current.as_ref().map_or(false, |run| run.is_active()) {
            let event = LogEvent::new(Severity::Warning, "A load test is already running");
            event.mirror();
            let _ = self.events.send(EngineEvent::Log(event));
            return Err(LoadError::RunActive);
        }

        let runtime = tokio::runtime::Handle::try_current()?;
        let url = configuration.validate()?;
        let request = LogicalRequest::from_configuration(&configuration);

        let (request_log, request_logger) = match self.options.request_log.as_ref() {
            Some(path) => {
                let (sender, receiver) = flume::unbounded();
                let logger = runtime.spawn(logger::request_logger_main(
                    path.clone(),
                    self.options.request_format,
                    receiver,
                ));
                (Some(sender), Some(logger))
            }
            None => (None, None),
        };

        let (summary_tx, summary_rx) = flume::bounded(1);
        let run = Arc::new(RunState {
            config: configuration,
            request,
            client: self.client.clone(),
            timeout: self.options.timeout,
            cors_heuristic: self.options.cors_heuristic,
            started: tokio::time::Instant::now(),
            started_at: Utc::now(),
            active: AtomicBool::new(true),
            sessions: AtomicUsize::new(0),
            metrics: Mutex::new(MetricsAccumulator::new()),
            failover: Mutex::new(ProxyFailover::new(
                self.options.relays.clone(),
                self.options.failover,
            )),
            chart: Mutex::new(ChartSeries::default()),
            events: self.events.clone(),
            request_log,
            summary: summary_tx,
        });

        run.log(
            Severity::Info,
            format!(
                "Starting {} load test against {}: {} users for {}s, ramping up over {}s",
                run.config.method,
                run.config.url,
                run.config.users,
                run.config.duration.as_secs(),
                run.config.ramp_up.as_secs(),
            ),
        );

        if self.options.failover && proxy::is_cors_hostile(&url, &self.options.cors_hostile_hosts) {
            let notice = util::lock(&run.failover).preselect();
            if let Some(notice) = notice {
                run.log(
                    Severity::Warning,
                    format!(
                        "{} is known to block cross-origin requests: {}",
                        url.host_str().unwrap_or_default(),
                        notice
                    ),
                );
            }
        }

        let ramp_up = runtime.spawn(scheduler::ramp_up_main(run.clone()));
        let aggregator = runtime.spawn(metrics::metrics_main(run.clone()));
        *current = Some(run.clone());

        Ok(RunHandle {
            run,
            summary: summary_rx,
            ramp_up,
            aggregator,
            request_logger,
        })
    }

    /// Interrupt the active run, if any, returning its summary.
    pub fn stop(&self) -> Option<RunSummary> {
        let run = util::lock(&self.current).clone();
        match run {
            Some(run) => run.finish(RunStatus::Interrupted),
            None => {
                debug!("stop requested with no active run");
                None
            }
        }
    }

    pub fn is_running(&self) -> bool {
        util::lock(&self.current)
            .as_ref()
            .map_or(false, |run| run.is_active())
    }
}

/// A handle on one run, returned by [`LoadEngine::start`].
pub struct RunHandle {
    run: Arc<RunState>,
    summary: flume::Receiver<RunSummary>,
    ramp_up: JoinHandle<Vec<JoinHandle<()>>>,
    aggregator: JoinHandle<()>,
    request_logger: Option<JoinHandle<Result<(), LoadError>>>,
}

impl RunHandle {
    pub fn is_running(&self) -> bool {
        self.run.is_active()
    }

    /// Number of virtual user sessions launched so far.
    pub fn active_users(&self) -> usize {
        self.run.active_users()
    }

    pub fn counters(&self) -> Counters {
        util::lock(&self.run.metrics).counters()
    }

    pub fn chart(&self) -> Vec<ChartPoint> {
        util::lock(&self.run.chart).points()
    }

    /// The route requests are currently sent through.
    pub fn route(&self) -> Route {
        util::lock(&self.run.failover).current()
    }

    pub fn relay_report(&self) -> Vec<RelayReport> {
        util::lock(&self.run.failover).report()
    }

    /// Interrupt this run, returning its summary if it was still active.
    pub fn stop(&self) -> Option<RunSummary> {
        self.run.finish(RunStatus::Interrupted)
    }

    /// Wait for the run to end, then for its tasks to drain.
    ///
    /// Requests still in flight when the run ends are allowed to complete or
    /// time out before this returns; they are not part of the summary.
    pub async fn wait(self) -> Result<RunSummary, LoadError> {
        let summary = self
            .summary
            .recv_async()
            .await
            .map_err(|e| LoadError::RunAborted {
                detail: e.to_string(),
            })?;

        self.aggregator.await?;
        let sessions = self.ramp_up.await?;
        for result in futures::future::join_all(sessions).await {
            if let Err(e) = result {
                warn!("session task failed: {}", e);
            }
        }

        if let Some(logger) = self.request_logger {
            if let Some(sender) = self.run.request_log.as_ref() {
                // Empty message means it's time to exit.
                let _ = sender.send(None);
            }
            logger.await??;
        }

        Ok(summary)
    }
}
