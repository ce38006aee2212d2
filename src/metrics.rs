//! Metrics collected during a run.
//!
//! Every request outcome is recorded into the run's [`MetricsAccumulator`].
//! Once a second the aggregator task turns the accumulator into a
//! [`MetricSample`] for live display: throughput over the last two seconds,
//! average latency of the last twenty requests, and the success rate so far.
//! Every other second it also appends a [`ChartPoint`] to the run's
//! [`ChartSeries`] and logs a progress line. When the run ends, a
//! [`RunSummary`] is computed over every outcome recorded until then.

use chrono::{DateTime, Utc};
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;

use crate::config::{HttpMethod, TestConfiguration};
use crate::executor::RequestOutcome;
use crate::logger::{EngineEvent, Severity};
use crate::util;
use crate::RunState;

/// How far back throughput is measured, in milliseconds.
pub const THROUGHPUT_WINDOW_MS: u64 = 2_000;
/// How many of the most recent requests the live average latency covers.
pub const RECENT_LATENCY_SAMPLES: usize = 20;
/// Points kept in a [`ChartSeries`].
pub const CHART_CAPACITY: usize = 30;
/// How often a [`MetricSample`] is emitted.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
/// Samples between two chart points.
const CHART_EVERY: u64 = 2;
/// Samples between two progress log lines.
const PROGRESS_EVERY: u64 = 2;

/// Cumulative request counts. `successful + failed == total` always holds.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

/// When a request was recorded and how long it took, in milliseconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    pub elapsed: u64,
    pub latency: u64,
}

/// Running totals and the ordered latency log of one run.
#[derive(Clone, Debug, Default)]
pub struct MetricsAccumulator {
    counters: Counters,
    samples: Vec<LatencySample>,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        MetricsAccumulator::default()
    }

    /// Record one outcome, returning the updated counters.
    ///
    /// Outcomes must be recorded in the order of their `elapsed` timestamps.
    pub fn record(&mut self, outcome: &RequestOutcome) -> Counters {
        self.counters.total += 1;
        if outcome.success {
            self.counters.successful += 1;
        } else {
            self.counters.failed += 1;
        }
        self.samples.push(LatencySample {
            elapsed: outcome.elapsed,
            latency: outcome.latency,
        });
        self.counters
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn samples(&self) -> &[LatencySample] {
        &self.samples
    }

    /// Requests per second over the two seconds up to `now` (milliseconds
    /// since the run started).
    pub fn throughput(&self, now: u64) -> f64 {
        let recent = self
            .samples
            .iter()
            .rev()
            .skip_while(|sample| sample.elapsed > now)
            .take_while(|sample| sample.elapsed + THROUGHPUT_WINDOW_MS > now)
            .count();
        recent as f64 / (THROUGHPUT_WINDOW_MS as f64 / 1_000.0)
    }

    /// Mean latency of the most recent requests, 0 if there are none.
    pub fn recent_latency(&self) -> f64 {
        let start = self.samples.len().saturating_sub(RECENT_LATENCY_SAMPLES);
        mean(&self.samples[start..])
    }

    /// Mean latency over the whole run, 0 if there are no requests.
    pub fn mean_latency(&self) -> f64 {
        mean(&self.samples)
    }

    /// Percentage of successful requests, 0 if there are none.
    pub fn success_rate(&self) -> f64 {
        if self.counters.total == 0 {
            0.0
        } else {
            self.counters.successful as f64 / self.counters.total as f64 * 100.0
        }
    }

    pub fn snapshot(&self, now: u64, active_users: usize) -> MetricSample {
        MetricSample {
            elapsed_ms: now,
            throughput_per_sec: self.throughput(now),
            avg_latency_ms: self.recent_latency(),
            active_users,
            success_rate_pct: self.success_rate(),
        }
    }
}

fn mean(samples: &[LatencySample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let total: u64 = samples.iter().map(|sample| sample.latency).sum();
    total as f64 / samples.len() as f64
}

/// Live metrics, emitted once a second.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Milliseconds since the run started.
    pub elapsed_ms: u64,
    pub throughput_per_sec: f64,
    pub avg_latency_ms: f64,
    pub active_users: usize,
    pub success_rate_pct: f64,
}

impl MetricSample {
    pub fn progress_line(&self) -> String {
        format!(
            "[{}s] {} users active, {:.1} req/s, {:.0}ms avg, {:.1}% success",
            (self.elapsed_ms as f64 / 1_000.0).round(),
            self.active_users,
            self.throughput_per_sec,
            self.avg_latency_ms,
            self.success_rate_pct
        )
    }
}

/// One point of the latency and throughput chart.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub elapsed_secs: u64,
    pub latency_ms: f64,
    pub throughput: f64,
}

impl From<&MetricSample> for ChartPoint {
    fn from(sample: &MetricSample) -> Self {
        ChartPoint {
            elapsed_secs: (sample.elapsed_ms as f64 / 1_000.0).round() as u64,
            latency_ms: sample.avg_latency_ms,
            throughput: sample.throughput_per_sec,
        }
    }
}

/// A bounded series of chart points, oldest evicted first.
#[derive(Clone, Debug, PartialEq)]
pub struct ChartSeries {
    capacity: usize,
    points: VecDeque<ChartPoint>,
}

impl Default for ChartSeries {
    fn default() -> Self {
        ChartSeries::with_capacity(CHART_CAPACITY)
    }
}

impl ChartSeries {
    pub fn with_capacity(capacity: usize) -> Self {
        ChartSeries {
            capacity,
            points: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, point: ChartPoint) {
        if self.capacity == 0 {
            return;
        }
        while self.points.len() >= self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn latest(&self) -> Option<&ChartPoint> {
        self.points.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChartPoint> {
        self.points.iter()
    }

    /// Copy of the points, oldest first.
    pub fn points(&self) -> Vec<ChartPoint> {
        self.points.iter().copied().collect()
    }
}

/// How a run ended.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
pub enum RunStatus {
    /// The run reached its deadline.
    Completed,
    /// The run was stopped before its deadline.
    Interrupted,
}

/// Whole-run results, produced exactly once per run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub url: String,
    pub method: HttpMethod,
    pub users: usize,
    pub status: RunStatus,
    pub started: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub total_requests: usize,
    pub successful: usize,
    pub failed: usize,
    pub avg_latency_ms: f64,
    pub success_rate_pct: f64,
}

impl RunSummary {
    pub fn new(
        configuration: &TestConfiguration,
        status: RunStatus,
        started: DateTime<Utc>,
        elapsed: Duration,
        metrics: &MetricsAccumulator,
    ) -> Self {
        let counters = metrics.counters();
        RunSummary {
            url: configuration.url.clone(),
            method: configuration.method,
            users: configuration.users,
            status,
            started,
            elapsed_secs: elapsed.as_secs_f64(),
            total_requests: counters.total,
            successful: counters.successful,
            failed: counters.failed,
            avg_latency_ms: metrics.mean_latency(),
            success_rate_pct: metrics.success_rate(),
        }
    }

    /// Percentage of failed requests.
    pub fn error_rate_pct(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            100.0 - self.success_rate_pct
        }
    }

    /// One line describing the outcome of the run.
    pub fn headline(&self) -> String {
        format!(
            "{} requests, {:.1}% success, {:.0}ms average response time",
            self.total_requests.to_formatted_string(&Locale::en),
            self.success_rate_pct,
            self.avg_latency_ms
        )
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "\n === LOAD TEST SUMMARY ===")?;
        writeln!(f, " ------------------------------------------------------------------------------")?;
        writeln!(f, " Target:        {} {}", self.method, self.url)?;
        writeln!(f, " Started:       {}", self.started.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(f, " Status:        {} after {:.1}s", self.status, self.elapsed_secs)?;
        writeln!(f, " Users:         {}", self.users)?;
        writeln!(f, " ------------------------------------------------------------------------------")?;
        writeln!(
            f,
            " {:<14} | {:>12} | {:>12} | {:>12}",
            "Requests", "Total", "Successful", "Failed"
        )?;
        writeln!(
            f,
            " {:<14} | {:>12} | {:>12} | {:>12}",
            "",
            self.total_requests.to_formatted_string(&Locale::en),
            self.successful.to_formatted_string(&Locale::en),
            self.failed.to_formatted_string(&Locale::en)
        )?;
        writeln!(f, " ------------------------------------------------------------------------------")?;
        writeln!(f, " Success rate:  {:.1}%", self.success_rate_pct)?;
        write!(f, " Avg latency:   {:.0}ms", self.avg_latency_ms)
    }
}

/// Emit a sample every second, a chart point and a progress line every two,
/// and end the run once its deadline has passed.
pub(crate) async fn metrics_main(run: Arc<RunState>) {
    let mut ticks: u64 = 0;
    let mut drift = tokio::time::Instant::now();

    loop {
        drift = util::sleep_minus_drift(SAMPLE_INTERVAL, drift).await;
        if !run.is_active() {
            break;
        }

        // Read the user count before the clock, so it never runs ahead of it.
        let active_users = run.active_users();
        let now = run.elapsed_ms();
        if now >= run.duration_ms() {
            run.finish(RunStatus::Completed);
            break;
        }

        ticks += 1;
        let sample = util::lock(&run.metrics).snapshot(now, active_users);
        run.emit(EngineEvent::Sample(sample.clone()));

        if ticks % CHART_EVERY == 0 {
            let point = ChartPoint::from(&sample);
            util::lock(&run.chart).push(point);
            run.emit(EngineEvent::Chart(point));
        }

        if ticks % PROGRESS_EVERY == 0 {
            run.log(Severity::Info, sample.progress_line());
        }
    }

    debug!("metrics aggregator exiting");
}
