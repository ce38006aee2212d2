//! Run history and diagnostics.
//!
//! Each finished run is turned into a [`HistoryRecord`] with a qualitative
//! [`Diagnostic`] derived from its error rate and average latency. Records are
//! kept newest first and can be persisted as JSON lines, one record per line,
//! appended as runs finish.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use strum_macros::{AsRefStr, Display};

use crate::config::HttpMethod;
use crate::metrics::{RunStatus, RunSummary};
use crate::LoadError;

/// Qualitative assessment of a run, from its error rate and average latency.
#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Diagnostic {
    Excellent,
    Good,
    Fair,
    Critical,
}

impl Diagnostic {
    /// The worst threshold crossed by either figure wins.
    ///
    /// ```rust
    /// use stampede::history::Diagnostic;
    ///
    /// assert_eq!(Diagnostic::from_metrics(0.0, 120.0), Diagnostic::Excellent);
    /// assert_eq!(Diagnostic::from_metrics(3.0, 120.0), Diagnostic::Good);
    /// assert_eq!(Diagnostic::from_metrics(0.0, 450.0), Diagnostic::Fair);
    /// assert_eq!(Diagnostic::from_metrics(12.0, 80.0), Diagnostic::Critical);
    /// ```
    pub fn from_metrics(error_rate_pct: f64, avg_latency_ms: f64) -> Self {
        if error_rate_pct > 10.0 || avg_latency_ms > 500.0 {
            Diagnostic::Critical
        } else if error_rate_pct > 5.0 || avg_latency_ms > 400.0 {
            Diagnostic::Fair
        } else if error_rate_pct > 2.0 || avg_latency_ms > 300.0 {
            Diagnostic::Good
        } else {
            Diagnostic::Excellent
        }
    }

    pub fn from_summary(summary: &RunSummary) -> Self {
        Diagnostic::from_metrics(100.0 - summary.success_rate_pct, summary.avg_latency_ms)
    }

    pub fn description(self) -> &'static str {
        match self {
            Diagnostic::Excellent => "excellent performance",
            Diagnostic::Good => "good performance",
            Diagnostic::Fair => "fair performance, room for optimization",
            Diagnostic::Critical => "critical: the target is very slow or failing",
        }
    }

    /// Runs with a critical diagnostic count as failed.
    pub fn is_success(self) -> bool {
        self != Diagnostic::Critical
    }
}

/// One finished run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub date: DateTime<Utc>,
    pub url: String,
    pub method: HttpMethod,
    pub users: usize,
    pub status: RunStatus,
    pub diagnostic: Diagnostic,
    pub error_rate_pct: f64,
    pub avg_latency_ms: f64,
    pub total_requests: usize,
}

impl From<&RunSummary> for HistoryRecord {
    fn from(summary: &RunSummary) -> Self {
        HistoryRecord {
            date: summary.started,
            url: summary.url.clone(),
            method: summary.method,
            users: summary.users,
            status: summary.status,
            diagnostic: Diagnostic::from_summary(summary),
            error_rate_pct: 100.0 - summary.success_rate_pct,
            avg_latency_ms: summary.avg_latency_ms.round(),
            total_requests: summary.total_requests,
        }
    }
}

/// Aggregate figures over the whole history.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total_runs: usize,
    /// Percentage of runs without a critical diagnostic.
    pub success_rate_pct: f64,
}

/// Finished runs, newest first.
#[derive(Clone, Debug, Default)]
pub struct History {
    records: Vec<HistoryRecord>,
    file: Option<PathBuf>,
}

impl History {
    pub fn new() -> Self {
        History::default()
    }

    /// Load the history persisted at `path`, which is also where new records
    /// will be appended. A missing file is an empty history.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let mut records = Vec::new();

        match File::open(path) {
            Ok(file) => {
                for line in BufReader::new(file).lines() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<HistoryRecord>(&line) {
                        Ok(record) => records.push(record),
                        Err(e) => warn!("skipping invalid history record in {}: {}", path.display(), e),
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no history at {}, starting a new one", path.display());
            }
            Err(e) => return Err(e.into()),
        }

        // The file is oldest first.
        records.reverse();
        info!("loaded {} runs from {}", records.len(), path.display());

        Ok(History {
            records,
            file: Some(path.to_path_buf()),
        })
    }

    /// Add a finished run, persisting it if the history is backed by a file.
    pub fn record(&mut self, summary: &RunSummary) -> Result<&HistoryRecord, LoadError> {
        let record = HistoryRecord::from(summary);

        if let Some(path) = self.file.as_ref() {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "{}", serde_json::to_string(&record)?)?;
        }

        self.records.insert(0, record);
        Ok(&self.records[0])
    }

    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    pub fn stats(&self) -> HistoryStats {
        let total_runs = self.records.len();
        let successful = self
            .records
            .iter()
            .filter(|record| record.diagnostic.is_success())
            .count();
        HistoryStats {
            total_runs,
            success_rate_pct: if total_runs == 0 {
                0.0
            } else {
                successful as f64 / total_runs as f64 * 100.0
            },
        }
    }
}
