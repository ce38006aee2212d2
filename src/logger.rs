//! Engine events and the optional request log.
//!
//! Everything a run reports flows through one [`EngineEvent`] channel: live
//! samples, chart points, log lines and the final summary. Log lines are also
//! mirrored to the [`log`](https://docs.rs/log) facade, so they show up in the
//! terminal and in the log file configured with `--log-file`.
//!
//! The request log is enabled with the `--request-log` command-line option, or
//! by setting [`EngineOptions::request_log`](../config/struct.EngineOptions.html#structfield.request_log).
//! When enabled, a task is launched for the run and every [`RequestOutcome`]
//! is sent to it over a channel, to be written asynchronously through a
//! buffered writer. The format is selected with `--request-format`:
//!
//! ```json
//! {"elapsed":1043,"failure":null,"latency":51,"method":"GET","route":"Direct","session":3,"status_code":200,"success":true}
//! ```
//!
//! ```csv
//! elapsed,session,method,route,status_code,success,failure,latency
//! 1043,3,GET,direct,200,true,,51
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum_macros::{Display, EnumString};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::executor::RequestOutcome;
use crate::metrics::{ChartPoint, MetricSample, RunSummary};
use crate::proxy::Route;
use crate::LoadError;

/// How much a log line matters.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// A human-readable line about the run, never revised once emitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    pub fn new<S: Into<String>>(severity: Severity, message: S) -> Self {
        LogEvent {
            severity,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Write the event to the log facade.
    pub(crate) fn mirror(&self) {
        match self.severity {
            Severity::Info | Severity::Success => info!("{}", self.message),
            Severity::Warning => warn!("{}", self.message),
            Severity::Error => error!("{}", self.message),
        }
    }
}

/// Everything a run reports, in the order it happened.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    /// Live metrics, once a second.
    Sample(MetricSample),
    /// A new point of the chart, every two seconds.
    Chart(ChartPoint),
    Log(LogEvent),
    /// The final summary, exactly once per run.
    Summary(RunSummary),
}

/// Formats the request log can be written in.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Csv,
    Json,
    Raw,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Json
    }
}

const CSV_HEADER: &str = "elapsed,session,method,route,status_code,success,failure,latency";

/// Format one outcome as a line of the request log.
pub fn format_outcome(outcome: &RequestOutcome, format: LogFormat) -> String {
    match format {
        // Use serde_json to create JSON.
        LogFormat::Json => serde_json::json!(outcome).to_string(),
        LogFormat::Csv => format!(
            "{},{},{},{},{},{},{},{}",
            outcome.elapsed,
            outcome.session,
            outcome.method,
            match outcome.route {
                Route::Direct => "direct".to_string(),
                Route::Relayed(index) => format!("relay{}", index + 1),
            },
            outcome
                .status_code
                .map(|status| status.to_string())
                .unwrap_or_default(),
            outcome.success,
            outcome
                .failure
                .map(|failure| failure.to_string())
                .unwrap_or_default(),
            outcome.latency
        ),
        // Raw format is Debug output for the RequestOutcome structure.
        LogFormat::Raw => format!("{:?}", outcome),
    }
}

/// Write request outcomes to `path` until an empty message is received or
/// every sender is dropped.
pub(crate) async fn request_logger_main(
    path: PathBuf,
    format: LogFormat,
    receiver: flume::Receiver<Option<RequestOutcome>>,
) -> Result<(), LoadError> {
    let mut file = match File::create(&path).await {
        Ok(f) => {
            info!("writing requests to: {}", path.display());
            BufWriter::with_capacity(64 * 1024, f)
        }
        Err(e) => {
            error!("failed to create request log ({}): {}", path.display(), e);
            // Drain the channel so senders never notice.
            while let Ok(Some(_)) = receiver.recv_async().await {}
            return Err(e.into());
        }
    };

    if format == LogFormat::Csv {
        file.write_all(format!("{}\n", CSV_HEADER).as_bytes()).await?;
    }

    // Loop waiting for and writing request outcomes.
    while let Ok(message) = receiver.recv_async().await {
        if let Some(outcome) = message {
            let formatted = format_outcome(&outcome, format);
            if let Err(e) = file.write_all(format!("{}\n", formatted).as_bytes()).await {
                warn!("failed to write to {}: {}", path.display(), e);
            }
        } else {
            // Empty message means it's time to exit.
            break;
        }
    }

    // Cleanup and flush the log to disk.
    info!("flushing request log: {}", path.display());
    file.flush().await?;

    Ok(())
}
