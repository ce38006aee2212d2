use gumdrop::Options;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use stampede::config::StampedeConfiguration;
use stampede::history::History;
use stampede::logger::EngineEvent;
use stampede::metrics::MetricSample;
use stampede::{LoadEngine, LoadError};

#[tokio::main]
async fn main() -> Result<(), LoadError> {
    let configuration = StampedeConfiguration::parse_args_default_or_exit();
    if configuration.version {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    configuration.initialize_logger();
    let (test, options) = configuration.build()?;

    let mut history = if configuration.history_file.is_empty() {
        History::new()
    } else {
        History::load(&configuration.history_file)?
    };

    let (engine, events) = LoadEngine::new(options)?;
    let engine = Arc::new(engine);

    // Stop the run gracefully on the first ctrl-c, still reporting a summary.
    // Exit abruptly on the second, without waiting for in-flight requests.
    let handler_engine = engine.clone();
    let canceled = AtomicBool::new(false);
    if let Err(e) = ctrlc::set_handler(move || {
        if caught_before(&canceled) {
            warn!("caught another ctrl-c, exiting immediately...");
            std::process::exit(1);
        }
        warn!("caught ctrl-c, stopping...");
        if handler_engine.stop().is_none() {
            info!("no load test running");
        }
    }) {
        warn!("failed to set ctrl-c handler: {}", e);
    }

    let handle = engine.start(test)?;
    let quiet = configuration.quiet > 0;
    let verbose = configuration.verbose > 0;
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            match event {
                EngineEvent::Sample(sample) if !quiet => print_sample(&sample),
                EngineEvent::Chart(point) if verbose => println!(
                    " chart {:>4}s | {:>8.1} req/s | {:>7.0}ms",
                    point.elapsed_secs, point.throughput, point.latency_ms
                ),
                EngineEvent::Summary(_) => break,
                _ => {}
            }
        }
    });

    let summary = handle.wait().await?;
    printer.await?;
    println!("{}", summary);

    let record = history.record(&summary)?;
    println!(
        " Diagnostic:    {} ({:.1}% errors, {:.0}ms average)\n",
        record.diagnostic.description(),
        record.error_rate_pct,
        record.avg_latency_ms
    );
    if history.records().len() > 1 {
        let stats = history.stats();
        println!(
            " History:       {} runs, {:.1}% without critical diagnostics",
            stats.total_runs, stats.success_rate_pct
        );
    }

    Ok(())
}

/// Record a ctrl-c, returning whether one was already caught.
fn caught_before(canceled: &AtomicBool) -> bool {
    canceled.swap(true, Ordering::SeqCst)
}

fn print_sample(sample: &MetricSample) {
    println!(
        " {:>6.1}s | {:>4} users | {:>8.1} req/s | {:>7.0}ms | {:>5.1}% ok",
        sample.elapsed_ms as f64 / 1_000.0,
        sample.active_users,
        sample.throughput_per_sec,
        sample.avg_latency_ms,
        sample.success_rate_pct
    );
}
