//! A virtual user: request, think, repeat.

use std::sync::Arc;
use std::time::Duration;

use crate::{executor, RunState};

/// Pause used between requests when the configured think time is zero.
pub const MIN_THINK_TIME: Duration = Duration::from_millis(100);

/// Sleep in slices of at most this long, so a stopped run is noticed quickly.
const SLEEP_SLICE: Duration = Duration::from_millis(500);

/// The pause between two requests of one user.
pub fn think_time(configured: Duration) -> Duration {
    if configured.is_zero() {
        MIN_THINK_TIME
    } else {
        configured
    }
}

/// Send requests until the run is stopped or its deadline passes.
///
/// The run is only checked between iterations: a request in flight when the
/// run ends completes or times out on its own.
pub(crate) async fn session_main(id: usize, run: Arc<RunState>) {
    debug!("session {} starting", id);
    let pause = think_time(run.config.think_time);

    while run.in_progress() {
        executor::execute(&run, id).await;
        think(&run, pause).await;
    }

    debug!("session {} exiting", id);
}

async fn think(run: &RunState, pause: Duration) {
    let mut remaining = pause;
    while !remaining.is_zero() && run.in_progress() {
        let slice = remaining.min(SLEEP_SLICE);
        tokio::time::sleep(slice).await;
        remaining -= slice;
    }
}
