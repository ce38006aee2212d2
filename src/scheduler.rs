//! Ramp-up: launch virtual users linearly until the target count is reached.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::logger::Severity;
use crate::{session, util, RunState};

/// How often the target number of users is recomputed.
pub const RAMP_UP_TICK: Duration = Duration::from_millis(500);

/// Number of users that should be running `elapsed` into a run.
///
/// Grows linearly from 1 to `users` over `ramp_up`, and is `users` once the
/// ramp-up is over or if there is none.
///
/// ```rust
/// use stampede::scheduler::target_users;
/// use std::time::Duration;
///
/// let ramp_up = Duration::from_secs(5);
/// assert_eq!(target_users(10, Duration::from_millis(200), ramp_up), 1);
/// assert_eq!(target_users(10, Duration::from_millis(2_500), ramp_up), 5);
/// assert_eq!(target_users(10, Duration::from_secs(6), ramp_up), 10);
/// ```
pub fn target_users(users: usize, elapsed: Duration, ramp_up: Duration) -> usize {
    // Sub-millisecond ramp-ups count as none.
    if ramp_up.as_millis() == 0 || elapsed >= ramp_up {
        return users;
    }
    let scaled = users as u128 * elapsed.as_millis() / ramp_up.as_millis();
    (scaled as usize).clamp(1, users.max(1))
}

/// Launch sessions on every tick until all users are running or the run ends.
///
/// This task is the only owner of the session list, and returns it so the
/// caller can wait for in-flight requests to drain.
pub(crate) async fn ramp_up_main(run: Arc<RunState>) -> Vec<JoinHandle<()>> {
    let users = run.config.users;
    let mut sessions: Vec<JoinHandle<()>> = Vec::with_capacity(users);
    let mut drift = tokio::time::Instant::now();

    while sessions.len() < users {
        drift = util::sleep_minus_drift(RAMP_UP_TICK, drift).await;
        if !run.in_progress() {
            break;
        }

        let target = target_users(users, run.elapsed(), run.config.ramp_up);
        while sessions.len() < target && run.in_progress() {
            let id = sessions.len() + 1;
            sessions.push(tokio::spawn(session::session_main(id, run.clone())));
            run.sessions.store(sessions.len(), Ordering::SeqCst);
        }
        debug!("{} of {} users launched", sessions.len(), users);
    }

    if sessions.len() == users && run.is_active() {
        run.log(
            Severity::Success,
            format!("All {} users launched after {:.1}s", users, run.elapsed().as_secs_f64()),
        );
    }

    sessions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_growth() {
        let ramp_up = Duration::from_secs(5);
        let at = |ms: u64| target_users(10, Duration::from_millis(ms), ramp_up);

        assert_eq!(at(0), 1);
        assert_eq!(at(500), 1);
        assert_eq!(at(1_000), 2);
        assert_eq!(at(1_499), 2);
        assert_eq!(at(4_999), 9);
        assert_eq!(at(5_000), 10);
        assert_eq!(at(60_000), 10);
    }

    #[test]
    fn never_exceeds_bound() {
        let ramp_up = Duration::from_millis(3_000);
        for users in 1..40usize {
            let mut previous = 0;
            for ms in (0..4_000u64).step_by(250) {
                let target = target_users(users, Duration::from_millis(ms), ramp_up);
                assert!(target >= previous, "concurrency must not decrease");
                assert!(target <= users);
                if ms > 0 && ms < 3_000 {
                    let bound = (users as f64 * ms as f64 / 3_000.0).ceil() as usize;
                    assert!(target <= bound.max(1));
                }
                previous = target;
            }
            assert_eq!(previous, users);
        }
    }

    #[test]
    fn no_ramp_up() {
        assert_eq!(target_users(7, Duration::from_millis(0), Duration::from_secs(0)), 7);
        assert_eq!(target_users(7, Duration::from_millis(10), Duration::from_secs(0)), 7);
        assert_eq!(target_users(7, Duration::from_micros(100), Duration::from_micros(500)), 7);
        assert_eq!(target_users(7, Duration::from_millis(0), Duration::from_micros(999)), 7);
    }
}
