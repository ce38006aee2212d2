use regex::Regex;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use url::Url;

use crate::LoadError;

/// Parse a string representing a time span and return the number of seconds.
///
/// Can be specified as an integer, indicating seconds. Or can use integers
/// together with one or more of "h", "m", and "s", in that order, indicating
/// "hours", "minutes", and "seconds". Returns `None` if nothing matches.
///
/// Valid formats include: 20, 20s, 3m, 2h, 1h20m, 3h30m10s, etc.
///
/// # Example
/// ```rust
/// use stampede::util;
///
/// // 1 hour 2 minutes and 3 seconds is 3,723 seconds.
/// assert_eq!(util::parse_timespan("1h2m3s"), Some(3_723));
///
/// // 45 seconds is 45 seconds.
/// assert_eq!(util::parse_timespan("45"), Some(45));
///
/// // Invalid value is rejected.
/// assert_eq!(util::parse_timespan("ten minutes"), None);
/// ```
pub fn parse_timespan(time_str: &str) -> Option<usize> {
    let time_str = time_str.trim();
    if let Ok(t) = usize::from_str(time_str) {
        // If an integer is passed in, assume it's seconds
        trace!("{} is integer: {} seconds", time_str, t);
        return Some(t);
    }

    // Otherwise use a regex to extract hours, minutes and seconds from string.
    let re = Regex::new(r"^(?:(?P<hours>\d+)h)?(?:(?P<minutes>\d+)m)?(?:(?P<seconds>\d+)s)?$").ok()?;
    let time_matches = re.captures(time_str)?;
    let part = |name: &str| -> Option<usize> {
        match time_matches.name(name) {
            Some(m) => usize::from_str(m.as_str()).ok(),
            None => Some(0),
        }
    };
    if time_matches.name("hours").is_none()
        && time_matches.name("minutes").is_none()
        && time_matches.name("seconds").is_none()
    {
        return None;
    }
    let (hours, minutes, seconds) = (part("hours")?, part("minutes")?, part("seconds")?);
    let total = hours * 60 * 60 + minutes * 60 + seconds;
    trace!(
        "{} hours {} minutes {} seconds: {} seconds",
        hours,
        minutes,
        seconds,
        total
    );
    Some(total)
}

/// Parse a duration given either as fractional seconds ("0.5", "1.25") or as
/// a time span accepted by [`parse_timespan`].
///
/// # Example
/// ```rust
/// use stampede::util;
/// use std::time::Duration;
///
/// assert_eq!(util::parse_duration("0.5"), Some(Duration::from_millis(500)));
/// assert_eq!(util::parse_duration("2m"), Some(Duration::from_secs(120)));
/// assert_eq!(util::parse_duration("-1"), None);
/// ```
pub fn parse_duration(value: &str) -> Option<Duration> {
    if let Some(seconds) = parse_timespan(value) {
        return Some(Duration::from_secs(seconds as u64));
    }
    let seconds = f64::from_str(value.trim()).ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}

/// Sleep for a specified duration, minus the time spent doing other things.
///
/// # Example
/// ```rust
/// use stampede::util;
///
/// #[tokio::main]
/// async fn main() {
///     // Do other work while tracking drift.
///     let mut drift_timer = tokio::time::Instant::now();
///
///     // Sleep for 1 second minus the time spent doing other work.
///     drift_timer = util::sleep_minus_drift(
///         std::time::Duration::from_secs(1),
///         drift_timer,
///     ).await;
/// }
/// ```
pub async fn sleep_minus_drift(
    duration: Duration,
    drift: tokio::time::Instant,
) -> tokio::time::Instant {
    match duration.checked_sub(drift.elapsed()) {
        Some(delay) if delay.as_nanos() > 0 => tokio::time::sleep(delay).await,
        _ => debug!("sleep_minus_drift: drift was greater than or equal to duration, not sleeping"),
    };
    tokio::time::Instant::now()
}

/// Parse a target URL, requiring an http or https scheme and a host.
///
/// # Example
/// ```rust
/// use stampede::util;
///
/// assert!(util::parse_target_url("https://example.com/path?q=1").is_ok());
/// assert!(util::parse_target_url("example.com").is_err());
/// assert!(util::parse_target_url("ftp://example.com/").is_err());
/// ```
pub fn parse_target_url(target: &str) -> Result<Url, LoadError> {
    let url = Url::parse(target).map_err(|parse_error| LoadError::InvalidUrl {
        url: target.to_string(),
        detail: "Invalid target URL.".to_string(),
        parse_error,
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(LoadError::InvalidConfig {
            option: "url".to_string(),
            value: target.to_string(),
            detail: "Only http and https targets can be load tested.".to_string(),
        });
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(LoadError::InvalidConfig {
            option: "url".to_string(),
            value: target.to_string(),
            detail: "The target URL must include a host.".to_string(),
        });
    }

    Ok(url)
}

/// Lock a mutex, recovering the data if another task panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespan() {
        assert_eq!(parse_timespan("0"), Some(0));
        assert_eq!(parse_timespan("foo"), None);
        assert_eq!(parse_timespan(""), None);
        assert_eq!(parse_timespan("1"), Some(1));
        assert_eq!(parse_timespan("1s"), Some(1));
        assert_eq!(parse_timespan("1m"), Some(60));
        assert_eq!(parse_timespan("61"), Some(61));
        assert_eq!(parse_timespan("1m1s"), Some(61));
        assert_eq!(parse_timespan("10m"), Some(600));
        assert_eq!(parse_timespan("1h"), Some(3600));
        assert_eq!(parse_timespan("1h1m1s"), Some(3661));
        assert_eq!(parse_timespan(" 15s "), Some(15));
        assert_eq!(parse_timespan("1s1m"), None);
        assert_eq!(parse_timespan("5x"), None);
    }

    #[test]
    fn duration() {
        assert_eq!(parse_duration("0"), Some(Duration::from_secs(0)));
        assert_eq!(parse_duration("1.5"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("NaN"), None);
        assert_eq!(parse_duration("-0.5"), None);
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn target_url() {
        assert!(parse_target_url("http://example.com").is_ok());
        assert!(parse_target_url("http://example.com/").is_ok());
        assert!(parse_target_url("https://example.com/foo").is_ok());
        assert!(parse_target_url("http://127.0.0.1:8080/api?id=1").is_ok());
        assert!(parse_target_url("http://[::1]:8080/").is_ok());

        match parse_target_url("example.com") {
            Err(LoadError::InvalidUrl { url, .. }) => assert_eq!(url, "example.com"),
            other => panic!("unexpected result: {:?}", other),
        }
        match parse_target_url("file:///etc/passwd") {
            Err(LoadError::InvalidConfig { option, .. }) => assert_eq!(option, "url"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(parse_target_url("not a url").unwrap_err().is_invalid_config());
    }

    #[tokio::test]
    async fn drift_is_subtracted() {
        let started = tokio::time::Instant::now();
        let drift = tokio::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        sleep_minus_drift(Duration::from_millis(100), drift).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(250));
    }
}
