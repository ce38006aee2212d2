//! Test and engine configuration.
//!
//! A [`TestConfiguration`] describes one run: what to request, how many users,
//! for how long. [`EngineOptions`] describe how the engine behaves across runs:
//! timeouts, relay failover and request logging. Both can be built in code, or
//! from the command line through [`StampedeConfiguration`].

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use strum_macros::{AsRefStr, Display, EnumString};
use url::Url;

use crate::logger::LogFormat;
use crate::proxy::{self, Relay};
use crate::util;
use crate::LoadError;

/// Virtual users launched when not otherwise configured.
pub const DEFAULT_USERS: usize = 5;
/// How long a run lasts when not otherwise configured.
pub const DEFAULT_DURATION: Duration = Duration::from_secs(15);
/// How long it takes to launch all users when not otherwise configured.
pub const DEFAULT_RAMP_UP: Duration = Duration::from_secs(5);
/// Pause between two requests of the same user when not otherwise configured.
pub const DEFAULT_THINK_TIME: Duration = Duration::from_secs(1);
/// Per-request deadline, independent of the run's deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP methods a load test can use.
#[derive(
    AsRefStr, Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq, Serialize, Deserialize,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    /// Only POST, PUT and PATCH requests carry a body.
    pub fn allows_body(self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }
}

impl Default for HttpMethod {
    fn default() -> Self {
        HttpMethod::Get
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

/// Extra headers and body sent with every request of a run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvancedRequest {
    /// Headers merged over the default `Content-Type: application/json`.
    pub headers: BTreeMap<String, String>,
    /// JSON body, only valid with methods that carry one.
    pub body: Option<serde_json::Value>,
}

/// Everything describing one run. Immutable once the run starts.
///
/// ```rust
/// use stampede::config::{HttpMethod, TestConfiguration};
/// use std::time::Duration;
///
/// let configuration = TestConfiguration::new("https://example.com/api")
///     .set_method(HttpMethod::Post)
///     .set_users(20)
///     .set_duration(Duration::from_secs(60))
///     .set_header("Authorization", "Bearer token")
///     .set_body(serde_json::json!({"name": "stampede"}));
/// assert!(configuration.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestConfiguration {
    pub url: String,
    pub method: HttpMethod,
    /// Target number of concurrent virtual users.
    pub users: usize,
    pub duration: Duration,
    pub ramp_up: Duration,
    pub think_time: Duration,
    pub advanced: AdvancedRequest,
}

impl TestConfiguration {
    pub fn new<S: Into<String>>(url: S) -> Self {
        TestConfiguration {
            url: url.into(),
            method: HttpMethod::Get,
            users: DEFAULT_USERS,
            duration: DEFAULT_DURATION,
            ramp_up: DEFAULT_RAMP_UP,
            think_time: DEFAULT_THINK_TIME,
            advanced: AdvancedRequest::default(),
        }
    }

    pub fn set_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn set_users(mut self, users: usize) -> Self {
        self.users = users;
        self
    }

    pub fn set_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn set_ramp_up(mut self, ramp_up: Duration) -> Self {
        self.ramp_up = ramp_up;
        self
    }

    pub fn set_think_time(mut self, think_time: Duration) -> Self {
        self.think_time = think_time;
        self
    }

    /// Add a header, replacing any existing header of the same name.
    pub fn set_header<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        let name = name.into();
        self.advanced
            .headers
            .retain(|existing, _| !existing.eq_ignore_ascii_case(&name));
        self.advanced.headers.insert(name, value.into());
        self
    }

    pub fn set_body(mut self, body: serde_json::Value) -> Self {
        self.advanced.body = Some(body);
        self
    }

    /// Validate the configuration, returning the parsed target URL.
    pub fn validate(&self) -> Result<Url, LoadError> {
        let url = util::parse_target_url(&self.url)?;

        if self.users == 0 {
            return Err(LoadError::InvalidConfig {
                option: "users".to_string(),
                value: self.users.to_string(),
                detail: "At least one user is required.".to_string(),
            });
        }

        if self.duration.is_zero() {
            return Err(LoadError::InvalidConfig {
                option: "run_time".to_string(),
                value: format!("{:?}", self.duration),
                detail: "The run time must be greater than zero.".to_string(),
            });
        }

        if self.advanced.body.is_some() && !self.method.allows_body() {
            return Err(LoadError::InvalidConfig {
                option: "body".to_string(),
                value: self.method.to_string(),
                detail: "A body can only be sent with POST, PUT or PATCH.".to_string(),
            });
        }

        for (name, value) in &self.advanced.headers {
            if http::HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(LoadError::InvalidConfig {
                    option: "header".to_string(),
                    value: name.to_string(),
                    detail: "Invalid header name.".to_string(),
                });
            }
            if http::HeaderValue::from_str(value).is_err() {
                return Err(LoadError::InvalidConfig {
                    option: "header".to_string(),
                    value: format!("{}: {}", name, value),
                    detail: "Invalid header value.".to_string(),
                });
            }
        }

        Ok(url)
    }
}

/// Engine behavior shared by every run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Deadline of each individual request.
    pub timeout: Duration,
    /// Route around cross-origin blocking through relays.
    pub failover: bool,
    /// Treat transport failures as cross-origin blocking until the first success.
    pub cors_heuristic: bool,
    /// Relays, tried in order.
    pub relays: Vec<Relay>,
    /// Hosts routed through the first relay from the start of a run.
    pub cors_hostile_hosts: Vec<String>,
    /// Write every request outcome to this file.
    pub request_log: Option<PathBuf>,
    pub request_format: LogFormat,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            timeout: DEFAULT_TIMEOUT,
            failover: true,
            cors_heuristic: true,
            relays: proxy::default_relays(),
            cors_hostile_hosts: proxy::CORS_HOSTILE_HOSTS
                .iter()
                .map(|host| host.to_string())
                .collect(),
            request_log: None,
            request_format: LogFormat::Json,
        }
    }
}

/// Runtime options available when launching a load test from the command line.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Stampede drives concurrent virtual users against one HTTP endpoint,
ramping up smoothly and reporting live throughput, latency and success rate.

The following runtime options are available:"#
)]
pub struct StampedeConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V", help = "Prints version information\n")]
    pub version: bool,

    /// Defines the URL to load test (ie https://example.com/api)
    #[options(short = "H", meta = "URL")]
    pub url: String,
    /// Sets the HTTP method (default: GET)
    #[options(short = "X", meta = "METHOD")]
    pub method: String,
    /// Sets concurrent users (default: 5)
    #[options(short = "u")]
    pub users: Option<usize>,
    /// Stops load test after (30s, 20m, 3h, 1h30m, etc) (default: 15s)
    #[options(short = "t", meta = "TIME")]
    pub run_time: String,
    /// Launches all users over (5s, 1m, etc) (default: 5s)
    #[options(short = "s", meta = "TIME")]
    pub ramp_up: String,
    /// Pauses each user between requests, in seconds (default: 1)
    #[options(no_short, meta = "TIME")]
    pub think_time: String,
    /// Aborts each request after (default: 30s)
    #[options(
        no_short,
        meta = "TIME",
        help = "Aborts each request after (default: 30s)\n\nRequest:"
    )]
    pub timeout: String,

    /// Adds a request header, may be repeated ("Name: value")
    #[options(no_short, meta = "HEADER")]
    pub header: Vec<String>,
    /// Adds request headers from a JSON object
    #[options(no_short, meta = "JSON")]
    pub headers: String,
    /// Sets a JSON request body (POST, PUT and PATCH only)
    #[options(no_short, meta = "JSON", help = "Sets a JSON request body (POST, PUT and PATCH only)\n\nFailover:")]
    pub body: String,

    /// Never routes requests through relays
    #[options(no_short)]
    pub no_failover: bool,
    /// Doesn't treat early transport failures as cross-origin blocking
    #[options(no_short)]
    pub no_cors_heuristic: bool,
    /// Replaces the default relays, may be repeated (append:, encode: or template:)
    #[options(no_short, meta = "RELAY")]
    pub relay: Vec<String>,
    /// Adds a host routed through relays from the start, may be repeated
    #[options(no_short, meta = "HOST", help = "Adds a host routed through relays from the start, may be repeated\n\nLogging:")]
    pub cors_host: Vec<String>,

    /// Sets request log file name
    #[options(short = "R", meta = "NAME")]
    pub request_log: String,
    /// Sets request log format (csv, json, raw)
    #[options(no_short, meta = "FORMAT")]
    pub request_format: Option<LogFormat>,
    /// Appends each run to a JSON lines history file
    #[options(no_short, meta = "NAME")]
    pub history_file: String,
    /// Enables log file and sets name
    #[options(short = "G", meta = "NAME")]
    pub log_file: String,
    /// Increases log file level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases verbosity (-q, -qq, etc)
    #[options(count, short = "q")]
    pub quiet: u8,
    /// Increases verbosity (-v, -vv, etc)
    #[options(count, short = "v")]
    pub verbose: u8,
}

impl StampedeConfiguration {
    /// Check for invalid and conflicting options.
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.url.is_empty() {
            return Err(LoadError::InvalidConfig {
                option: "--url".to_string(),
                value: String::new(),
                detail: "A target URL must be defined with --url.".to_string(),
            });
        }

        if self.no_failover && !self.relay.is_empty() {
            return Err(LoadError::InvalidConfig {
                option: "--relay".to_string(),
                value: self.relay.join(", "),
                detail: "The --relay option can not be used together with --no-failover."
                    .to_string(),
            });
        }

        if self.no_failover && !self.cors_host.is_empty() {
            return Err(LoadError::InvalidConfig {
                option: "--cors-host".to_string(),
                value: self.cors_host.join(", "),
                detail: "The --cors-host option can not be used together with --no-failover."
                    .to_string(),
            });
        }

        if self.request_format.is_some() && self.request_log.is_empty() {
            return Err(LoadError::InvalidConfig {
                option: "--request-format".to_string(),
                value: format!("{:?}", self.request_format),
                detail: "The --request-format option requires --request-log.".to_string(),
            });
        }

        Ok(())
    }

    /// Build the run and engine configuration from the parsed options.
    pub fn build(&self) -> Result<(TestConfiguration, EngineOptions), LoadError> {
        self.validate()?;

        let mut test = TestConfiguration::new(self.url.clone());

        if !self.method.is_empty() {
            test.method = HttpMethod::from_str(&self.method).map_err(|_| LoadError::InvalidConfig {
                option: "--method".to_string(),
                value: self.method.clone(),
                detail: "Supported methods are GET, POST, PUT, PATCH, DELETE, HEAD and OPTIONS."
                    .to_string(),
            })?;
        }
        if let Some(users) = self.users {
            test.users = users;
        }
        if let Some(run_time) = duration_option("--run-time", &self.run_time)? {
            test.duration = run_time;
        }
        if let Some(ramp_up) = duration_option("--ramp-up", &self.ramp_up)? {
            test.ramp_up = ramp_up;
        }
        if let Some(think_time) = duration_option("--think-time", &self.think_time)? {
            test.think_time = think_time;
        }

        if !self.headers.is_empty() {
            for (name, value) in parse_header_object(&self.headers)? {
                test = test.set_header(name, value);
            }
        }
        for header in &self.header {
            let (name, value) = parse_header_line(header)?;
            test = test.set_header(name, value);
        }

        if !self.body.is_empty() {
            let body = serde_json::from_str(&self.body).map_err(|e| LoadError::InvalidConfig {
                option: "--body".to_string(),
                value: self.body.clone(),
                detail: format!("Invalid JSON format: {}", e),
            })?;
            test = test.set_body(body);
        }

        test.validate()?;

        let mut options = EngineOptions::default();
        if let Some(timeout) = duration_option("--timeout", &self.timeout)? {
            if timeout.is_zero() {
                return Err(LoadError::InvalidConfig {
                    option: "--timeout".to_string(),
                    value: self.timeout.clone(),
                    detail: "The request timeout must be greater than zero.".to_string(),
                });
            }
            options.timeout = timeout;
        }
        options.failover = !self.no_failover;
        options.cors_heuristic = !self.no_cors_heuristic;
        if !self.relay.is_empty() {
            options.relays = self
                .relay
                .iter()
                .map(|relay| Relay::from_str(relay))
                .collect::<Result<Vec<_>, _>>()?;
        }
        options
            .cors_hostile_hosts
            .extend(self.cors_host.iter().map(|host| host.to_lowercase()));
        if !self.request_log.is_empty() {
            options.request_log = Some(PathBuf::from(&self.request_log));
        }
        if let Some(format) = self.request_format {
            options.request_format = format;
        }

        Ok((test, options))
    }

    /// Configure the terminal logger and the optional log file.
    pub fn initialize_logger(&self) {
        // Configure debug output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure log file level.
        let log_level = match self.log_level {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        let mut loggers: Vec<Box<dyn SharedLogger>> =
            vec![SimpleLogger::new(debug_level, Config::default())];
        let mut log_file_error = None;
        if !self.log_file.is_empty() {
            match std::fs::File::create(&self.log_file) {
                Ok(file) => loggers.push(WriteLogger::new(log_level, Config::default(), file)),
                Err(e) => log_file_error = Some(e),
            }
        }

        if let Err(e) = CombinedLogger::init(loggers) {
            info!("failed to initialize CombinedLogger: {}", e);
        }
        if let Some(e) = log_file_error {
            warn!("failed to create log file {}: {}", self.log_file, e);
        } else if !self.log_file.is_empty() {
            info!("Writing to log file: {}", self.log_file);
        }

        info!("Output verbosity level: {}", debug_level);
        debug!("Logfile verbosity level: {}", log_level);
    }
}

/// Parse an optional duration option, empty meaning not set.
fn duration_option(option: &str, value: &str) -> Result<Option<Duration>, LoadError> {
    if value.is_empty() {
        return Ok(None);
    }
    match util::parse_duration(value) {
        Some(duration) => Ok(Some(duration)),
        None => Err(LoadError::InvalidConfig {
            option: option.to_string(),
            value: value.to_string(),
            detail: "Expected seconds or a time span such as 30s, 2m or 1h30m.".to_string(),
        }),
    }
}

/// Parse a `Name: value` header.
fn parse_header_line(header: &str) -> Result<(String, String), LoadError> {
    match header.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(LoadError::InvalidConfig {
            option: "--header".to_string(),
            value: header.to_string(),
            detail: "Headers are defined as \"Name: value\".".to_string(),
        }),
    }
}

/// Parse headers from a JSON object. Non-string values are sent as their JSON text.
fn parse_header_object(json: &str) -> Result<Vec<(String, String)>, LoadError> {
    let invalid = |detail: String| LoadError::InvalidConfig {
        option: "--headers".to_string(),
        value: json.to_string(),
        detail,
    };
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| invalid(format!("Invalid JSON format: {}", e)))?;
    let object = value
        .as_object()
        .ok_or_else(|| invalid("Headers must be a JSON object.".to_string()))?;

    Ok(object
        .iter()
        .map(|(name, value)| {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (name.clone(), value)
        })
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(args: &[&str]) -> StampedeConfiguration {
        StampedeConfiguration::parse_args_default(args).expect("failed to parse options")
    }

    #[test]
    fn defaults() {
        let configuration = parse(&["--url", "https://example.com/"]);
        let (test, options) = configuration.build().unwrap();

        assert_eq!(test.url, "https://example.com/");
        assert_eq!(test.method, HttpMethod::Get);
        assert_eq!(test.users, DEFAULT_USERS);
        assert_eq!(test.duration, DEFAULT_DURATION);
        assert_eq!(test.ramp_up, DEFAULT_RAMP_UP);
        assert_eq!(test.think_time, DEFAULT_THINK_TIME);
        assert!(test.advanced.headers.is_empty());
        assert!(test.advanced.body.is_none());

        assert_eq!(options.timeout, DEFAULT_TIMEOUT);
        assert!(options.failover);
        assert!(options.cors_heuristic);
        assert_eq!(options.relays.len(), 7);
        assert!(options.request_log.is_none());
    }

    #[test]
    fn set_options() {
        let configuration = parse(&[
            "-H",
            "https://example.com/api",
            "-X",
            "post",
            "-u",
            "25",
            "-t",
            "1m30s",
            "-s",
            "10s",
            "--think-time",
            "0.25",
            "--timeout",
            "5",
            "--header",
            "Authorization: Bearer abc",
            "--header",
            "X-Trace:1",
            "--headers",
            r#"{"X-Count": 3}"#,
            "--body",
            r#"{"name": "stampede"}"#,
            "--no-cors-heuristic",
            "--relay",
            "template:http://relay.local/fetch?target={url}",
            "--cors-host",
            "Example.org",
            "-R",
            "requests.csv",
            "--request-format",
            "csv",
        ]);
        let (test, options) = configuration.build().unwrap();

        assert_eq!(test.method, HttpMethod::Post);
        assert_eq!(test.users, 25);
        assert_eq!(test.duration, Duration::from_secs(90));
        assert_eq!(test.ramp_up, Duration::from_secs(10));
        assert_eq!(test.think_time, Duration::from_millis(250));
        assert_eq!(
            test.advanced.headers.get("Authorization").map(String::as_str),
            Some("Bearer abc")
        );
        assert_eq!(test.advanced.headers.get("X-Trace").map(String::as_str), Some("1"));
        assert_eq!(test.advanced.headers.get("X-Count").map(String::as_str), Some("3"));
        assert_eq!(test.advanced.body, Some(serde_json::json!({"name": "stampede"})));

        assert_eq!(options.timeout, Duration::from_secs(5));
        assert!(!options.cors_heuristic);
        assert_eq!(options.relays.len(), 1);
        assert!(options.cors_hostile_hosts.contains(&"example.org".to_string()));
        assert_eq!(options.request_log, Some(PathBuf::from("requests.csv")));
        assert_eq!(options.request_format, LogFormat::Csv);
    }

    #[test]
    fn invalid_options() {
        let invalid = |args: &[&str]| match parse(args).build() {
            Err(LoadError::InvalidConfig { option, .. }) => option,
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("{:?} should not be valid", args),
        };

        assert_eq!(invalid(&[]), "--url");
        assert_eq!(invalid(&["-H", "https://example.com", "-X", "FETCH"]), "--method");
        assert_eq!(invalid(&["-H", "https://example.com", "-t", "soon"]), "--run-time");
        assert_eq!(invalid(&["-H", "https://example.com", "-t", "0"]), "run_time");
        assert_eq!(invalid(&["-H", "https://example.com", "-u", "0"]), "users");
        assert_eq!(invalid(&["-H", "https://example.com", "--timeout", "0"]), "--timeout");
        assert_eq!(invalid(&["-H", "https://example.com", "--header", "NoColon"]), "--header");
        assert_eq!(invalid(&["-H", "https://example.com", "--headers", "[1]"]), "--headers");
        assert_eq!(
            invalid(&["-H", "https://example.com", "-X", "POST", "--body", "{oops"]),
            "--body"
        );
        assert_eq!(invalid(&["-H", "https://example.com", "--body", "{}"]), "body");
        assert_eq!(
            invalid(&["-H", "https://example.com", "--no-failover", "--relay", "append:http://r/"]),
            "--relay"
        );
        assert_eq!(
            invalid(&["-H", "https://example.com", "--request-format", "csv"]),
            "--request-format"
        );
        assert_eq!(invalid(&["-H", "https://example.com", "--relay", "carrier:pigeon"]), "--relay");
        assert_eq!(invalid(&["-H", "ftp://example.com/"]), "url");

        match parse(&["-H", "example.com"]).build() {
            Err(LoadError::InvalidUrl { url, .. }) => assert_eq!(url, "example.com"),
            _ => panic!("a URL without a scheme should not be valid"),
        }
    }

    #[test]
    fn header_replacement_ignores_case() {
        let test = TestConfiguration::new("https://example.com/")
            .set_header("content-type", "text/plain")
            .set_header("Content-Type", "application/xml");
        assert_eq!(test.advanced.headers.len(), 1);
        assert_eq!(
            test.advanced.headers.get("Content-Type").map(String::as_str),
            Some("application/xml")
        );

        let invalid = TestConfiguration::new("https://example.com/").set_header("Bad Name", "x");
        assert!(invalid.validate().unwrap_err().is_invalid_config());
    }

    #[test]
    fn method_names() {
        assert_eq!(HttpMethod::from_str("get").unwrap(), HttpMethod::Get);
        assert_eq!(HttpMethod::from_str("PATCH").unwrap(), HttpMethod::Patch);
        assert_eq!(HttpMethod::Delete.to_string(), "DELETE");
        assert!(HttpMethod::Put.allows_body());
        assert!(!HttpMethod::Head.allows_body());
        assert_eq!(reqwest::Method::from(HttpMethod::Options), reqwest::Method::OPTIONS);
    }
}
