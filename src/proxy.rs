//! Relay failover for targets that block cross-origin requests.
//!
//! Requests start out [`Route::Direct`]. The first request classified as
//! [`FailureKind::Cors`] switches the run to the first relay, and from then on
//! any sign that the current relay is failing rotates to the next one, wrapping
//! around when the list is exhausted. The controller never gives up while the
//! run is active.
//!
//! Each [`Relay`] knows how to embed the target URL and which methods and
//! headers it accepts, so requests are downgraded to fit the relay rather than
//! failing outright.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::config::HttpMethod;
use crate::executor::{EffectiveRequest, FailureKind, LogicalRequest, RequestOutcome};
use crate::logger::Severity;
use crate::LoadError;

/// Status codes a relay answers with when it can't or won't forward a request.
pub const RELAY_FAILURE_STATUSES: [u16; 6] = [403, 404, 429, 502, 503, 504];

/// Relay failures tolerated before rotating to the next relay.
pub const ROTATION_THRESHOLD: usize = 1;

/// Hosts known to reject cross-origin requests.
pub const CORS_HOSTILE_HOSTS: &[&str] = &[
    "google.com",
    "amazon.com",
    "facebook.com",
    "twitter.com",
    "instagram.com",
    "brandili.com.br",
    "lojasinoar.com.br",
];

/// Headers sent through relays that strip custom headers. Simple requests
/// avoid a preflight.
const SIMPLE_ACCEPT: &str = "application/json, text/plain, */*";

/// Where requests are sent.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Route {
    Direct,
    /// Through the relay at this index.
    Relayed(usize),
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Route::Direct => write!(f, "directly"),
            Route::Relayed(index) => write!(f, "through relay {}", index + 1),
        }
    }
}

/// How a relay embeds the target URL.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum UrlBuilder {
    /// Append the target URL to the prefix as is.
    Append(String),
    /// Append the percent-encoded target URL to the prefix.
    AppendEncoded(String),
    /// Replace `{url}` in the template with the percent-encoded target URL.
    Placeholder(String),
}

impl UrlBuilder {
    pub fn build(&self, target: &str) -> String {
        match self {
            UrlBuilder::Append(prefix) => format!("{}{}", prefix, target),
            UrlBuilder::AppendEncoded(prefix) => {
                format!("{}{}", prefix, urlencoding::encode(target))
            }
            UrlBuilder::Placeholder(template) => {
                template.replace("{url}", &urlencoding::encode(target))
            }
        }
    }

    fn base(&self) -> &str {
        match self {
            UrlBuilder::Append(base)
            | UrlBuilder::AppendEncoded(base)
            | UrlBuilder::Placeholder(base) => base,
        }
    }
}

/// Methods a relay forwards.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AllowedMethods {
    Any,
    Only(Vec<HttpMethod>),
}

/// A relay able to forward requests around cross-origin restrictions.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Relay {
    pub name: String,
    pub url_builder: UrlBuilder,
    pub allowed_methods: AllowedMethods,
    /// Replace all headers with a minimal set that avoids preflight requests.
    pub strips_headers: bool,
}

impl Relay {
    /// A relay forwarding any method with all headers.
    pub fn new<S: Into<String>>(name: S, url_builder: UrlBuilder) -> Self {
        Relay {
            name: name.into(),
            url_builder,
            allowed_methods: AllowedMethods::Any,
            strips_headers: false,
        }
    }

    pub fn set_allowed_methods(mut self, methods: &[HttpMethod]) -> Self {
        self.allowed_methods = AllowedMethods::Only(methods.to_vec());
        self
    }

    pub fn set_strips_headers(mut self, strips_headers: bool) -> Self {
        self.strips_headers = strips_headers;
        self
    }

    pub fn allows(&self, method: HttpMethod) -> bool {
        match &self.allowed_methods {
            AllowedMethods::Any => true,
            AllowedMethods::Only(methods) => methods.contains(&method),
        }
    }

    /// Rewrite a request to go through this relay.
    ///
    /// Methods the relay doesn't accept are downgraded to GET and lose their
    /// body.
    pub fn apply(&self, request: &LogicalRequest, index: usize) -> EffectiveRequest {
        let (method, body) = if self.allows(request.method) {
            (request.method, request.body.clone())
        } else {
            (HttpMethod::Get, None)
        };

        let headers = if self.strips_headers {
            let mut headers = BTreeMap::new();
            headers.insert("Accept".to_string(), SIMPLE_ACCEPT.to_string());
            if body.is_some() {
                headers.insert("Content-Type".to_string(), "application/json".to_string());
            }
            headers
        } else {
            request.headers.clone()
        };

        EffectiveRequest {
            url: self.url_builder.build(&request.url),
            method,
            headers,
            body,
            route: Route::Relayed(index),
        }
    }
}

/// Parse a relay from `append:PREFIX`, `encode:PREFIX` or `template:TEMPLATE`.
///
/// Relays defined this way only forward GET requests and strip headers.
///
/// ```rust
/// use stampede::proxy::{Relay, UrlBuilder};
/// use std::str::FromStr;
///
/// let relay = Relay::from_str("template:https://relay.example/fetch?target={url}").unwrap();
/// assert_eq!(relay.name, "relay.example");
/// assert_eq!(
///     relay.url_builder.build("https://example.com/?a=1"),
///     "https://relay.example/fetch?target=https%3A%2F%2Fexample.com%2F%3Fa%3D1"
/// );
/// ```
impl FromStr for Relay {
    type Err = LoadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |detail: &str| LoadError::InvalidConfig {
            option: "--relay".to_string(),
            value: value.to_string(),
            detail: detail.to_string(),
        };

        let (kind, target) = value
            .split_once(':')
            .ok_or_else(|| invalid("Expected append:PREFIX, encode:PREFIX or template:TEMPLATE."))?;
        let url_builder = match kind {
            "append" => UrlBuilder::Append(target.to_string()),
            "encode" => UrlBuilder::AppendEncoded(target.to_string()),
            "template" if target.contains("{url}") => UrlBuilder::Placeholder(target.to_string()),
            "template" => return Err(invalid("A relay template must contain {url}.")),
            _ => {
                return Err(invalid(
                    "Expected append:PREFIX, encode:PREFIX or template:TEMPLATE.",
                ))
            }
        };

        let base = url_builder.base().replace("{url}", "");
        let name = Url::parse(&base)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .ok_or_else(|| invalid("A relay must be an absolute http or https URL."))?;

        Ok(Relay::new(name, url_builder)
            .set_allowed_methods(&[HttpMethod::Get])
            .set_strips_headers(true))
    }
}

/// The default relays, in the order they are tried.
pub fn default_relays() -> Vec<Relay> {
    let get_only = [HttpMethod::Get];
    vec![
        Relay::new(
            "allorigins",
            UrlBuilder::AppendEncoded("https://api.allorigins.win/raw?url=".to_string()),
        )
        .set_strips_headers(true),
        Relay::new(
            "corsproxy.io",
            UrlBuilder::AppendEncoded("https://corsproxy.io/?".to_string()),
        )
        .set_allowed_methods(&[HttpMethod::Get, HttpMethod::Post])
        .set_strips_headers(true),
        Relay::new(
            "codetabs",
            UrlBuilder::AppendEncoded("https://api.codetabs.com/v1/proxy?quest=".to_string()),
        )
        .set_allowed_methods(&get_only)
        .set_strips_headers(true),
        Relay::new(
            "thingproxy",
            UrlBuilder::Append("https://thingproxy.freeboard.io/fetch/".to_string()),
        )
        .set_allowed_methods(&get_only)
        .set_strips_headers(true),
        Relay::new(
            "cors-anywhere",
            UrlBuilder::Append("https://cors-anywhere.herokuapp.com/".to_string()),
        )
        .set_allowed_methods(&get_only)
        .set_strips_headers(true),
        Relay::new(
            "cors.sh",
            UrlBuilder::AppendEncoded("https://proxy.cors.sh/?".to_string()),
        )
        .set_allowed_methods(&get_only)
        .set_strips_headers(true),
        Relay::new(
            "allorigins-get",
            UrlBuilder::AppendEncoded("https://api.allorigins.win/get?url=".to_string()),
        )
        .set_strips_headers(true),
    ]
}

/// Whether the target's host is, or is a subdomain of, one of `hosts`.
pub fn is_cors_hostile(url: &Url, hosts: &[String]) -> bool {
    let host = match url.host_str() {
        Some(host) => host.trim_start_matches("www.").to_lowercase(),
        None => return false,
    };
    hosts.iter().any(|known| {
        let known = known.to_lowercase();
        host == known || host.ends_with(&format!(".{}", known))
    })
}

/// Why the controller left a relay.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RotationReason {
    /// The relay answered with one of [`RELAY_FAILURE_STATUSES`].
    Status(u16),
    /// The request through the relay was classified as cross-origin blocked.
    Cors,
    /// The relay has failed repeatedly without a single success.
    NoSuccesses,
}

impl fmt::Display for RotationReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RotationReason::Status(status) => write!(f, "HTTP {}", status),
            RotationReason::Cors => write!(f, "cross-origin blocked"),
            RotationReason::NoSuccesses => write!(f, "no successful requests"),
        }
    }
}

/// A route change, reported to the run's log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailoverNotice {
    /// Switched from direct requests to the first relay.
    Activated { relay: String, count: usize },
    /// Switched from one relay to the next.
    Rotated {
        from: usize,
        to: usize,
        relay: String,
        count: usize,
        reason: RotationReason,
        /// Every relay has been tried and the cycle starts over.
        wrapped: bool,
    },
}

impl FailoverNotice {
    pub fn severity(&self) -> Severity {
        match self {
            FailoverNotice::Rotated { wrapped: true, .. } => Severity::Error,
            _ => Severity::Warning,
        }
    }
}

impl fmt::Display for FailoverNotice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FailoverNotice::Activated { relay, count } => write!(
                f,
                "Cross-origin blocking detected, routing requests through relay 1/{} ({})",
                count, relay
            ),
            FailoverNotice::Rotated {
                from,
                relay,
                count,
                reason,
                wrapped: true,
                ..
            } => write!(
                f,
                "Relay {}/{} failed ({}), all {} relays tried, restarting cycle with relay 1/{} ({})",
                from + 1,
                count,
                reason,
                count,
                count,
                relay
            ),
            FailoverNotice::Rotated {
                from,
                to,
                relay,
                count,
                reason,
                wrapped: false,
            } => write!(
                f,
                "Relay {}/{} failed ({}), switching to relay {}/{} ({})",
                from + 1,
                count,
                reason,
                to + 1,
                count,
                relay
            ),
        }
    }
}

/// Requests, successes and failures seen by one relay.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RelayReport {
    pub name: String,
    pub requests: usize,
    pub successes: usize,
    pub failures: usize,
}

impl fmt::Display for RelayReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Relay {}: {} requests, {} succeeded, {} failed",
            self.name, self.requests, self.successes, self.failures
        )
    }
}

/// Per-run failover state.
#[derive(Clone, Debug)]
pub struct ProxyFailover {
    enabled: bool,
    relays: Vec<Relay>,
    route: Route,
    /// Relay failures since the last rotation.
    failures: usize,
    reports: Vec<RelayReport>,
}

impl ProxyFailover {
    /// Failover is inert when disabled or when there are no relays.
    pub fn new(relays: Vec<Relay>, enabled: bool) -> Self {
        let reports = relays
            .iter()
            .map(|relay| RelayReport {
                name: relay.name.clone(),
                ..Default::default()
            })
            .collect();
        ProxyFailover {
            enabled: enabled && !relays.is_empty(),
            relays,
            route: Route::Direct,
            failures: 0,
            reports,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn current(&self) -> Route {
        self.route
    }

    pub fn report(&self) -> Vec<RelayReport> {
        self.reports.clone()
    }

    /// Route through the first relay before any request is sent.
    pub fn preselect(&mut self) -> Option<FailoverNotice> {
        if !self.enabled || self.route != Route::Direct {
            return None;
        }
        Some(self.activate())
    }

    /// The request to dispatch for `request` on the current route.
    pub fn resolve(&self, request: &LogicalRequest) -> EffectiveRequest {
        match self.route {
            Route::Relayed(index) => self.relays[index].apply(request, index),
            Route::Direct => EffectiveRequest {
                url: request.url.clone(),
                method: request.method,
                headers: request.headers.clone(),
                body: request.body.clone(),
                route: Route::Direct,
            },
        }
    }

    /// Update the state with a recorded outcome, returning a notice if the
    /// route changed.
    ///
    /// Outcomes of requests dispatched on another route than the current one
    /// are ignored: they describe a route that was already abandoned.
    pub fn observe(&mut self, outcome: &RequestOutcome) -> Option<FailoverNotice> {
        if !self.enabled || outcome.route != self.route {
            return None;
        }

        match self.route {
            Route::Direct => {
                if outcome.failure == Some(FailureKind::Cors) {
                    Some(self.activate())
                } else {
                    None
                }
            }
            Route::Relayed(index) => {
                let report = &mut self.reports[index];
                report.requests += 1;
                if outcome.success {
                    report.successes += 1;
                    return None;
                }
                report.failures += 1;

                let reason = match (outcome.status_code, outcome.failure) {
                    (Some(status), _) if RELAY_FAILURE_STATUSES.contains(&status) => {
                        Some(RotationReason::Status(status))
                    }
                    (_, Some(FailureKind::Cors)) => Some(RotationReason::Cors),
                    _ if report.requests >= 3 && report.successes == 0 && report.failures >= 2 => {
                        Some(RotationReason::NoSuccesses)
                    }
                    _ => None,
                }?;

                self.failures += 1;
                if self.failures >= ROTATION_THRESHOLD {
                    Some(self.rotate(index, reason))
                } else {
                    None
                }
            }
        }
    }

    fn activate(&mut self) -> FailoverNotice {
        self.route = Route::Relayed(0);
        self.failures = 0;
        FailoverNotice::Activated {
            relay: self.relays[0].name.clone(),
            count: self.relays.len(),
        }
    }

    fn rotate(&mut self, from: usize, reason: RotationReason) -> FailoverNotice {
        let to = (from + 1) % self.relays.len();
        self.route = Route::Relayed(to);
        self.failures = 0;
        FailoverNotice::Rotated {
            from,
            to,
            relay: self.relays[to].name.clone(),
            count: self.relays.len(),
            reason,
            wrapped: to == 0,
        }
    }
}
