use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::fetcher::{DEFAULT_MAX_RETRY_INTERVAL, DEFAULT_MIN_RETRY_INTERVAL, RetryPolicy};
use crate::queue::DEFAULT_MAX_RUNNING_FETCHERS_PER_HOST;
use crate::session::DEFAULT_UNUSED_SESSION_TIMEOUT;
use crate::{ErrorKind, Result};

/// Default total timeout of a request
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout of the connect phase
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default user agent for requests which don't set one
pub const DEFAULT_USER_AGENT: &str = concat!("fetchpool/", env!("CARGO_PKG_VERSION"));

/// Service-wide defaults, applied to every fetcher the service creates.
///
/// Durations use the `humantime` format, e.g. `"30s"` or `"1m 30s"`. A
/// `max_running_fetchers_per_host` of 0 disables the per-host cap, and an
/// `unused_session_timeout` or `request_timeout` of 0 disables that timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetcherServiceConfig {
    /// Maximum number of fetchers running against one host
    pub max_running_fetchers_per_host: usize,

    /// Share one transport session between fetchers
    pub reuse_session: bool,

    /// Idle time after which the shared session is invalidated
    #[serde(with = "humantime_serde")]
    pub unused_session_timeout: Duration,

    /// Total timeout of a request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Timeout of the connect phase
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Whether failed requests may be retried
    pub retry_enabled: bool,

    /// Lower bound between two retries
    #[serde(with = "humantime_serde")]
    pub min_retry_interval: Duration,

    /// Upper bound between two retries
    #[serde(with = "humantime_serde")]
    pub max_retry_interval: Duration,

    /// User agent for requests without one. `None` keeps the transport default.
    pub user_agent: Option<String>,

    /// Schemes other than `https` which may be fetched, e.g. `["http"]`
    pub allowed_insecure_schemes: Vec<String>,

    /// Allow plain requests to localhost
    pub allow_localhost_request: bool,

    /// Accept invalid TLS certificates
    pub allow_invalid_server_certificates: bool,

    /// Proxy every request is routed through
    pub proxy: Option<Url>,

    /// Arbitrary properties copied onto every fetcher
    pub properties: HashMap<String, String>,
}

impl Default for FetcherServiceConfig {
    fn default() -> Self {
        Self {
            max_running_fetchers_per_host: DEFAULT_MAX_RUNNING_FETCHERS_PER_HOST,
            reuse_session: true,
            unused_session_timeout: DEFAULT_UNUSED_SESSION_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_enabled: false,
            min_retry_interval: DEFAULT_MIN_RETRY_INTERVAL,
            max_retry_interval: DEFAULT_MAX_RETRY_INTERVAL,
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            allowed_insecure_schemes: Vec::new(),
            allow_localhost_request: false,
            allow_invalid_server_certificates: false,
            proxy: None,
            properties: HashMap::new(),
        }
    }
}

impl FetcherServiceConfig {
    /// Parse a configuration from TOML. Missing fields take their default.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidConfig`] for malformed TOML, unknown
    /// fields, or values of the wrong type, such as a negative cap
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Load a configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ErrorKind::ReadConfig(path.to_path_buf(), e))?;
        Self::from_toml(&contents)
    }

    /// The retry bounds fetchers are stamped with
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_enabled,
            self.min_retry_interval,
            self.max_retry_interval,
        )
    }

    /// `request_timeout`, or `None` if it is disabled
    #[must_use]
    pub fn effective_request_timeout(&self) -> Option<Duration> {
        non_zero(self.request_timeout)
    }

    /// `connect_timeout`, or `None` if it is disabled
    #[must_use]
    pub fn effective_connect_timeout(&self) -> Option<Duration> {
        non_zero(self.connect_timeout)
    }
}

const fn non_zero(duration: Duration) -> Option<Duration> {
    if duration.is_zero() {
        None
    } else {
        Some(duration)
    }
}
