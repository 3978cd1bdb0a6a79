use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use url::{Host, Url};

use crate::session::{SessionConfiguration, SessionConfigurationBlock};
use crate::{Credential, ErrorKind, FetchRequest, Result};

/// Default lower bound between two retries
pub const DEFAULT_MIN_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Default upper bound between two retries
pub const DEFAULT_MAX_RETRY_INTERVAL: Duration = Duration::from_secs(600);

/// Hook which may rewrite a request right before it is dispatched, for
/// example to attach a freshly refreshed bearer token
#[async_trait]
pub trait Authorizer: Send + Sync + Debug {
    /// Authorize `request` in place
    ///
    /// # Errors
    ///
    /// Returning an error fails the fetcher without contacting the transport
    async fn authorize_request(&self, request: &mut FetchRequest) -> Result<()>;
}

/// Retry bounds stamped onto each fetcher.
///
/// The backoff itself belongs to whatever layer performs retries. The
/// service only hands out the configured bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Whether failed requests may be retried
    pub enabled: bool,
    /// Lower bound between two attempts
    pub min_interval: Duration,
    /// Upper bound between two attempts
    pub max_interval: Duration,
}

impl RetryPolicy {
    /// Create a policy. Bounds given in the wrong order are swapped.
    #[must_use]
    pub fn new(enabled: bool, min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            enabled,
            min_interval: min_interval.min(max_interval),
            max_interval: max_interval.max(min_interval),
        }
    }

    /// Clamp `interval` into the configured bounds
    #[must_use]
    pub fn clamp(&self, interval: Duration) -> Duration {
        interval.clamp(self.min_interval, self.max_interval)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(false, DEFAULT_MIN_RETRY_INTERVAL, DEFAULT_MAX_RETRY_INTERVAL)
    }
}

/// Per-fetcher settings, stamped from the service defaults at creation
#[derive(Debug, Clone, Default)]
pub struct FetcherSettings {
    /// Basic auth credential handed to the transport
    pub credential: Option<Credential>,
    /// Proxy every request is routed through
    pub proxy: Option<Url>,
    /// Credential for an authenticating proxy
    pub proxy_credential: Option<Credential>,
    /// Hook run right before dispatch
    pub authorizer: Option<Arc<dyn Authorizer>>,
    /// Retry bounds
    pub retry: RetryPolicy,
    /// Total timeout of a request
    pub request_timeout: Option<Duration>,
    /// Timeout of the connect phase
    pub connect_timeout: Option<Duration>,
    /// Schemes other than `https` which may be fetched
    pub allowed_insecure_schemes: Vec<String>,
    /// Allow plain requests to `localhost` and loopback addresses
    pub allow_localhost_request: bool,
    /// Accept invalid TLS certificates
    pub allow_invalid_server_certificates: bool,
    /// Arbitrary caller properties
    pub properties: HashMap<String, String>,
    /// Run on a private session, outside of the per-host cap
    pub use_isolated_session: bool,
    /// Hook adjusting the session configuration
    pub configuration_block: Option<SessionConfigurationBlock>,
}

impl FetcherSettings {
    /// The session configuration a fetcher with these settings needs, after
    /// the configuration block ran on it
    #[must_use]
    pub fn session_configuration(&self) -> SessionConfiguration {
        let mut configuration = SessionConfiguration {
            timeout: self.request_timeout,
            connect_timeout: self.connect_timeout,
            accept_invalid_certs: self.allow_invalid_server_certificates,
            proxy: self.proxy.clone(),
            proxy_credential: self.proxy_credential.clone(),
            ..SessionConfiguration::default()
        };
        if let Some(block) = &self.configuration_block {
            block.apply(&mut configuration);
        }
        configuration
    }

    /// Check that `url` may be fetched with these settings.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InsecureRequest`] for a non-`https` URL whose
    /// scheme is not allowed, unless it targets localhost and localhost
    /// requests are allowed.
    pub fn check_request_allowed(&self, url: &Url) -> Result<()> {
        let scheme = url.scheme();
        if scheme == "https" {
            return Ok(());
        }
        if self
            .allowed_insecure_schemes
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(scheme))
        {
            return Ok(());
        }
        if self.allow_localhost_request && is_localhost(url) {
            return Ok(());
        }
        warn!("Refusing insecure request to {url}");
        Err(ErrorKind::InsecureRequest(url.clone()))
    }
}

fn is_localhost(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}
