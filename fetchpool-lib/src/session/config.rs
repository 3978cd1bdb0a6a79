use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use url::Url;

use crate::Credential;

/// Settings a transport session is built from.
///
/// Two fetchers can only share a session when their configurations are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfiguration {
    /// Total timeout of a request
    pub timeout: Option<Duration>,

    /// Timeout of the connect phase only
    pub connect_timeout: Option<Duration>,

    /// Accept invalid TLS certificates
    pub accept_invalid_certs: bool,

    /// Route every request of the session through this proxy
    pub proxy: Option<Url>,

    /// Credential sent to `proxy`
    pub proxy_credential: Option<Credential>,

    /// Headers sent with every request of the session, unless the request
    /// sets them itself
    pub default_headers: HeaderMap,

    /// How long idle pooled connections are kept
    pub pool_idle_timeout: Option<Duration>,

    /// Upper bound of idle pooled connections per host
    pub pool_max_idle_per_host: Option<usize>,
}

type ConfigureFn = dyn Fn(&mut SessionConfiguration) + Send + Sync;

/// Caller hook customizing the session configuration of every fetcher
/// before a session is acquired for it
#[derive(Clone)]
pub struct SessionConfigurationBlock(Arc<ConfigureFn>);

impl SessionConfigurationBlock {
    /// Wrap a closure adjusting a configuration in place
    pub fn new<F>(block: F) -> Self
    where
        F: Fn(&mut SessionConfiguration) + Send + Sync + 'static,
    {
        Self(Arc::new(block))
    }

    /// Run the hook on `configuration`
    pub fn apply(&self, configuration: &mut SessionConfiguration) {
        (self.0)(configuration);
    }
}

impl Debug for SessionConfigurationBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionConfigurationBlock")
    }
}
