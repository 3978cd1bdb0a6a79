//! The fetcher service facade.
//!
//! A [`FetcherService`] creates fetchers stamped with its defaults, admits
//! them through a per-host [`HostQueue`], and runs them on sessions borrowed
//! from its [`SessionManager`].

mod builder;
mod config;
mod dispatch;

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use http::HeaderValue;
use http::header::USER_AGENT;
use log::debug;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::time::Instant;
use url::Url;

pub use builder::FetcherServiceBuilder;
pub use config::{DEFAULT_USER_AGENT, FetcherServiceConfig};
pub use dispatch::{Dispatcher, TestBlock};

use crate::decorator::{DecoratorChain, DecoratorPhase, HeaderDecorator};
use crate::fetcher::{Authorizer, Fetcher, FetcherFactory, FetcherParts, FetcherSettings};
use crate::queue::{FetcherCounts, HostKey, HostQueue};
use crate::session::{SessionConfigurationBlock, SessionInvalidated, SessionManager};
use crate::utils::{read, write};
use crate::{Credential, FetchRequest, FetchResponse, Result};
use dispatch::{FakeDispatcher, TransportDispatcher};

static NEXT_SERVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a fetcher service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(u64);

impl ServiceId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SERVICE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service-{}", self.0)
    }
}

#[derive(Debug)]
struct ServiceDefaults {
    config: FetcherServiceConfig,
    credential: Option<Credential>,
    proxy_credential: Option<Credential>,
    authorizer: Option<Arc<dyn Authorizer>>,
    configuration_block: Option<SessionConfigurationBlock>,
    user_agent: Option<HeaderValue>,
}

impl ServiceDefaults {
    fn fetcher_settings(&self) -> FetcherSettings {
        let config = &self.config;
        FetcherSettings {
            credential: self.credential.clone(),
            proxy: config.proxy.clone(),
            proxy_credential: self.proxy_credential.clone(),
            authorizer: self.authorizer.clone(),
            retry: config.retry_policy(),
            request_timeout: config.effective_request_timeout(),
            connect_timeout: config.effective_connect_timeout(),
            allowed_insecure_schemes: config.allowed_insecure_schemes.clone(),
            allow_localhost_request: config.allow_localhost_request,
            allow_invalid_server_certificates: config.allow_invalid_server_certificates,
            properties: config.properties.clone(),
            use_isolated_session: false,
            configuration_block: self.configuration_block.clone(),
        }
    }
}

/// State shared by a service and, weakly, by its fetchers
#[derive(Debug)]
pub(crate) struct ServiceInner {
    id: ServiceId,
    pub(crate) queue: HostQueue<Fetcher>,
    sessions: SessionManager,
    decorators: DecoratorChain,
    defaults: RwLock<ServiceDefaults>,
    dispatcher: RwLock<Arc<dyn Dispatcher>>,
    factory: Arc<dyn FetcherFactory>,
    pub(crate) runtime: Handle,
}

impl ServiceInner {
    pub(crate) fn dispatcher(&self) -> Arc<dyn Dispatcher> {
        read(&self.dispatcher).clone()
    }

    /// `fetcher` finished or was stopped. Its slot goes to the next delayed
    /// fetcher of the same host.
    pub(crate) fn fetcher_did_stop(self: &Arc<Self>, fetcher: &Fetcher) {
        let promoted = self.queue.complete(fetcher);
        self.start_promoted(promoted);
    }

    fn start_promoted(self: &Arc<Self>, promoted: Vec<Fetcher>) {
        for fetcher in promoted {
            debug!("Starting delayed {} for {}", fetcher.id(), fetcher.host());
            fetcher.begin_dispatch(self);
        }
    }
}

/// Creates fetchers and coordinates their admission and sessions.
///
/// Cloning the service is cheap, clones share all state. Fetchers only hold
/// a weak reference, so dropping every clone of the service makes fetchers
/// which were not started yet fail with
/// [`crate::ErrorKind::ServiceDropped`].
#[derive(Debug, Clone)]
pub struct FetcherService {
    inner: Arc<ServiceInner>,
}

impl FetcherService {
    /// Create a service with default settings on the current runtime
    ///
    /// # Errors
    ///
    /// Returns [`crate::ErrorKind::MissingRuntime`] outside of a tokio runtime
    pub fn new() -> Result<Self> {
        FetcherServiceBuilder::default().service()
    }

    /// Create a service in test mode whose fetchers complete with
    /// `faked_data`, or fail with `faked_error` when given.
    ///
    /// Fetchers still go through admission and header decoration.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ErrorKind::MissingRuntime`] outside of a tokio runtime
    pub fn mock(faked_data: Option<Vec<u8>>, faked_error: Option<String>) -> Result<Self> {
        FetcherServiceBuilder::builder()
            .test_block(TestBlock::faked(faked_data, faked_error))
            .build()
            .service()
    }

    /// Like [`FetcherService::mock`], completing with a copy of `response`
    ///
    /// # Errors
    ///
    /// Returns [`crate::ErrorKind::MissingRuntime`] outside of a tokio runtime
    pub fn mock_with_response(
        faked_data: Option<Vec<u8>>,
        response: Option<FetchResponse>,
        faked_error: Option<String>,
    ) -> Result<Self> {
        FetcherServiceBuilder::builder()
            .test_block(TestBlock::faked_response(faked_data, response, faked_error))
            .build()
            .service()
    }

    /// Identity of this service
    #[must_use]
    pub fn id(&self) -> ServiceId {
        self.inner.id
    }

    fn defaults(&self) -> RwLockReadGuard<'_, ServiceDefaults> {
        read(&self.inner.defaults)
    }

    fn defaults_mut(&self) -> RwLockWriteGuard<'_, ServiceDefaults> {
        write(&self.inner.defaults)
    }

    /// Create a fetcher for `request`.
    ///
    /// The fetcher is stamped with the service defaults and the creation
    /// phase headers of the registered decorators. Nothing is sent until
    /// [`Fetcher::start`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ErrorKind::InvalidUrlHost`] if the URL has no host
    pub fn fetcher_with_request(&self, mut request: FetchRequest) -> Result<Fetcher> {
        let host = HostKey::try_from(&request.url)?;
        let (settings, user_agent) = {
            let defaults = self.defaults();
            (defaults.fetcher_settings(), defaults.user_agent.clone())
        };
        if let Some(user_agent) = user_agent
            && !request.headers.contains_key(USER_AGENT)
        {
            request.headers.insert(USER_AGENT, user_agent);
        }

        let parts = FetcherParts {
            request,
            settings,
            host,
            decorators: self.inner.decorators.snapshot(),
            service: Arc::downgrade(&self.inner),
        };
        let fetcher = self.inner.factory.create_fetcher(parts);
        fetcher.apply_header_decorators(DecoratorPhase::Creation);
        Ok(fetcher)
    }

    /// Create a fetcher for a `GET` of `url`
    ///
    /// # Errors
    ///
    /// Returns [`crate::ErrorKind::InvalidUrlHost`] if the URL has no host
    pub fn fetcher_with_url(&self, url: Url) -> Result<Fetcher> {
        self.fetcher_with_request(FetchRequest::get(url))
    }

    /// Create a fetcher for a `GET` of the parsed `url`
    ///
    /// # Errors
    ///
    /// Returns an error if `url` cannot be parsed or has no host
    pub fn fetcher_with_url_string(&self, url: &str) -> Result<Fetcher> {
        self.fetcher_with_request(FetchRequest::try_from(url)?)
    }

    /// Whether `fetcher` waits for a free slot on its host
    #[must_use]
    pub fn is_delaying_fetcher(&self, fetcher: &Fetcher) -> bool {
        self.inner.queue.is_delaying(fetcher)
    }

    /// Running and delayed fetchers across all hosts
    #[must_use]
    pub fn fetcher_counts(&self) -> FetcherCounts {
        self.inner.queue.counts()
    }

    /// Running and delayed fetchers of one host
    #[must_use]
    pub fn fetcher_counts_for_host(&self, host: &HostKey) -> FetcherCounts {
        self.inner.queue.counts_for(host)
    }

    /// Number of started fetchers which did not complete yet
    #[must_use]
    pub fn number_of_fetchers(&self) -> usize {
        self.fetcher_counts().total()
    }

    /// Number of fetchers dispatched to a session
    #[must_use]
    pub fn number_of_running_fetchers(&self) -> usize {
        self.fetcher_counts().running
    }

    /// Number of fetchers waiting for a free slot
    #[must_use]
    pub fn number_of_delayed_fetchers(&self) -> usize {
        self.fetcher_counts().delayed
    }

    /// Every running and delayed fetcher
    #[must_use]
    pub fn issued_fetchers(&self) -> Vec<Fetcher> {
        self.inner.queue.issued()
    }

    /// Running and delayed fetchers whose request URL equals `url`
    #[must_use]
    pub fn issued_fetchers_with_request_url(&self, url: &Url) -> Vec<Fetcher> {
        self.issued_fetchers()
            .into_iter()
            .filter(|fetcher| fetcher.url() == *url)
            .collect()
    }

    /// Running fetchers keyed by host
    #[must_use]
    pub fn running_fetchers_by_host(&self) -> HashMap<HostKey, Vec<Fetcher>> {
        self.inner.queue.running_by_host()
    }

    /// Delayed fetchers keyed by host, in the order they will start
    #[must_use]
    pub fn delayed_fetchers_by_host(&self) -> HashMap<HostKey, Vec<Fetcher>> {
        self.inner.queue.delayed_by_host()
    }

    /// Stop every running and delayed fetcher.
    ///
    /// Completions of work which began before the sweep are discarded. Calling
    /// this again with nothing issued has no effect besides moving the marker.
    pub fn stop_all_fetchers(&self) {
        let drained = self.inner.queue.stop_all();
        debug!("Stopping {} fetchers of {}", drained.len(), self.inner.id);
        for fetcher in drained {
            fetcher.terminate();
        }
    }

    /// When [`FetcherService::stop_all_fetchers`] last ran
    #[must_use]
    pub fn stopped_all_fetchers_at(&self) -> Option<Instant> {
        self.inner.queue.stopped_all_at()
    }

    /// Invalidate the shared session. Running fetchers finish on it, new
    /// fetchers get a fresh one.
    pub fn reset_session(&self) {
        self.inner.sessions.reset();
    }

    /// Observe invalidation of the shared session
    #[must_use]
    pub fn subscribe_session_events(&self) -> broadcast::Receiver<SessionInvalidated> {
        self.inner.sessions.subscribe()
    }

    /// The session manager of this service
    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    /// Current per-host cap. `0` means unlimited.
    #[must_use]
    pub fn max_running_fetchers_per_host(&self) -> usize {
        self.inner.queue.max_running_per_host()
    }

    /// Change the per-host cap. A higher cap starts delayed fetchers right
    /// away, a lower one never stops running fetchers.
    pub fn set_max_running_fetchers_per_host(&self, max_running: usize) {
        self.defaults_mut().config.max_running_fetchers_per_host = max_running;
        let promoted = self.inner.queue.set_max_running_per_host(max_running);
        self.inner.start_promoted(promoted);
    }

    /// Whether fetchers share one session
    #[must_use]
    pub fn reuse_session(&self) -> bool {
        self.inner.sessions.reuse_session()
    }

    /// Enable or disable session sharing. Disabling resets the shared
    /// session.
    pub fn set_reuse_session(&self, reuse: bool) {
        self.defaults_mut().config.reuse_session = reuse;
        self.inner.sessions.set_reuse_session(reuse);
    }

    /// Idle time after which the shared session is invalidated
    #[must_use]
    pub fn unused_session_timeout(&self) -> Duration {
        self.inner.sessions.unused_session_timeout()
    }

    /// Change the idle timeout. `Duration::ZERO` keeps the session until
    /// [`FetcherService::reset_session`].
    pub fn set_unused_session_timeout(&self, timeout: Duration) {
        self.defaults_mut().config.unused_session_timeout = timeout;
        self.inner.sessions.set_unused_session_timeout(timeout);
    }

    /// A snapshot of the current defaults
    #[must_use]
    pub fn config(&self) -> FetcherServiceConfig {
        self.defaults().config.clone()
    }

    /// Credential stamped onto new fetchers
    #[must_use]
    pub fn credential(&self) -> Option<Credential> {
        self.defaults().credential.clone()
    }

    /// Set the credential stamped onto new fetchers
    pub fn set_credential(&self, credential: Option<Credential>) {
        self.defaults_mut().credential = credential;
    }

    /// Proxy credential stamped onto new fetchers
    #[must_use]
    pub fn proxy_credential(&self) -> Option<Credential> {
        self.defaults().proxy_credential.clone()
    }

    /// Set the proxy credential stamped onto new fetchers
    pub fn set_proxy_credential(&self, credential: Option<Credential>) {
        self.defaults_mut().proxy_credential = credential;
    }

    /// Proxy new fetchers are routed through
    pub fn set_proxy(&self, proxy: Option<Url>) {
        self.defaults_mut().config.proxy = proxy;
    }

    /// Hook adjusting the session configuration of new fetchers
    #[must_use]
    pub fn session_configuration_block(&self) -> Option<SessionConfigurationBlock> {
        self.defaults().configuration_block.clone()
    }

    /// Set the hook adjusting the session configuration of new fetchers
    pub fn set_session_configuration_block(&self, block: Option<SessionConfigurationBlock>) {
        self.defaults_mut().configuration_block = block;
    }

    /// Authorizer stamped onto new fetchers
    #[must_use]
    pub fn authorizer(&self) -> Option<Arc<dyn Authorizer>> {
        self.defaults().authorizer.clone()
    }

    /// Set the authorizer stamped onto new fetchers
    pub fn set_authorizer(&self, authorizer: Option<Arc<dyn Authorizer>>) {
        self.defaults_mut().authorizer = authorizer;
    }

    /// User agent of requests which don't set one
    #[must_use]
    pub fn user_agent(&self) -> Option<String> {
        self.defaults().config.user_agent.clone()
    }

    /// Set the user agent of requests which don't set one
    ///
    /// # Errors
    ///
    /// Returns [`crate::ErrorKind::InvalidHeader`] if `user_agent` is not a
    /// valid header value
    pub fn set_user_agent(&self, user_agent: Option<&str>) -> Result<()> {
        let value = user_agent.map(HeaderValue::from_str).transpose()?;
        let mut defaults = self.defaults_mut();
        defaults.user_agent = value;
        defaults.config.user_agent = user_agent.map(ToString::to_string);
        Ok(())
    }

    /// Allow or forbid retries of new fetchers
    pub fn set_retry_enabled(&self, enabled: bool) {
        self.defaults_mut().config.retry_enabled = enabled;
    }

    /// Bounds between two retries of new fetchers
    pub fn set_retry_intervals(&self, min_interval: Duration, max_interval: Duration) {
        let mut defaults = self.defaults_mut();
        defaults.config.min_retry_interval = min_interval;
        defaults.config.max_retry_interval = max_interval;
    }

    /// Total request timeout of new fetchers. `Duration::ZERO` disables it.
    pub fn set_request_timeout(&self, timeout: Duration) {
        self.defaults_mut().config.request_timeout = timeout;
    }

    /// Connect timeout of new fetchers. `Duration::ZERO` disables it.
    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.defaults_mut().config.connect_timeout = timeout;
    }

    /// Schemes other than `https` new fetchers may use
    pub fn set_allowed_insecure_schemes(&self, schemes: Vec<String>) {
        self.defaults_mut().config.allowed_insecure_schemes = schemes;
    }

    /// Allow plain requests to localhost for new fetchers
    pub fn set_allow_localhost_request(&self, allow: bool) {
        self.defaults_mut().config.allow_localhost_request = allow;
    }

    /// Accept invalid TLS certificates for new fetchers
    pub fn set_allow_invalid_server_certificates(&self, allow: bool) {
        self.defaults_mut().config.allow_invalid_server_certificates = allow;
    }

    /// Replace the properties copied onto new fetchers
    pub fn set_properties(&self, properties: HashMap<String, String>) {
        self.defaults_mut().config.properties = properties;
    }

    /// Set one property copied onto new fetchers
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        self.defaults_mut()
            .config
            .properties
            .insert(key.into(), value.into());
    }

    /// Put the service in test mode, or back to the transport with `None`.
    /// Only affects fetchers dispatched afterwards.
    pub fn set_test_block(&self, block: Option<TestBlock>) {
        let dispatcher: Arc<dyn Dispatcher> = match block {
            Some(block) => Arc::new(FakeDispatcher::new(block)),
            None => Arc::new(TransportDispatcher::new(self.inner.sessions.clone())),
        };
        *write(&self.inner.dispatcher) = dispatcher;
    }

    /// Register a decorator for fetchers created from now on. The service
    /// only keeps a weak reference.
    pub fn add_header_decorator(&self, decorator: &Arc<dyn HeaderDecorator>) {
        self.inner.decorators.register(decorator);
    }

    /// Remove a decorator, returning whether it was registered
    pub fn remove_header_decorator(&self, decorator: &Arc<dyn HeaderDecorator>) -> bool {
        self.inner.decorators.unregister(decorator)
    }

    /// Number of live decorators
    #[must_use]
    pub fn header_decorator_count(&self) -> usize {
        self.inner.decorators.len()
    }
}
