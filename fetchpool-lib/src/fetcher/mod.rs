//! Fetchers, the units of work scheduled by the service.
//!
//! A [`Fetcher`] is a cheap handle. Clones share the same request, settings
//! and completion signal. Nothing touches the network until
//! [`Fetcher::start`] is called, which submits the fetcher to the admission
//! queue of its host.

mod factory;
mod settings;

use std::fmt::{self, Debug, Display};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use http::HeaderMap;
use log::debug;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use url::Url;

pub use factory::{DefaultFetcherFactory, FetcherFactory, FetcherParts};
pub use settings::{
    Authorizer, DEFAULT_MAX_RETRY_INTERVAL, DEFAULT_MIN_RETRY_INTERVAL, FetcherSettings,
    RetryPolicy,
};

use crate::decorator::{DecoratorChain, DecoratorPhase, HeaderDecorator, merge_headers};
use crate::queue::{Admission, HostKey, QueuedUnit};
use crate::service::{Dispatcher, ServiceInner};
use crate::session::{SessionId, SessionLease};
use crate::utils::lock;
use crate::{ErrorKind, FetchRequest, FetchResponse, FetchResult, Result};

static NEXT_FETCHER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a fetcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetcherId(u64);

impl FetcherId {
    fn next() -> Self {
        Self(NEXT_FETCHER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw identity
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for FetcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fetcher-{}", self.0)
    }
}

/// Where a fetcher is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetcherPhase {
    /// Created but not started
    Created,
    /// Started and waiting for a free slot on its host
    Delayed,
    /// Dispatched to a session
    Running,
    /// Completed on its own, successfully or not
    Finished,
    /// Stopped by the caller or by a stop-all sweep
    Stopped,
}

impl FetcherPhase {
    /// Whether the fetcher will not change phase anymore
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Stopped)
    }
}

#[derive(Debug)]
struct State {
    phase: FetcherPhase,
    began_at: Option<Instant>,
    finished_at: Option<Instant>,
    session: Option<SessionLease>,
    task: Option<AbortHandle>,
}

struct Inner {
    id: FetcherId,
    host: HostKey,
    isolated: AtomicBool,
    request: Mutex<FetchRequest>,
    settings: Mutex<FetcherSettings>,
    decorators: DecoratorChain,
    service: Weak<ServiceInner>,
    state: Mutex<State>,
    completion: watch::Sender<Option<FetchResult>>,
}

/// A single request scheduled through a [`crate::FetcherService`]
#[derive(Clone)]
pub struct Fetcher {
    inner: Arc<Inner>,
}

impl Debug for Fetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetcher")
            .field("id", &self.inner.id)
            .field("host", &self.inner.host)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Fetcher {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Fetcher {}

impl QueuedUnit for Fetcher {
    type Id = FetcherId;

    fn id(&self) -> FetcherId {
        self.inner.id
    }

    fn host(&self) -> &HostKey {
        &self.inner.host
    }

    fn uses_isolated_session(&self) -> bool {
        self.inner.isolated.load(Ordering::Acquire)
    }
}

impl Fetcher {
    /// Build a fetcher from the parts prepared by the service
    #[must_use]
    pub fn from_parts(parts: FetcherParts) -> Self {
        let FetcherParts {
            request,
            settings,
            host,
            decorators,
            service,
        } = parts;
        let (completion, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                id: FetcherId::next(),
                host,
                isolated: AtomicBool::new(settings.use_isolated_session),
                request: Mutex::new(request),
                settings: Mutex::new(settings),
                decorators,
                service,
                state: Mutex::new(State {
                    phase: FetcherPhase::Created,
                    began_at: None,
                    finished_at: None,
                    session: None,
                    task: None,
                }),
                completion,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.inner.state)
    }

    /// Identity of this fetcher
    #[must_use]
    pub fn id(&self) -> FetcherId {
        self.inner.id
    }

    /// The admission queue this fetcher belongs to
    #[must_use]
    pub fn host(&self) -> &HostKey {
        &self.inner.host
    }

    /// A copy of the current request
    #[must_use]
    pub fn request(&self) -> FetchRequest {
        lock(&self.inner.request).clone()
    }

    /// URL of the current request
    #[must_use]
    pub fn url(&self) -> Url {
        lock(&self.inner.request).url.clone()
    }

    /// Modify the request in place.
    ///
    /// The host of a fetcher is fixed at creation, so changing the URL to
    /// another host does not move the fetcher to another queue.
    pub fn with_request_mut<R>(&self, f: impl FnOnce(&mut FetchRequest) -> R) -> R {
        f(&mut lock(&self.inner.request))
    }

    /// A copy of the current settings
    #[must_use]
    pub fn settings(&self) -> FetcherSettings {
        lock(&self.inner.settings).clone()
    }

    /// Modify the settings in place. Changes made after the fetcher was
    /// dispatched only affect later dispatches.
    pub fn with_settings_mut<R>(&self, f: impl FnOnce(&mut FetcherSettings) -> R) -> R {
        let mut settings = lock(&self.inner.settings);
        let isolated = settings.use_isolated_session;
        let result = f(&mut settings);
        if settings.use_isolated_session != isolated {
            settings.use_isolated_session = isolated;
            drop(settings);
            self.set_use_isolated_session(!isolated);
        }
        result
    }

    /// Whether this fetcher runs on a private session
    #[must_use]
    pub fn uses_isolated_session(&self) -> bool {
        QueuedUnit::uses_isolated_session(self)
    }

    /// Run this fetcher on a private session, outside of the per-host cap.
    ///
    /// Has no effect once the fetcher was started. Returns whether the
    /// setting was applied.
    pub fn set_use_isolated_session(&self, isolated: bool) -> bool {
        let state = self.state();
        if state.phase != FetcherPhase::Created {
            return false;
        }
        self.inner.isolated.store(isolated, Ordering::Release);
        lock(&self.inner.settings).use_isolated_session = isolated;
        drop(state);
        true
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> FetcherPhase {
        self.state().phase
    }

    /// When [`Fetcher::start`] was called
    #[must_use]
    pub fn began_at(&self) -> Option<Instant> {
        self.state().began_at
    }

    /// When the fetcher finished or was stopped
    #[must_use]
    pub fn finished_at(&self) -> Option<Instant> {
        self.state().finished_at
    }

    /// The session the fetcher is running on, if any
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.state().session.as_ref().map(SessionLease::id)
    }

    /// Register a decorator for this fetcher only. It runs after the
    /// decorators the service had when the fetcher was created.
    pub fn add_header_decorator(&self, decorator: &Arc<dyn HeaderDecorator>) {
        self.inner.decorators.register(decorator);
    }

    /// Remove a decorator, returning whether it was registered
    pub fn remove_header_decorator(&self, decorator: &Arc<dyn HeaderDecorator>) -> bool {
        self.inner.decorators.unregister(decorator)
    }

    /// Ask the decorators for headers at `phase` and merge them into the
    /// request. Redirect and retry layers call this before re-issuing.
    pub fn apply_header_decorators(&self, phase: DecoratorPhase) {
        let request = self.request();
        let headers: HeaderMap = self.inner.decorators.headers_for(&request, phase);
        if headers.is_empty() {
            return;
        }
        merge_headers(&mut lock(&self.inner.request).headers, &headers);
    }

    /// Submit the fetcher to the admission queue of its host.
    ///
    /// It is dispatched right away if the host has a free slot and delayed
    /// otherwise. Starting a fetcher twice has no effect.
    pub fn start(&self) {
        {
            let mut state = self.state();
            if state.phase != FetcherPhase::Created {
                return;
            }
            state.phase = FetcherPhase::Delayed;
            state.began_at = Some(Instant::now());
        }

        let Some(service) = self.inner.service.upgrade() else {
            self.finish(Err(Arc::new(ErrorKind::ServiceDropped)));
            return;
        };

        match service.queue.submit(self.clone()) {
            Admission::StartNow => self.begin_dispatch(&service),
            Admission::Hold => {
                debug!("Delaying {} for {}", self.inner.id, self.inner.host);
                // Stopped while being submitted
                if self.phase() == FetcherPhase::Stopped {
                    service.fetcher_did_stop(self);
                }
            }
        }
    }

    /// Spawn the dispatch task. Called once the queue admitted the fetcher.
    pub(crate) fn begin_dispatch(&self, service: &Arc<ServiceInner>) {
        let mut state = self.state();
        if state.phase.is_terminal() {
            drop(state);
            service.fetcher_did_stop(self);
            return;
        }
        state.phase = FetcherPhase::Running;

        let fetcher = self.clone();
        let dispatcher = service.dispatcher();
        let task = service.runtime.spawn(async move {
            let result = fetcher.run(dispatcher).await;
            fetcher.finish(result.map_err(Arc::new));
        });
        state.task = Some(task.abort_handle());
    }

    async fn run(&self, dispatcher: Arc<dyn Dispatcher>) -> Result<FetchResponse> {
        let settings = self.settings();
        let mut request = self.request();
        settings.check_request_allowed(&request.url)?;
        if let Some(authorizer) = &settings.authorizer {
            authorizer.authorize_request(&mut request).await?;
        }
        dispatcher.dispatch(self, request).await
    }

    /// Keep `lease` alive until the fetcher completes
    pub(crate) fn attach_session(&self, lease: SessionLease) {
        let mut state = self.state();
        if state.phase == FetcherPhase::Running {
            state.session = Some(lease);
        }
    }

    /// Record the outcome of the dispatch task and hand the slot back
    fn finish(&self, result: FetchResult) {
        let service = self.inner.service.upgrade();
        let stopped_all_at = service
            .as_ref()
            .and_then(|service| service.queue.stopped_all_at());

        let mut state = self.state();
        if state.phase.is_terminal() {
            return;
        }
        // Work which began before a stop-all sweep is discarded
        let swept = matches!(
            (state.began_at, stopped_all_at),
            (Some(began), Some(stopped)) if began < stopped
        );
        state.phase = if swept {
            FetcherPhase::Stopped
        } else {
            FetcherPhase::Finished
        };
        state.finished_at = Some(Instant::now());
        state.task = None;
        let lease = state.session.take();
        drop(state);
        drop(lease);

        let result = if swept {
            debug!("Discarding completion of {} after stop-all", self.inner.id);
            Err(Arc::new(ErrorKind::Stopped))
        } else {
            result
        };
        self.inner.completion.send_replace(Some(result));

        if let Some(service) = service {
            service.fetcher_did_stop(self);
        }
    }

    /// Stop the fetcher.
    ///
    /// A running fetcher is cancelled, a delayed one leaves its queue without
    /// contacting the transport. Waiters receive [`ErrorKind::Stopped`].
    pub fn stop(&self) {
        self.halt(true);
    }

    /// Stop a fetcher the queue already dropped
    pub(crate) fn terminate(&self) {
        self.halt(false);
    }

    fn halt(&self, notify_queue: bool) {
        let mut state = self.state();
        if state.phase.is_terminal() {
            return;
        }
        let started = state.phase != FetcherPhase::Created;
        state.phase = FetcherPhase::Stopped;
        state.finished_at = Some(Instant::now());
        let task = state.task.take();
        let lease = state.session.take();
        drop(state);

        if let Some(task) = task {
            task.abort();
        }
        drop(lease);
        debug!("Stopped {}", self.inner.id);
        self.inner
            .completion
            .send_replace(Some(Err(Arc::new(ErrorKind::Stopped))));

        if notify_queue
            && started
            && let Some(service) = self.inner.service.upgrade()
        {
            service.fetcher_did_stop(self);
        }
    }

    /// Wait for the fetcher to finish or be stopped
    pub async fn completion(&self) -> FetchResult {
        let mut receiver = self.inner.completion.subscribe();
        let outcome = receiver
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|result| (*result).clone());
        outcome.unwrap_or_else(|| Err(Arc::new(ErrorKind::Stopped)))
    }

    /// The outcome, if the fetcher already completed
    #[must_use]
    pub fn result(&self) -> Option<FetchResult> {
        (*self.inner.completion.borrow()).clone()
    }

    /// Whether the fetcher finished or was stopped
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.phase().is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderName, HeaderValue};
    use pretty_assertions::assert_eq;

    #[derive(Debug)]
    struct Tag(&'static str);

    impl HeaderDecorator for Tag {
        fn additional_headers(&self, _: &FetchRequest, _: DecoratorPhase) -> Option<HeaderMap> {
            let mut headers = HeaderMap::new();
            headers.insert(
                HeaderName::from_static("x-tag"),
                HeaderValue::from_static(self.0),
            );
            Some(headers)
        }
    }

    fn detached(url: &str) -> Fetcher {
        let request = FetchRequest::try_from(url).unwrap();
        Fetcher::from_parts(FetcherParts {
            host: HostKey::try_from(&request.url).unwrap(),
            request,
            settings: FetcherSettings::default(),
            decorators: DecoratorChain::new(),
            service: Weak::new(),
        })
    }

    #[test]
    fn test_new_fetcher_is_created() {
        let fetcher = detached("https://Example.com/a");
        assert_eq!(fetcher.phase(), FetcherPhase::Created);
        assert_eq!(fetcher.host().as_str(), "example.com");
        assert!(fetcher.began_at().is_none());
        assert!(fetcher.result().is_none());
        assert_eq!(fetcher.clone(), fetcher);
    }

    #[tokio::test]
    async fn test_start_without_service() {
        let fetcher = detached("https://example.com");
        fetcher.start();
        assert_eq!(fetcher.phase(), FetcherPhase::Finished);
        let err = fetcher.completion().await.unwrap_err();
        assert_eq!(*err, ErrorKind::ServiceDropped);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let fetcher = detached("https://example.com");
        fetcher.stop();
        fetcher.start();
        assert_eq!(fetcher.phase(), FetcherPhase::Stopped);
        assert_eq!(*fetcher.completion().await.unwrap_err(), ErrorKind::Stopped);
    }

    #[test]
    fn test_local_decorator_applied() {
        let fetcher = detached("https://example.com");
        let decorator: Arc<dyn HeaderDecorator> = Arc::new(Tag("local"));
        fetcher.add_header_decorator(&decorator);
        fetcher.apply_header_decorators(DecoratorPhase::Redirect);
        assert_eq!(
            fetcher.request().headers.get("x-tag"),
            Some(&HeaderValue::from_static("local"))
        );

        assert!(fetcher.remove_header_decorator(&decorator));
        assert!(!fetcher.remove_header_decorator(&decorator));
    }

    #[test]
    fn test_isolated_session_only_before_start() {
        let fetcher = detached("https://example.com");
        assert!(fetcher.set_use_isolated_session(true));
        assert!(fetcher.uses_isolated_session());
        assert!(fetcher.settings().use_isolated_session);

        fetcher.with_settings_mut(|settings| settings.use_isolated_session = false);
        assert!(!fetcher.uses_isolated_session());

        fetcher.stop();
        assert!(!fetcher.set_use_isolated_session(true));
        assert!(!fetcher.uses_isolated_session());
    }
}
