use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;

use crate::fetcher::Fetcher;
use crate::session::SessionManager;
use crate::{ErrorKind, FetchRequest, FetchResponse, Result};

/// Executes the request of an admitted fetcher
#[async_trait]
pub trait Dispatcher: Send + Sync + Debug {
    /// Execute `request` on behalf of `fetcher`
    async fn dispatch(&self, fetcher: &Fetcher, request: FetchRequest) -> Result<FetchResponse>;
}

/// Dispatches on sessions borrowed from the session manager
#[derive(Debug)]
pub(crate) struct TransportDispatcher {
    sessions: SessionManager,
}

impl TransportDispatcher {
    pub(crate) const fn new(sessions: SessionManager) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Dispatcher for TransportDispatcher {
    async fn dispatch(&self, fetcher: &Fetcher, request: FetchRequest) -> Result<FetchResponse> {
        let settings = fetcher.settings();
        let configuration = settings.session_configuration();
        let lease = if fetcher.uses_isolated_session() {
            self.sessions.acquire_isolated(&configuration)?
        } else {
            self.sessions.acquire(&configuration)?
        };
        let session = lease.session().clone();
        fetcher.attach_session(lease);

        session
            .execute(request, settings.credential.as_ref())
            .await
    }
}

type TestFn = dyn Fn(&FetchRequest) -> Result<FetchResponse> + Send + Sync;

/// Produces the outcome of every request of a service in test mode
#[derive(Clone)]
pub struct TestBlock(Arc<TestFn>);

impl TestBlock {
    /// Wrap a closure inspecting each request and returning its outcome
    pub fn new<F>(block: F) -> Self
    where
        F: Fn(&FetchRequest) -> Result<FetchResponse> + Send + Sync + 'static,
    {
        Self(Arc::new(block))
    }

    /// Answer every request with `data` and a `200 OK`, or fail it with
    /// `error`. The error wins when both are given.
    #[must_use]
    pub fn faked(data: Option<Vec<u8>>, error: Option<String>) -> Self {
        Self::faked_response(data, None, error)
    }

    /// Like [`TestBlock::faked`], answering with a copy of `response` whose
    /// body is replaced by `data` when given
    #[must_use]
    pub fn faked_response(
        data: Option<Vec<u8>>,
        response: Option<FetchResponse>,
        error: Option<String>,
    ) -> Self {
        Self::new(move |request| {
            if let Some(error) = &error {
                return Err(ErrorKind::Faked(error.clone()));
            }
            let mut response = response
                .clone()
                .unwrap_or_else(|| FetchResponse::new(request.url.clone(), StatusCode::OK));
            if let Some(data) = &data {
                response.body.clone_from(data);
            }
            Ok(response)
        })
    }

    pub(crate) fn call(&self, request: &FetchRequest) -> Result<FetchResponse> {
        (self.0)(request)
    }
}

impl Debug for TestBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TestBlock")
    }
}

/// Never touches the transport. Still runs asynchronously, like a real
/// request would.
#[derive(Debug)]
pub(crate) struct FakeDispatcher {
    block: TestBlock,
}

impl FakeDispatcher {
    pub(crate) const fn new(block: TestBlock) -> Self {
        Self { block }
    }
}

#[async_trait]
impl Dispatcher for FakeDispatcher {
    async fn dispatch(&self, _: &Fetcher, request: FetchRequest) -> Result<FetchResponse> {
        tokio::task::yield_now().await;
        self.block.call(&request)
    }
}
