//! Helpers for testing code built on a [`FetcherService`].
//!
//! [`RecordingTransport`] is an in-memory [`Transport`] which records the
//! sessions it creates and invalidates. It can hold requests at a gate, which
//! makes it possible to observe fetchers while they are running.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use http::{HeaderValue, StatusCode};
use tokio::sync::Semaphore;

use crate::session::{Session, SessionConfiguration, SessionDelegate, SessionId, Transport};
use crate::utils::lock;
use crate::{Credential, ErrorKind, FetchRequest, FetchResponse, FetcherService, Result};

/// Header carrying the session a [`RecordingTransport`] response came from
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Wait until `service` has no running or delayed fetchers.
///
/// Returns `false` if that did not happen within `timeout`.
pub async fn wait_for_all_fetchers(service: &FetcherService, timeout: Duration) -> bool {
    let drained = async {
        loop {
            let issued = service.issued_fetchers();
            if issued.is_empty() {
                return;
            }
            join_all(issued.iter().map(|fetcher| fetcher.completion())).await;
            // Completed fetchers leave the queue right after signalling
            tokio::task::yield_now().await;
        }
    };
    tokio::time::timeout(timeout, drained).await.is_ok()
}

#[derive(Debug, Default)]
struct Recorded {
    invalidated: Mutex<Vec<SessionId>>,
    executed: Mutex<Vec<(SessionId, FetchRequest)>>,
    in_flight: AtomicUsize,
    gate: Option<Semaphore>,
}

/// In-memory transport answering every request with `200 OK`
#[derive(Debug, Default)]
pub struct RecordingTransport {
    created: Mutex<Vec<(SessionId, SessionConfiguration)>>,
    recorded: Arc<Recorded>,
}

impl RecordingTransport {
    /// A transport answering right away
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport holding every request until [`RecordingTransport::open`]
    /// lets it through
    #[must_use]
    pub fn gated() -> Self {
        Self {
            created: Mutex::default(),
            recorded: Arc::new(Recorded {
                gate: Some(Semaphore::new(0)),
                ..Recorded::default()
            }),
        }
    }

    /// Let `requests` held requests through
    pub fn open(&self, requests: usize) {
        if let Some(gate) = &self.recorded.gate {
            gate.add_permits(requests);
        }
    }

    /// Number of sessions created so far
    #[must_use]
    pub fn created(&self) -> usize {
        lock(&self.created).len()
    }

    /// Configurations of the created sessions, in creation order
    #[must_use]
    pub fn configurations(&self) -> Vec<SessionConfiguration> {
        lock(&self.created)
            .iter()
            .map(|(_, configuration)| configuration.clone())
            .collect()
    }

    /// Sessions invalidated so far, in order
    #[must_use]
    pub fn invalidated(&self) -> Vec<SessionId> {
        lock(&self.recorded.invalidated).clone()
    }

    /// Requests which reached a session, with the session they ran on
    #[must_use]
    pub fn executed(&self) -> Vec<(SessionId, FetchRequest)> {
        lock(&self.recorded.executed).clone()
    }

    /// Requests currently executing, including those held at the gate
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.recorded.in_flight.load(Ordering::SeqCst)
    }
}

impl Transport for RecordingTransport {
    fn create_session(
        &self,
        configuration: &SessionConfiguration,
        delegate: Arc<dyn SessionDelegate>,
    ) -> Result<Arc<dyn Session>> {
        let id = SessionId::next();
        lock(&self.created).push((id, configuration.clone()));
        Ok(Arc::new(MemorySession {
            id,
            valid: AtomicBool::new(true),
            delegate,
            recorded: self.recorded.clone(),
        }))
    }
}

#[derive(Debug)]
struct MemorySession {
    id: SessionId,
    valid: AtomicBool,
    delegate: Arc<dyn SessionDelegate>,
    recorded: Arc<Recorded>,
}

/// Decrements the in-flight counter, also when the request is cancelled
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn invalidate(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            lock(&self.recorded.invalidated).push(self.id);
            self.delegate.session_did_become_invalid(self.id);
        }
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    async fn execute(
        &self,
        request: FetchRequest,
        _credential: Option<&Credential>,
    ) -> Result<FetchResponse> {
        if !self.is_valid() {
            return Err(ErrorKind::SessionInvalidated(self.id));
        }
        lock(&self.recorded.executed).push((self.id, request.clone()));

        self.recorded.in_flight.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight(&self.recorded.in_flight);
        if let Some(gate) = &self.recorded.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| ErrorKind::SessionInvalidated(self.id))?;
            permit.forget();
        }

        let mut response = FetchResponse::new(request.url, StatusCode::OK);
        response.headers.insert(
            SESSION_ID_HEADER,
            HeaderValue::from(self.id.as_u64()),
        );
        Ok(response)
    }
}
