use std::fmt::{self, Debug, Display};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use super::SessionConfiguration;
use crate::{Credential, FetchRequest, FetchResponse, Result};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate a fresh identity. Transports call this once per session.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw identity
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Receives session-level events from a transport
pub trait SessionDelegate: Send + Sync + Debug {
    /// `session` was invalidated and will not accept new work
    fn session_did_become_invalid(&self, session: SessionId);
}

/// A pooled transport resource, such as an HTTP client with its connection pool.
///
/// Invalidating a session only affects new work. Requests which are already
/// executing on it are allowed to complete.
#[async_trait]
pub trait Session: Send + Sync + Debug {
    /// Identity of the session
    fn id(&self) -> SessionId;

    /// Stop accepting new work and notify the delegate
    fn invalidate(&self);

    /// Whether [`Session::invalidate`] has not been called yet
    fn is_valid(&self) -> bool;

    /// Execute `request`, authenticating with `credential` if given
    async fn execute(
        &self,
        request: FetchRequest,
        credential: Option<&Credential>,
    ) -> Result<FetchResponse>;
}

/// Creates sessions for the session manager
pub trait Transport: Send + Sync + Debug {
    /// Build a new session for `configuration`, reporting its events to
    /// `delegate`
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying client cannot be built
    fn create_session(
        &self,
        configuration: &SessionConfiguration,
        delegate: Arc<dyn SessionDelegate>,
    ) -> Result<Arc<dyn Session>>;
}
