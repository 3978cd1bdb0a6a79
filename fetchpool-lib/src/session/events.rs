use crate::ServiceId;
use crate::session::SessionId;

/// Broadcast when a reused session of a service becomes invalid.
///
/// Mainly useful to observe idle teardown and resets in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInvalidated {
    /// The service which owned the session
    pub service: ServiceId,
    /// The invalidated session
    pub session: SessionId,
}
