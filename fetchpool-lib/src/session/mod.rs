//! Transport sessions and their lifecycle.
//!
//! The [`SessionManager`] pools a single reusable [`Session`] per service and
//! tears it down after it has been unused for a while. Sessions themselves
//! come from a [`Transport`]; [`ReqwestTransport`] is the default one.

mod config;
mod events;
mod manager;
mod reqwest_transport;
mod transport;

pub use config::{SessionConfiguration, SessionConfigurationBlock};
pub use events::SessionInvalidated;
pub use manager::{DEFAULT_UNUSED_SESSION_TIMEOUT, SessionLease, SessionManager};
pub use reqwest_transport::{ReqwestSession, ReqwestTransport};
pub use transport::{Session, SessionDelegate, SessionId, Transport};
