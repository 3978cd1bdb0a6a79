use std::hash::Hash;
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

use crate::session::SessionId;

/// Possible errors when interacting with `fetchpool_lib`
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Network error while executing a request on a transport session
    #[error("Network error while executing request: {0}")]
    NetworkRequest(#[source] reqwest::Error),

    /// The transport could not build a session for the requested configuration
    #[error("Failed to create transport session: {0}")]
    BuildTransport(#[source] reqwest::Error),

    /// The given string can not be parsed into a valid URL
    #[error("Cannot parse {0} as URL: {1}")]
    InvalidUrl(String, #[source] url::ParseError),

    /// An URL without a host was given to the service
    #[error("URL is missing a host")]
    InvalidUrlHost,

    /// The given header could not be parsed.
    /// A possible error when converting a `HeaderValue` from a string or byte
    /// slice.
    #[error("Header could not be parsed.")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    /// A request with an insecure scheme was refused
    #[error("Insecure request to {0} is not allowed, use HTTPS or allow the scheme")]
    InsecureRequest(Url),

    /// The fetcher was stopped before it completed
    #[error("Fetcher was stopped before completion")]
    Stopped,

    /// The fetcher outlived the service which created it
    #[error("The fetcher service was dropped before the fetcher could start")]
    ServiceDropped,

    /// Error injected by a mock service
    #[error("Faked error: {0}")]
    Faked(String),

    /// A request was issued on a session which was already invalidated
    #[error("Session {0} is no longer valid")]
    SessionInvalidated(SessionId),

    /// The service was built outside of a tokio runtime
    #[error("No tokio runtime available, build the service inside a runtime or pass a handle")]
    MissingRuntime,

    /// The authorizer refused to authorize a request
    #[error("Request authorization failed: {0}")]
    Authorization(String),

    /// The service configuration could not be parsed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration file could not be read
    #[error("Failed to read configuration from `{}`: {}", .0.display(), .1)]
    ReadConfig(PathBuf, #[source] std::io::Error),
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::NetworkRequest(e1), Self::NetworkRequest(e2))
            | (Self::BuildTransport(e1), Self::BuildTransport(e2)) => {
                e1.to_string() == e2.to_string()
            }
            (Self::InvalidUrl(s1, e1), Self::InvalidUrl(s2, e2)) => s1 == s2 && e1 == e2,
            (Self::InsecureRequest(u1), Self::InsecureRequest(u2)) => u1 == u2,
            (Self::Faked(m1), Self::Faked(m2))
            | (Self::Authorization(m1), Self::Authorization(m2))
            | (Self::InvalidConfig(m1), Self::InvalidConfig(m2)) => m1 == m2,
            (Self::SessionInvalidated(s1), Self::SessionInvalidated(s2)) => s1 == s2,
            (Self::ReadConfig(p1, e1), Self::ReadConfig(p2, e2)) => {
                p1 == p2 && e1.kind() == e2.kind()
            }
            (Self::InvalidHeader(_), Self::InvalidHeader(_))
            | (Self::InvalidUrlHost, Self::InvalidUrlHost)
            | (Self::Stopped, Self::Stopped)
            | (Self::ServiceDropped, Self::ServiceDropped)
            | (Self::MissingRuntime, Self::MissingRuntime) => true,
            _ => false,
        }
    }
}

impl Eq for ErrorKind {}

impl Hash for ErrorKind {
    fn hash<H>(&self, state: &mut H)
    where
        H: std::hash::Hasher,
    {
        match self {
            Self::NetworkRequest(e) | Self::BuildTransport(e) => e.to_string().hash(state),
            Self::InvalidUrl(s, e) => (s, e.to_string()).hash(state),
            Self::InvalidHeader(e) => e.to_string().hash(state),
            Self::InsecureRequest(u) => u.hash(state),
            Self::Faked(m) | Self::Authorization(m) | Self::InvalidConfig(m) => m.hash(state),
            Self::SessionInvalidated(s) => s.hash(state),
            Self::ReadConfig(p, e) => (p, e.kind()).hash(state),
            Self::InvalidUrlHost | Self::Stopped | Self::ServiceDropped | Self::MissingRuntime => {
                std::mem::discriminant(self).hash(state);
            }
        }
    }
}

impl From<(String, url::ParseError)> for ErrorKind {
    fn from(value: (String, url::ParseError)) -> Self {
        Self::InvalidUrl(value.0, value.1)
    }
}

impl From<toml::de::Error> for ErrorKind {
    fn from(e: toml::de::Error) -> Self {
        Self::InvalidConfig(e.to_string())
    }
}
