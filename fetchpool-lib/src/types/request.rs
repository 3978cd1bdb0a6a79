use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use http::Method;
use url::Url;

use crate::{ErrorKind, Result};

/// An outbound request descriptor handed to the fetcher service
///
/// A fetcher owns one of these. Header decorators and the service-wide
/// defaults are applied to it before it is dispatched to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// HTTP method
    pub method: Method,

    /// Target URL. Its host (and explicit port) selects the admission queue.
    pub url: Url,

    /// Request headers
    pub headers: HeaderMap,

    /// Optional request body
    pub body: Option<Vec<u8>>,

    /// Per-request timeout, overriding the session timeout
    pub timeout: Option<Duration>,
}

impl FetchRequest {
    /// Create a request with the given method and URL and no headers
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Create a `GET` request for the given URL
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Add a header, replacing any existing values of the same name
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the per-request timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The `User-Agent` header of this request, if any
    #[must_use]
    pub fn user_agent(&self) -> Option<&HeaderValue> {
        self.headers.get(USER_AGENT)
    }
}

impl From<Url> for FetchRequest {
    fn from(url: Url) -> Self {
        Self::get(url)
    }
}

impl TryFrom<&str> for FetchRequest {
    type Error = ErrorKind;

    fn try_from(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| ErrorKind::InvalidUrl(url.to_string(), e))?;
        Ok(Self::get(url))
    }
}
