use std::borrow::Cow;
use std::sync::Arc;

use http::{HeaderMap, StatusCode};
use url::Url;

use crate::ErrorKind;

/// Outcome delivered to everyone waiting on a fetcher.
///
/// The error is shared so that every waiter can receive its own copy.
pub type FetchResult = std::result::Result<FetchResponse, Arc<ErrorKind>>;

/// A fully buffered HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// Final URL of the response
    pub url: Url,
    /// Response status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Vec<u8>,
}

impl FetchResponse {
    /// Create an empty response with the given status
    #[must_use]
    pub fn new(url: Url, status: StatusCode) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Replace the body of the response
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Whether the status is in the `2xx` range
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The body decoded as UTF-8, replacing invalid sequences
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}
