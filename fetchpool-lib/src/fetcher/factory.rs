use std::fmt::Debug;
use std::sync::Weak;

use super::{Fetcher, FetcherSettings};
use crate::decorator::DecoratorChain;
use crate::queue::HostKey;
use crate::service::ServiceInner;
use crate::FetchRequest;

/// Everything a new fetcher is built from.
///
/// A custom [`FetcherFactory`] may adjust the request and settings before
/// handing the parts to [`Fetcher::from_parts`].
#[derive(Debug)]
pub struct FetcherParts {
    /// The request, with the service user agent already applied
    pub request: FetchRequest,
    /// Settings stamped from the service defaults
    pub settings: FetcherSettings,
    pub(crate) host: HostKey,
    pub(crate) decorators: DecoratorChain,
    pub(crate) service: Weak<ServiceInner>,
}

impl FetcherParts {
    /// The admission queue the fetcher will be submitted to
    #[must_use]
    pub const fn host(&self) -> &HostKey {
        &self.host
    }
}

/// Builds the fetchers a service hands out
pub trait FetcherFactory: Send + Sync + Debug {
    /// Turn `parts` into a fetcher
    fn create_fetcher(&self, parts: FetcherParts) -> Fetcher;
}

/// Builds plain [`Fetcher`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFetcherFactory;

impl FetcherFactory for DefaultFetcherFactory {
    fn create_fetcher(&self, parts: FetcherParts) -> Fetcher {
        Fetcher::from_parts(parts)
    }
}
