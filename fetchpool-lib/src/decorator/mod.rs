//! Header decorators.
//!
//! A [`HeaderDecorator`] contributes HTTP headers to a request at a given
//! [`DecoratorPhase`]. Decorators are registered on a [`DecoratorChain`],
//! which only holds weak references: once the owner drops a decorator it is
//! skipped and pruned on the next invocation.
//!
//! Decorators are consulted in registration order and later contributions
//! overwrite earlier ones, so the most recently registered decorator wins a
//! header name collision.

use std::fmt::Debug;
use std::sync::{Arc, Mutex, Weak};

use http::HeaderMap;
use log::trace;

use crate::FetchRequest;
use crate::utils::lock;

/// Point in a fetcher's life at which decorators are consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecoratorPhase {
    /// The fetcher was just created
    Creation,
    /// The fetcher is about to follow a redirect
    Redirect,
    /// The fetcher is about to retry its request
    Retry,
}

/// A policy contributing headers to outgoing requests.
///
/// Implementations must be pure functions of the request and phase. They are
/// called without any lock held.
pub trait HeaderDecorator: Send + Sync + Debug {
    /// Headers to add to `request` at `phase`, or `None` to contribute nothing
    fn additional_headers(&self, request: &FetchRequest, phase: DecoratorPhase)
    -> Option<HeaderMap>;
}

#[derive(Debug, Clone)]
struct Registration(Weak<dyn HeaderDecorator>);

impl Registration {
    fn is(&self, decorator: &Arc<dyn HeaderDecorator>) -> bool {
        std::ptr::addr_eq(self.0.as_ptr(), Arc::as_ptr(decorator))
    }

    fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

/// Ordered, weakly-held set of [`HeaderDecorator`]s
#[derive(Debug, Default)]
pub struct DecoratorChain {
    registrations: Mutex<Vec<Registration>>,
}

impl DecoratorChain {
    /// Create an empty chain
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `decorator` as the most recent decorator.
    ///
    /// Registering a decorator twice moves it to the end of the chain.
    pub fn register(&self, decorator: &Arc<dyn HeaderDecorator>) {
        let mut registrations = lock(&self.registrations);
        registrations.retain(|r| r.is_alive() && !r.is(decorator));
        registrations.push(Registration(Arc::downgrade(decorator)));
    }

    /// Remove `decorator`, returning whether it was registered
    pub fn unregister(&self, decorator: &Arc<dyn HeaderDecorator>) -> bool {
        let mut registrations = lock(&self.registrations);
        let before = registrations.len();
        registrations.retain(|r| !r.is(decorator));
        before != registrations.len()
    }

    /// Number of decorators which are still alive
    pub fn len(&self) -> usize {
        lock(&self.registrations)
            .iter()
            .filter(|r| r.is_alive())
            .count()
    }

    /// Whether no live decorator is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A new chain holding the same registrations, in the same order
    #[must_use]
    pub fn snapshot(&self) -> Self {
        Self {
            registrations: Mutex::new(lock(&self.registrations).clone()),
        }
    }

    /// Live decorators in registration order. Dead ones are pruned.
    fn live(&self) -> Vec<Arc<dyn HeaderDecorator>> {
        let mut registrations = lock(&self.registrations);
        let before = registrations.len();
        registrations.retain(Registration::is_alive);
        if registrations.len() != before {
            trace!("Pruned {} dropped header decorators", before - registrations.len());
        }
        registrations.iter().filter_map(|r| r.0.upgrade()).collect()
    }

    /// Accumulate the headers every decorator contributes for `request` at
    /// `phase`
    pub fn headers_for(&self, request: &FetchRequest, phase: DecoratorPhase) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for decorator in self.live() {
            if let Some(contribution) = decorator.additional_headers(request, phase) {
                merge_headers(&mut headers, &contribution);
            }
        }
        headers
    }
}

/// Copy every header of `source` into `target`, replacing all existing values
/// of the same name
pub(crate) fn merge_headers(target: &mut HeaderMap, source: &HeaderMap) {
    for name in source.keys() {
        let mut values = source.get_all(name).iter();
        if let Some(first) = values.next() {
            target.insert(name.clone(), first.clone());
            for value in values {
                target.append(name.clone(), value.clone());
            }
        }
    }
}
