use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::debug;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::{
    Session, SessionConfiguration, SessionDelegate, SessionId, SessionInvalidated, Transport,
};
use crate::utils::lock;
use crate::{Result, ServiceId};

/// Default delay until an unused reusable session is invalidated
pub const DEFAULT_UNUSED_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Capacity of the session event channel. Slow subscribers lose old events.
const EVENT_CAPACITY: usize = 16;

/// Owns the single reusable session of a service.
///
/// With reuse enabled, every fetcher with the same effective
/// [`SessionConfiguration`] shares one session. When the last lease on it is
/// dropped, a one-shot timer is armed and the session is invalidated if it is
/// still unused when the timer fires. A timeout of zero keeps the session
/// until [`SessionManager::reset`].
///
/// With reuse disabled, every lease gets its own session, which is
/// invalidated as soon as the lease is dropped.
#[derive(Debug, Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    service: ServiceId,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    events: broadcast::Sender<SessionInvalidated>,
    /// Delegate of the reusable session, broadcasting its invalidation
    notifier: Arc<dyn SessionDelegate>,
    /// Delegate of unshared sessions
    quiet: Arc<dyn SessionDelegate>,
    slot: Mutex<SessionSlot>,
}

#[derive(Debug)]
struct SessionSlot {
    reuse: bool,
    unused_timeout: Duration,
    current: Option<ReusableSession>,
}

#[derive(Debug)]
struct ReusableSession {
    session: Arc<dyn Session>,
    configuration: SessionConfiguration,
    in_use: usize,
    last_used: Instant,
    idle_timer: Option<AbortHandle>,
}

impl ReusableSession {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }

    /// Tear the session down. Call this outside the slot lock.
    fn discard(mut self) {
        self.cancel_timer();
        self.session.invalidate();
    }
}

#[derive(Debug)]
struct InvalidationNotifier {
    service: ServiceId,
    events: broadcast::Sender<SessionInvalidated>,
}

impl SessionDelegate for InvalidationNotifier {
    fn session_did_become_invalid(&self, session: SessionId) {
        debug!("Reusable {session} of {} became invalid", self.service);
        // Nobody listening is fine
        let _ = self.events.send(SessionInvalidated {
            service: self.service,
            session,
        });
    }
}

#[derive(Debug)]
struct QuietDelegate;

impl SessionDelegate for QuietDelegate {
    fn session_did_become_invalid(&self, _: SessionId) {}
}

/// A borrowed session. Dropping the lease hands the session back.
#[derive(Debug)]
pub struct SessionLease {
    session: Arc<dyn Session>,
    reused: bool,
    manager: Weak<Shared>,
}

impl SessionLease {
    /// The borrowed session
    #[must_use]
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Identity of the borrowed session
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.session.id()
    }

    /// Whether the session is the shared, reusable one
    #[must_use]
    pub const fn is_reused(&self) -> bool {
        self.reused
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if !self.reused {
            self.session.invalidate();
        } else if let Some(shared) = self.manager.upgrade() {
            shared.release(self.session.id());
        }
    }
}

impl SessionManager {
    /// Create a manager building sessions with `transport` and arming its
    /// idle timers on `runtime`
    #[must_use]
    pub fn new(
        service: ServiceId,
        transport: Arc<dyn Transport>,
        runtime: Handle,
        reuse: bool,
        unused_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let notifier = Arc::new(InvalidationNotifier {
            service,
            events: events.clone(),
        });
        Self {
            shared: Arc::new(Shared {
                service,
                transport,
                runtime,
                events,
                notifier,
                quiet: Arc::new(QuietDelegate),
                slot: Mutex::new(SessionSlot {
                    reuse,
                    unused_timeout,
                    current: None,
                }),
            }),
        }
    }

    /// Borrow a session for `configuration`.
    ///
    /// Reuses the current session when reuse is enabled and its configuration
    /// matches. Otherwise a new session is created and the previous one is
    /// invalidated.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to create a session. The next
    /// call simply tries again.
    pub fn acquire(&self, configuration: &SessionConfiguration) -> Result<SessionLease> {
        let shared = &self.shared;
        let mut slot = shared.slot();
        if !slot.reuse {
            drop(slot);
            return self.acquire_isolated(configuration);
        }

        if let Some(current) = slot.current.as_mut()
            && current.configuration == *configuration
            && current.session.is_valid()
        {
            current.cancel_timer();
            current.in_use += 1;
            return Ok(SessionLease {
                session: current.session.clone(),
                reused: true,
                manager: Arc::downgrade(shared),
            });
        }

        let session = shared
            .transport
            .create_session(configuration, shared.notifier.clone())?;
        debug!("Using new reusable {} for {}", session.id(), shared.service);
        let previous = slot.current.replace(ReusableSession {
            session: session.clone(),
            configuration: configuration.clone(),
            in_use: 1,
            last_used: Instant::now(),
            idle_timer: None,
        });
        drop(slot);

        if let Some(previous) = previous {
            debug!(
                "Discarding {} with a different configuration",
                previous.session.id()
            );
            previous.discard();
        }

        Ok(SessionLease {
            session,
            reused: true,
            manager: Arc::downgrade(shared),
        })
    }

    /// Borrow a fresh session nobody else uses.
    ///
    /// It is invalidated when the lease is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to create a session
    pub fn acquire_isolated(&self, configuration: &SessionConfiguration) -> Result<SessionLease> {
        let session = self
            .shared
            .transport
            .create_session(configuration, self.shared.quiet.clone())?;
        Ok(SessionLease {
            session,
            reused: false,
            manager: Arc::downgrade(&self.shared),
        })
    }

    /// Invalidate the reusable session now, even if it is in use.
    ///
    /// Fetchers which already hold a lease finish on the old session. The next
    /// [`SessionManager::acquire`] builds a fresh one.
    pub fn reset(&self) {
        let previous = self.shared.slot().current.take();
        if let Some(previous) = previous {
            debug!("Resetting {} of {}", previous.session.id(), self.shared.service);
            previous.discard();
        }
    }

    /// The reusable session, if one is alive
    #[must_use]
    pub fn session(&self) -> Option<Arc<dyn Session>> {
        self.shared
            .slot()
            .current
            .as_ref()
            .map(|current| current.session.clone())
    }

    /// Whether sessions are shared between fetchers
    #[must_use]
    pub fn reuse_session(&self) -> bool {
        self.shared.slot().reuse
    }

    /// Enable or disable session reuse. Disabling it resets the current
    /// session.
    pub fn set_reuse_session(&self, reuse: bool) {
        self.shared.slot().reuse = reuse;
        if !reuse {
            self.reset();
        }
    }

    /// Delay until an unused reusable session is invalidated
    #[must_use]
    pub fn unused_session_timeout(&self) -> Duration {
        self.shared.slot().unused_timeout
    }

    /// Change the idle delay. Applies from the next time the session becomes
    /// unused.
    pub fn set_unused_session_timeout(&self, timeout: Duration) {
        self.shared.slot().unused_timeout = timeout;
    }

    /// Subscribe to invalidation events of reusable sessions
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionInvalidated> {
        self.shared.events.subscribe()
    }
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, SessionSlot> {
        lock(&self.slot)
    }

    /// A lease on session `id` was dropped
    fn release(self: &Arc<Self>, id: SessionId) {
        let mut slot = self.slot();
        let timeout = slot.unused_timeout;
        let Some(current) = slot.current.as_mut() else {
            return;
        };
        // Leases of a session which was reset or replaced have nothing to do
        if current.session.id() != id {
            return;
        }
        current.in_use = current.in_use.saturating_sub(1);
        if current.in_use > 0 {
            return;
        }
        current.last_used = Instant::now();
        if timeout.is_zero() {
            return;
        }

        current.cancel_timer();
        let manager = Arc::downgrade(self);
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = manager.upgrade() {
                shared.expire(id);
            }
        });
        current.idle_timer = Some(timer.abort_handle());
    }

    /// The idle timer of session `id` fired
    fn expire(&self, id: SessionId) {
        let mut slot = self.slot();
        let timeout = slot.unused_timeout;
        let expired = slot.current.as_ref().is_some_and(|current| {
            current.session.id() == id
                && current.in_use == 0
                && current.last_used.elapsed() >= timeout
        });
        if !expired {
            return;
        }
        let previous = slot.current.take();
        drop(slot);

        if let Some(mut previous) = previous {
            debug!("Invalidating {id} after {timeout:?} unused");
            // This task is the timer, nothing to abort
            previous.idle_timer = None;
            previous.discard();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let slot = self
            .slot
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(previous) = slot.current.take() {
            previous.discard();
        }
    }
}
