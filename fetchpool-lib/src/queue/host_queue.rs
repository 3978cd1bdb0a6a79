use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

use log::debug;
use tokio::time::Instant;

use super::{FetcherCounts, HostKey};
use crate::utils::lock;

/// Default number of fetchers allowed to run against one host
pub const DEFAULT_MAX_RUNNING_FETCHERS_PER_HOST: usize = 10;

/// A unit of work that can be admitted by a [`HostQueue`]
pub trait QueuedUnit: Clone + Debug + Send + Sync {
    /// Identity used to find the unit again when it completes
    type Id: Copy + Eq + Hash + Debug;

    /// Identity of this unit
    fn id(&self) -> Self::Id;

    /// Host the unit targets
    fn host(&self) -> &HostKey;

    /// Units with an isolated session bypass the per-host cap and are never
    /// delayed
    fn uses_isolated_session(&self) -> bool;
}

/// Admission decision returned by [`HostQueue::submit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was free, dispatch the unit right away
    StartNow,
    /// The host is at capacity, the unit was appended to its delayed queue
    Hold,
}

#[derive(Debug)]
struct HostEntry<T> {
    running: Vec<T>,
    delayed: VecDeque<T>,
}

impl<T> Default for HostEntry<T> {
    fn default() -> Self {
        Self {
            running: Vec::new(),
            delayed: VecDeque::new(),
        }
    }
}

impl<T: QueuedUnit> HostEntry<T> {
    /// Running units which count against the cap
    fn capped_running(&self) -> usize {
        self.running
            .iter()
            .filter(|unit| !unit.uses_isolated_session())
            .count()
    }

    fn has_capacity(&self, max_running: usize) -> bool {
        max_running == 0 || self.capped_running() < max_running
    }

    /// Move delayed units to running, oldest first, while the cap allows
    fn promote(&mut self, max_running: usize, promoted: &mut Vec<T>) {
        while self.has_capacity(max_running) {
            let Some(next) = self.delayed.pop_front() else {
                break;
            };
            self.running.push(next.clone());
            promoted.push(next);
        }
    }

    fn is_empty(&self) -> bool {
        self.running.is_empty() && self.delayed.is_empty()
    }

    fn counts(&self) -> FetcherCounts {
        FetcherCounts {
            running: self.running.len(),
            delayed: self.delayed.len(),
        }
    }
}

#[derive(Debug)]
struct QueueState<T> {
    hosts: HashMap<HostKey, HostEntry<T>>,
    max_running_per_host: usize,
    stopped_all_at: Option<Instant>,
}

/// Per-host running and delayed queues with a concurrency cap.
///
/// All mutations are serialized through a single mutex. Units which get
/// promoted are handed back to the caller instead of being started here, so
/// the caller can start them after the lock is released. That way a
/// completion callback re-entering the queue can never deadlock.
///
/// A cap of `0` means no unit is ever delayed.
#[derive(Debug)]
pub struct HostQueue<T> {
    state: Mutex<QueueState<T>>,
}

impl<T: QueuedUnit> HostQueue<T> {
    /// Create an empty queue with the given per-host cap
    #[must_use]
    pub fn new(max_running_per_host: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                hosts: HashMap::new(),
                max_running_per_host,
                stopped_all_at: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState<T>> {
        lock(&self.state)
    }

    /// Admit `unit` to its host's running queue, or delay it when the host is
    /// at capacity
    pub fn submit(&self, unit: T) -> Admission {
        let mut state = self.state();
        let max_running = state.max_running_per_host;
        let host = unit.host().clone();
        let entry = state.hosts.entry(host.clone()).or_default();

        if unit.uses_isolated_session() || entry.has_capacity(max_running) {
            entry.running.push(unit);
            Admission::StartNow
        } else {
            debug!(
                "Host {host} has {} running fetchers, delaying {:?}",
                entry.capped_running(),
                unit.id()
            );
            entry.delayed.push_back(unit);
            Admission::Hold
        }
    }

    /// Remove `unit` from whichever queue holds it.
    ///
    /// When it leaves the running queue, the oldest delayed units of the same
    /// host are promoted while the cap allows and returned so the caller can
    /// start them. Completing an unknown or already completed unit is a no-op.
    #[must_use = "promoted units must be started by the caller"]
    pub fn complete(&self, unit: &T) -> Vec<T> {
        let mut state = self.state();
        let max_running = state.max_running_per_host;
        let host = unit.host();
        let id = unit.id();
        let mut promoted = Vec::new();

        let Some(entry) = state.hosts.get_mut(host) else {
            return promoted;
        };

        if let Some(pos) = entry.running.iter().position(|u| u.id() == id) {
            entry.running.remove(pos);
            entry.promote(max_running, &mut promoted);
        } else if let Some(pos) = entry.delayed.iter().position(|u| u.id() == id) {
            entry.delayed.remove(pos);
        }

        if entry.is_empty() {
            state.hosts.remove(host);
        }
        promoted
    }

    /// Whether `unit` is waiting in a delayed queue
    pub fn is_delaying(&self, unit: &T) -> bool {
        let id = unit.id();
        self.state()
            .hosts
            .get(unit.host())
            .is_some_and(|entry| entry.delayed.iter().any(|u| u.id() == id))
    }

    /// Current per-host cap
    pub fn max_running_per_host(&self) -> usize {
        self.state().max_running_per_host
    }

    /// Change the per-host cap.
    ///
    /// Running units are never stopped by a lower cap. When the cap grows,
    /// delayed units are promoted on every host and returned to the caller.
    #[must_use = "promoted units must be started by the caller"]
    pub fn set_max_running_per_host(&self, max_running: usize) -> Vec<T> {
        let mut state = self.state();
        let previous = state.max_running_per_host;
        state.max_running_per_host = max_running;

        let mut promoted = Vec::new();
        let grew = max_running == 0 || (previous != 0 && max_running > previous);
        if grew {
            for entry in state.hosts.values_mut() {
                entry.promote(max_running, &mut promoted);
            }
        }
        promoted
    }

    /// Counts for a single host
    pub fn counts_for(&self, host: &HostKey) -> FetcherCounts {
        self.state()
            .hosts
            .get(host)
            .map(HostEntry::counts)
            .unwrap_or_default()
    }

    /// Counts across all hosts
    pub fn counts(&self) -> FetcherCounts {
        self.state()
            .hosts
            .values()
            .fold(FetcherCounts::default(), |acc, entry| acc + entry.counts())
    }

    /// Snapshot of the running units, keyed by host
    pub fn running_by_host(&self) -> HashMap<HostKey, Vec<T>> {
        self.state()
            .hosts
            .iter()
            .filter(|(_, entry)| !entry.running.is_empty())
            .map(|(host, entry)| (host.clone(), entry.running.clone()))
            .collect()
    }

    /// Snapshot of the delayed units, keyed by host, in promotion order
    pub fn delayed_by_host(&self) -> HashMap<HostKey, Vec<T>> {
        self.state()
            .hosts
            .iter()
            .filter(|(_, entry)| !entry.delayed.is_empty())
            .map(|(host, entry)| (host.clone(), entry.delayed.iter().cloned().collect()))
            .collect()
    }

    /// Snapshot of every running and delayed unit
    pub fn issued(&self) -> Vec<T> {
        self.state()
            .hosts
            .values()
            .flat_map(|entry| entry.running.iter().chain(entry.delayed.iter()))
            .cloned()
            .collect()
    }

    /// Drain every host and record the stop-all marker.
    ///
    /// The drained units are returned so the caller can terminate them
    /// outside the lock.
    #[must_use = "drained units must be terminated by the caller"]
    pub fn stop_all(&self) -> Vec<T> {
        let mut state = self.state();
        state.stopped_all_at = Some(Instant::now());
        state
            .hosts
            .drain()
            .flat_map(|(_, entry)| entry.running.into_iter().chain(entry.delayed))
            .collect()
    }

    /// When [`HostQueue::stop_all`] last ran
    pub fn stopped_all_at(&self) -> Option<Instant> {
        self.state().stopped_all_at
    }
}

impl<T: QueuedUnit> Default for HostQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RUNNING_FETCHERS_PER_HOST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[derive(Debug, Clone, PartialEq)]
    struct Unit {
        id: u32,
        host: HostKey,
        isolated: bool,
    }

    impl QueuedUnit for Unit {
        type Id = u32;

        fn id(&self) -> u32 {
            self.id
        }

        fn host(&self) -> &HostKey {
            &self.host
        }

        fn uses_isolated_session(&self) -> bool {
            self.isolated
        }
    }

    fn unit(id: u32, host: &str) -> Unit {
        Unit {
            id,
            host: HostKey::from(host),
            isolated: false,
        }
    }

    fn isolated(id: u32, host: &str) -> Unit {
        Unit {
            isolated: true,
            ..unit(id, host)
        }
    }

    fn ids(units: &[Unit]) -> Vec<u32> {
        units.iter().map(|u| u.id).collect()
    }

    #[test]
    fn test_submit_respects_cap() {
        let queue = HostQueue::new(2);
        assert_eq!(queue.submit(unit(1, "a")), Admission::StartNow);
        assert_eq!(queue.submit(unit(2, "a")), Admission::StartNow);
        assert_eq!(queue.submit(unit(3, "a")), Admission::Hold);
        // Other hosts are not affected
        assert_eq!(queue.submit(unit(4, "b")), Admission::StartNow);

        let a = queue.counts_for(&HostKey::from("a"));
        assert_eq!(a, FetcherCounts { running: 2, delayed: 1 });
        assert_eq!(queue.counts().total(), 4);
        assert!(queue.is_delaying(&unit(3, "a")));
        assert!(!queue.is_delaying(&unit(1, "a")));
    }

    #[rstest]
    #[case(1, 5)]
    #[case(3, 10)]
    #[case(10, 4)]
    fn test_running_never_exceeds_cap(#[case] cap: usize, #[case] submitted: u32) {
        let queue = HostQueue::new(cap);
        for id in 0..submitted {
            let _ = queue.submit(unit(id, "a"));
            assert!(queue.counts_for(&HostKey::from("a")).running <= cap);
        }
        let running = queue.counts_for(&HostKey::from("a")).running;
        assert_eq!(running, cap.min(submitted as usize));
    }

    #[test]
    fn test_zero_cap_means_unlimited() {
        let queue = HostQueue::new(0);
        for id in 0..50 {
            assert_eq!(queue.submit(unit(id, "a")), Admission::StartNow);
        }
        assert_eq!(queue.counts().delayed, 0);
    }

    #[test]
    fn test_promotion_is_fifo() {
        let queue = HostQueue::new(1);
        let _ = queue.submit(unit(0, "a"));
        for id in 1..=3 {
            assert_eq!(queue.submit(unit(id, "a")), Admission::Hold);
        }

        assert_eq!(ids(&queue.complete(&unit(0, "a"))), vec![1]);
        assert_eq!(ids(&queue.complete(&unit(1, "a"))), vec![2]);
        assert_eq!(ids(&queue.complete(&unit(2, "a"))), vec![3]);
        assert!(queue.complete(&unit(3, "a")).is_empty());
        assert!(queue.counts().is_empty());
    }

    #[test]
    fn test_complete_is_idempotent() {
        let queue = HostQueue::new(1);
        let _ = queue.submit(unit(0, "a"));
        let _ = queue.submit(unit(1, "a"));
        let _ = queue.submit(unit(2, "a"));

        assert_eq!(ids(&queue.complete(&unit(0, "a"))), vec![1]);
        // A second completion must not promote unit 2 as well
        assert!(queue.complete(&unit(0, "a")).is_empty());
        assert_eq!(
            queue.counts_for(&HostKey::from("a")),
            FetcherCounts { running: 1, delayed: 1 }
        );
    }

    #[test]
    fn test_complete_unknown_unit_is_noop() {
        let queue: HostQueue<Unit> = HostQueue::new(1);
        assert!(queue.complete(&unit(42, "nowhere")).is_empty());
        let _ = queue.submit(unit(1, "a"));
        assert!(queue.complete(&unit(42, "a")).is_empty());
        assert_eq!(queue.counts().running, 1);
    }

    #[test]
    fn test_cancel_delayed_unit_does_not_promote() {
        let queue = HostQueue::new(1);
        let _ = queue.submit(unit(0, "a"));
        let _ = queue.submit(unit(1, "a"));
        let _ = queue.submit(unit(2, "a"));

        assert!(queue.complete(&unit(1, "a")).is_empty());
        assert_eq!(ids(&queue.complete(&unit(0, "a"))), vec![2]);
    }

    #[test]
    fn test_host_entry_removed_when_empty() {
        let queue = HostQueue::new(1);
        let _ = queue.submit(unit(0, "a"));
        assert_eq!(queue.running_by_host().len(), 1);
        let _ = queue.complete(&unit(0, "a"));
        assert!(queue.running_by_host().is_empty());
        assert!(queue.delayed_by_host().is_empty());
        assert!(queue.issued().is_empty());
    }

    #[test]
    fn test_isolated_units_bypass_cap() {
        let queue = HostQueue::new(1);
        assert_eq!(queue.submit(unit(0, "a")), Admission::StartNow);
        assert_eq!(queue.submit(isolated(1, "a")), Admission::StartNow);
        assert_eq!(queue.submit(isolated(2, "a")), Admission::StartNow);
        assert_eq!(queue.submit(unit(3, "a")), Admission::Hold);

        // Isolated units do not occupy a capped slot
        assert_eq!(queue.complete(&isolated(1, "a")), vec![]);
        assert_eq!(ids(&queue.complete(&unit(0, "a"))), vec![3]);
    }

    #[test]
    fn test_raising_cap_promotes_exactly_the_new_slots() {
        let queue = HostQueue::new(1);
        let _ = queue.submit(unit(0, "a"));
        let _ = queue.submit(unit(1, "a"));
        let _ = queue.submit(unit(2, "a"));

        let promoted = queue.set_max_running_per_host(2);
        assert_eq!(ids(&promoted), vec![1]);
        assert_eq!(
            queue.counts_for(&HostKey::from("a")),
            FetcherCounts { running: 2, delayed: 1 }
        );
    }

    #[test]
    fn test_lowering_cap_keeps_running_units() {
        let queue = HostQueue::new(3);
        for id in 0..4 {
            let _ = queue.submit(unit(id, "a"));
        }
        assert!(queue.set_max_running_per_host(1).is_empty());
        assert_eq!(
            queue.counts_for(&HostKey::from("a")),
            FetcherCounts { running: 3, delayed: 1 }
        );

        // Freed slots are not refilled until running drops below the new cap
        assert!(queue.complete(&unit(0, "a")).is_empty());
        assert!(queue.complete(&unit(1, "a")).is_empty());
        assert_eq!(ids(&queue.complete(&unit(2, "a"))), vec![3]);
    }

    #[test]
    fn test_unlimited_cap_promotes_everything() {
        let queue = HostQueue::new(1);
        for id in 0..4 {
            let _ = queue.submit(unit(id, "a"));
        }
        let _ = queue.submit(unit(4, "b"));
        let _ = queue.submit(unit(5, "b"));

        let mut promoted = ids(&queue.set_max_running_per_host(0));
        promoted.sort_unstable();
        assert_eq!(promoted, vec![1, 2, 3, 5]);
        assert_eq!(queue.counts().delayed, 0);
    }

    #[test]
    fn test_stop_all_drains_and_records_marker() {
        let queue = HostQueue::new(1);
        assert!(queue.stopped_all_at().is_none());
        let _ = queue.submit(unit(0, "a"));
        let _ = queue.submit(unit(1, "a"));
        let _ = queue.submit(unit(2, "b"));

        let mut drained = ids(&queue.stop_all());
        drained.sort_unstable();
        assert_eq!(drained, vec![0, 1, 2]);
        assert!(queue.counts().is_empty());
        assert!(queue.stopped_all_at().is_some());

        // Idempotent, and late completions stay harmless
        assert!(queue.stop_all().is_empty());
        assert!(queue.complete(&unit(0, "a")).is_empty());
    }

    #[test]
    fn test_concurrent_submit_and_complete() {
        use std::sync::Arc;
        use std::thread;

        let queue = Arc::new(HostQueue::new(3));
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..100u32 {
                        let u = unit(t * 1000 + i, "a");
                        let _ = queue.submit(u.clone());
                        assert!(queue.counts_for(&HostKey::from("a")).running <= 3);
                        let _ = queue.complete(&u);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        // Every thread completed its own units
        assert!(queue.counts().is_empty());
    }
}
