//! Per-host admission control.
//!
//! Fetchers are partitioned by the authority they target. Each host gets a
//! running queue bounded by a cap and an unbounded FIFO of delayed fetchers
//! which are promoted as running fetchers complete.
//!
//! # Architecture
//!
//! - [`HostKey`]: The normalized `host[:port]` a fetcher targets
//! - [`HostQueue`]: Running and delayed queues for every host behind one lock
//! - [`QueuedUnit`]: What the queue needs to know about a unit of work
//! - [`FetcherCounts`]: Running/delayed counters for inspection

mod counts;
mod host_key;
mod host_queue;

pub use counts::FetcherCounts;
pub use host_key::HostKey;
pub use host_queue::{Admission, DEFAULT_MAX_RUNNING_FETCHERS_PER_HOST, HostQueue, QueuedUnit};
