use serde::Serialize;
use std::ops::{Add, AddAssign};

/// Number of fetchers held by the admission queue, for one host or in total
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FetcherCounts {
    /// Fetchers currently dispatched to a session
    pub running: usize,
    /// Fetchers waiting for a free slot on their host
    pub delayed: usize,
}

impl FetcherCounts {
    /// Running and delayed fetchers together
    #[must_use]
    pub const fn total(&self) -> usize {
        self.running + self.delayed
    }

    /// Whether no fetcher is held at all
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl Add for FetcherCounts {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            running: self.running + rhs.running,
            delayed: self.delayed + rhs.delayed,
        }
    }
}

impl AddAssign for FetcherCounts {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
