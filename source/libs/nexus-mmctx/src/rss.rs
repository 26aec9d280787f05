// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Resident-set accounting shared by a context and cached per thread
//! OWNERS: @kernel-mm-team
//! PUBLIC API: RssCounter, RssCounters, RssCache
//! INVARIANTS: Cached deltas reach the context before the thread stops being tracked
//!             against it; shared counters only change through atomic adds

use core::sync::atomic::{AtomicI64, Ordering};

/// Number of distinct RSS counters.
pub const NR_RSS_COUNTERS: usize = 4;

/// Page categories tracked per address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RssCounter {
    /// Page-cache backed pages.
    FilePages,
    /// Anonymous pages.
    AnonPages,
    /// Swap entries.
    SwapEntries,
    /// Shared-memory pages.
    ShmemPages,
}

impl RssCounter {
    /// Every counter, in storage order.
    pub const ALL: [RssCounter; NR_RSS_COUNTERS] = [
        RssCounter::FilePages,
        RssCounter::AnonPages,
        RssCounter::SwapEntries,
        RssCounter::ShmemPages,
    ];

    const fn index(self) -> usize {
        match self {
            RssCounter::FilePages => 0,
            RssCounter::AnonPages => 1,
            RssCounter::SwapEntries => 2,
            RssCounter::ShmemPages => 3,
        }
    }
}

/// Counters owned by a context, updated concurrently by every thread that used it.
#[derive(Debug, Default)]
pub struct RssCounters {
    counts: [AtomicI64; NR_RSS_COUNTERS],
}

impl RssCounters {
    /// Adds `delta` pages to `counter`.
    pub fn add(&self, counter: RssCounter, delta: i64) {
        self.counts[counter.index()].fetch_add(delta, Ordering::Relaxed);
    }

    /// Current value of `counter`.
    pub fn get(&self, counter: RssCounter) -> i64 {
        self.counts[counter.index()].load(Ordering::Relaxed)
    }

    /// Sum of file, anonymous and shmem pages.
    pub fn resident(&self) -> i64 {
        self.get(RssCounter::FilePages)
            + self.get(RssCounter::AnonPages)
            + self.get(RssCounter::ShmemPages)
    }
}

/// Per-thread cache of RSS deltas not yet published to the context.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RssCache {
    deltas: [i64; NR_RSS_COUNTERS],
    events: u32,
}

impl RssCache {
    /// Creates an empty cache.
    pub const fn new() -> Self {
        Self { deltas: [0; NR_RSS_COUNTERS], events: 0 }
    }

    /// Records `delta` pages against `counter` and returns the number of cached events.
    pub fn add(&mut self, counter: RssCounter, delta: i64) -> u32 {
        self.deltas[counter.index()] += delta;
        self.events = self.events.saturating_add(1);
        self.events
    }

    /// Cached delta for `counter`.
    pub fn pending(&self, counter: RssCounter) -> i64 {
        self.deltas[counter.index()]
    }

    /// Number of updates since the last flush.
    pub fn events(&self) -> u32 {
        self.events
    }

    /// True when nothing is waiting to be flushed.
    pub fn is_empty(&self) -> bool {
        self.deltas.iter().all(|d| *d == 0)
    }

    /// Publishes cached deltas into `counters` and resets the cache.
    pub fn flush_into(&mut self, counters: &RssCounters) {
        for counter in RssCounter::ALL {
            let delta = core::mem::take(&mut self.deltas[counter.index()]);
            if delta != 0 {
                counters.add(counter, delta);
            }
        }
        self.events = 0;
    }
}
