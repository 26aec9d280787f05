// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-space context shared between a process and borrowing kernel threads
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MmContext (new/id/grabs/rss/membarrier_state), ContextId
//! DEPENDS_ON: rss::RssCounters, membarrier::MembarrierState
//! INVARIANTS: grabs == number of lazy slots holding the context; never underflows
//!
//! A context is created by the process that owns it and handed out as `Arc<MmContext>`.
//! Kernel threads that retain it in their lazy slot additionally hold a *grab*. Grabs
//! are counted explicitly so the ledger can be checked independently of how many `Arc`
//! handles happen to be alive.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use log::debug;

use crate::membarrier::MembarrierState;
use crate::rss::{RssCounter, RssCounters};
use crate::LOG_TARGET;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a context, valid for logging after the context is gone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw identifier value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mm#{}", self.0)
    }
}

/// Reference-counted set of mappings a thread can be bound to.
pub struct MmContext {
    id: ContextId,
    grabs: AtomicUsize,
    rss: RssCounters,
    membarrier: AtomicU32,
}

impl MmContext {
    /// Creates a context with no grabs.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ContextId::next(),
            grabs: AtomicUsize::new(0),
            rss: RssCounters::default(),
            membarrier: AtomicU32::new(0),
        })
    }

    /// Identity of this context.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Number of lazy slots currently holding a grab on this context.
    pub fn grabs(&self) -> usize {
        self.grabs.load(Ordering::Acquire)
    }

    /// Shared RSS counters.
    pub fn rss(&self) -> &RssCounters {
        &self.rss
    }

    /// Current value of one RSS counter.
    pub fn rss_count(&self, counter: RssCounter) -> i64 {
        self.rss.get(counter)
    }

    /// Membarrier commands this context registered for.
    pub fn membarrier_state(&self) -> MembarrierState {
        MembarrierState::from_bits_truncate(self.membarrier.load(Ordering::Relaxed))
    }

    /// Sets registration bits. Threads already bound are brought up to date by
    /// [`crate::Membarrier`], the only caller.
    pub(crate) fn register_membarrier(&self, state: MembarrierState) {
        self.membarrier.fetch_or(state.bits(), Ordering::Relaxed);
    }

    pub(crate) fn grab(&self) {
        let prev = self.grabs.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev < usize::MAX, "grab count overflow on {}", self.id);
    }

    /// Drops one grab. Returns true when it was the last.
    pub(crate) fn drop_grab(&self) -> bool {
        let prev = self.grabs.fetch_sub(1, Ordering::Release);
        assert!(prev != 0, "grab count underflow on {}", self.id);
        if prev == 1 {
            fence(Ordering::Acquire);
            debug!(target: LOG_TARGET, "{}: last lazy reference released", self.id);
            true
        } else {
            false
        }
    }

    pub(crate) fn ptr(self: &Arc<Self>) -> *mut MmContext {
        Arc::as_ptr(self).cast_mut()
    }
}

impl fmt::Debug for MmContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmContext")
            .field("id", &self.id)
            .field("grabs", &self.grabs())
            .field("membarrier", &self.membarrier_state())
            .finish()
    }
}

impl Drop for MmContext {
    fn drop(&mut self) {
        debug!(
            target: LOG_TARGET,
            "{}: context torn down (resident pages {})",
            self.id,
            self.rss.resident()
        );
    }
}
