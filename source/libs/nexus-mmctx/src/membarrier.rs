// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Expedited membarrier target selection over registered threads
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Membarrier (register/register_*_expedited/private_expedited/global_expedited),
//!             MembarrierState
//! DEPENDS_ON: kthread::ThreadObserver, barrier::full
//! INVARIANTS: Scans read bindings without task locks; each scan is bracketed by full
//!             barriers pairing with the ones attach/detach emit; registering a context
//!             updates threads already bound to it before it reports ready

use alloc::vec::Vec;

use bitflags::bitflags;
use log::{debug, trace};
use spin::Mutex;

use crate::barrier;
use crate::context::MmContext;
use crate::error::MembarrierError;
use crate::kthread::{ThreadObserver, Tid, WeakObserver};
use crate::LOG_TARGET;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Expedited membarrier commands an address space registered for.
    pub struct MembarrierState: u32 {
        /// Private registration finished: private expedited barriers may be issued.
        const PRIVATE_EXPEDITED_READY = 1 << 0;
        /// Private registration started; mirrored into bound threads.
        const PRIVATE_EXPEDITED = 1 << 1;
        /// Global registration finished.
        const GLOBAL_EXPEDITED_READY = 1 << 2;
        /// Threads bound to this context are targets of global expedited barriers.
        const GLOBAL_EXPEDITED = 1 << 3;
    }
}

/// Registry of threads visible to membarrier scans.
///
/// Entries do not keep threads alive. Exited threads are pruned on the next
/// registration or scan.
#[derive(Default)]
pub struct Membarrier {
    threads: Mutex<Vec<WeakObserver>>,
}

impl Membarrier {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `thread` visible to future scans.
    pub fn register(&self, thread: ThreadObserver) {
        let mut threads = self.threads.lock();
        threads.retain(WeakObserver::is_live);
        if threads.iter().all(|t| t.tid() != thread.tid()) {
            // The context may have registered while this thread was already bound.
            thread.sync_membarrier_state(None);
            threads.push(thread.downgrade());
        }
    }

    /// Removes `tid` from future scans.
    pub fn unregister(&self, tid: Tid) {
        self.threads.lock().retain(|t| t.tid() != tid);
    }

    /// Number of registered threads still alive.
    pub fn len(&self) -> usize {
        let mut threads = self.threads.lock();
        threads.retain(WeakObserver::is_live);
        threads.len()
    }

    /// True when no live thread is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers `mm` for private expedited barriers.
    pub fn register_private_expedited(&self, mm: &MmContext) {
        self.register_context(
            mm,
            MembarrierState::PRIVATE_EXPEDITED,
            MembarrierState::PRIVATE_EXPEDITED_READY,
        );
    }

    /// Registers `mm` so threads bound to it receive global expedited barriers.
    pub fn register_global_expedited(&self, mm: &MmContext) {
        self.register_context(
            mm,
            MembarrierState::GLOBAL_EXPEDITED,
            MembarrierState::GLOBAL_EXPEDITED_READY,
        );
    }

    /// Sets `active`, brings the mirror of every thread already bound to `mm` up to
    /// date, then sets `ready`.
    fn register_context(&self, mm: &MmContext, active: MembarrierState, ready: MembarrierState) {
        if mm.membarrier_state().contains(ready) {
            return;
        }
        mm.register_membarrier(active);
        barrier::full();
        let mut synced = 0usize;
        for thread in self.threads.lock().iter().filter_map(WeakObserver::upgrade) {
            if thread.sync_membarrier_state(Some(mm)) {
                synced += 1;
            }
        }
        mm.register_membarrier(ready);
        debug!(
            target: LOG_TARGET,
            "membarrier register {} {:?}: {} bound threads synced",
            mm.id(),
            active,
            synced
        );
    }

    /// Threads that must be interrupted for a private expedited barrier on `mm`: every
    /// thread currently bound to it.
    pub fn private_expedited(&self, mm: &MmContext) -> Result<Vec<Tid>, MembarrierError> {
        if !mm.membarrier_state().contains(MembarrierState::PRIVATE_EXPEDITED_READY) {
            return Err(MembarrierError::NotRegistered);
        }
        let targets = self.scan(|thread| thread.is_bound_to(mm));
        trace!(target: LOG_TARGET, "membarrier private {}: {} targets", mm.id(), targets.len());
        Ok(targets)
    }

    /// Threads that must be interrupted for a global expedited barrier: every thread
    /// bound to a context registered for it.
    pub fn global_expedited(&self) -> Vec<Tid> {
        let targets = self.scan(|thread| {
            thread.membarrier_state().contains(MembarrierState::GLOBAL_EXPEDITED)
        });
        trace!(target: LOG_TARGET, "membarrier global: {} targets", targets.len());
        targets
    }

    fn scan(&self, wants_ipi: impl Fn(&ThreadObserver) -> bool) -> Vec<Tid> {
        let mut threads = self.threads.lock();
        // Pairs with the barrier after a binding store: a thread missed here issued that
        // barrier after our read and will see the caller's prior stores.
        barrier::full();
        let mut targets = Vec::new();
        threads.retain(|entry| match entry.upgrade() {
            Some(thread) => {
                if wants_ipi(&thread) {
                    targets.push(thread.tid());
                }
                true
            }
            None => false,
        });
        barrier::full();
        targets
    }
}
