// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host backend recording every MMU hook invocation
//! OWNERS: @kernel-mm-team
//! PUBLIC API: RecordingMmu, MmuEvent
//! DEPENDS_ON: parking_lot::Mutex
//!
//! Used by host-first tests to check the order in which attach and detach call into
//! the architecture and where the barriers land.

use alloc::vec::Vec;

use parking_lot::Mutex;

use crate::barrier::{self, BarrierSite};
use crate::context::{ContextId, MmContext};
use crate::kthread::Tid;
use crate::ops::MmuOps;

/// One recorded hook invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmuEvent {
    /// `switch_mm`; `None` is the kernel-only mapping.
    Switch {
        /// Thread being switched.
        thread: Tid,
        /// Context loaded before.
        prev: Option<ContextId>,
        /// Context loaded after.
        next: Option<ContextId>,
    },
    /// `finish_post_lock_switch`.
    FinishPostLock,
    /// `enter_lazy_tlb`.
    EnterLazyTlb {
        /// Thread entering lazy mode.
        thread: Tid,
        /// Context left loaded.
        mm: ContextId,
    },
    /// `full_barrier`.
    Barrier(BarrierSite),
}

/// [`MmuOps`] implementation that records calls and still issues real barriers.
#[derive(Debug, Default)]
pub struct RecordingMmu {
    events: Mutex<Vec<MmuEvent>>,
}

impl RecordingMmu {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far.
    pub fn events(&self) -> Vec<MmuEvent> {
        self.events.lock().clone()
    }

    /// Returns and clears the recorded events.
    pub fn take(&self) -> Vec<MmuEvent> {
        core::mem::take(&mut *self.events.lock())
    }

    /// Number of switches that changed the loaded context.
    pub fn switches(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, MmuEvent::Switch { prev, next, .. } if prev != next))
            .count()
    }

    /// Number of barriers issued at `site`.
    pub fn barriers(&self, site: BarrierSite) -> usize {
        self.events.lock().iter().filter(|e| **e == MmuEvent::Barrier(site)).count()
    }

    fn record(&self, event: MmuEvent) {
        self.events.lock().push(event);
    }
}

impl MmuOps for RecordingMmu {
    fn switch_mm(&self, prev: Option<&MmContext>, next: Option<&MmContext>, thread: Tid) {
        self.record(MmuEvent::Switch {
            thread,
            prev: prev.map(MmContext::id),
            next: next.map(MmContext::id),
        });
    }

    fn finish_post_lock_switch(&self) {
        self.record(MmuEvent::FinishPostLock);
    }

    fn enter_lazy_tlb(&self, mm: &MmContext, thread: Tid) {
        self.record(MmuEvent::EnterLazyTlb { thread, mm: mm.id() });
    }

    fn full_barrier(&self, site: BarrierSite) {
        barrier::full();
        self.record(MmuEvent::Barrier(site));
    }
}
