// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Architecture hooks consumed by attach/detach
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MmuOps, NoopMmu
//! INVARIANTS: switch_mm runs under the task lock; finish_post_lock_switch runs after it

use alloc::sync::Arc;

use crate::barrier::{self, BarrierSite};
use crate::context::MmContext;
use crate::kthread::Tid;

/// Hardware side of an address-space switch.
pub trait MmuOps {
    /// Loads the mappings of `next` on the executing CPU for `thread`. `None` stands for
    /// the kernel-only mappings. Called with `prev == next` when a retained context is
    /// re-attached, so implementations can leave lazy-TLB mode without remapping.
    fn switch_mm(&self, prev: Option<&MmContext>, next: Option<&MmContext>, thread: Tid);

    /// Work that has to wait until the task lock is dropped.
    fn finish_post_lock_switch(&self) {}

    /// `thread` stopped using `mm` but leaves it loaded.
    fn enter_lazy_tlb(&self, _mm: &MmContext, _thread: Tid) {}

    /// Full memory barrier required at `site`.
    fn full_barrier(&self, _site: BarrierSite) {
        barrier::full();
    }
}

impl<T: MmuOps + ?Sized> MmuOps for &T {
    fn switch_mm(&self, prev: Option<&MmContext>, next: Option<&MmContext>, thread: Tid) {
        (**self).switch_mm(prev, next, thread)
    }

    fn finish_post_lock_switch(&self) {
        (**self).finish_post_lock_switch()
    }

    fn enter_lazy_tlb(&self, mm: &MmContext, thread: Tid) {
        (**self).enter_lazy_tlb(mm, thread)
    }

    fn full_barrier(&self, site: BarrierSite) {
        (**self).full_barrier(site)
    }
}

impl<T: MmuOps + ?Sized> MmuOps for Arc<T> {
    fn switch_mm(&self, prev: Option<&MmContext>, next: Option<&MmContext>, thread: Tid) {
        (**self).switch_mm(prev, next, thread)
    }

    fn finish_post_lock_switch(&self) {
        (**self).finish_post_lock_switch()
    }

    fn enter_lazy_tlb(&self, mm: &MmContext, thread: Tid) {
        (**self).enter_lazy_tlb(mm, thread)
    }

    fn full_barrier(&self, site: BarrierSite) {
        (**self).full_barrier(site)
    }
}

/// Collaborator for targets without per-address-space hardware state.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMmu;

impl MmuOps for NoopMmu {
    fn switch_mm(&self, _prev: Option<&MmContext>, _next: Option<&MmContext>, _thread: Tid) {}
}
