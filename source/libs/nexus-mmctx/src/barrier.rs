// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Barrier placement for the membarrier visibility contract
//! OWNERS: @kernel-mm-team
//! PUBLIC API: full(), BarrierSite
//! INVARIANTS: Every binding store is followed by a full barrier before user memory is
//!             touched; every binding clear is preceded by one
//!
//! The membarrier scanner reads a thread's binding without the task lock. It may skip a
//! thread it sees as unbound, so:
//!
//! - after storing a binding, the thread must issue a full barrier before its first
//!   user-memory access, otherwise a scan running concurrently could miss it;
//! - before clearing a binding, the thread must issue a full barrier so its user-memory
//!   accesses are globally visible by the time a scan can see "unbound".
//!
//! Acquiring a spin lock is only an acquire operation and releasing a context reference
//! is not guaranteed to fence, so neither is relied upon. Each site issues its own
//! barrier through [`crate::MmuOps::full_barrier`].

use core::sync::atomic::{fence, Ordering};

/// Full memory barrier visible to every CPU.
#[inline]
pub fn full() {
    fence(Ordering::SeqCst);
}

/// Call sites that must emit a full barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BarrierSite {
    /// Attach installed a different context; issued after the lock is dropped and before
    /// the previous context is released.
    AttachSwitched,
    /// Attach found the context already retained; no reference was released, so this
    /// barrier is the only one on the path.
    AttachReused,
    /// Detach, after taking the task lock and before the binding is cleared.
    BeforeClear,
    /// Retained context dropped at thread teardown, before the grab is released.
    LazyDrop,
}
