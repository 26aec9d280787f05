// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Retained-load slot owning at most one grab on a context
//! OWNERS: @kernel-mm-team
//! PUBLIC API: LazyMmSlot (install/take/holds), Grab (release)
//! INVARIANTS: A grab is taken exactly when a new context enters the slot and released
//!             exactly once after it leaves; dropping a Grab never releases it
//!
//! The slot outlives the logical binding on purpose, so the grab cannot be tied to a
//! scope. Whatever leaves the slot comes back as a [`Grab`] that the caller must hand to
//! [`Grab::release`], normally after the task lock has been dropped.

use alloc::sync::Arc;
use core::fmt;

use crate::context::{ContextId, MmContext};

/// One counted reference on a context, detached from the slot that held it.
#[must_use = "a grab is only released by Grab::release"]
pub struct Grab {
    mm: Arc<MmContext>,
}

impl Grab {
    fn acquire(mm: &Arc<MmContext>) -> Self {
        mm.grab();
        Self { mm: Arc::clone(mm) }
    }

    /// Context this grab refers to.
    pub fn context(&self) -> &Arc<MmContext> {
        &self.mm
    }

    /// Releases the grab. Returns true when it was the last one on the context; the
    /// context itself is freed once its owner's handles are gone too.
    pub fn release(self) -> bool {
        let last = self.mm.drop_grab();
        drop(self.mm);
        last
    }
}

impl fmt::Debug for Grab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Grab").field(&self.mm.id()).finish()
    }
}

/// Context whose mappings remain loaded on a thread.
#[derive(Debug, Default)]
pub struct LazyMmSlot {
    held: Option<Grab>,
}

impl LazyMmSlot {
    /// Creates an empty slot (kernel mappings only).
    pub const fn empty() -> Self {
        Self { held: None }
    }

    /// Retained context, if any.
    pub fn get(&self) -> Option<&Arc<MmContext>> {
        self.held.as_ref().map(Grab::context)
    }

    /// Identity of the retained context, if any.
    pub fn id(&self) -> Option<ContextId> {
        self.get().map(|mm| mm.id())
    }

    /// True when `mm` is the retained context.
    pub fn holds(&self, mm: &MmContext) -> bool {
        self.get().is_some_and(|held| core::ptr::eq(Arc::as_ptr(held), mm))
    }

    /// Grabs `mm`, retains it and returns the previous occupant's grab.
    ///
    /// Installing the context already held would grab it twice; callers check
    /// [`Self::holds`] first.
    pub fn install(&mut self, mm: &Arc<MmContext>) -> Option<Grab> {
        debug_assert!(!self.holds(mm), "{} installed twice", mm.id());
        self.held.replace(Grab::acquire(mm))
    }

    /// Empties the slot and returns its grab.
    pub fn take(&mut self) -> Option<Grab> {
        self.held.take()
    }
}
