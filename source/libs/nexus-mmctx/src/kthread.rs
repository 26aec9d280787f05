// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Attach/detach of a kernel thread to a borrowed address space
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/attach_detach.rs (scenario, proptest, ordering)
//! PUBLIC API: KThread (attach/detach/drop_lazy_mm/add_rss), ThreadObserver, Tid
//! DEPENDS_ON: lazy::LazyMmSlot, ops::MmuOps, barrier::BarrierSite, rss::RssCache
//! INVARIANTS: Binding implies the slot holds the same context; binding stores happen
//!             under the task lock; only the owning KThread mutates its binding
//!
//! Each thread has two views of its address space:
//!
//! - the *binding* (`mm`): the context it currently works on behalf of. Membarrier scans
//!   read it from other CPUs without the task lock;
//! - the *retained load* (`active_mm`): the context whose mappings are still loaded. It
//!   survives [`KThread::detach`] so that re-attaching the same context skips the remap and
//!   the reference churn.
//!
//! `KThread` is the owner handle. It is neither `Clone` nor `Sync` and its mutators take
//! `&mut self`, so only the thread that owns it can attach or detach.

use alloc::sync::{Arc, Weak};
use core::cell::Cell;
use core::fmt;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use log::{debug, trace, warn};
use spin::Mutex;

use crate::barrier::BarrierSite;
use crate::config::Config;
use crate::context::{ContextId, MmContext};
use crate::error::ContractViolation;
use crate::lazy::LazyMmSlot;
use crate::membarrier::MembarrierState;
use crate::ops::MmuOps;
use crate::rss::{RssCache, RssCounter};
use crate::LOG_TARGET;

static NEXT_TID: AtomicU32 = AtomicU32::new(1);

/// Thread identifier used in logs and membarrier scan results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(u32);

impl Tid {
    fn next() -> Self {
        Self(NEXT_TID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw identifier value.
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

struct ThreadMm {
    tid: Tid,
    kernel: bool,
    /// Logical binding. Stored only with `active_mm` locked; observers load it lock-free
    /// and compare addresses, never dereference.
    mm: AtomicPtr<MmContext>,
    /// Membarrier state of the bound context, as seen by global scans.
    membarrier: AtomicU32,
    /// Task lock and retained-load slot.
    active_mm: Mutex<LazyMmSlot>,
}

impl ThreadMm {
    fn new(kernel: bool) -> Self {
        Self {
            tid: Tid::next(),
            kernel,
            mm: AtomicPtr::new(ptr::null_mut()),
            membarrier: AtomicU32::new(0),
            active_mm: Mutex::new(LazyMmSlot::empty()),
        }
    }

    fn is_bound(&self) -> bool {
        !self.mm.load(Ordering::Acquire).is_null()
    }

    fn is_bound_to(&self, mm: &MmContext) -> bool {
        ptr::eq(self.mm.load(Ordering::Acquire).cast_const(), mm)
    }

    /// Stores the binding and mirrors the context's membarrier state. Caller holds the
    /// task lock.
    fn publish(&self, mm: Option<&Arc<MmContext>>) {
        let raw = mm.map_or(ptr::null_mut(), MmContext::ptr);
        self.mm.store(raw, Ordering::Release);
        let state = mm.map_or(0, |mm| mm.membarrier_state().bits());
        self.membarrier.store(state, Ordering::Relaxed);
    }
}

/// Owner handle of a thread's address-space binding.
pub struct KThread<O: MmuOps> {
    shared: Arc<ThreadMm>,
    ops: O,
    config: Config,
    rss: RssCache,
    reported: u8,
    violations: u32,
    _not_sync: PhantomData<Cell<()>>,
}

impl<O: MmuOps> KThread<O> {
    /// Creates an unbound kernel thread with default tunables.
    pub fn new_kernel(ops: O) -> Self {
        Self::with_config(ops, Config::DEFAULT)
    }

    /// Creates an unbound kernel thread.
    pub fn with_config(ops: O, config: Config) -> Self {
        Self::build(ops, config, true)
    }

    /// Creates a user thread permanently bound to its own context `mm`.
    pub fn new_user(ops: O, mm: &Arc<MmContext>) -> Self {
        let thread = Self::build(ops, Config::DEFAULT, false);
        let previous = {
            let mut active = thread.shared.active_mm.lock();
            let previous = active.install(mm);
            thread.shared.publish(Some(mm));
            previous
        };
        debug_assert!(previous.is_none());
        if let Some(previous) = previous {
            previous.release();
        }
        thread
    }

    fn build(ops: O, config: Config, kernel: bool) -> Self {
        Self {
            shared: Arc::new(ThreadMm::new(kernel)),
            ops,
            config,
            rss: RssCache::new(),
            reported: 0,
            violations: 0,
            _not_sync: PhantomData,
        }
    }

    /// Identifier of this thread.
    pub fn tid(&self) -> Tid {
        self.shared.tid
    }

    /// Read-only view for scanners and other threads.
    pub fn observer(&self) -> ThreadObserver {
        ThreadObserver { shared: Arc::clone(&self.shared) }
    }

    /// True while logically bound.
    pub fn is_bound(&self) -> bool {
        self.shared.is_bound()
    }

    /// Context this thread is logically bound to.
    pub fn current_mm(&self) -> Option<Arc<MmContext>> {
        let active = self.shared.active_mm.lock();
        if self.shared.is_bound() {
            active.get().cloned()
        } else {
            None
        }
    }

    /// Context whose mappings are still loaded, bound or not.
    pub fn retained_mm(&self) -> Option<Arc<MmContext>> {
        self.shared.active_mm.lock().get().cloned()
    }

    /// RSS updates not yet flushed to the bound context.
    pub fn pending_rss(&self) -> &RssCache {
        &self.rss
    }

    /// Number of caller-contract violations seen so far.
    pub fn contract_violations(&self) -> u32 {
        self.violations
    }

    /// Checks that [`Self::attach`] is allowed.
    pub fn check_attach(&self) -> Result<(), ContractViolation> {
        if !self.shared.kernel {
            return Err(ContractViolation::NotKernelThread);
        }
        Ok(())
    }

    /// Checks that [`Self::detach`] is allowed.
    pub fn check_detach(&self) -> Result<(), ContractViolation> {
        self.check_attach()?;
        if !self.shared.is_bound() {
            return Err(ContractViolation::NotAttached);
        }
        Ok(())
    }

    /// Binds this thread to `mm` and loads its mappings.
    ///
    /// A context already in the retained slot is reused: no grab is taken and no
    /// reference is released, and an explicit full barrier stands in for the one the
    /// release would have provided.
    pub fn attach(&mut self, mm: &Arc<MmContext>) {
        if let Err(violation) = self.check_attach() {
            self.report(violation);
            return;
        }
        let tid = self.shared.tid;

        let mut active = self.shared.active_mm.lock();
        let reused = active.holds(mm);
        if !reused && self.shared.is_bound() {
            // Bound to another context: the old binding is about to disappear from
            // scans, same as on detach.
            self.ops.full_barrier(BarrierSite::BeforeClear);
            if let Some(cur) = active.get() {
                self.rss.flush_into(cur.rss());
            }
        }
        let replaced = if reused { None } else { active.install(mm) };
        self.shared.publish(Some(mm));
        let prev = if reused {
            Some(&**mm)
        } else {
            replaced.as_ref().map(|grab| &**grab.context())
        };
        self.ops.switch_mm(prev, Some(&**mm), tid);
        drop(active);

        if reused {
            self.ops.full_barrier(BarrierSite::AttachReused);
            trace!(target: LOG_TARGET, "{}: attach {} (retained)", tid, mm.id());
            return;
        }

        self.ops.finish_post_lock_switch();
        self.ops.full_barrier(BarrierSite::AttachSwitched);
        match replaced {
            Some(previous) => {
                let previous_id = previous.context().id();
                let last = previous.release();
                trace!(
                    target: LOG_TARGET,
                    "{}: attach {} (switched from {}{})",
                    tid,
                    mm.id(),
                    previous_id,
                    if last { ", last grab" } else { "" }
                );
            }
            None => trace!(target: LOG_TARGET, "{}: attach {} (from kernel mm)", tid, mm.id()),
        }
    }

    /// Clears the binding. The mappings stay loaded and the grab is kept.
    pub fn detach(&mut self) {
        if let Err(violation) = self.check_detach() {
            self.report(violation);
            return;
        }
        self.unbind();
    }

    fn unbind(&mut self) {
        let tid = self.shared.tid;
        let active = self.shared.active_mm.lock();
        self.ops.full_barrier(BarrierSite::BeforeClear);
        let cur = active.get();
        if let Some(cur) = cur {
            self.rss.flush_into(cur.rss());
        }
        self.shared.publish(None);
        if let Some(cur) = cur {
            self.ops.enter_lazy_tlb(cur, tid);
            trace!(target: LOG_TARGET, "{}: detach {} (still loaded)", tid, cur.id());
        }
    }

    /// Switches an unbound thread to the kernel mappings and releases the retained
    /// context. Called on thread teardown.
    pub fn drop_lazy_mm(&mut self) {
        if self.shared.is_bound() {
            self.report(ContractViolation::StillAttached);
            return;
        }
        let tid = self.shared.tid;
        let mut active = self.shared.active_mm.lock();
        let Some(previous) = active.take() else {
            return;
        };
        self.ops.switch_mm(Some(&**previous.context()), None, tid);
        drop(active);

        self.ops.finish_post_lock_switch();
        self.ops.full_barrier(BarrierSite::LazyDrop);
        let previous_id = previous.context().id();
        let last = previous.release();
        debug!(
            target: LOG_TARGET,
            "{}: dropped retained {}{}",
            tid,
            previous_id,
            if last { " (last grab)" } else { "" }
        );
    }

    /// Accounts `delta` pages of `counter` against the bound context.
    ///
    /// Updates are cached per thread and flushed on detach, or earlier once
    /// [`Config::rss_sync_threshold`] updates have accumulated.
    pub fn add_rss(&mut self, counter: RssCounter, delta: i64) {
        if !self.shared.is_bound() {
            self.report(ContractViolation::NotAttached);
            return;
        }
        let events = self.rss.add(counter, delta);
        let threshold = self.config.rss_sync_threshold;
        if threshold != 0 && events >= threshold {
            self.sync_rss();
        }
    }

    /// Flushes cached RSS updates into the bound context.
    pub fn sync_rss(&mut self) {
        let active = self.shared.active_mm.lock();
        if !self.shared.is_bound() {
            return;
        }
        if let Some(cur) = active.get() {
            self.rss.flush_into(cur.rss());
        }
    }

    /// Counts a violation. Returns true when it was logged.
    fn report(&mut self, violation: ContractViolation) -> bool {
        self.violations = self.violations.saturating_add(1);
        let first = self.reported & violation.bit() == 0;
        self.reported |= violation.bit();
        if first || !self.config.warn_once {
            warn!(target: LOG_TARGET, "{}: {}", self.shared.tid, violation);
            return true;
        }
        false
    }
}

impl<O: MmuOps> Drop for KThread<O> {
    fn drop(&mut self) {
        if self.shared.is_bound() {
            self.unbind();
        }
        self.drop_lazy_mm();
    }
}

impl<O: MmuOps> fmt::Debug for KThread<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KThread")
            .field("tid", &self.shared.tid)
            .field("kernel", &self.shared.kernel)
            .field("bound", &self.shared.is_bound())
            .field("violations", &self.violations)
            .finish()
    }
}

/// Read-only view of another thread's binding.
#[derive(Clone)]
pub struct ThreadObserver {
    shared: Arc<ThreadMm>,
}

impl ThreadObserver {
    /// Identifier of the observed thread.
    pub fn tid(&self) -> Tid {
        self.shared.tid
    }

    /// Lock-free read of the binding.
    pub fn is_bound(&self) -> bool {
        self.shared.is_bound()
    }

    /// Lock-free check whether the thread is bound to `mm`.
    pub fn is_bound_to(&self, mm: &MmContext) -> bool {
        self.shared.is_bound_to(mm)
    }

    /// Membarrier state of the bound context, empty when unbound.
    pub fn membarrier_state(&self) -> MembarrierState {
        MembarrierState::from_bits_truncate(self.shared.membarrier.load(Ordering::Relaxed))
    }

    /// Context owned by a user thread. Kernel threads only borrow address spaces and
    /// report none.
    pub fn get_task_mm(&self) -> Option<Arc<MmContext>> {
        if self.shared.kernel {
            return None;
        }
        let active = self.shared.active_mm.lock();
        if self.shared.is_bound() {
            active.get().cloned()
        } else {
            None
        }
    }

    /// Bound context, read under the task lock.
    pub fn current_context_id(&self) -> Option<ContextId> {
        let active = self.shared.active_mm.lock();
        if self.shared.is_bound() {
            active.id()
        } else {
            None
        }
    }

    /// Retained context, read under the task lock.
    pub fn retained_context_id(&self) -> Option<ContextId> {
        self.shared.active_mm.lock().id()
    }

    /// Reloads the membarrier state mirror from the bound context. With `only` set,
    /// threads bound to another context are skipped. Returns true if the mirror was
    /// rewritten.
    ///
    /// Runs under the task lock, so it either precedes a concurrent attach (which then
    /// reads the new state itself) or sees the binding that attach published.
    pub(crate) fn sync_membarrier_state(&self, only: Option<&MmContext>) -> bool {
        let active = self.shared.active_mm.lock();
        let Some(cur) = active.get() else {
            return false;
        };
        if !self.shared.is_bound() || only.is_some_and(|mm| !ptr::eq(&**cur, mm)) {
            return false;
        }
        self.shared.membarrier.store(cur.membarrier_state().bits(), Ordering::Relaxed);
        true
    }

    pub(crate) fn downgrade(&self) -> WeakObserver {
        WeakObserver { tid: self.shared.tid, shared: Arc::downgrade(&self.shared) }
    }
}

/// Registry entry that does not keep an exited thread alive.
pub(crate) struct WeakObserver {
    tid: Tid,
    shared: Weak<ThreadMm>,
}

impl WeakObserver {
    pub(crate) fn tid(&self) -> Tid {
        self.tid
    }

    pub(crate) fn upgrade(&self) -> Option<ThreadObserver> {
        self.shared.upgrade().map(|shared| ThreadObserver { shared })
    }

    pub(crate) fn is_live(&self) -> bool {
        self.shared.strong_count() > 0
    }
}

impl fmt::Debug for ThreadObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadObserver")
            .field("tid", &self.shared.tid)
            .field("bound", &self.shared.is_bound())
            .finish()
    }
}

static_assertions::assert_impl_all!(ThreadObserver: Send, Sync, Clone);
static_assertions::assert_impl_all!(KThread<crate::ops::NoopMmu>: Send);
static_assertions::assert_not_impl_any!(KThread<crate::ops::NoopMmu>: Sync, Clone);
