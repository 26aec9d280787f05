// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel threads temporarily borrowing a process address space
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + tests/attach_detach.rs, tests/membarrier_scan.rs
//! PUBLIC API: KThread (attach/detach/drop_lazy_mm), ThreadObserver, MmContext, Membarrier, MmuOps
//! DEPENDS_ON: spin::Mutex (task lock), log, bitflags, thiserror; parking_lot (backend-host)
//! INVARIANTS: Binding implies retained load; one grab per retained context; full barrier
//!             after every binding store and before every binding clear
//!
//! A worker thread calls [`KThread::attach`] to operate on another process's user
//! memory and [`KThread::detach`] when it is done. Detaching only clears the logical
//! binding: the mappings stay loaded and the thread keeps its grab on the context, so
//! re-attaching to the same context costs neither a reference nor a remap.
//!
//! The membarrier scanner ([`Membarrier`]) reads each thread's binding without taking
//! the thread lock. Attach and detach emit the barriers that scan depends on; callers
//! never place them.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

extern crate alloc;

pub mod barrier;
pub mod config;
pub mod context;
pub mod error;
pub mod kthread;
pub mod lazy;
pub mod membarrier;
pub mod ops;
pub mod rss;

#[cfg(feature = "backend-host")]
pub mod host;

pub use barrier::BarrierSite;
pub use config::Config;
pub use context::{ContextId, MmContext};
pub use error::{ContractViolation, MembarrierError};
pub use kthread::{KThread, ThreadObserver, Tid};
pub use lazy::{Grab, LazyMmSlot};
pub use membarrier::{Membarrier, MembarrierState};
pub use ops::{MmuOps, NoopMmu};
pub use rss::{RssCache, RssCounter};

#[cfg(feature = "backend-host")]
pub use host::{MmuEvent, RecordingMmu};

/// Log target used by every record emitted from this crate.
pub const LOG_TARGET: &str = "mmctx";
