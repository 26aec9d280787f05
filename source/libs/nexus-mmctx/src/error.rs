// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Caller-contract violations and membarrier errors
//! OWNERS: @kernel-mm-team
//! PUBLIC API: ContractViolation, MembarrierError
//! INVARIANTS: Attach/detach never fail; violations are reported and the call becomes a no-op

/// Misuse of the attach/detach protocol by the calling thread.
///
/// These are programming defects. The offending call logs a warning and returns without
/// touching the binding or the reference ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ContractViolation {
    /// A user thread tried to attach to or detach from a borrowed address space.
    #[error("only kernel threads may borrow an address space")]
    NotKernelThread,
    /// Detach or RSS accounting without a bound context.
    #[error("thread is not attached to an address space")]
    NotAttached,
    /// Lazy context teardown while the thread is still bound.
    #[error("thread is still attached to an address space")]
    StillAttached,
}

impl ContractViolation {
    pub(crate) const fn bit(self) -> u8 {
        match self {
            ContractViolation::NotKernelThread => 1 << 0,
            ContractViolation::NotAttached => 1 << 1,
            ContractViolation::StillAttached => 1 << 2,
        }
    }
}

/// Errors returned by membarrier scans.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MembarrierError {
    /// The context never registered for the requested expedited command.
    #[error("address space is not registered for expedited membarrier")]
    NotRegistered,
}
