// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-thread tunables for address-space borrowing
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Config, Config::DEFAULT

/// Tunables applied to a single [`crate::KThread`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Number of cached RSS updates after which the thread flushes them into the bound
    /// context without waiting for detach. Zero disables the early flush.
    pub rss_sync_threshold: u32,
    /// Report each kind of caller-contract violation only once per thread.
    pub warn_once: bool,
}

impl Config {
    /// Defaults matching the kernel build.
    pub const DEFAULT: Config = Config { rss_sync_threshold: 64, warn_once: true };

    /// Returns a copy with a different RSS flush threshold.
    pub const fn with_rss_sync_threshold(mut self, threshold: u32) -> Self {
        self.rss_sync_threshold = threshold;
        self
    }

    /// Returns a copy that reports every violation instead of the first of each kind.
    pub const fn warn_always(mut self) -> Self {
        self.warn_once = false;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}
