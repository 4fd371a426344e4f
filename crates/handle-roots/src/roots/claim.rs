//! Once-per-pass execution guards for root groups.
//!
//! Every root group of an iterator is wrapped in a [`ClaimOnce`]. A
//! `SerialOnly` group is executed by exactly one of the workers sharing the
//! iterator: the first to win a CAS on the claim flag. A `ParallelSafe` group
//! is executed by every worker; the group's collaborator partitions the work
//! internally, and the flag only records that some invocation completed.

#![allow(missing_docs)]
#![allow(clippy::must_use_candidate)]

use crossbeam::utils::CachePadded;

#[cfg(loom)]
use loom::sync::atomic::{AtomicBool, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether a root group's traversal may be entered by several workers at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// The traversal is not safe for concurrent entry; run it once.
    SerialOnly,
    /// The traversal partitions its work across concurrent callers.
    ParallelSafe,
}

/// Observable state of a [`ClaimOnce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Unclaimed,
    Claimed,
    Pending,
    Completed,
}

/// Execution guard for one root group within one iterator instance.
///
/// A guard is created with its iterator and must not be reused for another
/// pass.
pub struct ClaimOnce {
    name: &'static str,
    concurrency: Concurrency,
    /// `claimed` for serial groups, `completed` for parallel ones.
    flag: CachePadded<AtomicBool>,
}

impl ClaimOnce {
    pub fn new(name: &'static str, concurrency: Concurrency) -> Self {
        Self {
            name,
            concurrency,
            flag: CachePadded::new(AtomicBool::new(false)),
        }
    }

    pub fn serial(name: &'static str) -> Self {
        Self::new(name, Concurrency::SerialOnly)
    }

    pub fn parallel(name: &'static str) -> Self {
        Self::new(name, Concurrency::ParallelSafe)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    /// Run `f` if this caller is entitled to. Returns whether `f` ran.
    ///
    /// Serial guards run `f` for the first caller only. Parallel guards run it
    /// for every caller.
    pub fn run(&self, f: impl FnOnce()) -> bool {
        match self.concurrency {
            Concurrency::SerialOnly => {
                if self.flag.load(Ordering::Acquire)
                    || self
                        .flag
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                {
                    return false;
                }
                self.execute(f);
                true
            }
            Concurrency::ParallelSafe => {
                self.execute(f);
                if !self.flag.load(Ordering::Relaxed) {
                    self.flag.store(true, Ordering::Release);
                }
                true
            }
        }
    }

    #[inline]
    fn execute(&self, f: impl FnOnce()) {
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::trace_root_group(self.name);
        f();
    }

    pub fn state(&self) -> ClaimState {
        let set = self.flag.load(Ordering::Acquire);
        match (self.concurrency, set) {
            (Concurrency::SerialOnly, false) => ClaimState::Unclaimed,
            (Concurrency::SerialOnly, true) => ClaimState::Claimed,
            (Concurrency::ParallelSafe, false) => ClaimState::Pending,
            (Concurrency::ParallelSafe, true) => ClaimState::Completed,
        }
    }
}

impl std::fmt::Debug for ClaimOnce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimOnce")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
