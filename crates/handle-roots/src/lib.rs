//! Native handle table and claim-based root scanning for garbage collectors.
//!
//! `handle-roots` provides the two pieces of a managed runtime that sit
//! between native code and the collector:
//!
//! - a **handle table**: native code refers to managed objects through
//!   handles instead of raw references, so the collector can find, relocate
//!   and clear those references;
//! - **root iterators**: a pause constructs one iterator, any number of GC
//!   workers share it, and every root category is visited exactly once.
//!
//! # Handles
//!
//! - *Local* handles belong to one attached thread and are released in bulk
//!   when a local frame is popped or the thread detaches.
//! - *Global* handles live until explicitly destroyed.
//! - *Weak-global* handles do not keep their referent alive; the collector
//!   clears them when it dies.
//!
//! ```
//! use std::sync::Arc;
//! use handle_roots::{HandleTable, ObjectRef, ThreadRegistry};
//!
//! let registry = ThreadRegistry::new(Arc::new(HandleTable::default()));
//! let thread = registry.attach();
//!
//! let obj = ObjectRef::new(0x1000);
//! let local = thread.make_local(obj);
//! let global = registry.handles().make_global(obj);
//!
//! assert_eq!(registry.handles().resolve(local), obj);
//! assert_eq!(registry.handles().resolve(global), obj);
//!
//! registry.handles().destroy_global(global);
//! ```
//!
//! # Root scanning
//!
//! ```
//! use std::sync::Arc;
//! use handle_roots::{
//!     HandleTable, ObjectRef, RootSet, RootSlot, StrongRootIterator, ThreadRegistry,
//! };
//!
//! let registry = Arc::new(ThreadRegistry::new(Arc::new(HandleTable::default())));
//! let global = registry.handles().make_global(ObjectRef::new(0x2000));
//! let roots = RootSet::new(Arc::clone(&registry));
//!
//! let safepoint = registry.begin_safepoint();
//! let iter = StrongRootIterator::new(&roots, &safepoint);
//! let mut visited = Vec::new();
//! iter.oops_do(&mut |slot: &RootSlot| visited.push(slot.load()), false);
//! drop(iter);
//!
//! assert_eq!(visited, vec![ObjectRef::new(0x2000)]);
//! # registry.handles().destroy_global(global);
//! ```
//!
//! # Thread Safety
//!
//! The handle table, the thread registry and the iterators are `Send + Sync`.
//! Global and weak-global handles may be created
//! and destroyed from any thread, including while a concurrent weak scan is in
//! progress. Local handles are created and destroyed by their owning thread.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod arena;
pub mod config;
pub mod handles;
pub mod roots;
pub mod slot;
pub mod storage;
pub mod threads;
mod tracing;

// Re-export public API
pub use config::{AllocFailStrategy, HandleTableConfig, RootsConfig};
pub use handles::{Handle, HandleTable, HandleType, LocalFrame, RawHandle};
pub use roots::{
    ClaimOnce, ClaimState, Concurrency, ConcurrentWeakRootIterator, NoRoots, RootSet,
    StrongRootIterator, StrongRootSource, ThreadRootIterator, WeakRootIterator, WeakRootSource,
};
pub use slot::{AlwaysAlive, IsAlive, ObjectRef, RootSlot, RootVisitor};
pub use storage::{ParState, SlotStorage};
pub use threads::{ClaimParity, Safepoint, StackRoots, ThreadContext, ThreadRegistry};

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use crate::{IsAlive, ObjectRef, RootSlot, RootVisitor, StrongRootSource, WeakRootSource};

    /// Object reference `n`, aligned like a heap address.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero.
    pub fn obj(n: usize) -> ObjectRef {
        ObjectRef::new(n * 16).unwrap_or_else(|| panic!("object {n} is null"))
    }

    /// Visitor counting how often each slot address is visited.
    #[derive(Debug, Default)]
    pub struct RecordingVisitor {
        pub visits: HashMap<usize, usize>,
    }

    impl RecordingVisitor {
        pub fn count(&self, slot: &RootSlot) -> usize {
            self.visits.get(&slot.address()).copied().unwrap_or(0)
        }

        pub fn total(&self) -> usize {
            self.visits.values().sum()
        }
    }

    impl RootVisitor for RecordingVisitor {
        fn visit(&mut self, slot: &RootSlot) {
            *self.visits.entry(slot.address()).or_default() += 1;
        }
    }

    /// Visit counts merged from many GC workers.
    #[derive(Debug, Default)]
    pub struct SharedVisits(Mutex<RecordingVisitor>);

    impl SharedVisits {
        /// Run `visit` with a worker-local visitor and merge its counts.
        pub fn record(&self, visit: impl FnOnce(&mut dyn RootVisitor)) {
            let mut local = RecordingVisitor::default();
            visit(&mut local);
            let mut visits = self.0.lock();
            for (address, n) in local.visits {
                *visits.visits.entry(address).or_default() += n;
            }
        }

        pub fn count(&self, slot: &RootSlot) -> usize {
            self.0.lock().count(slot)
        }

        pub fn total(&self) -> usize {
            self.0.lock().total()
        }

        /// Number of distinct slots visited.
        pub fn distinct(&self) -> usize {
            self.0.lock().visits.len()
        }

        /// Whether no slot was visited.
        pub fn is_empty(&self) -> bool {
            self.0.lock().visits.is_empty()
        }

        pub fn all_visited_once(&self) -> bool {
            self.0.lock().visits.values().all(|&n| n == 1)
        }
    }

    /// Root source counting calls to each entry point.
    #[derive(Debug, Default)]
    pub struct CountingSource {
        pub calls: AtomicUsize,
        pub prologues: AtomicUsize,
        pub epilogues: AtomicUsize,
    }

    impl CountingSource {
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn prologues(&self) -> usize {
            self.prologues.load(Ordering::SeqCst)
        }

        pub fn epilogues(&self) -> usize {
            self.epilogues.load(Ordering::SeqCst)
        }
    }

    impl StrongRootSource for CountingSource {
        fn oops_do(&self, _visitor: &mut dyn RootVisitor) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }

        fn gc_prologue(&self) {
            self.prologues.fetch_add(1, Ordering::SeqCst);
        }

        fn gc_epilogue(&self) {
            self.epilogues.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl WeakRootSource for CountingSource {
        fn unlink_or_oops_do(&self, _is_alive: &dyn IsAlive, _visitor: &mut dyn RootVisitor) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }

        fn gc_prologue(&self) {
            self.prologues.fetch_add(1, Ordering::SeqCst);
        }

        fn gc_epilogue(&self) {
            self.epilogues.fetch_add(1, Ordering::SeqCst);
        }
    }
}
