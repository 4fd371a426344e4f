//! Attached threads, their local handles, and thread claiming.
//!
//! Every thread that creates local handles attaches to a [`ThreadRegistry`]
//! and receives a [`ThreadContext`]. At a pause, GC workers share the
//! thread list through [`ThreadRegistry::possibly_parallel_oops_do`]: each
//! worker claims a thread by moving its parity to the current
//! [`ClaimParity`] value with a CAS, so each thread is scanned once per pause
//! without a lock.

#![allow(missing_docs)]
#![allow(clippy::must_use_candidate)]

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::handles::local_handles::HandleBlockChain;
use crate::handles::{Handle, HandleTable, SlotRef};
use crate::slot::{ObjectRef, RootVisitor};

// ============================================================================
// ClaimParity
// ============================================================================

/// Alternating generation token for thread claiming.
///
/// Threads start at parity 0, which is never current, so a fresh thread is
/// always claimable. [`ClaimParity::advance`] cycles through 1 and 2.
#[derive(Debug, Default)]
pub struct ClaimParity(AtomicU32);

impl ClaimParity {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub fn current(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Move to the next parity and return it.
    pub fn advance(&self) -> u32 {
        let next = if self.current() == 2 { 1 } else { self.current() + 1 };
        self.0.store(next, Ordering::Release);
        next
    }
}

// ============================================================================
// Safepoint
// ============================================================================

/// Proof that mutator threads are stopped.
///
/// Obtained from [`ThreadRegistry::begin_safepoint`]; the paused root
/// iterators require a reference to one. Dropping it ends the safepoint.
pub struct Safepoint<'a> {
    registry: &'a ThreadRegistry,
}

impl Safepoint<'_> {
    pub fn registry(&self) -> &ThreadRegistry {
        self.registry
    }
}

impl Drop for Safepoint<'_> {
    fn drop(&mut self) {
        self.registry.at_safepoint.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Safepoint<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Safepoint").finish_non_exhaustive()
    }
}

/// Stack-walking collaborator: reports the roots held in a thread's frames.
pub trait StackRoots: Send + Sync {
    fn oops_do(&self, thread: &ThreadContext, visitor: &mut dyn RootVisitor);
}

// ============================================================================
// ThreadContext
// ============================================================================

/// Identifier of an attached thread.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ContextId(u64);

/// Per-thread handle state.
///
/// Local handle operations are made by the owning thread. The chain mutex is
/// otherwise only taken by a GC worker while the owner is stopped, so it is
/// uncontended.
pub struct ThreadContext {
    id: ContextId,
    table: Arc<HandleTable>,
    oops_do_parity: AtomicU32,
    /// `None` once detached.
    active_handles: Mutex<Option<HandleBlockChain>>,
}

impl ThreadContext {
    fn new(id: ContextId, table: Arc<HandleTable>) -> Self {
        let chain = HandleBlockChain::new(table.block_pool());
        Self {
            id,
            table,
            oops_do_parity: AtomicU32::new(0),
            active_handles: Mutex::new(Some(chain)),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn handles(&self) -> &HandleTable {
        &self.table
    }

    #[track_caller]
    fn with_chain<R>(&self, f: impl FnOnce(&mut HandleBlockChain) -> R) -> R {
        let mut guard = self.active_handles.lock();
        let chain = guard
            .as_mut()
            .unwrap_or_else(|| panic!("{:?} used after detach", self.id));
        f(chain)
    }

    /// Create a local handle for `obj` in the current frame.
    ///
    /// A null reference yields a null handle and consumes no slot.
    pub fn make_local(&self, obj: Option<ObjectRef>) -> Option<Handle> {
        let obj = obj?;
        let pool = self.table.block_pool();
        let index = self.with_chain(|chain| chain.allocate_handle(pool, obj));
        Some(Handle::Strong(SlotRef::Local(index)))
    }

    /// Destroy a local handle. Its slot is reused after the next free list
    /// rebuild.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is not a local handle, and in debug builds if it was
    /// already destroyed or belongs to another thread.
    #[track_caller]
    pub fn destroy_local(&self, handle: Option<Handle>) {
        let Some(handle) = handle else {
            return;
        };
        let SlotRef::Local(index) = handle.strong_ref() else {
            panic!("invalid local handle {handle:?}");
        };
        debug_assert!(
            self.is_local_handle(handle),
            "{handle:?} is not a local handle of {:?}",
            self.id
        );
        if let Some(slot) = self.table.block_pool().slot(index) {
            debug_assert!(!slot.is_null(), "local handle {handle:?} destroyed twice");
            slot.clear();
        }
    }

    /// Whether `handle` lives in any frame of this thread's block chain.
    pub fn is_local_handle(&self, handle: Handle) -> bool {
        let Handle::Strong(SlotRef::Local(index)) = handle else {
            return false;
        };
        let pool = self.table.block_pool();
        self.active_handles
            .lock()
            .as_ref()
            .is_some_and(|chain| chain.frames_contain(pool, index))
    }

    /// Record that `capacity` more local handles are planned.
    ///
    /// Returns `false` if `capacity` exceeds the configured maximum.
    #[must_use]
    pub fn ensure_local_capacity(&self, capacity: usize) -> bool {
        if capacity > self.table.config().max_local_capacity {
            return false;
        }
        let pool = self.table.block_pool();
        self.with_chain(|chain| {
            let planned = chain.live_handles(pool) + capacity;
            chain.set_planned_capacity(planned);
        });
        true
    }

    /// Enter a new local frame with room planned for `capacity` handles.
    ///
    /// Returns `false` if `capacity` exceeds the configured maximum.
    #[must_use]
    pub fn push_local_frame(&self, capacity: usize) -> bool {
        if capacity > self.table.config().max_local_capacity {
            return false;
        }
        let pool = self.table.block_pool();
        self.with_chain(|chain| {
            chain.push_frame(pool);
            chain.set_planned_capacity(capacity);
        });
        true
    }

    /// Leave the current local frame, releasing its handles, and return a
    /// handle to `result` in the enclosing frame.
    ///
    /// Popping without a matching push releases nothing.
    pub fn pop_local_frame(&self, result: Option<Handle>) -> Option<Handle> {
        let obj = self.table.resolve(result);
        let pool = self.table.block_pool();
        self.with_chain(|chain| chain.pop_frame(pool));
        self.make_local(obj)
    }

    /// Non-null local handles in the current frame.
    pub fn live_local_handles(&self) -> usize {
        let pool = self.table.block_pool();
        self.with_chain(|chain| chain.live_handles(pool))
    }

    /// Blocks in the current frame's chain.
    pub fn local_chain_length(&self) -> usize {
        self.with_chain(|chain| chain.length())
    }

    pub fn planned_capacity(&self) -> usize {
        self.with_chain(|chain| chain.planned_capacity())
    }

    /// Bytes of handle blocks held by all frames of this thread.
    pub fn local_handle_memory_usage(&self) -> usize {
        self.with_chain(|chain| chain.frames().map(HandleBlockChain::memory_usage).sum())
    }

    /// Claim this thread for the pass with `parity`.
    ///
    /// Exactly one caller per parity value observes `true`.
    pub fn claim_oops_do(&self, parity: u32) -> bool {
        let current = self.oops_do_parity.load(Ordering::Relaxed);
        current != parity
            && self
                .oops_do_parity
                .compare_exchange(current, parity, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    /// Parity of the last pass that claimed this thread.
    pub fn oops_do_parity(&self) -> u32 {
        self.oops_do_parity.load(Ordering::Acquire)
    }

    /// Visit the local handles of every frame of this thread.
    pub fn oops_do(&self, visitor: &mut dyn RootVisitor) {
        if let Some(chain) = self.active_handles.lock().as_ref() {
            chain.oops_do(self.table.block_pool(), visitor);
        }
    }

    fn detach(&self) {
        if let Some(chain) = self.active_handles.lock().take() {
            chain.release(self.table.block_pool());
        }
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("id", &self.id)
            .field("oops_do_parity", &self.oops_do_parity())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ThreadRegistry
// ============================================================================

/// The set of attached threads.
pub struct ThreadRegistry {
    table: Arc<HandleTable>,
    threads: RwLock<Vec<Arc<ThreadContext>>>,
    parity: ClaimParity,
    at_safepoint: AtomicBool,
    next_id: AtomicU64,
    stack_roots: Option<Arc<dyn StackRoots>>,
}

impl ThreadRegistry {
    pub fn new(table: Arc<HandleTable>) -> Self {
        Self {
            table,
            threads: RwLock::new(Vec::new()),
            parity: ClaimParity::new(),
            at_safepoint: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            stack_roots: None,
        }
    }

    /// Install the stack-walking collaborator used by thread root scans.
    #[must_use]
    pub fn with_stack_roots(mut self, stack_roots: Arc<dyn StackRoots>) -> Self {
        self.stack_roots = Some(stack_roots);
        self
    }

    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.table
    }

    /// Attach a new thread and return its context.
    #[track_caller]
    pub fn attach(&self) -> Arc<ThreadContext> {
        debug_assert!(!self.is_at_safepoint(), "attach during safepoint");
        let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let thread = Arc::new(ThreadContext::new(id, Arc::clone(&self.table)));
        self.threads.write().push(Arc::clone(&thread));
        thread
    }

    /// Detach `thread`, returning its handle blocks to the pool.
    #[track_caller]
    pub fn detach(&self, thread: &Arc<ThreadContext>) {
        debug_assert!(!self.is_at_safepoint(), "detach during safepoint");
        self.threads.write().retain(|t| !Arc::ptr_eq(t, thread));
        thread.detach();
    }

    pub fn thread_count(&self) -> usize {
        self.threads.read().len()
    }

    /// Stop-the-world token.
    ///
    /// # Panics
    ///
    /// Panics if a safepoint is already in progress.
    #[track_caller]
    pub fn begin_safepoint(&self) -> Safepoint<'_> {
        let was = self.at_safepoint.swap(true, Ordering::AcqRel);
        assert!(!was, "safepoint already in progress");
        Safepoint { registry: self }
    }

    pub fn is_at_safepoint(&self) -> bool {
        self.at_safepoint.load(Ordering::Acquire)
    }

    pub fn claim_parity(&self) -> &ClaimParity {
        &self.parity
    }

    /// Start a new claiming generation. Called once per root-scanning pause.
    pub fn change_thread_claim_parity(&self) -> u32 {
        self.parity.advance()
    }

    /// Visit the roots of every thread this caller manages to claim.
    ///
    /// Safe to call from many workers at once; each thread is visited by
    /// exactly one of them for a given `parity`.
    pub fn possibly_parallel_oops_do(&self, parity: u32, visitor: &mut dyn RootVisitor) {
        let threads = self.threads.read();
        for thread in threads.iter() {
            if thread.claim_oops_do(parity) {
                thread.oops_do(visitor);
                if let Some(stack_roots) = &self.stack_roots {
                    stack_roots.oops_do(thread, visitor);
                }
            }
        }
    }

    /// Check that the current pass claimed every attached thread.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if some thread still carries an older parity.
    #[track_caller]
    pub fn assert_all_threads_claimed(&self) {
        let parity = self.parity.current();
        for thread in self.threads.read().iter() {
            debug_assert_eq!(
                thread.oops_do_parity(),
                parity,
                "{:?} not claimed in pass with parity {parity}",
                thread.id()
            );
        }
    }

    /// Is `handle` a local handle of any attached thread?
    pub fn is_local_handle_of_any(&self, handle: Handle) -> bool {
        self.threads
            .read()
            .iter()
            .any(|thread| thread.is_local_handle(handle))
    }
}

impl fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("threads", &self.thread_count())
            .field("parity", &self.parity.current())
            .field("at_safepoint", &self.is_at_safepoint())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ThreadRegistry {
        ThreadRegistry::new(Arc::new(HandleTable::default()))
    }

    #[test]
    fn test_parity_alternates() {
        let parity = ClaimParity::new();
        assert_eq!(parity.current(), 0);
        assert_eq!(parity.advance(), 1);
        assert_eq!(parity.advance(), 2);
        assert_eq!(parity.advance(), 1);
    }

    #[test]
    fn test_claim_once_per_parity() {
        let registry = registry();
        let thread = registry.attach();
        let parity = registry.change_thread_claim_parity();

        assert!(thread.claim_oops_do(parity));
        assert!(!thread.claim_oops_do(parity));

        let parity = registry.change_thread_claim_parity();
        assert!(thread.claim_oops_do(parity));
    }

    #[test]
    fn test_safepoint_flag() {
        let registry = registry();
        assert!(!registry.is_at_safepoint());
        {
            let _sp = registry.begin_safepoint();
            assert!(registry.is_at_safepoint());
        }
        assert!(!registry.is_at_safepoint());
    }

    #[test]
    #[should_panic(expected = "safepoint already in progress")]
    fn test_nested_safepoint_panics() {
        let registry = registry();
        let _a = registry.begin_safepoint();
        let _b = registry.begin_safepoint();
    }

    #[test]
    fn test_detach_returns_blocks() {
        let registry = registry();
        let thread = registry.attach();
        for i in 1..=100 {
            thread.make_local(ObjectRef::new(i * 8));
        }
        let chain_length = thread.local_chain_length();
        assert!(chain_length > 1);

        registry.detach(&thread);
        assert_eq!(registry.thread_count(), 0);
        assert_eq!(
            registry.handles().block_pool().pooled_blocks(),
            chain_length
        );
    }

    #[test]
    fn test_parallel_thread_claiming_visits_each_thread_once() {
        let registry = registry();
        let threads: Vec<_> = (0..16).map(|_| registry.attach()).collect();
        for (i, thread) in threads.iter().enumerate() {
            thread.make_local(ObjectRef::new((i + 1) * 16));
        }

        let parity = registry.change_thread_claim_parity();
        let visited = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let mut count = 0;
                    registry.possibly_parallel_oops_do(parity, &mut |_: &crate::RootSlot| {
                        count += 1;
                    });
                    visited.fetch_add(count, Ordering::Relaxed);
                });
            }
        });

        assert_eq!(visited.load(Ordering::Relaxed), 16);
        registry.assert_all_threads_claimed();
    }
}
