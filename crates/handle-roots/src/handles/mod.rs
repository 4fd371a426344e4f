//! The handle table: indirect references from native code to managed objects.
//!
//! Three kinds of handle exist:
//! - **local** handles live in a thread's [`HandleBlockChain`] and are created
//!   through [`ThreadContext`](crate::ThreadContext);
//! - **global** handles live in the global [`SlotStorage`] until destroyed;
//! - **weak-global** handles live in the weak [`SlotStorage`]; the collector
//!   clears them when their referent dies.
//!
//! Native code holds handles as [`RawHandle`] words. The low bit of the word
//! tags weak handles so that [`RawHandle::is_weak`] needs no lookup.

#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]

pub mod local_handles;
pub mod pool;
mod scope;
pub mod tagged;


pub use local_handles::{BlockId, HandleBlock, HandleBlockChain, HANDLE_BLOCK_SIZE};
pub use pool::HandleBlockPool;
pub use scope::LocalFrame;
pub use tagged::{
    GlobalIndex, Handle, LocalIndex, RawHandle, SlotRef, MAX_HANDLE_INDEX, WEAK_TAG_MASK,
    WEAK_TAG_VALUE,
};

use crate::config::{AllocFailStrategy, HandleTableConfig};
use crate::slot::{AlwaysAlive, IsAlive, ObjectRef, RootSlot, RootVisitor};
use crate::storage::SlotStorage;
use crate::threads::ThreadContext;

/// Kind of a handle, as reported by [`HandleTable::handle_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleType {
    Invalid,
    Local,
    Global,
    WeakGlobal,
}

/// Global and weak-global handle storage plus the local handle block pool.
pub struct HandleTable {
    config: HandleTableConfig,
    global_handles: SlotStorage,
    weak_global_handles: SlotStorage,
    block_pool: HandleBlockPool,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new(HandleTableConfig::default())
    }
}

impl HandleTable {
    pub fn new(config: HandleTableConfig) -> Self {
        let max_index = MAX_HANDLE_INDEX;
        debug_assert!(config.global_capacity <= max_index);
        debug_assert!(config.weak_global_capacity <= max_index);
        debug_assert!(config.max_handle_blocks <= max_index / HANDLE_BLOCK_SIZE);
        Self {
            config,
            global_handles: SlotStorage::new("global handles", config.global_capacity),
            weak_global_handles: SlotStorage::new(
                "weak global handles",
                config.weak_global_capacity,
            ),
            block_pool: HandleBlockPool::new(config.max_handle_blocks),
        }
    }

    pub fn config(&self) -> &HandleTableConfig {
        &self.config
    }

    pub fn block_pool(&self) -> &HandleBlockPool {
        &self.block_pool
    }

    pub fn global_handles(&self) -> &SlotStorage {
        &self.global_handles
    }

    /// Weak-global storage, for collectors that iterate it directly.
    pub fn weak_global_handles(&self) -> &SlotStorage {
        &self.weak_global_handles
    }

    // ------------------------------------------------------------------------
    // Global handles
    // ------------------------------------------------------------------------

    /// Create a global handle using the configured failure strategy.
    pub fn make_global(&self, obj: Option<ObjectRef>) -> Option<Handle> {
        self.make_global_with(obj, self.config.alloc_fail_strategy)
    }

    /// Create a global handle. A null reference yields a null handle.
    pub fn make_global_with(
        &self,
        obj: Option<ObjectRef>,
        strategy: AllocFailStrategy,
    ) -> Option<Handle> {
        let obj = obj?;
        match self.global_handles.add(obj) {
            Some(index) => Some(Handle::Strong(SlotRef::Global(GlobalIndex(index)))),
            None => alloc_failed(&self.global_handles, strategy),
        }
    }

    /// # Panics
    ///
    /// Panics if `handle` is not a global handle or was already destroyed.
    #[track_caller]
    pub fn destroy_global(&self, handle: Option<Handle>) {
        let Some(handle) = handle else {
            return;
        };
        let SlotRef::Global(index) = handle.strong_ref() else {
            panic!("invalid global handle {handle:?}");
        };
        self.global_handles.remove(index.0);
    }

    // ------------------------------------------------------------------------
    // Weak-global handles
    // ------------------------------------------------------------------------

    /// Create a weak-global handle using the configured failure strategy.
    pub fn make_weak_global(&self, obj: Option<ObjectRef>) -> Option<Handle> {
        self.make_weak_global_with(obj, self.config.alloc_fail_strategy)
    }

    pub fn make_weak_global_with(
        &self,
        obj: Option<ObjectRef>,
        strategy: AllocFailStrategy,
    ) -> Option<Handle> {
        let obj = obj?;
        match self.weak_global_handles.add(obj) {
            Some(index) => Some(Handle::Weak(GlobalIndex(index))),
            None => alloc_failed(&self.weak_global_handles, strategy),
        }
    }

    /// # Panics
    ///
    /// Panics if `handle` is not weak or was already destroyed.
    #[track_caller]
    pub fn destroy_weak_global(&self, handle: Option<Handle>) {
        if let Some(handle) = handle {
            self.weak_global_handles.remove(handle.weak_ref().0);
        }
    }

    /// Has the collector cleared the referent of this weak handle?
    ///
    /// Reads the slot directly, without the checks of the resolve path.
    #[track_caller]
    pub fn is_global_weak_cleared(&self, handle: Handle) -> bool {
        let index = handle.weak_ref();
        self.weak_global_handles
            .slot(index.0)
            .map_or(true, RootSlot::is_null)
    }

    // ------------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------------

    /// Resolve a handle to its referent.
    ///
    /// A null handle, or a weak handle whose referent was cleared, resolves to
    /// `None`. In debug builds, a strong handle whose slot is empty is
    /// reported as an invalid handle.
    #[inline]
    #[track_caller]
    pub fn resolve(&self, handle: Option<Handle>) -> Option<ObjectRef> {
        handle.and_then(|handle| self.resolve_impl::<false>(handle))
    }

    /// Resolve a handle word supplied by untrusted native code.
    ///
    /// Never panics: null words, words naming no slot, destroyed handles and
    /// cleared weak handles all resolve to `None`. A destroyed handle whose
    /// slot was since reused is not detected.
    #[inline]
    pub fn resolve_external_guard(&self, raw: RawHandle) -> Option<ObjectRef> {
        raw.decode()
            .and_then(|handle| self.resolve_impl::<true>(handle))
    }

    /// Resolve a handle known to be non-null and to refer to a live object.
    #[inline]
    #[track_caller]
    pub fn resolve_non_null(&self, handle: Handle) -> ObjectRef {
        self.resolve_impl::<false>(handle)
            .unwrap_or_else(|| panic!("null read from handle {handle:?}"))
    }

    #[inline]
    #[track_caller]
    fn resolve_impl<const EXTERNAL_GUARD: bool>(&self, handle: Handle) -> Option<ObjectRef> {
        let slot = match handle {
            Handle::Weak(index) => {
                let slot = self.weak_global_handles.slot(index.0);
                debug_assert!(EXTERNAL_GUARD || slot.is_some(), "invalid handle {handle:?}");
                return slot.and_then(RootSlot::load);
            }
            Handle::Strong(slot_ref) => self.strong_slot(slot_ref),
        };
        let result = slot.and_then(RootSlot::load);
        // Handle construction canonicalises null into a null handle, so a
        // strong slot is never empty outside the external guard path.
        debug_assert!(EXTERNAL_GUARD || result.is_some(), "invalid handle {handle:?}");
        result
    }

    /// The slot behind `handle`, without any validity check.
    ///
    /// Its address is what root visitors observe for this handle.
    pub fn slot(&self, handle: Handle) -> Option<&RootSlot> {
        match handle {
            Handle::Weak(index) => self.weak_global_handles.slot(index.0),
            Handle::Strong(slot_ref) => self.strong_slot(slot_ref),
        }
    }

    #[inline]
    fn strong_slot(&self, slot_ref: SlotRef) -> Option<&RootSlot> {
        match slot_ref {
            SlotRef::Local(index) => self.block_pool.slot(index),
            SlotRef::Global(index) => self.global_handles.slot(index.0),
        }
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn is_global_handle(&self, handle: Handle) -> bool {
        match handle {
            Handle::Strong(SlotRef::Global(index)) => self.global_handles.is_allocated(index.0),
            _ => false,
        }
    }

    pub fn is_weak_global_handle(&self, handle: Handle) -> bool {
        match handle {
            Handle::Weak(index) => self.weak_global_handles.is_allocated(index.0),
            Handle::Strong(_) => false,
        }
    }

    /// Classify `handle`. Local handles are only recognised when `thread` is
    /// the thread owning them.
    pub fn handle_type(&self, thread: Option<&ThreadContext>, handle: Handle) -> HandleType {
        match handle {
            Handle::Weak(_) if self.is_weak_global_handle(handle) => HandleType::WeakGlobal,
            Handle::Strong(SlotRef::Global(_)) if self.is_global_handle(handle) => {
                HandleType::Global
            }
            Handle::Strong(SlotRef::Local(_))
                if thread.is_some_and(|t| t.is_local_handle(handle)) =>
            {
                HandleType::Local
            }
            _ => HandleType::Invalid,
        }
    }

    pub fn global_handle_memory_usage(&self) -> usize {
        self.global_handles.total_memory_usage()
    }

    pub fn weak_global_handle_memory_usage(&self) -> usize {
        self.weak_global_handles.total_memory_usage()
    }

    // ------------------------------------------------------------------------
    // Garbage collection support
    // ------------------------------------------------------------------------

    /// Visit every global handle slot.
    pub fn oops_do(&self, visitor: &mut dyn RootVisitor) {
        self.global_handles.oops_do(visitor);
    }

    /// Clear weak-global slots whose referent is dead and visit the rest.
    pub fn weak_oops_do(&self, is_alive: &dyn IsAlive, visitor: &mut dyn RootVisitor) {
        self.weak_global_handles.weak_oops_do(is_alive, visitor);
    }

    /// Visit every weak-global slot, treating every referent as live.
    pub fn weak_oops_do_all(&self, visitor: &mut dyn RootVisitor) {
        self.weak_oops_do(&AlwaysAlive, visitor);
    }
}

impl std::fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable")
            .field("global_handles", &self.global_handles)
            .field("weak_global_handles", &self.weak_global_handles)
            .field("block_pool", &self.block_pool)
            .finish()
    }
}

fn alloc_failed(storage: &SlotStorage, strategy: AllocFailStrategy) -> Option<Handle> {
    match strategy {
        AllocFailStrategy::ReturnNull => None,
        AllocFailStrategy::ExitOom => exit_out_of_memory(storage),
    }
}

#[cold]
fn exit_out_of_memory(storage: &SlotStorage) -> ! {
    #[cfg(feature = "tracing")]
    tracing::error!(storage = storage.name(), "handle allocation failed");
    eprintln!(
        "[handles] Out of memory: cannot allocate in {} ({} in use)",
        storage.name(),
        storage.allocation_count()
    );
    std::process::abort()
}
