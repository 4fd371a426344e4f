//! Configuration for the handle table and root iterators.

#![allow(missing_docs)]
#![allow(clippy::must_use_candidate)]

/// Default number of slots in global and weak-global storage.
pub const DEFAULT_GLOBAL_CAPACITY: usize = 1 << 20;
/// Default upper bound for `ensure_local_capacity` / `push_local_frame`.
pub const DEFAULT_MAX_LOCAL_CAPACITY: usize = 65536;
/// Default number of handle blocks the block pool may allocate.
pub const DEFAULT_MAX_HANDLE_BLOCKS: usize = 1 << 20;

/// What to do when global or weak-global storage is exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AllocFailStrategy {
    /// Report and abort the process.
    #[default]
    ExitOom,
    /// Return a null handle for the caller to check.
    ReturnNull,
}

#[derive(Debug, Clone, Copy)]
pub struct HandleTableConfig {
    pub global_capacity: usize,
    pub weak_global_capacity: usize,
    pub max_local_capacity: usize,
    pub max_handle_blocks: usize,
    /// Strategy used by `make_global` / `make_weak_global`.
    pub alloc_fail_strategy: AllocFailStrategy,
}

impl Default for HandleTableConfig {
    fn default() -> Self {
        Self {
            global_capacity: DEFAULT_GLOBAL_CAPACITY,
            weak_global_capacity: DEFAULT_GLOBAL_CAPACITY,
            max_local_capacity: DEFAULT_MAX_LOCAL_CAPACITY,
            max_handle_blocks: DEFAULT_MAX_HANDLE_BLOCKS,
            alloc_fail_strategy: AllocFailStrategy::ExitOom,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RootsConfig {
    /// Weak roots are processed in their own phase instead of being folded
    /// into the strong pass.
    pub weak_roots: bool,
    /// Weak-global handles are scanned by the concurrent weak iterator
    /// instead of the paused weak iterator. Only meaningful with `weak_roots`.
    pub concurrent_jni_weak_global_handles: bool,
}

impl Default for RootsConfig {
    fn default() -> Self {
        Self {
            weak_roots: true,
            concurrent_jni_weak_global_handles: true,
        }
    }
}
