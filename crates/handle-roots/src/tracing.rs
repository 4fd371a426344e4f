//! Root scanning tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans for root iterator passes and events for handle storage growth.
//! Call sites are gated on the feature, so nothing here is compiled into a
//! default build.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// Stable identifier for one root iterator, used to correlate the events
    /// emitted by all workers sharing it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ScanId(pub u64);

    static NEXT_SCAN_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique scan ID.
    pub fn next_scan_id() -> ScanId {
        ScanId(NEXT_SCAN_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering one worker's pass over a root iterator.
    pub fn trace_root_pass(iterator: &'static str, scan_id: ScanId) -> span::EnteredSpan {
        span!(Level::DEBUG, "root_pass", iterator, scan_id = scan_id.0).entered()
    }

    /// Span covering the body of one claimed root group.
    pub fn trace_root_group(group: &'static str) -> span::EnteredSpan {
        span!(Level::TRACE, "root_group", group).entered()
    }

    /// Log iterator construction (prologues run, parity advanced).
    pub fn log_iterator_setup(iterator: &'static str, scan_id: ScanId, parity: Option<u32>) {
        tracing::debug!(iterator, scan_id = scan_id.0, parity, "iterator_setup");
    }

    /// Log iterator teardown (epilogues run).
    pub fn log_iterator_teardown(iterator: &'static str, scan_id: ScanId) {
        tracing::debug!(iterator, scan_id = scan_id.0, "iterator_teardown");
    }
}

#[cfg(feature = "tracing")]
pub use internal::{
    log_iterator_setup, log_iterator_teardown, next_scan_id, trace_root_group, trace_root_pass,
    ScanId,
};

/// Log allocation of a new arena chunk.
#[cfg(feature = "tracing")]
pub fn log_arena_chunk(chunk: usize, len: usize) {
    tracing::debug!(chunk, len, "arena_chunk");
}

/// Log a slot storage running out of capacity.
#[cfg(feature = "tracing")]
pub fn log_storage_exhausted(name: &'static str, allocated: usize) {
    tracing::warn!(storage = name, allocated, "storage_exhausted");
}

/// Log a local handle free list rebuild.
#[cfg(feature = "tracing")]
pub fn log_free_list_rebuild(blocks: usize, free: usize, allocate_before_rebuild: usize) {
    tracing::trace!(blocks, free, allocate_before_rebuild, "free_list_rebuild");
}

/// Log a fresh handle block taken from the arena.
#[cfg(feature = "tracing")]
pub fn log_block_allocated(index: usize) {
    tracing::trace!(block = index, "block_allocated");
}
