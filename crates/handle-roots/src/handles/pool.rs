//! Recycling pool for handle blocks.
//!
//! Blocks are allocated from an index-addressed arena and never returned to
//! the allocator: a released block is cleared and queued for the next chain
//! that needs capacity. Allocation and release may happen on any thread.

#![allow(missing_docs)]
#![allow(clippy::must_use_candidate)]

use crossbeam_queue::SegQueue;

use super::local_handles::{BlockId, HandleBlock, HANDLE_BLOCK_SIZE};
use super::tagged::LocalIndex;
use crate::arena::Arena;
use crate::slot::RootSlot;

pub struct HandleBlockPool {
    blocks: Arena<HandleBlock>,
    free: SegQueue<BlockId>,
}

impl HandleBlockPool {
    /// Create a pool that can hand out at most `max_blocks` distinct blocks.
    pub fn new(max_blocks: usize) -> Self {
        Self {
            blocks: Arena::with_capacity(max_blocks),
            free: SegQueue::new(),
        }
    }

    /// Take a cleared block, reusing a released one when available.
    ///
    /// # Panics
    ///
    /// Panics if every block is in use and the arena is at capacity.
    pub fn allocate_block(&self) -> BlockId {
        if let Some(id) = self.free.pop() {
            return id;
        }
        let index = self.blocks.push().unwrap_or_else(|| {
            panic!(
                "out of handle blocks ({} blocks of {HANDLE_BLOCK_SIZE} handles in use)",
                self.blocks.capacity()
            )
        });

        #[cfg(feature = "tracing")]
        crate::tracing::log_block_allocated(index);

        BlockId(index)
    }

    /// Clear `id` and make it available for reuse.
    pub fn release_block(&self, id: BlockId) {
        self.block(id).clear();
        self.free.push(id);
    }

    #[inline]
    pub fn get(&self, id: BlockId) -> Option<&HandleBlock> {
        self.blocks.get(id.0)
    }

    /// # Panics
    ///
    /// Panics if `id` was never handed out by this pool.
    #[inline]
    #[track_caller]
    pub fn block(&self, id: BlockId) -> &HandleBlock {
        self.get(id)
            .unwrap_or_else(|| panic!("{id:?} not allocated by this pool"))
    }

    /// Slot named by a local handle index, if its block exists.
    #[inline]
    pub fn slot(&self, index: LocalIndex) -> Option<&RootSlot> {
        let (id, slot) = BlockId::of(index);
        self.get(id).map(|block| block.slot(slot))
    }

    /// Blocks ever allocated from the arena.
    pub fn blocks_allocated(&self) -> usize {
        self.blocks.len()
    }

    /// Blocks currently waiting for reuse.
    pub fn pooled_blocks(&self) -> usize {
        self.free.len()
    }

    pub fn memory_usage(&self) -> usize {
        self.blocks.reserved_bytes()
    }
}

impl std::fmt::Debug for HandleBlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleBlockPool")
            .field("blocks_allocated", &self.blocks_allocated())
            .field("pooled_blocks", &self.pooled_blocks())
            .finish()
    }
}
