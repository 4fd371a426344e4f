//! Handle blocks and per-context block chains.
//!
//! This module implements the storage behind local handles:
//! - `HandleBlock`: fixed-size array of 32 root slots with a bump index
//! - `HandleBlockChain`: the blocks owned by one context (a thread, or one
//!   local frame of a thread), with its free list and frame link
//!
//! Blocks live in the [`HandleBlockPool`] arena and are referred to by
//! [`BlockId`]; a chain is an ordered list of ids. A local handle names its
//! slot as `block_id * HANDLE_BLOCK_SIZE + slot`.

#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]

use std::sync::atomic::{AtomicUsize, Ordering};

use super::pool::HandleBlockPool;
use super::tagged::LocalIndex;
use crate::slot::{ObjectRef, RootSlot, RootVisitor};

/// Number of handles per handle block.
pub const HANDLE_BLOCK_SIZE: usize = 32;

/// Index of a block in the pool's arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BlockId(pub(crate) usize);

impl BlockId {
    #[inline]
    pub(crate) const fn of(index: LocalIndex) -> (Self, usize) {
        (Self(index.0 / HANDLE_BLOCK_SIZE), index.0 % HANDLE_BLOCK_SIZE)
    }

    #[inline]
    const fn local_index(self, slot: usize) -> LocalIndex {
        LocalIndex(self.0 * HANDLE_BLOCK_SIZE + slot)
    }
}

pub struct HandleBlock {
    slots: [RootSlot; HANDLE_BLOCK_SIZE],
    /// Index of the next unused slot. Written only by the owning context.
    top: AtomicUsize,
}

impl Default for HandleBlock {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| RootSlot::null()),
            top: AtomicUsize::new(0),
        }
    }
}

impl HandleBlock {
    #[inline]
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    #[inline]
    pub fn slot(&self, index: usize) -> &RootSlot {
        &self.slots[index]
    }

    /// Store `obj` in the next unused slot, if any.
    #[inline]
    fn bump(&self, obj: ObjectRef) -> Option<usize> {
        let top = self.top.load(Ordering::Relaxed);
        if top >= HANDLE_BLOCK_SIZE {
            return None;
        }
        self.slots[top].store(Some(obj));
        self.top.store(top + 1, Ordering::Release);
        Some(top)
    }

    /// Zap used slots and reset the bump index.
    pub(crate) fn clear(&self) {
        for slot in &self.slots[..self.top()] {
            slot.clear();
        }
        self.top.store(0, Ordering::Release);
    }

    /// Whether `slot` is below the bump index.
    #[inline]
    pub fn contains(&self, slot: usize) -> bool {
        slot < self.top()
    }

    /// Visit every non-null slot below the bump index.
    pub fn oops_do(&self, visitor: &mut dyn RootVisitor) {
        for slot in &self.slots[..self.top()] {
            if !slot.is_null() {
                visitor.visit(slot);
            }
        }
    }

    pub fn live_handles(&self) -> usize {
        self.slots[..self.top()].iter().filter(|s| !s.is_null()).count()
    }
}

/// The blocks owned by one context.
///
/// Corresponds to the first block of a chain in a linked design: it carries
/// the tail position, the free list, the rebuild counter, the planned capacity
/// and the link to the enclosing frame's chain.
#[derive(Debug)]
pub struct HandleBlockChain {
    blocks: Vec<BlockId>,
    /// Index in `blocks` of the block currently bump-allocating.
    last: usize,
    free_list: Vec<LocalIndex>,
    /// Blocks to append before the free list is rebuilt again.
    allocate_before_rebuild: usize,
    planned_capacity: usize,
    pop_frame_link: Option<Box<HandleBlockChain>>,
}

impl HandleBlockChain {
    /// Start a chain with one block from `pool`.
    pub fn new(pool: &HandleBlockPool) -> Self {
        Self {
            blocks: vec![pool.allocate_block()],
            last: 0,
            free_list: Vec::new(),
            allocate_before_rebuild: 0,
            planned_capacity: 0,
            pop_frame_link: None,
        }
    }

    /// Store `obj` in a slot of this chain, growing it if needed.
    pub fn allocate_handle(&mut self, pool: &HandleBlockPool, obj: ObjectRef) -> LocalIndex {
        loop {
            let last = self.blocks[self.last];
            if let Some(slot) = pool.block(last).bump(obj) {
                return last.local_index(slot);
            }

            if let Some(index) = self.free_list.pop() {
                let slot = pool.slot(index).expect("free list entry outside pool");
                debug_assert!(slot.is_null(), "free list entry {index:?} in use");
                slot.store(Some(obj));
                return index;
            }

            if self.last + 1 < self.blocks.len() {
                self.last += 1;
                continue;
            }

            if self.allocate_before_rebuild == 0 {
                self.rebuild_free_list(pool);
            } else {
                self.blocks.push(pool.allocate_block());
                self.last += 1;
                self.allocate_before_rebuild -= 1;
            }
        }
    }

    /// Collect every cleared slot of a full chain into the free list.
    ///
    /// If less than half of the chain is free afterwards, the next
    /// `allocate_before_rebuild` exhaustions append blocks instead of
    /// rebuilding, so a mostly-live chain is not rescanned on every miss.
    fn rebuild_free_list(&mut self, pool: &HandleBlockPool) {
        debug_assert!(self.allocate_before_rebuild == 0 && self.free_list.is_empty());

        for &id in &self.blocks {
            let block = pool.block(id);
            debug_assert_eq!(block.top(), HANDLE_BLOCK_SIZE, "rebuild with unused handles");
            for index in 0..block.top() {
                if block.slot(index).is_null() {
                    self.free_list.push(id.local_index(index));
                }
            }
        }

        let total = self.blocks.len() * HANDLE_BLOCK_SIZE;
        let free = self.free_list.len();
        if total > 2 * free {
            self.allocate_before_rebuild = (total - 2 * free).div_ceil(HANDLE_BLOCK_SIZE);
        }

        #[cfg(feature = "tracing")]
        crate::tracing::log_free_list_rebuild(self.blocks.len(), free, self.allocate_before_rebuild);
    }

    /// Does this chain (excluding enclosing frames) hold `index`?
    pub fn chain_contains(&self, pool: &HandleBlockPool, index: LocalIndex) -> bool {
        let (id, slot) = BlockId::of(index);
        self.blocks.contains(&id) && pool.get(id).is_some_and(|b| b.contains(slot))
    }

    /// Does this chain or any enclosing frame's chain hold `index`?
    pub fn frames_contain(&self, pool: &HandleBlockPool, index: LocalIndex) -> bool {
        self.frames().any(|chain| chain.chain_contains(pool, index))
    }

    /// This chain followed by the chains of enclosing frames.
    pub fn frames(&self) -> impl Iterator<Item = &Self> + '_ {
        std::iter::successors(Some(self), |chain| chain.pop_frame_link.as_deref())
    }

    /// Visit the handles of this chain and every enclosing frame.
    pub fn oops_do(&self, pool: &HandleBlockPool, visitor: &mut dyn RootVisitor) {
        for chain in self.frames() {
            for &id in &chain.blocks {
                pool.block(id).oops_do(visitor);
            }
        }
    }

    /// Number of blocks in this chain.
    pub fn length(&self) -> usize {
        self.blocks.len()
    }

    pub fn memory_usage(&self) -> usize {
        self.length() * std::mem::size_of::<HandleBlock>()
    }

    /// Non-null handles in this chain.
    pub fn live_handles(&self, pool: &HandleBlockPool) -> usize {
        self.blocks.iter().map(|&id| pool.block(id).live_handles()).sum()
    }

    pub fn planned_capacity(&self) -> usize {
        self.planned_capacity
    }

    pub fn set_planned_capacity(&mut self, planned_capacity: usize) {
        self.planned_capacity = planned_capacity;
    }

    pub fn pop_frame_link(&self) -> Option<&Self> {
        self.pop_frame_link.as_deref()
    }

    /// Enter a new local frame: `self` becomes a fresh chain linked to the
    /// previous one.
    pub fn push_frame(&mut self, pool: &HandleBlockPool) {
        let outer = std::mem::replace(self, Self::new(pool));
        self.pop_frame_link = Some(Box::new(outer));
    }

    /// Leave the current local frame, returning its blocks to `pool`.
    ///
    /// Returns `false` without releasing anything when no frame was pushed.
    pub fn pop_frame(&mut self, pool: &HandleBlockPool) -> bool {
        let Some(outer) = self.pop_frame_link.take() else {
            return false;
        };
        let inner = std::mem::replace(self, *outer);
        inner.release(pool);
        true
    }

    /// Return every block of this chain and of enclosing frames to `pool`.
    pub fn release(mut self, pool: &HandleBlockPool) {
        let mut chain = Some(&mut self);
        while let Some(current) = chain {
            for id in current.blocks.drain(..) {
                pool.release_block(id);
            }
            current.free_list.clear();
            chain = current.pop_frame_link.as_deref_mut();
        }
    }
}
