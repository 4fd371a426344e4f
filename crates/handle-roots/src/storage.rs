//! Concurrent, partitionable slot storage for global and weak-global handles.
//!
//! Storage is a sequence of 64-slot segments, each with an allocation bitmap.
//! Allocation and release serialise on a mutex; readers and scanners never
//! take it. Segments are never freed, which is what makes a [`ParState`] safe
//! to use while mutator threads keep adding and removing entries.
//!
//! # Partitioned scans
//!
//! A [`ParState`] snapshots the segment count when it is created and hands out
//! segments through an atomic cursor. Any number of threads can call
//! [`ParState::oops_do`] concurrently; every segment in the snapshot is
//! scanned by exactly one of them. Entries added to segments created after the
//! snapshot are not visited by that pass.

#![allow(missing_docs)]
#![allow(clippy::must_use_candidate)]

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

use crate::arena::Arena;
use crate::slot::{unlink_or_visit, IsAlive, ObjectRef, RootSlot, RootVisitor};

/// Number of slots per storage segment.
pub const SEGMENT_SLOTS: usize = 64;

struct Segment {
    allocated: AtomicU64,
    slots: [RootSlot; SEGMENT_SLOTS],
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            allocated: AtomicU64::new(0),
            slots: std::array::from_fn(|_| RootSlot::null()),
        }
    }
}

impl Segment {
    /// Call `f` for every allocated, non-null slot.
    #[inline]
    fn for_each_live(&self, mut f: impl FnMut(&RootSlot)) {
        let mut bits = self.allocated.load(Ordering::Acquire);
        while bits != 0 {
            let index = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            let slot = &self.slots[index];
            if !slot.is_null() {
                f(slot);
            }
        }
    }
}

#[derive(Default)]
struct AllocState {
    /// Segments with at least one free slot.
    partial: Vec<usize>,
}

/// Set-like storage of root slots.
pub struct SlotStorage {
    name: &'static str,
    segments: Arena<Segment>,
    alloc: Mutex<AllocState>,
    allocation_count: AtomicUsize,
}

impl SlotStorage {
    /// Create a storage holding at least `capacity` slots.
    ///
    /// Capacity is rounded up to whole segments.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            segments: Arena::with_capacity(capacity.div_ceil(SEGMENT_SLOTS)),
            alloc: Mutex::new(AllocState::default()),
            allocation_count: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Allocate a slot holding `obj`.
    ///
    /// Returns the slot index, or `None` if the storage is exhausted.
    pub fn add(&self, obj: ObjectRef) -> Option<usize> {
        let mut state = self.alloc.lock();
        let segment_index = match state.partial.last() {
            Some(&index) => index,
            None => {
                let Some(index) = self.segments.push() else {
                    #[cfg(feature = "tracing")]
                    crate::tracing::log_storage_exhausted(self.name, self.allocation_count());
                    return None;
                };
                state.partial.push(index);
                index
            }
        };
        let segment = self.segment(segment_index);

        let bits = segment.allocated.load(Ordering::Relaxed);
        let free = (!bits).trailing_zeros() as usize;
        debug_assert!(free < SEGMENT_SLOTS, "partial segment has no free slot");

        segment.slots[free].store(Some(obj));
        let bits = bits | (1 << free);
        segment.allocated.store(bits, Ordering::Release);
        if bits == u64::MAX {
            state.partial.pop();
        }
        self.allocation_count.fetch_add(1, Ordering::Relaxed);

        Some(segment_index * SEGMENT_SLOTS + free)
    }

    #[inline]
    fn segment(&self, index: usize) -> &Segment {
        self.segments
            .get(index)
            .expect("segment was pushed under the alloc lock")
    }

    /// Release the slot at `index`.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not currently allocated (double release).
    #[track_caller]
    pub fn remove(&self, index: usize) {
        let mut state = self.alloc.lock();
        let (segment_index, bit) = (index / SEGMENT_SLOTS, index % SEGMENT_SLOTS);
        let segment = self
            .segments
            .get(segment_index)
            .unwrap_or_else(|| panic!("{}: slot {index} out of range", self.name));

        let bits = segment.allocated.load(Ordering::Relaxed);
        assert!(
            bits & (1 << bit) != 0,
            "{}: release of unallocated slot {index}",
            self.name
        );

        segment.slots[bit].clear();
        segment.allocated.store(bits & !(1 << bit), Ordering::Release);
        if bits == u64::MAX {
            state.partial.push(segment_index);
        }
        self.allocation_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// The slot at `index`, whether or not it is allocated.
    #[inline]
    pub fn slot(&self, index: usize) -> Option<&RootSlot> {
        self.segments
            .get(index / SEGMENT_SLOTS)
            .map(|segment| &segment.slots[index % SEGMENT_SLOTS])
    }

    /// Whether the slot at `index` is currently allocated.
    #[inline]
    pub fn is_allocated(&self, index: usize) -> bool {
        self.segments.get(index / SEGMENT_SLOTS).is_some_and(|segment| {
            segment.allocated.load(Ordering::Acquire) & (1 << (index % SEGMENT_SLOTS)) != 0
        })
    }

    /// Number of allocated slots.
    pub fn allocation_count(&self) -> usize {
        self.allocation_count.load(Ordering::Relaxed)
    }

    /// Number of segments created so far.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Bytes used by this storage, including its segments.
    pub fn total_memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.segments.reserved_bytes()
    }

    /// Single-threaded scan of every live slot.
    pub fn oops_do(&self, visitor: &mut dyn RootVisitor) {
        for (_, segment) in self.segments.iter() {
            segment.for_each_live(|slot| visitor.visit(slot));
        }
    }

    /// Single-threaded scan that clears slots whose referent is dead and
    /// visits the rest.
    pub fn weak_oops_do(&self, is_alive: &dyn IsAlive, visitor: &mut dyn RootVisitor) {
        for (_, segment) in self.segments.iter() {
            segment.for_each_live(|slot| unlink_or_visit(slot, is_alive, visitor));
        }
    }

    /// Start a possibly-parallel scan.
    pub fn par_state(&self) -> ParState<'_> {
        ParState {
            storage: self,
            segment_count: self.segments.len(),
            next_segment: CachePadded::new(AtomicUsize::new(0)),
        }
    }
}

impl fmt::Debug for SlotStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotStorage")
            .field("name", &self.name)
            .field("allocation_count", &self.allocation_count())
            .field("segments", &self.segment_count())
            .finish()
    }
}

/// Shared cursor for a partitioned scan of a [`SlotStorage`].
pub struct ParState<'a> {
    storage: &'a SlotStorage,
    segment_count: usize,
    next_segment: CachePadded<AtomicUsize>,
}

impl ParState<'_> {
    /// Segments covered by this scan.
    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    #[inline]
    fn claim_segment(&self) -> Option<&Segment> {
        let index = self.next_segment.fetch_add(1, Ordering::Relaxed);
        if index >= self.segment_count {
            return None;
        }
        self.storage.segments.get(index)
    }

    /// Visit every live slot in the segments this caller claims.
    pub fn oops_do(&self, visitor: &mut dyn RootVisitor) {
        while let Some(segment) = self.claim_segment() {
            segment.for_each_live(|slot| visitor.visit(slot));
        }
    }

    /// Clear dead slots and visit live ones in the segments this caller claims.
    pub fn weak_oops_do(&self, is_alive: &dyn IsAlive, visitor: &mut dyn RootVisitor) {
        while let Some(segment) = self.claim_segment() {
            segment.for_each_live(|slot| unlink_or_visit(slot, is_alive, visitor));
        }
    }
}

impl fmt::Debug for ParState<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParState")
            .field("storage", &self.storage.name)
            .field("segment_count", &self.segment_count)
            .field("next_segment", &self.next_segment.load(Ordering::Relaxed))
            .finish()
    }
}
