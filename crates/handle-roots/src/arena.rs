//! Append-only arena addressed by index.
//!
//! Elements live in chunks whose sizes double (16, 32, 64, ...). Chunks are
//! allocated once and never moved or freed while the arena lives, so a
//! `&T` obtained from [`Arena::get`] stays valid and readers never lock.
//! Growth is serialised by a mutex.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

const FIRST_CHUNK_BITS: u32 = 4;
const FIRST_CHUNK_LEN: usize = 1 << FIRST_CHUNK_BITS;

/// Split an element index into `(chunk, offset)`.
#[inline]
const fn locate(index: usize) -> (usize, usize) {
    let biased = index + FIRST_CHUNK_LEN;
    let bit = usize::BITS - 1 - biased.leading_zeros();
    ((bit - FIRST_CHUNK_BITS) as usize, biased - (1 << bit))
}

#[inline]
const fn chunk_len(chunk: usize) -> usize {
    FIRST_CHUNK_LEN << chunk
}

pub struct Arena<T> {
    chunks: Box<[OnceLock<Box<[T]>>]>,
    len: AtomicUsize,
    capacity: usize,
    grow: Mutex<()>,
}

impl<T: Default> Arena<T> {
    /// Create an arena that will hold at most `capacity` elements.
    pub fn with_capacity(capacity: usize) -> Self {
        let chunk_count = if capacity == 0 {
            0
        } else {
            locate(capacity - 1).0 + 1
        };
        Self {
            chunks: (0..chunk_count).map(|_| OnceLock::new()).collect(),
            len: AtomicUsize::new(0),
            capacity,
            grow: Mutex::new(()),
        }
    }

    /// Append a default-initialised element and return its index.
    ///
    /// Returns `None` once the arena is at capacity.
    pub fn push(&self) -> Option<usize> {
        let _grow = self.grow.lock();
        let index = self.len.load(Ordering::Relaxed);
        if index >= self.capacity {
            return None;
        }
        let (chunk, _) = locate(index);
        self.chunks[chunk].get_or_init(|| {
            #[cfg(feature = "tracing")]
            crate::tracing::log_arena_chunk(chunk, chunk_len(chunk));
            (0..chunk_len(chunk)).map(|_| T::default()).collect()
        });
        self.len.store(index + 1, Ordering::Release);
        Some(index)
    }
}

impl<T> Arena<T> {
    /// Element at `index`, if it has been pushed.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len.load(Ordering::Acquire) {
            return None;
        }
        let (chunk, offset) = locate(index);
        self.chunks[chunk].get().map(|elems| &elems[offset])
    }

    /// Number of elements pushed so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes reserved by chunks allocated so far.
    pub fn reserved_bytes(&self) -> usize {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.get().is_some())
            .map(|(i, _)| chunk_len(i) * std::mem::size_of::<T>())
            .sum()
    }

    /// Iterate over every pushed element in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i).map(|e| (i, e)))
    }
}

impl<T> std::fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
