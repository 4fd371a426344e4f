//! Handle values and their raw-word encoding.
//!
//! Inside the crate a handle is the sum type [`Handle`]. Native code sees a
//! single machine word, [`RawHandle`], in which the low bit tags weak handles:
//!
//! ```text
//! bits [usize::BITS-1 .. 2]  index + 1   (never zero for a live handle)
//! bit  1                     LOCAL_TAG   (strong handle into a block chain)
//! bit  0                     WEAK_TAG    (weak-global handle)
//! ```
//!
//! The all-zero word is the null handle.

use std::fmt;

/// Number of low bits reserved for the weak tag.
pub const WEAK_TAG_SIZE: u32 = 1;
/// Minimum slot alignment implied by the weak tag.
pub const WEAK_TAG_ALIGNMENT: usize = 1 << WEAK_TAG_SIZE;
/// Mask selecting the weak tag.
pub const WEAK_TAG_MASK: usize = WEAK_TAG_ALIGNMENT - 1;
/// Value added to a weak handle's payload.
pub const WEAK_TAG_VALUE: usize = 1;

const LOCAL_TAG: usize = 0b10;
const TAG_BITS: u32 = 2;

/// Largest index that fits in a raw handle.
pub const MAX_HANDLE_INDEX: usize = (usize::MAX >> TAG_BITS) - 1;

/// Index of a local handle slot: `block_id * HANDLE_BLOCK_SIZE + slot`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct LocalIndex(pub(crate) usize);

/// Index of a slot in global or weak-global storage.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct GlobalIndex(pub(crate) usize);

/// Location of a strong handle's slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SlotRef {
    /// Slot in a thread's handle block chain.
    Local(LocalIndex),
    /// Slot in global handle storage.
    Global(GlobalIndex),
}

/// A non-null handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Handle {
    /// Keeps its referent alive.
    Strong(SlotRef),
    /// Weak-global handle; its referent may be cleared by the collector.
    Weak(GlobalIndex),
}

impl Handle {
    #[inline]
    #[must_use]
    pub const fn is_weak(self) -> bool {
        matches!(self, Self::Weak(_))
    }

    /// Slot of a strong handle.
    ///
    /// # Panics
    ///
    /// Panics if the handle is weak.
    #[inline]
    #[track_caller]
    #[must_use]
    pub fn strong_ref(self) -> SlotRef {
        match self {
            Self::Strong(slot) => slot,
            Self::Weak(_) => panic!("strong accessor applied to weak handle {self:?}"),
        }
    }

    /// Storage index of a weak handle.
    ///
    /// # Panics
    ///
    /// Panics if the handle is strong.
    #[inline]
    #[track_caller]
    #[must_use]
    pub fn weak_ref(self) -> GlobalIndex {
        match self {
            Self::Weak(index) => index,
            Self::Strong(_) => panic!("weak accessor applied to strong handle {self:?}"),
        }
    }

    /// Encode for the native boundary.
    #[inline]
    #[must_use]
    pub const fn to_raw(self) -> RawHandle {
        let bits = match self {
            Self::Strong(SlotRef::Local(LocalIndex(i))) => ((i + 1) << TAG_BITS) | LOCAL_TAG,
            Self::Strong(SlotRef::Global(GlobalIndex(i))) => (i + 1) << TAG_BITS,
            Self::Weak(GlobalIndex(i)) => ((i + 1) << TAG_BITS) | WEAK_TAG_VALUE,
        };
        RawHandle(bits)
    }
}

/// A handle as native code sees it: one machine word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct RawHandle(usize);

impl RawHandle {
    /// The null handle.
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> usize {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Tests the weak tag without decoding the rest of the word.
    #[inline]
    #[must_use]
    pub const fn is_weak(self) -> bool {
        self.0 & WEAK_TAG_MASK != 0
    }

    /// Decode into a [`Handle`].
    ///
    /// The null word, and any word whose index payload is empty, decode to
    /// `None`. Decoding never validates that the slot exists.
    #[inline]
    #[must_use]
    pub const fn decode(self) -> Option<Handle> {
        let payload = self.0 >> TAG_BITS;
        if payload == 0 {
            return None;
        }
        let index = payload - 1;
        Some(if self.is_weak() {
            Handle::Weak(GlobalIndex(index))
        } else if self.0 & LOCAL_TAG != 0 {
            Handle::Strong(SlotRef::Local(LocalIndex(index)))
        } else {
            Handle::Strong(SlotRef::Global(GlobalIndex(index)))
        })
    }
}

impl From<Handle> for RawHandle {
    fn from(handle: Handle) -> Self {
        handle.to_raw()
    }
}

impl From<Option<Handle>> for RawHandle {
    fn from(handle: Option<Handle>) -> Self {
        handle.map_or(Self::NULL, Handle::to_raw)
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHandle({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_word_decodes_to_none() {
        assert!(RawHandle::NULL.decode().is_none());
        assert!(RawHandle::from(None).is_null());
        assert!(RawHandle::from_bits(WEAK_TAG_VALUE).decode().is_none());
    }

    #[test]
    fn test_weak_tag_is_low_bit() {
        let weak = Handle::Weak(GlobalIndex(5)).to_raw();
        let strong = Handle::Strong(SlotRef::Global(GlobalIndex(5))).to_raw();

        assert!(weak.is_weak());
        assert!(!strong.is_weak());
        assert_eq!(weak.bits() - WEAK_TAG_VALUE, strong.bits());
    }

    #[test]
    fn test_local_and_global_decode_distinctly() {
        let local = Handle::Strong(SlotRef::Local(LocalIndex(0)));
        let global = Handle::Strong(SlotRef::Global(GlobalIndex(0)));

        assert_ne!(local.to_raw(), global.to_raw());
        assert_eq!(local.to_raw().decode(), Some(local));
        assert_eq!(global.to_raw().decode(), Some(global));
        assert!(!local.to_raw().is_null());
        assert!(!global.to_raw().is_null());
    }

    #[test]
    fn test_max_index_encodes() {
        let handle = Handle::Weak(GlobalIndex(MAX_HANDLE_INDEX));
        assert_eq!(handle.to_raw().decode(), Some(handle));
    }

    #[test]
    #[should_panic(expected = "weak accessor applied to strong handle")]
    fn test_weak_accessor_on_strong_panics() {
        let _ = Handle::Strong(SlotRef::Global(GlobalIndex(1))).weak_ref();
    }

    #[test]
    #[should_panic(expected = "strong accessor applied to weak handle")]
    fn test_strong_accessor_on_weak_panics() {
        let _ = Handle::Weak(GlobalIndex(1)).strong_ref();
    }
}
