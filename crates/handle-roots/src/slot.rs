//! Root slots and the visitor interfaces used to scan them.
//!
//! The object model is external to this crate: a managed object is only ever
//! seen as an opaque, non-zero word ([`ObjectRef`]). Everything the collector
//! can observe or rewrite lives in a [`RootSlot`].

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

// ============================================================================
// ObjectRef
// ============================================================================

/// An opaque reference to a managed object.
///
/// The null reference is represented as `Option<ObjectRef>::None`, which has
/// the same size as a machine word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    /// Wrap a raw object address. Returns `None` for the null address.
    #[inline]
    #[must_use]
    pub const fn new(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// The raw object address.
    #[inline]
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    #[inline]
    const fn to_bits(obj: Option<Self>) -> usize {
        match obj {
            Some(obj) => obj.addr(),
            None => 0,
        }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}

// ============================================================================
// RootSlot
// ============================================================================

/// A single word of root storage.
///
/// Slots are owned by handle blocks or by a [`SlotStorage`](crate::SlotStorage)
/// segment and never move, so [`RootSlot::address`] identifies a slot for the
/// lifetime of its owner. All accesses are atomic: the collector may rewrite a
/// slot (relocation) or clear it (dead weak referent) while other threads read
/// it.
#[repr(transparent)]
pub struct RootSlot(AtomicUsize);

impl RootSlot {
    /// An empty slot.
    #[must_use]
    pub const fn null() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// Current content of the slot.
    #[inline]
    pub fn load(&self) -> Option<ObjectRef> {
        ObjectRef::new(self.0.load(Ordering::Acquire))
    }

    /// Overwrite the slot, e.g. with the relocated address of its referent.
    #[inline]
    pub fn store(&self, obj: Option<ObjectRef>) {
        self.0.store(ObjectRef::to_bits(obj), Ordering::Release);
    }

    /// Clear the slot.
    #[inline]
    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }

    /// Clear the slot only if it still holds `expected`.
    ///
    /// Used when clearing dead weak referents so that a concurrent store of a
    /// new value into a recycled slot is never lost.
    #[inline]
    pub fn clear_if(&self, expected: ObjectRef) -> bool {
        self.0
            .compare_exchange(expected.addr(), 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Is the slot empty?
    #[inline]
    pub fn is_null(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }

    /// Stable address of this slot.
    #[inline]
    pub fn address(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }
}

impl Default for RootSlot {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for RootSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootSlot")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("value", &self.load())
            .finish()
    }
}

// ============================================================================
// Visitors
// ============================================================================

/// Visits root slots during a scan.
///
/// Each worker thread passes its own visitor; implementations need not be
/// `Sync`. Slots handed to a visitor are always non-null at the time of the
/// call, though a concurrent scan may race with a clear.
pub trait RootVisitor {
    /// Called once per visited slot.
    fn visit(&mut self, slot: &RootSlot);
}

impl<F> RootVisitor for F
where
    F: FnMut(&RootSlot),
{
    #[inline]
    fn visit(&mut self, slot: &RootSlot) {
        self(slot);
    }
}

/// Liveness predicate used by weak root scans.
pub trait IsAlive {
    /// Returns `true` if `obj` survives the current collection.
    fn is_alive(&self, obj: ObjectRef) -> bool;
}

impl<F> IsAlive for F
where
    F: Fn(ObjectRef) -> bool,
{
    #[inline]
    fn is_alive(&self, obj: ObjectRef) -> bool {
        self(obj)
    }
}

/// Liveness predicate that treats every object as live.
///
/// Turns an unlink-or-visit scan into a visit-only scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAlive;

impl IsAlive for AlwaysAlive {
    #[inline]
    fn is_alive(&self, _obj: ObjectRef) -> bool {
        true
    }
}

/// Visit `slot` if it is live, clear it otherwise.
///
/// Shared by every weak scan in this crate.
#[inline]
pub(crate) fn unlink_or_visit(slot: &RootSlot, is_alive: &dyn IsAlive, visitor: &mut dyn RootVisitor) {
    if let Some(obj) = slot.load() {
        if is_alive.is_alive(obj) {
            visitor.visit(slot);
        } else {
            slot.clear_if(obj);
        }
    }
}
