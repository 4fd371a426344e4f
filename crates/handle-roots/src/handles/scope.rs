//! RAII wrapper around `push_local_frame` / `pop_local_frame`.

#![allow(missing_docs)]
#![allow(clippy::must_use_candidate)]

use std::marker::PhantomData;

use super::Handle;
use crate::threads::ThreadContext;

/// A local frame that is popped when dropped.
///
/// Local handles created while the frame is active are released with it;
/// [`LocalFrame::escape`] carries one result out to the enclosing frame.
pub struct LocalFrame<'t> {
    thread: &'t ThreadContext,
    popped: bool,
    _marker: PhantomData<*mut ()>,
}

impl<'t> LocalFrame<'t> {
    /// Push a frame planned for `capacity` handles.
    ///
    /// Returns `None` if `capacity` exceeds the configured maximum.
    pub fn new(thread: &'t ThreadContext, capacity: usize) -> Option<Self> {
        thread.push_local_frame(capacity).then_some(Self {
            thread,
            popped: false,
            _marker: PhantomData,
        })
    }

    pub fn thread(&self) -> &'t ThreadContext {
        self.thread
    }

    /// Pop the frame and return a handle to `result` valid in the enclosing
    /// frame.
    pub fn escape(mut self, result: Option<Handle>) -> Option<Handle> {
        self.popped = true;
        self.thread.pop_local_frame(result)
    }
}

impl Drop for LocalFrame<'_> {
    fn drop(&mut self) {
        if !self.popped {
            self.thread.pop_local_frame(None);
        }
    }
}
