//! Root iterators.
//!
//! Each iterator is created once per pause (or concurrent phase), shared by
//! reference among any number of GC workers, and dropped when the workers are
//! done. Every worker calls the iterator's visit entry point with its own
//! visitor; the [`ClaimOnce`] guard of each group decides whether that worker
//! executes the group.
//!
//! | iterator                       | needs safepoint | groups |
//! |--------------------------------|-----------------|--------|
//! | [`StrongRootIterator`]         | yes             | 13     |
//! | [`WeakRootIterator`]           | yes             | 5      |
//! | [`ConcurrentWeakRootIterator`] | no              | 1      |
//! | [`ThreadRootIterator`]         | yes             | 1      |

#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]

use std::ptr;

use super::claim::ClaimOnce;
use super::RootSet;
use crate::slot::{AlwaysAlive, IsAlive, RootVisitor};
use crate::storage::ParState;
use crate::threads::Safepoint;

#[cfg(feature = "tracing")]
use crate::tracing::{
    log_iterator_setup, log_iterator_teardown, next_scan_id, trace_root_pass, ScanId,
};

#[track_caller]
fn assert_safepoint(roots: &RootSet, safepoint: &Safepoint<'_>) {
    debug_assert!(
        ptr::eq(safepoint.registry(), roots.registry().as_ref()),
        "safepoint belongs to another thread registry"
    );
    debug_assert!(roots.registry().is_at_safepoint(), "should be at safepoint");
}

/// Teardown check shared by the iterators that scan threads.
///
/// Skipped while unwinding so a panicking worker is reported, not masked.
fn assert_all_threads_claimed(roots: &RootSet) {
    if !std::thread::panicking() {
        roots.registry().assert_all_threads_claimed();
    }
}

// ============================================================================
// StrongRootIterator
// ============================================================================

/// All strong roots of a pause, optionally with the weak categories folded in.
pub struct StrongRootIterator<'a> {
    roots: &'a RootSet,
    _safepoint: &'a Safepoint<'a>,
    parity: u32,
    #[cfg(feature = "tracing")]
    scan_id: ScanId,
    universe: ClaimOnce,
    jni_handles: ClaimOnce,
    jni_weak_handles: ClaimOnce,
    object_synchronizer: ClaimOnce,
    management: ClaimOnce,
    jvmti_export: ClaimOnce,
    jvmti_weak_export: ClaimOnce,
    trace: ClaimOnce,
    system_dictionary: ClaimOnce,
    class_loader_data_graph: ClaimOnce,
    threads: ClaimOnce,
    code_cache: ClaimOnce,
    string_table: ClaimOnce,
}

impl<'a> StrongRootIterator<'a> {
    /// Advance the thread claim parity and reset collaborator claim state.
    #[track_caller]
    pub fn new(roots: &'a RootSet, safepoint: &'a Safepoint<'a>) -> Self {
        assert_safepoint(roots, safepoint);

        let parity = roots.registry().change_thread_claim_parity();
        roots.string_table.gc_prologue();
        roots.class_loader_data_graph.gc_prologue();
        roots.code_cache.gc_prologue();

        #[cfg(feature = "tracing")]
        let scan_id = next_scan_id();
        #[cfg(feature = "tracing")]
        log_iterator_setup("strong", scan_id, Some(parity));

        Self {
            roots,
            _safepoint: safepoint,
            parity,
            #[cfg(feature = "tracing")]
            scan_id,
            universe: ClaimOnce::serial("universe"),
            jni_handles: ClaimOnce::serial("jni_handles"),
            jni_weak_handles: ClaimOnce::serial("jni_weak_handles"),
            object_synchronizer: ClaimOnce::serial("object_synchronizer"),
            management: ClaimOnce::serial("management"),
            jvmti_export: ClaimOnce::serial("jvmti_export"),
            jvmti_weak_export: ClaimOnce::serial("jvmti_weak_export"),
            trace: ClaimOnce::serial("trace"),
            system_dictionary: ClaimOnce::serial("system_dictionary"),
            class_loader_data_graph: ClaimOnce::parallel("class_loader_data_graph"),
            threads: ClaimOnce::parallel("threads"),
            code_cache: ClaimOnce::parallel("code_cache"),
            string_table: ClaimOnce::parallel("string_table"),
        }
    }

    /// Parity this pass claims threads with.
    pub fn parity(&self) -> u32 {
        self.parity
    }

    /// Visit strong roots with this worker's `visitor`.
    ///
    /// When weak roots have no phase of their own, the weak categories are
    /// visited here as if every referent were live. Otherwise
    /// `visit_jvmti_weak_export` selects whether the JVMTI weak export is
    /// visited as a strong root.
    pub fn oops_do(&self, visitor: &mut dyn RootVisitor, visit_jvmti_weak_export: bool) {
        #[cfg(feature = "tracing")]
        let _span = trace_root_pass("strong", self.scan_id);

        let roots = self.roots;
        self.universe.run(|| roots.universe.oops_do(visitor));
        self.jni_handles.run(|| roots.handles().oops_do(visitor));
        self.object_synchronizer
            .run(|| roots.object_synchronizer.oops_do(visitor));
        self.management.run(|| roots.management.oops_do(visitor));
        self.jvmti_export.run(|| roots.jvmti_export.oops_do(visitor));
        self.system_dictionary
            .run(|| roots.system_dictionary.oops_do(visitor));
        self.class_loader_data_graph
            .run(|| roots.class_loader_data_graph.oops_do(visitor));
        self.threads.run(|| {
            roots
                .registry()
                .possibly_parallel_oops_do(self.parity, visitor);
        });
        self.code_cache.run(|| roots.code_cache.oops_do(visitor));

        if !roots.config().weak_roots {
            self.jni_weak_handles
                .run(|| roots.handles().weak_oops_do(&AlwaysAlive, visitor));
            self.jvmti_weak_export.run(|| {
                roots
                    .jvmti_weak_export
                    .unlink_or_oops_do(&AlwaysAlive, visitor);
            });
            self.trace
                .run(|| roots.trace.unlink_or_oops_do(&AlwaysAlive, visitor));
            self.string_table
                .run(|| roots.string_table.unlink_or_oops_do(&AlwaysAlive, visitor));
        } else if visit_jvmti_weak_export {
            self.jvmti_weak_export.run(|| {
                roots
                    .jvmti_weak_export
                    .unlink_or_oops_do(&AlwaysAlive, visitor);
            });
        }
    }

    /// Guards of every group, in visit order.
    pub fn groups(&self) -> [&ClaimOnce; 13] {
        [
            &self.universe,
            &self.jni_handles,
            &self.object_synchronizer,
            &self.management,
            &self.jvmti_export,
            &self.system_dictionary,
            &self.class_loader_data_graph,
            &self.threads,
            &self.code_cache,
            &self.jni_weak_handles,
            &self.jvmti_weak_export,
            &self.trace,
            &self.string_table,
        ]
    }
}

impl Drop for StrongRootIterator<'_> {
    fn drop(&mut self) {
        self.roots.code_cache.gc_epilogue();
        self.roots.jvmti_export.gc_epilogue();
        assert_all_threads_claimed(self.roots);

        #[cfg(feature = "tracing")]
        log_iterator_teardown("strong", self.scan_id);
    }
}

impl std::fmt::Debug for StrongRootIterator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrongRootIterator")
            .field("parity", &self.parity)
            .field("groups", &self.groups())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// WeakRootIterator
// ============================================================================

/// Weak roots processed at a pause.
pub struct WeakRootIterator<'a> {
    roots: &'a RootSet,
    _safepoint: &'a Safepoint<'a>,
    #[cfg(feature = "tracing")]
    scan_id: ScanId,
    jni_weak_handles: ClaimOnce,
    jvmti_weak_export: ClaimOnce,
    trace: ClaimOnce,
    symbol_table: ClaimOnce,
    string_table: ClaimOnce,
}

impl<'a> WeakRootIterator<'a> {
    #[track_caller]
    pub fn new(roots: &'a RootSet, safepoint: &'a Safepoint<'a>) -> Self {
        assert_safepoint(roots, safepoint);

        roots.symbol_table.gc_prologue();
        roots.string_table.gc_prologue();

        #[cfg(feature = "tracing")]
        let scan_id = next_scan_id();
        #[cfg(feature = "tracing")]
        log_iterator_setup("weak", scan_id, None);

        Self {
            roots,
            _safepoint: safepoint,
            #[cfg(feature = "tracing")]
            scan_id,
            jni_weak_handles: ClaimOnce::serial("jni_weak_handles"),
            jvmti_weak_export: ClaimOnce::serial("jvmti_weak_export"),
            trace: ClaimOnce::serial("trace"),
            symbol_table: ClaimOnce::parallel("symbol_table"),
            string_table: ClaimOnce::parallel("string_table"),
        }
    }

    /// Clear weak roots whose referent is dead and visit the others.
    ///
    /// The symbol table is always processed. The remaining categories are
    /// only processed when weak roots have a phase of their own; JNI weak
    /// handles are skipped when the concurrent weak iterator owns them.
    pub fn unlink_or_oops_do(&self, is_alive: &dyn IsAlive, visitor: &mut dyn RootVisitor) {
        #[cfg(feature = "tracing")]
        let _span = trace_root_pass("weak", self.scan_id);

        let roots = self.roots;
        let config = roots.config();
        self.symbol_table
            .run(|| roots.symbol_table.unlink_or_oops_do(is_alive, visitor));
        if config.weak_roots {
            if !config.concurrent_jni_weak_global_handles {
                self.jni_weak_handles
                    .run(|| roots.handles().weak_oops_do(is_alive, visitor));
            }
            self.jvmti_weak_export
                .run(|| roots.jvmti_weak_export.unlink_or_oops_do(is_alive, visitor));
            self.trace
                .run(|| roots.trace.unlink_or_oops_do(is_alive, visitor));
            self.string_table
                .run(|| roots.string_table.unlink_or_oops_do(is_alive, visitor));
        }
    }

    /// Visit weak roots as if every referent were live.
    pub fn oops_do(&self, visitor: &mut dyn RootVisitor) {
        self.unlink_or_oops_do(&AlwaysAlive, visitor);
    }

    pub fn groups(&self) -> [&ClaimOnce; 5] {
        [
            &self.symbol_table,
            &self.jni_weak_handles,
            &self.jvmti_weak_export,
            &self.trace,
            &self.string_table,
        ]
    }
}

impl Drop for WeakRootIterator<'_> {
    fn drop(&mut self) {
        self.roots.symbol_table.gc_epilogue();
        self.roots.string_table.gc_epilogue();

        #[cfg(feature = "tracing")]
        log_iterator_teardown("weak", self.scan_id);
    }
}

impl std::fmt::Debug for WeakRootIterator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakRootIterator")
            .field("groups", &self.groups())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ConcurrentWeakRootIterator
// ============================================================================

/// JNI weak handles scanned while mutators run.
///
/// Workers share a partition of the weak-global storage, so each slot that
/// existed when the iterator was created is visited by exactly one worker.
/// Handles created during the scan may or may not be visited.
pub struct ConcurrentWeakRootIterator<'a> {
    roots: &'a RootSet,
    par_state: ParState<'a>,
    #[cfg(feature = "tracing")]
    scan_id: ScanId,
    jni_weak_handles: ClaimOnce,
}

impl<'a> ConcurrentWeakRootIterator<'a> {
    pub fn new(roots: &'a RootSet) -> Self {
        #[cfg(feature = "tracing")]
        let scan_id = next_scan_id();
        #[cfg(feature = "tracing")]
        log_iterator_setup("concurrent_weak", scan_id, None);

        Self {
            roots,
            par_state: roots.handles().weak_global_handles().par_state(),
            #[cfg(feature = "tracing")]
            scan_id,
            jni_weak_handles: ClaimOnce::parallel("jni_weak_handles"),
        }
    }

    fn is_active(&self) -> bool {
        let config = self.roots.config();
        config.weak_roots && config.concurrent_jni_weak_global_handles
    }

    /// Visit this worker's share of the weak-global handles.
    pub fn oops_do(&self, visitor: &mut dyn RootVisitor) {
        if !self.is_active() {
            return;
        }
        #[cfg(feature = "tracing")]
        let _span = trace_root_pass("concurrent_weak", self.scan_id);
        self.jni_weak_handles.run(|| self.par_state.oops_do(visitor));
    }

    /// Clear dead weak-global handles in this worker's share and visit the
    /// others.
    pub fn unlink_or_oops_do(&self, is_alive: &dyn IsAlive, visitor: &mut dyn RootVisitor) {
        if !self.is_active() {
            return;
        }
        #[cfg(feature = "tracing")]
        let _span = trace_root_pass("concurrent_weak", self.scan_id);
        self.jni_weak_handles
            .run(|| self.par_state.weak_oops_do(is_alive, visitor));
    }

    pub fn group(&self) -> &ClaimOnce {
        &self.jni_weak_handles
    }
}

#[cfg(feature = "tracing")]
impl Drop for ConcurrentWeakRootIterator<'_> {
    fn drop(&mut self) {
        log_iterator_teardown("concurrent_weak", self.scan_id);
    }
}

impl std::fmt::Debug for ConcurrentWeakRootIterator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentWeakRootIterator")
            .field("par_state", &self.par_state)
            .field("group", &self.jni_weak_handles)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ThreadRootIterator
// ============================================================================

/// Thread roots only: local handles and stacks of every attached thread.
pub struct ThreadRootIterator<'a> {
    roots: &'a RootSet,
    _safepoint: &'a Safepoint<'a>,
    parity: u32,
    #[cfg(feature = "tracing")]
    scan_id: ScanId,
    threads: ClaimOnce,
}

impl<'a> ThreadRootIterator<'a> {
    #[track_caller]
    pub fn new(roots: &'a RootSet, safepoint: &'a Safepoint<'a>) -> Self {
        assert_safepoint(roots, safepoint);
        let parity = roots.registry().change_thread_claim_parity();

        #[cfg(feature = "tracing")]
        let scan_id = next_scan_id();
        #[cfg(feature = "tracing")]
        log_iterator_setup("thread", scan_id, Some(parity));

        Self {
            roots,
            _safepoint: safepoint,
            parity,
            #[cfg(feature = "tracing")]
            scan_id,
            threads: ClaimOnce::parallel("threads"),
        }
    }

    pub fn parity(&self) -> u32 {
        self.parity
    }

    pub fn oops_do(&self, visitor: &mut dyn RootVisitor) {
        #[cfg(feature = "tracing")]
        let _span = trace_root_pass("thread", self.scan_id);
        let registry = self.roots.registry();
        self.threads
            .run(|| registry.possibly_parallel_oops_do(self.parity, visitor));
    }

    pub fn group(&self) -> &ClaimOnce {
        &self.threads
    }
}

impl Drop for ThreadRootIterator<'_> {
    fn drop(&mut self) {
        assert_all_threads_claimed(self.roots);

        #[cfg(feature = "tracing")]
        log_iterator_teardown("thread", self.scan_id);
    }
}

impl std::fmt::Debug for ThreadRootIterator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRootIterator")
            .field("parity", &self.parity)
            .field("group", &self.threads)
            .finish_non_exhaustive()
    }
}
