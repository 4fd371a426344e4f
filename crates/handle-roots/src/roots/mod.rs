//! Root scanning: the collaborators a pause visits and the iterators that
//! visit them.
//!
//! A [`RootSet`] names every root category of the runtime. JNI handles and
//! thread roots come from the [`ThreadRegistry`] and its [`HandleTable`];
//! every other category is an external collaborator implementing
//! [`StrongRootSource`] or [`WeakRootSource`]. Unregistered categories are
//! empty.
//!
//! The iterators in [`iterator`] compose these categories into fixed, ordered
//! lists of root groups, each behind a [`ClaimOnce`] guard.

#![allow(missing_docs)]
#![allow(clippy::must_use_candidate)]

pub mod claim;
pub mod iterator;

use std::sync::Arc;

pub use claim::{ClaimOnce, ClaimState, Concurrency};
pub use iterator::{
    ConcurrentWeakRootIterator, StrongRootIterator, ThreadRootIterator, WeakRootIterator,
};

use crate::config::RootsConfig;
use crate::handles::HandleTable;
use crate::slot::{IsAlive, RootVisitor};
use crate::threads::ThreadRegistry;

/// A category of strong roots owned by a collaborator.
///
/// Sources registered for a parallel group are entered by every worker and
/// must hand each root to exactly one of them.
pub trait StrongRootSource: Send + Sync {
    fn oops_do(&self, visitor: &mut dyn RootVisitor);

    /// Called once when an iterator is created, before any worker runs.
    fn gc_prologue(&self) {}

    /// Called once when an iterator is dropped.
    fn gc_epilogue(&self) {}
}

/// A category of weak roots owned by a collaborator.
pub trait WeakRootSource: Send + Sync {
    /// Clear roots whose referent is dead and visit the others.
    fn unlink_or_oops_do(&self, is_alive: &dyn IsAlive, visitor: &mut dyn RootVisitor);

    fn gc_prologue(&self) {}

    fn gc_epilogue(&self) {}
}

impl<F> StrongRootSource for F
where
    F: Fn(&mut dyn RootVisitor) + Send + Sync,
{
    fn oops_do(&self, visitor: &mut dyn RootVisitor) {
        self(visitor);
    }
}

impl<F> WeakRootSource for F
where
    F: Fn(&dyn IsAlive, &mut dyn RootVisitor) + Send + Sync,
{
    fn unlink_or_oops_do(&self, is_alive: &dyn IsAlive, visitor: &mut dyn RootVisitor) {
        self(is_alive, visitor);
    }
}

/// An empty root category.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRoots;

impl StrongRootSource for NoRoots {
    fn oops_do(&self, _visitor: &mut dyn RootVisitor) {}
}

impl WeakRootSource for NoRoots {
    fn unlink_or_oops_do(&self, _is_alive: &dyn IsAlive, _visitor: &mut dyn RootVisitor) {}
}

/// Every root category of the runtime, plus the switches selecting how weak
/// categories are scanned.
pub struct RootSet {
    registry: Arc<ThreadRegistry>,
    config: RootsConfig,
    pub(crate) universe: Arc<dyn StrongRootSource>,
    pub(crate) object_synchronizer: Arc<dyn StrongRootSource>,
    pub(crate) management: Arc<dyn StrongRootSource>,
    pub(crate) jvmti_export: Arc<dyn StrongRootSource>,
    pub(crate) system_dictionary: Arc<dyn StrongRootSource>,
    pub(crate) class_loader_data_graph: Arc<dyn StrongRootSource>,
    pub(crate) code_cache: Arc<dyn StrongRootSource>,
    pub(crate) jvmti_weak_export: Arc<dyn WeakRootSource>,
    pub(crate) trace: Arc<dyn WeakRootSource>,
    pub(crate) symbol_table: Arc<dyn WeakRootSource>,
    pub(crate) string_table: Arc<dyn WeakRootSource>,
}

impl RootSet {
    /// A root set with only JNI handle and thread roots.
    pub fn new(registry: Arc<ThreadRegistry>) -> Self {
        Self::with_config(registry, RootsConfig::default())
    }

    pub fn with_config(registry: Arc<ThreadRegistry>, config: RootsConfig) -> Self {
        let strong: Arc<dyn StrongRootSource> = Arc::new(NoRoots);
        let weak: Arc<dyn WeakRootSource> = Arc::new(NoRoots);
        Self {
            registry,
            config,
            universe: Arc::clone(&strong),
            object_synchronizer: Arc::clone(&strong),
            management: Arc::clone(&strong),
            jvmti_export: Arc::clone(&strong),
            system_dictionary: Arc::clone(&strong),
            class_loader_data_graph: Arc::clone(&strong),
            code_cache: strong,
            jvmti_weak_export: Arc::clone(&weak),
            trace: Arc::clone(&weak),
            symbol_table: Arc::clone(&weak),
            string_table: weak,
        }
    }

    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    pub fn handles(&self) -> &HandleTable {
        self.registry.handles()
    }

    pub fn config(&self) -> &RootsConfig {
        &self.config
    }

    #[must_use]
    pub fn with_universe(mut self, source: Arc<dyn StrongRootSource>) -> Self {
        self.universe = source;
        self
    }

    #[must_use]
    pub fn with_object_synchronizer(mut self, source: Arc<dyn StrongRootSource>) -> Self {
        self.object_synchronizer = source;
        self
    }

    #[must_use]
    pub fn with_management(mut self, source: Arc<dyn StrongRootSource>) -> Self {
        self.management = source;
        self
    }

    #[must_use]
    pub fn with_jvmti_export(mut self, source: Arc<dyn StrongRootSource>) -> Self {
        self.jvmti_export = source;
        self
    }

    #[must_use]
    pub fn with_system_dictionary(mut self, source: Arc<dyn StrongRootSource>) -> Self {
        self.system_dictionary = source;
        self
    }

    /// Install the class-loader graph. Entered by every worker.
    #[must_use]
    pub fn with_class_loader_data_graph(mut self, source: Arc<dyn StrongRootSource>) -> Self {
        self.class_loader_data_graph = source;
        self
    }

    /// Install the code cache. Entered by every worker.
    #[must_use]
    pub fn with_code_cache(mut self, source: Arc<dyn StrongRootSource>) -> Self {
        self.code_cache = source;
        self
    }

    #[must_use]
    pub fn with_jvmti_weak_export(mut self, source: Arc<dyn WeakRootSource>) -> Self {
        self.jvmti_weak_export = source;
        self
    }

    #[must_use]
    pub fn with_trace(mut self, source: Arc<dyn WeakRootSource>) -> Self {
        self.trace = source;
        self
    }

    /// Install the symbol table. Entered by every worker.
    #[must_use]
    pub fn with_symbol_table(mut self, source: Arc<dyn WeakRootSource>) -> Self {
        self.symbol_table = source;
        self
    }

    /// Install the string table. Entered by every worker.
    #[must_use]
    pub fn with_string_table(mut self, source: Arc<dyn WeakRootSource>) -> Self {
        self.string_table = source;
        self
    }
}

impl std::fmt::Debug for RootSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootSet")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_util::{obj, CountingSource, RecordingVisitor};
    use crate::slot::{AlwaysAlive, RootSlot};

    fn registry() -> Arc<ThreadRegistry> {
        Arc::new(ThreadRegistry::new(Arc::new(HandleTable::default())))
    }

    #[test]
    fn test_default_sources_are_empty() {
        let roots = RootSet::new(registry());
        let mut visitor = RecordingVisitor::default();
        roots.universe.oops_do(&mut visitor);
        roots.string_table.unlink_or_oops_do(&AlwaysAlive, &mut visitor);
        assert_eq!(visitor.total(), 0);
        assert!(roots.config().weak_roots);
    }

    #[test]
    fn test_with_methods_install_sources() {
        let code_cache = Arc::new(CountingSource::default());
        let symbol_table = Arc::new(CountingSource::default());
        let roots = RootSet::new(registry())
            .with_code_cache(code_cache.clone())
            .with_symbol_table(symbol_table.clone());

        roots.code_cache.gc_prologue();
        roots.code_cache.oops_do(&mut RecordingVisitor::default());
        roots
            .symbol_table
            .unlink_or_oops_do(&AlwaysAlive, &mut RecordingVisitor::default());

        assert_eq!(code_cache.prologues(), 1);
        assert_eq!(code_cache.calls(), 1);
        assert_eq!(symbol_table.calls(), 1);
        assert_eq!(symbol_table.epilogues(), 0);
    }

    #[test]
    fn test_closure_sources() {
        let slot = Arc::new(RootSlot::null());
        slot.store(Some(obj(3)));
        let weak_slot = Arc::clone(&slot);
        let roots = RootSet::new(registry())
            .with_universe(Arc::new({
                let slot = Arc::clone(&slot);
                move |visitor: &mut dyn RootVisitor| visitor.visit(&slot)
            }))
            .with_trace(Arc::new(
                move |is_alive: &dyn IsAlive, visitor: &mut dyn RootVisitor| {
                    if weak_slot.load().is_some_and(|o| is_alive.is_alive(o)) {
                        visitor.visit(&weak_slot);
                    }
                },
            ));

        let mut visitor = RecordingVisitor::default();
        roots.universe.oops_do(&mut visitor);
        roots.trace.unlink_or_oops_do(&AlwaysAlive, &mut visitor);
        roots
            .trace
            .unlink_or_oops_do(&|_: crate::ObjectRef| false, &mut visitor);
        assert_eq!(visitor.count(&slot), 2);
    }
}
