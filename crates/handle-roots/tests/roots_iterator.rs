//! Integration tests for the paused root iterators.
//!
//! Each test runs one or more GC workers over a shared iterator and checks
//! which slots were visited, and how often.

use std::collections::HashSet;
use std::sync::{Arc, Barrier, Mutex};

use handle_roots::test_util::{self, CountingSource, SharedVisits};
use handle_roots::threads::ContextId;
use handle_roots::{
    HandleTable, ObjectRef, RootSet, RootSlot, RootVisitor, RootsConfig, StackRoots,
    StrongRootIterator, ThreadContext, ThreadRegistry, ThreadRootIterator, WeakRootIterator,
};

fn obj(n: usize) -> Option<ObjectRef> {
    Some(test_util::obj(n))
}

fn registry() -> Arc<ThreadRegistry> {
    Arc::new(ThreadRegistry::new(Arc::new(HandleTable::default())))
}

/// Run `f` on `workers` threads released together.
fn run_workers(workers: usize, f: impl Fn() + Sync) {
    let barrier = Barrier::new(workers);
    std::thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| {
                barrier.wait();
                f();
            });
        }
    });
}

// ============================================================================
// StrongRootIterator
// ============================================================================

#[test]
fn test_global_visited_once_then_gone() {
    let registry = registry();
    let roots = RootSet::new(Arc::clone(&registry));
    let handles = registry.handles();
    let global = handles.make_global(obj(1)).unwrap();
    let slot = handles.slot(global).unwrap();

    let visits = SharedVisits::default();
    {
        let safepoint = registry.begin_safepoint();
        let iter = StrongRootIterator::new(&roots, &safepoint);
        run_workers(4, || visits.record(|v| iter.oops_do(v, false)));
    }
    assert_eq!(visits.count(slot), 1);

    handles.destroy_global(Some(global));

    let visits = SharedVisits::default();
    {
        let safepoint = registry.begin_safepoint();
        let iter = StrongRootIterator::new(&roots, &safepoint);
        visits.record(|v| iter.oops_do(v, false));
    }
    assert_eq!(visits.count(slot), 0);
}

#[test]
fn test_serial_groups_run_once_parallel_groups_every_worker() {
    const WORKERS: usize = 6;
    let registry = registry();
    let universe = Arc::new(CountingSource::default());
    let system_dictionary = Arc::new(CountingSource::default());
    let cldg = Arc::new(CountingSource::default());
    let code_cache = Arc::new(CountingSource::default());
    let roots = RootSet::new(Arc::clone(&registry))
        .with_universe(universe.clone())
        .with_system_dictionary(system_dictionary.clone())
        .with_class_loader_data_graph(cldg.clone())
        .with_code_cache(code_cache.clone());

    {
        let safepoint = registry.begin_safepoint();
        let iter = StrongRootIterator::new(&roots, &safepoint);
        run_workers(WORKERS, || iter.oops_do(&mut |_: &RootSlot| {}, false));
    }

    assert_eq!(universe.calls(), 1);
    assert_eq!(system_dictionary.calls(), 1);
    assert_eq!(cldg.calls(), WORKERS);
    assert_eq!(code_cache.calls(), WORKERS);
}

#[test]
fn test_strong_setup_and_teardown_notify_collaborators() {
    let registry = registry();
    let cldg = Arc::new(CountingSource::default());
    let code_cache = Arc::new(CountingSource::default());
    let jvmti_export = Arc::new(CountingSource::default());
    let string_table = Arc::new(CountingSource::default());
    let roots = RootSet::new(Arc::clone(&registry))
        .with_class_loader_data_graph(cldg.clone())
        .with_code_cache(code_cache.clone())
        .with_jvmti_export(jvmti_export.clone())
        .with_string_table(string_table.clone());

    let safepoint = registry.begin_safepoint();
    let iter = StrongRootIterator::new(&roots, &safepoint);
    assert_eq!(cldg.prologues(), 1);
    assert_eq!(code_cache.prologues(), 1);
    assert_eq!(string_table.prologues(), 1);
    assert_eq!(code_cache.epilogues(), 0);

    drop(iter);
    assert_eq!(code_cache.epilogues(), 1);
    assert_eq!(jvmti_export.epilogues(), 1);
}

#[test]
fn test_weak_categories_folded_into_strong_pass() {
    let registry = registry();
    let handles = registry.handles();
    let weak = handles.make_weak_global(obj(1)).unwrap();
    let weak_slot = handles.slot(weak).unwrap();
    let trace = Arc::new(CountingSource::default());

    let folded = RootSet::with_config(
        Arc::clone(&registry),
        RootsConfig {
            weak_roots: false,
            ..RootsConfig::default()
        },
    )
    .with_trace(trace.clone());
    let visits = SharedVisits::default();
    {
        let safepoint = registry.begin_safepoint();
        let iter = StrongRootIterator::new(&folded, &safepoint);
        run_workers(3, || visits.record(|v| iter.oops_do(v, false)));
    }
    assert_eq!(visits.count(weak_slot), 1);
    assert_eq!(trace.calls(), 1);

    let separate = RootSet::new(Arc::clone(&registry)).with_trace(trace.clone());
    let visits = SharedVisits::default();
    {
        let safepoint = registry.begin_safepoint();
        let iter = StrongRootIterator::new(&separate, &safepoint);
        visits.record(|v| iter.oops_do(v, true));
    }
    assert_eq!(visits.count(weak_slot), 0);
    assert_eq!(trace.calls(), 1);
}

#[test]
fn test_jvmti_weak_export_as_strong_root() {
    let registry = registry();
    let export = Arc::new(CountingSource::default());
    let roots = RootSet::new(Arc::clone(&registry)).with_jvmti_weak_export(export.clone());

    {
        let safepoint = registry.begin_safepoint();
        let iter = StrongRootIterator::new(&roots, &safepoint);
        iter.oops_do(&mut |_: &RootSlot| {}, false);
    }
    assert_eq!(export.calls(), 0);

    {
        let safepoint = registry.begin_safepoint();
        let iter = StrongRootIterator::new(&roots, &safepoint);
        run_workers(4, || iter.oops_do(&mut |_: &RootSlot| {}, true));
    }
    assert_eq!(export.calls(), 1);
}

#[test]
fn test_strong_pass_visits_every_local_once() {
    const THREADS: usize = 12;
    const LOCALS: usize = 40;
    let registry = registry();
    let threads: Vec<_> = (0..THREADS).map(|_| registry.attach()).collect();
    for thread in &threads {
        for n in 1..=LOCALS {
            thread.make_local(obj(n));
        }
    }
    let roots = RootSet::new(Arc::clone(&registry));

    let visits = SharedVisits::default();
    {
        let safepoint = registry.begin_safepoint();
        let iter = StrongRootIterator::new(&roots, &safepoint);
        run_workers(5, || visits.record(|v| iter.oops_do(v, false)));
    }

    assert_eq!(visits.total(), THREADS * LOCALS);
    assert!(visits.all_visited_once());
}

#[test]
fn test_strong_pass_closure_sources() {
    let registry = registry();
    let slot = Arc::new(RootSlot::null());
    slot.store(obj(9));
    let universe = {
        let slot = Arc::clone(&slot);
        move |visitor: &mut dyn RootVisitor| visitor.visit(&slot)
    };
    let roots = RootSet::new(Arc::clone(&registry)).with_universe(Arc::new(universe));

    let visits = SharedVisits::default();
    {
        let safepoint = registry.begin_safepoint();
        let iter = StrongRootIterator::new(&roots, &safepoint);
        run_workers(4, || visits.record(|v| iter.oops_do(v, false)));
    }
    assert_eq!(visits.count(&slot), 1);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "not claimed")]
fn test_unscanned_thread_fails_teardown() {
    let registry = registry();
    let _thread = registry.attach();
    let roots = RootSet::new(Arc::clone(&registry));

    let safepoint = registry.begin_safepoint();
    let iter = StrongRootIterator::new(&roots, &safepoint);
    drop(iter);
}

#[test]
#[cfg(not(debug_assertions))]
fn test_unscanned_thread_teardown_is_silent_in_release() {
    let registry = registry();
    let _thread = registry.attach();
    let roots = RootSet::new(Arc::clone(&registry));

    let safepoint = registry.begin_safepoint();
    let iter = StrongRootIterator::new(&roots, &safepoint);
    drop(iter);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "another thread registry")]
fn test_safepoint_of_other_registry_panics() {
    let registry = registry();
    let other = ThreadRegistry::new(Arc::new(HandleTable::default()));
    let roots = RootSet::new(registry);

    let safepoint = other.begin_safepoint();
    let _iter = ThreadRootIterator::new(&roots, &safepoint);
}

// ============================================================================
// WeakRootIterator
// ============================================================================

#[test]
fn test_weak_pass_clears_dead_referent() {
    let registry = registry();
    let handles = registry.handles();
    let dead = handles.make_weak_global(obj(1)).unwrap();
    let live = handles.make_weak_global(obj(2)).unwrap();
    let roots = RootSet::with_config(
        Arc::clone(&registry),
        RootsConfig {
            weak_roots: true,
            concurrent_jni_weak_global_handles: false,
        },
    );
    let dead_obj = obj(1).unwrap();
    let is_alive = move |o: ObjectRef| o != dead_obj;

    let visits = SharedVisits::default();
    {
        let safepoint = registry.begin_safepoint();
        let iter = WeakRootIterator::new(&roots, &safepoint);
        run_workers(4, || visits.record(|v| iter.unlink_or_oops_do(&is_alive, v)));
    }

    assert!(handles.is_global_weak_cleared(dead));
    assert_eq!(handles.resolve(Some(dead)), None);
    assert!(!handles.is_global_weak_cleared(live));
    assert_eq!(visits.count(handles.slot(live).unwrap()), 1);
    assert_eq!(visits.count(handles.slot(dead).unwrap()), 0);
}

#[test]
fn test_weak_pass_leaves_jni_weak_to_concurrent_phase() {
    let registry = registry();
    let handles = registry.handles();
    let weak = handles.make_weak_global(obj(1)).unwrap();
    let roots = RootSet::new(Arc::clone(&registry));

    {
        let safepoint = registry.begin_safepoint();
        let iter = WeakRootIterator::new(&roots, &safepoint);
        iter.unlink_or_oops_do(&|_: ObjectRef| false, &mut |_: &RootSlot| {});
    }

    assert!(!handles.is_global_weak_cleared(weak));
}

#[test]
fn test_weak_switch_off_only_symbol_table() {
    let registry = registry();
    let symbol_table = Arc::new(CountingSource::default());
    let string_table = Arc::new(CountingSource::default());
    let trace = Arc::new(CountingSource::default());
    let roots = RootSet::with_config(
        Arc::clone(&registry),
        RootsConfig {
            weak_roots: false,
            concurrent_jni_weak_global_handles: false,
        },
    )
    .with_symbol_table(symbol_table.clone())
    .with_string_table(string_table.clone())
    .with_trace(trace.clone());

    {
        let safepoint = registry.begin_safepoint();
        let iter = WeakRootIterator::new(&roots, &safepoint);
        run_workers(3, || iter.oops_do(&mut |_: &RootSlot| {}));
    }

    assert_eq!(symbol_table.calls(), 3);
    assert_eq!(symbol_table.prologues(), 1);
    assert_eq!(symbol_table.epilogues(), 1);
    assert_eq!(string_table.calls(), 0);
    assert_eq!(trace.calls(), 0);
}

#[test]
fn test_weak_oops_do_keeps_everything() {
    let registry = registry();
    let handles = registry.handles();
    let weak = handles.make_weak_global(obj(1)).unwrap();
    let roots = RootSet::with_config(
        Arc::clone(&registry),
        RootsConfig {
            weak_roots: true,
            concurrent_jni_weak_global_handles: false,
        },
    );

    let visits = SharedVisits::default();
    {
        let safepoint = registry.begin_safepoint();
        let iter = WeakRootIterator::new(&roots, &safepoint);
        visits.record(|v| iter.oops_do(v));
    }
    assert_eq!(visits.count(handles.slot(weak).unwrap()), 1);
    assert_eq!(handles.resolve(Some(weak)), obj(1));
}

// ============================================================================
// ThreadRootIterator
// ============================================================================

#[derive(Default)]
struct RecordingStacks {
    scanned: Mutex<Vec<ContextId>>,
}

impl StackRoots for RecordingStacks {
    fn oops_do(&self, thread: &ThreadContext, _visitor: &mut dyn RootVisitor) {
        self.scanned.lock().unwrap().push(thread.id());
    }
}

#[test]
fn test_thread_roots_only() {
    let stack_roots = Arc::new(RecordingStacks::default());
    let registry = Arc::new(
        ThreadRegistry::new(Arc::new(HandleTable::default()))
            .with_stack_roots(stack_roots.clone()),
    );
    let threads: Vec<_> = (0..8).map(|_| registry.attach()).collect();
    for (n, thread) in threads.iter().enumerate() {
        thread.make_local(obj(n + 1));
    }
    let global = registry.handles().make_global(obj(100)).unwrap();
    let roots = RootSet::new(Arc::clone(&registry));

    let visits = SharedVisits::default();
    {
        let safepoint = registry.begin_safepoint();
        let iter = ThreadRootIterator::new(&roots, &safepoint);
        run_workers(3, || visits.record(|v| iter.oops_do(v)));
        assert_eq!(iter.parity(), registry.claim_parity().current());
    }

    assert_eq!(visits.total(), 8);
    assert_eq!(visits.count(registry.handles().slot(global).unwrap()), 0);

    let scanned = stack_roots.scanned.lock().unwrap();
    let unique: HashSet<_> = scanned.iter().copied().collect();
    assert_eq!(scanned.len(), 8, "each stack scanned exactly once");
    assert_eq!(unique.len(), 8);
}

#[test]
fn test_parity_advances_per_iterator() {
    let registry = registry();
    let thread = registry.attach();
    let roots = RootSet::new(Arc::clone(&registry));

    let mut parities = Vec::new();
    for _ in 0..3 {
        let safepoint = registry.begin_safepoint();
        let iter = ThreadRootIterator::new(&roots, &safepoint);
        iter.oops_do(&mut |_: &RootSlot| {});
        parities.push(iter.parity());
        assert_eq!(thread.oops_do_parity(), iter.parity());
    }
    assert_eq!(parities, vec![1, 2, 1]);
}
