// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for kernel-thread attach/detach
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! TEST_COVERAGE: scenario, hook ordering, grab ledger properties, cross-thread visibility
//!
//! TEST_SCOPE:
//!   - Binding/retained-load state machine across attach and detach
//!   - Grab count equals the number of threads retaining a context
//!   - Reuse path: no switch, no grab churn, explicit barrier
//!   - Barrier placement on every path
//!   - User-memory stores visible before a scanner observes the binding cleared or moved
//!
//! TEST_SCENARIOS:
//!   - switch_then_reuse_scenario(): A -> B -> detach -> B again
//!   - last_grab_frees_unowned_context(): replaced context is freed when nothing else holds it
//!   - *_hook_order(): MMU hooks and barriers per path
//!   - ledger_matches_model(): random attach/detach sequences on several threads
//!   - stores_visible_before_unbound(): two OS threads, handshake per round
//!   - stores_visible_before_rebound(): same, with a direct switch to another context

#![cfg(feature = "backend-host")]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use nexus_mmctx::{BarrierSite, KThread, MmContext, MmuEvent, NoopMmu, RecordingMmu};
use proptest::prelude::*;

#[test]
fn switch_then_reuse_scenario() {
    let mmu = RecordingMmu::new();
    let a = MmContext::new();
    let b = MmContext::new();
    let mut thread = KThread::new_kernel(&mmu);
    let observer = thread.observer();

    thread.attach(&a);
    assert_eq!(observer.current_context_id(), Some(a.id()));
    assert_eq!(a.grabs(), 1);

    thread.attach(&b);
    assert_eq!(observer.current_context_id(), Some(b.id()));
    assert_eq!(a.grabs(), 0);
    assert_eq!(b.grabs(), 1);

    thread.detach();
    assert_eq!(observer.current_context_id(), None);
    assert_eq!(observer.retained_context_id(), Some(b.id()));
    assert_eq!(b.grabs(), 1);

    mmu.take();
    thread.attach(&b);
    assert_eq!(observer.current_context_id(), Some(b.id()));
    assert_eq!(b.grabs(), 1);
    assert_eq!(mmu.switches(), 0);
    assert_eq!(mmu.barriers(BarrierSite::AttachReused), 1);
}

#[test]
fn last_grab_frees_unowned_context() {
    let a = MmContext::new();
    let b = MmContext::new();
    let freed = Arc::downgrade(&a);
    let mut thread = KThread::new_kernel(NoopMmu);

    thread.attach(&a);
    drop(a);
    assert!(freed.upgrade().is_some(), "retained slot keeps the context alive");

    thread.attach(&b);
    assert!(freed.upgrade().is_none());
    assert_eq!(b.grabs(), 1);
}

#[test]
fn first_attach_hook_order() {
    let mmu = RecordingMmu::new();
    let a = MmContext::new();
    let mut thread = KThread::new_kernel(&mmu);
    let tid = thread.tid();

    thread.attach(&a);
    assert_eq!(
        mmu.take(),
        vec![
            MmuEvent::Switch { thread: tid, prev: None, next: Some(a.id()) },
            MmuEvent::FinishPostLock,
            MmuEvent::Barrier(BarrierSite::AttachSwitched),
        ]
    );
}

#[test]
fn reuse_hook_order() {
    let mmu = RecordingMmu::new();
    let a = MmContext::new();
    let mut thread = KThread::new_kernel(&mmu);
    let tid = thread.tid();

    thread.attach(&a);
    mmu.take();
    thread.attach(&a);
    assert_eq!(a.grabs(), 1);
    assert_eq!(
        mmu.take(),
        vec![
            MmuEvent::Switch { thread: tid, prev: Some(a.id()), next: Some(a.id()) },
            MmuEvent::Barrier(BarrierSite::AttachReused),
        ]
    );
}

#[test]
fn detach_hook_order() {
    let mmu = RecordingMmu::new();
    let a = MmContext::new();
    let mut thread = KThread::new_kernel(&mmu);
    let tid = thread.tid();

    thread.attach(&a);
    mmu.take();
    thread.detach();
    assert_eq!(
        mmu.take(),
        vec![
            MmuEvent::Barrier(BarrierSite::BeforeClear),
            MmuEvent::EnterLazyTlb { thread: tid, mm: a.id() },
        ]
    );

    // Round trip: no new grab, no remap.
    thread.attach(&a);
    thread.detach();
    assert_eq!(mmu.switches(), 0);
    assert_eq!(a.grabs(), 1);
}

#[test]
fn direct_switch_hook_order() {
    let mmu = RecordingMmu::new();
    let a = MmContext::new();
    let b = MmContext::new();
    let mut thread = KThread::new_kernel(&mmu);
    let tid = thread.tid();

    thread.attach(&a);
    mmu.take();
    thread.attach(&b);
    assert_eq!(
        mmu.take(),
        vec![
            MmuEvent::Barrier(BarrierSite::BeforeClear),
            MmuEvent::Switch { thread: tid, prev: Some(a.id()), next: Some(b.id()) },
            MmuEvent::FinishPostLock,
            MmuEvent::Barrier(BarrierSite::AttachSwitched),
        ]
    );
}

#[test]
fn teardown_hook_order() {
    let mmu = RecordingMmu::new();
    let a = MmContext::new();
    let tid;
    {
        let mut thread = KThread::new_kernel(&mmu);
        tid = thread.tid();
        thread.attach(&a);
        thread.detach();
        mmu.take();
    }
    assert_eq!(
        mmu.take(),
        vec![
            MmuEvent::Switch { thread: tid, prev: Some(a.id()), next: None },
            MmuEvent::FinishPostLock,
            MmuEvent::Barrier(BarrierSite::LazyDrop),
        ]
    );
    assert_eq!(a.grabs(), 0);
}

const THREADS: usize = 3;
const CONTEXTS: usize = 3;

#[derive(Clone, Copy, Debug)]
enum Op {
    Attach { thread: usize, mm: usize },
    Detach { thread: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..THREADS, 0..CONTEXTS).prop_map(|(thread, mm)| Op::Attach { thread, mm }),
        (0..THREADS).prop_map(|thread| Op::Detach { thread }),
    ]
}

#[derive(Clone, Copy, Default)]
struct Model {
    bound: Option<usize>,
    retained: Option<usize>,
}

proptest! {
    #[test]
    fn ledger_matches_model(ops in proptest::collection::vec(arb_op(), 1..64)) {
        let mmu = RecordingMmu::new();
        let contexts: Vec<_> = (0..CONTEXTS).map(|_| MmContext::new()).collect();
        let mut threads: Vec<_> = (0..THREADS).map(|_| KThread::new_kernel(&mmu)).collect();
        let mut model = [Model::default(); THREADS];
        let mut expected_switches = 0usize;
        let mut expected_reuses = 0usize;
        let mut expected_violations = [0u32; THREADS];

        for op in ops {
            match op {
                Op::Attach { thread, mm } => {
                    if model[thread].retained == Some(mm) {
                        expected_reuses += 1;
                    } else {
                        expected_switches += 1;
                    }
                    model[thread] = Model { bound: Some(mm), retained: Some(mm) };
                    threads[thread].attach(&contexts[mm]);
                }
                Op::Detach { thread } => {
                    if model[thread].bound.is_none() {
                        expected_violations[thread] += 1;
                    }
                    model[thread].bound = None;
                    threads[thread].detach();
                }
            }

            for (index, mm) in contexts.iter().enumerate() {
                let holders = model.iter().filter(|m| m.retained == Some(index)).count();
                prop_assert_eq!(mm.grabs(), holders);
            }
            for (thread, state) in threads.iter().zip(model.iter()) {
                let observer = thread.observer();
                prop_assert_eq!(observer.current_context_id(), state.bound.map(|i| contexts[i].id()));
                prop_assert_eq!(observer.retained_context_id(), state.retained.map(|i| contexts[i].id()));
                if let Some(bound) = state.bound {
                    prop_assert_eq!(state.retained, Some(bound));
                }
            }
        }

        prop_assert_eq!(mmu.switches(), expected_switches);
        prop_assert_eq!(mmu.barriers(BarrierSite::AttachSwitched), expected_switches);
        prop_assert_eq!(mmu.barriers(BarrierSite::AttachReused), expected_reuses);
        for (thread, expected) in threads.iter().zip(expected_violations) {
            prop_assert_eq!(thread.contract_violations(), expected);
        }

        drop(threads);
        for mm in &contexts {
            prop_assert_eq!(mm.grabs(), 0);
        }
    }
}

#[test]
fn stores_visible_before_unbound() {
    const ROUNDS: u64 = 200;

    let mm = MmContext::new();
    let user_word = Arc::new(AtomicU64::new(0));
    let seen_bound = Arc::new(AtomicBool::new(false));
    let seen_unbound = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();

    let worker = {
        let mm = Arc::clone(&mm);
        let user_word = Arc::clone(&user_word);
        let seen_bound = Arc::clone(&seen_bound);
        let seen_unbound = Arc::clone(&seen_unbound);
        thread::spawn(move || {
            let mut kthread = KThread::new_kernel(NoopMmu);
            tx.send(kthread.observer()).expect("send observer");
            for round in 1..=ROUNDS {
                kthread.attach(&mm);
                user_word.store(round, Ordering::Relaxed);
                while !seen_bound.swap(false, Ordering::AcqRel) {
                    std::hint::spin_loop();
                }
                kthread.detach();
                while !seen_unbound.swap(false, Ordering::AcqRel) {
                    std::hint::spin_loop();
                }
            }
        })
    };

    let observer = rx.recv().expect("observer");
    for round in 1..=ROUNDS {
        while !observer.is_bound_to(&mm) {
            std::hint::spin_loop();
        }
        seen_bound.store(true, Ordering::Release);
        while observer.is_bound() {
            std::hint::spin_loop();
        }
        assert_eq!(user_word.load(Ordering::Relaxed), round);
        seen_unbound.store(true, Ordering::Release);
    }

    worker.join().expect("worker");
    assert_eq!(mm.grabs(), 0);
}

#[test]
fn stores_visible_before_rebound() {
    const ROUNDS: u64 = 200;

    let a = MmContext::new();
    let b = MmContext::new();
    let user_word = Arc::new(AtomicU64::new(0));
    let seen_bound = Arc::new(AtomicBool::new(false));
    let seen_moved = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();

    let worker = {
        let a = Arc::clone(&a);
        let b = Arc::clone(&b);
        let user_word = Arc::clone(&user_word);
        let seen_bound = Arc::clone(&seen_bound);
        let seen_moved = Arc::clone(&seen_moved);
        thread::spawn(move || {
            let mut kthread = KThread::new_kernel(NoopMmu);
            tx.send(kthread.observer()).expect("send observer");
            for round in 1..=ROUNDS {
                kthread.attach(&a);
                user_word.store(round, Ordering::Relaxed);
                while !seen_bound.swap(false, Ordering::AcqRel) {
                    std::hint::spin_loop();
                }
                kthread.attach(&b);
                while !seen_moved.swap(false, Ordering::AcqRel) {
                    std::hint::spin_loop();
                }
            }
        })
    };

    let observer = rx.recv().expect("observer");
    for round in 1..=ROUNDS {
        while !observer.is_bound_to(&a) {
            std::hint::spin_loop();
        }
        seen_bound.store(true, Ordering::Release);
        while observer.is_bound_to(&a) {
            std::hint::spin_loop();
        }
        assert!(observer.is_bound());
        assert_eq!(user_word.load(Ordering::Relaxed), round);
        seen_moved.store(true, Ordering::Release);
    }

    worker.join().expect("worker");
    assert_eq!(a.grabs(), 0);
    assert_eq!(b.grabs(), 0);
}
