// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cross-node event tests: subscription flows, remote triggering of
//! another node's events, non-contiguous generations, and event-id
//! lifecycle under poison.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use gensync::config::POISONED_GENERATION_LIMIT;
use gensync::{Event, EventWaiter, LoopbackMesh, Runtime, UserEvent};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Recorder {
    fired: AtomicUsize,
    poisoned: AtomicBool,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fired: AtomicUsize::new(0),
            poisoned: AtomicBool::new(false),
        })
    }
}

impl EventWaiter for Recorder {
    fn notify(&self, _rt: &Runtime, _event: Event, poisoned: bool) -> bool {
        self.fired.fetch_add(1, Ordering::SeqCst);
        self.poisoned.store(poisoned, Ordering::SeqCst);
        true
    }
}

#[test]
fn test_remote_waiter_notified_through_subscription() {
    init_logs();
    let (mesh, nodes) = LoopbackMesh::with_nodes(2);

    let u = UserEvent::create(&nodes[0]);
    let e = u.event();

    // registering on the replica subscribes to the owner
    let recorder = Recorder::new();
    nodes[1].add_waiter(e, recorder.clone());
    mesh.pump();
    assert_eq!(recorder.fired.load(Ordering::SeqCst), 0);

    u.trigger(&nodes[0], Event::NO_EVENT);
    mesh.pump();

    assert_eq!(recorder.fired.load(Ordering::SeqCst), 1);
    assert!(!recorder.poisoned.load(Ordering::SeqCst));
    assert_eq!(e.has_triggered_faultaware(&nodes[1]), (true, false));
}

#[test]
fn test_subscription_after_trigger_gets_immediate_update() {
    init_logs();
    let (mesh, nodes) = LoopbackMesh::with_nodes(2);

    let u = UserEvent::create(&nodes[0]);
    let e = u.event();
    u.trigger(&nodes[0], Event::NO_EVENT);

    // the owner answers a late subscription with the current state
    let recorder = Recorder::new();
    nodes[1].add_waiter(e, recorder.clone());
    mesh.pump();

    assert_eq!(recorder.fired.load(Ordering::SeqCst), 1);
    assert_eq!(e.has_triggered_faultaware(&nodes[1]), (true, false));
}

#[test]
fn test_remote_trigger_of_owned_event() {
    init_logs();
    let (mesh, nodes) = LoopbackMesh::with_nodes(2);

    let u = UserEvent::create(&nodes[0]);
    let e = u.event();

    // a non-owner performs the trigger; its replica knows immediately
    u.trigger(&nodes[1], Event::NO_EVENT);
    assert_eq!(e.has_triggered_faultaware(&nodes[1]), (true, false));
    assert!(!e.has_triggered(&nodes[0]));

    mesh.pump();
    assert_eq!(e.has_triggered_faultaware(&nodes[0]), (true, false));
}

#[test]
fn test_remote_poison_reaches_owner_and_third_party() {
    init_logs();
    let (mesh, nodes) = LoopbackMesh::with_nodes(3);

    let u = UserEvent::create(&nodes[0]);
    let e = u.event();

    // a third node blocks on the event before anything happens
    let recorder = Recorder::new();
    nodes[2].add_waiter(e, recorder.clone());
    mesh.pump();

    // the cancel happens on a node that owns nothing
    u.cancel(&nodes[1]);
    assert_eq!(e.has_triggered_faultaware(&nodes[1]), (true, true));

    mesh.pump();
    assert_eq!(e.has_triggered_faultaware(&nodes[0]), (true, true));
    assert_eq!(e.has_triggered_faultaware(&nodes[2]), (true, true));
    assert_eq!(recorder.fired.load(Ordering::SeqCst), 1);
    assert!(recorder.poisoned.load(Ordering::SeqCst));
}

#[test]
fn test_future_generation_trigger_on_replica() {
    init_logs();
    let (mesh, nodes) = LoopbackMesh::with_nodes(2);

    // consume generation 1 so the id is recycled at generation 2
    let first = UserEvent::create(&nodes[0]);
    first.trigger(&nodes[0], Event::NO_EVENT);
    let second = UserEvent::create(&nodes[0]);
    assert_eq!(second.event().id, first.event().id, "trigger should recycle the id");
    assert_eq!(second.event().gen, 2);

    let gen1 = first.event();
    let gen2 = second.event();

    // the replica on node 1 has seen nothing; triggering generation 2
    // there runs ahead of generation 1's (unknown) poison status
    second.trigger(&nodes[1], Event::NO_EVENT);
    assert_eq!(gen2.has_triggered_faultaware(&nodes[1]), (true, false));
    assert_eq!(
        gen1.has_triggered_faultaware(&nodes[1]),
        (false, false),
        "an intermediate generation stays unknown until the owner confirms"
    );

    // the owner's update fills the gap
    mesh.pump();
    assert_eq!(gen1.has_triggered_faultaware(&nodes[1]), (true, false));
    assert_eq!(gen2.has_triggered_faultaware(&nodes[1]), (true, false));
}

#[test]
fn test_future_waiter_fires_on_replica_trigger() {
    init_logs();
    let (mesh, nodes) = LoopbackMesh::with_nodes(2);

    let first = UserEvent::create(&nodes[0]);
    first.trigger(&nodes[0], Event::NO_EVENT);
    let second = UserEvent::create(&nodes[0]);
    let gen2 = second.event();

    // a waiter on generation 2 goes into the replica's future queue
    let recorder = Recorder::new();
    nodes[1].add_waiter(gen2, recorder.clone());
    assert_eq!(recorder.fired.load(Ordering::SeqCst), 0);

    second.trigger(&nodes[1], Event::NO_EVENT);
    assert_eq!(
        recorder.fired.load(Ordering::SeqCst),
        1,
        "a future waiter fires as soon as its generation triggers locally"
    );
    mesh.pump();
}

#[test]
fn test_poison_budget_retires_event_id() {
    init_logs();
    let (_mesh, nodes) = LoopbackMesh::with_nodes(1);
    let rt = &nodes[0];

    let first = UserEvent::create(rt);
    let id = first.event().id;
    first.cancel(rt);

    // the id keeps recycling while the poison budget lasts
    for generation in 2..=POISONED_GENERATION_LIMIT as u64 {
        let u = UserEvent::create(rt);
        assert_eq!(u.event().id, id);
        assert_eq!(u.event().gen, generation);
        u.cancel(rt);
    }

    // the budget is exhausted: the id is retired, a fresh one is minted
    let fresh = UserEvent::create(rt);
    assert_ne!(fresh.event().id, id);

    // poison history of the retired id stays queryable
    for generation in 1..=POISONED_GENERATION_LIMIT as u64 {
        let old = Event { id, gen: generation };
        assert_eq!(old.has_triggered_faultaware(rt), (true, true));
    }
}

#[test]
fn test_clean_triggers_recycle_without_retiring() {
    init_logs();
    let (_mesh, nodes) = LoopbackMesh::with_nodes(1);
    let rt = &nodes[0];

    let first = UserEvent::create(rt);
    let id = first.event().id;
    first.trigger(rt, Event::NO_EVENT);

    for generation in 2..(POISONED_GENERATION_LIMIT as u64 + 8) {
        let u = UserEvent::create(rt);
        assert_eq!(u.event().id, id, "clean triggers never exhaust the id");
        assert_eq!(u.event().gen, generation);
        u.trigger(rt, Event::NO_EVENT);
    }
}

#[test]
fn test_cross_node_merge() {
    init_logs();
    let (mesh, nodes) = LoopbackMesh::with_nodes(2);

    // inputs owned by different nodes, merged on node 1
    let a = UserEvent::create(&nodes[0]);
    let b = UserEvent::create(&nodes[1]);
    let merged = Event::merge(&nodes[1], a.event(), b.event());

    mesh.pump();
    assert!(!merged.has_triggered(&nodes[1]));

    a.trigger(&nodes[0], Event::NO_EVENT);
    mesh.pump();
    assert!(!merged.has_triggered(&nodes[1]));

    b.trigger(&nodes[1], Event::NO_EVENT);
    mesh.pump();
    assert!(merged.has_triggered(&nodes[1]));
}
