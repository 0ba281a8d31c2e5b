// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Barrier integration tests: phased arrivals, reductions, arrival-count
//! adjustments, and out-of-order trigger delivery.

use std::sync::{Arc, Mutex};

use gensync::config::BARRIER_TIMESTAMP_NODEID_SHIFT;
use gensync::protocol::Message;
use gensync::{
    Barrier, Event, EventWaiter, LoopbackMesh, ReductionOpId, Runtime, SumI32, UserEvent,
};

const SUM_I32: ReductionOpId = 7;

/// Retry a condition with message pumping in between; subscriptions take
/// one round trip to produce an answer.
fn eventually(mesh: &LoopbackMesh, mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..8 {
        if cond() {
            return true;
        }
        mesh.pump();
    }
    cond()
}

/// Pushes a fixed label into a shared log on notification.
struct Tagged {
    label: u64,
    log: Arc<Mutex<Vec<u64>>>,
}

impl EventWaiter for Tagged {
    fn notify(&self, _rt: &Runtime, _event: Event, _poisoned: bool) -> bool {
        self.log.lock().expect("log lock").push(self.label);
        true
    }
}

#[test]
fn test_three_node_barrier_triggers_everywhere() {
    let (mesh, nodes) = LoopbackMesh::with_nodes(3);
    let barrier = Barrier::create(&nodes[0], 3);

    for rt in &nodes {
        barrier.arrive(rt, 1, Event::NO_EVENT, None);
    }
    mesh.pump();

    for rt in &nodes {
        assert!(
            eventually(&mesh, || barrier.has_triggered(rt)),
            "generation 1 must trigger on node {}",
            rt.node_id()
        );
    }

    // the next phase has no arrivals yet
    let next = barrier.advance();
    for rt in &nodes {
        assert!(!next.has_triggered(rt));
    }
    mesh.pump();
    for rt in &nodes {
        assert!(!next.has_triggered(rt));
    }
}

#[test]
fn test_partial_arrivals_do_not_trigger() {
    let (mesh, nodes) = LoopbackMesh::with_nodes(2);
    let barrier = Barrier::create(&nodes[0], 3);

    barrier.arrive(&nodes[0], 1, Event::NO_EVENT, None);
    barrier.arrive(&nodes[1], 1, Event::NO_EVENT, None);
    mesh.pump();

    assert!(!barrier.has_triggered(&nodes[0]));

    barrier.arrive(&nodes[0], 1, Event::NO_EVENT, None);
    assert!(barrier.has_triggered(&nodes[0]));
}

#[test]
fn test_multi_count_arrival() {
    let (_mesh, nodes) = LoopbackMesh::with_nodes(1);
    let rt = &nodes[0];

    let barrier = Barrier::create(rt, 4);
    barrier.arrive(rt, 3, Event::NO_EVENT, None);
    assert!(!barrier.has_triggered(rt));
    barrier.arrive(rt, 1, Event::NO_EVENT, None);
    assert!(barrier.has_triggered(rt));
}

#[test]
fn test_reduction_round_trip() {
    let (mesh, nodes) = LoopbackMesh::with_nodes(2);
    for rt in &nodes {
        rt.register_reduction(SUM_I32, Arc::new(SumI32));
    }

    let barrier =
        Barrier::create_with_reduction(&nodes[0], 2, SUM_I32, &0i32.to_le_bytes());
    barrier.arrive(&nodes[0], 1, Event::NO_EVENT, Some(&7i32.to_le_bytes()));
    barrier.arrive(&nodes[1], 1, Event::NO_EVENT, Some(&35i32.to_le_bytes()));
    mesh.pump();

    let mut result = [0u8; 4];
    assert!(barrier.get_result(&nodes[0], &mut result));
    assert_eq!(i32::from_le_bytes(result), 42);

    // the subscribed remote receives the same folded value
    assert!(eventually(&mesh, || barrier.has_triggered(&nodes[1])));
    let mut remote_result = [0u8; 4];
    assert!(barrier.get_result(&nodes[1], &mut remote_result));
    assert_eq!(i32::from_le_bytes(remote_result), 42);
}

#[test]
fn test_reduction_restarts_each_generation() {
    let (_mesh, nodes) = LoopbackMesh::with_nodes(1);
    let rt = &nodes[0];
    rt.register_reduction(SUM_I32, Arc::new(SumI32));

    let barrier = Barrier::create_with_reduction(rt, 1, SUM_I32, &10i32.to_le_bytes());
    barrier.arrive(rt, 1, Event::NO_EVENT, Some(&5i32.to_le_bytes()));

    let next = barrier.advance();
    next.arrive(rt, 1, Event::NO_EVENT, Some(&1i32.to_le_bytes()));

    let mut result = [0u8; 4];
    assert!(barrier.get_result(rt, &mut result));
    assert_eq!(i32::from_le_bytes(result), 15);

    assert!(next.get_result(rt, &mut result));
    assert_eq!(i32::from_le_bytes(result), 11, "each generation folds from the initial value");
}

#[test]
fn test_get_result_before_trigger_is_false() {
    let (_mesh, nodes) = LoopbackMesh::with_nodes(1);
    let rt = &nodes[0];
    rt.register_reduction(SUM_I32, Arc::new(SumI32));

    let barrier = Barrier::create_with_reduction(rt, 2, SUM_I32, &0i32.to_le_bytes());
    barrier.arrive(rt, 1, Event::NO_EVENT, Some(&1i32.to_le_bytes()));

    let mut result = [0u8; 4];
    assert!(!barrier.get_result(rt, &mut result));
}

#[test]
fn test_alter_arrival_count_raises_requirement() {
    let (_mesh, nodes) = LoopbackMesh::with_nodes(1);
    let rt = &nodes[0];

    let barrier = Barrier::create(rt, 1);
    let altered = barrier.alter_arrival_count(rt, 1);

    barrier.arrive(rt, 1, Event::NO_EVENT, None);
    assert!(!barrier.has_triggered(rt), "the raised count needs a second arrival");

    altered.arrive(rt, 1, Event::NO_EVENT, None);
    assert!(barrier.has_triggered(rt));
}

#[test]
fn test_arrival_cannot_overtake_matching_count_increase() {
    let (_mesh, nodes) = LoopbackMesh::with_nodes(2);
    let owner = &nodes[0];

    let barrier = Barrier::create(owner, 1);
    let timestamp = (1u64 << BARRIER_TIMESTAMP_NODEID_SHIFT) | 5;
    let remote_handle = Barrier {
        id: barrier.id,
        gen: barrier.gen,
        timestamp,
    };

    // the arrival paired with a pending count increase is delivered first
    owner
        .handle_message(
            1,
            Message::BarrierAdjust {
                barrier: remote_handle,
                delta: -1,
                wait_on: Event::NO_EVENT,
            },
            &[],
        )
        .expect("adjust dispatch");
    assert!(
        !barrier.has_triggered(owner),
        "a timestamped arrival must wait for its count increase"
    );

    // the increase releases the parked arrival; net effect is zero
    owner
        .handle_message(
            1,
            Message::BarrierAdjust {
                barrier: remote_handle,
                delta: 1,
                wait_on: Event::NO_EVENT,
            },
            &[],
        )
        .expect("adjust dispatch");
    assert!(!barrier.has_triggered(owner));

    barrier.arrive(owner, 1, Event::NO_EVENT, None);
    assert!(barrier.has_triggered(owner));
}

#[test]
fn test_future_generation_arrivals_park_until_contiguous() {
    let (_mesh, nodes) = LoopbackMesh::with_nodes(1);
    let rt = &nodes[0];

    let first = Barrier::create(rt, 1);
    let second = first.advance();

    second.arrive(rt, 1, Event::NO_EVENT, None);
    assert!(!first.has_triggered(rt));
    assert!(!second.has_triggered(rt));

    // completing the first generation drains both contiguously
    first.arrive(rt, 1, Event::NO_EVENT, None);
    assert!(first.has_triggered(rt));
    assert!(second.has_triggered(rt));
}

#[test]
fn test_deferred_arrival_waits_for_gate() {
    let (_mesh, nodes) = LoopbackMesh::with_nodes(1);
    let rt = &nodes[0];

    let barrier = Barrier::create(rt, 1);
    let gate = UserEvent::create(rt);

    barrier.arrive(rt, 1, gate.event(), None);
    assert!(!barrier.has_triggered(rt));

    gate.trigger(rt, Event::NO_EVENT);
    assert!(barrier.has_triggered(rt));
}

#[test]
fn test_deferred_arrival_forwarded_to_owner() {
    let (mesh, nodes) = LoopbackMesh::with_nodes(2);

    let barrier = Barrier::create(&nodes[0], 1);
    let gate = UserEvent::create(&nodes[0]);

    // the remote arrival travels to the owner with the gate attached
    barrier.arrive(&nodes[1], 1, gate.event(), None);
    mesh.pump();
    assert!(!barrier.has_triggered(&nodes[0]));

    gate.trigger(&nodes[0], Event::NO_EVENT);
    mesh.pump();
    assert!(barrier.has_triggered(&nodes[0]));
}

#[test]
fn test_out_of_order_remote_triggers_relinearize() {
    let (mesh, nodes) = LoopbackMesh::with_nodes(2);
    let owner = &nodes[0];
    let remote = &nodes[1];

    let barrier = Barrier::create(owner, 1);

    // trigger generation 1 normally and let the remote catch up
    barrier.arrive(owner, 1, Event::NO_EVENT, None);
    assert!(!barrier.has_triggered(remote));
    mesh.pump();
    assert!(eventually(&mesh, || barrier.has_triggered(remote)));

    // waiters for the next two phases on the remote
    let gen2 = barrier.advance();
    let gen3 = gen2.advance();
    assert!(!gen2.has_triggered(remote));
    assert!(!gen3.has_triggered(remote));

    let log = Arc::new(Mutex::new(Vec::new()));
    remote.add_waiter(
        gen2.as_event(),
        Arc::new(Tagged {
            label: 2,
            log: Arc::clone(&log),
        }),
    );
    remote.add_waiter(
        gen3.as_event(),
        Arc::new(Tagged {
            label: 3,
            log: Arc::clone(&log),
        }),
    );

    // the later range arrives first and must be held
    remote
        .handle_message(
            0,
            Message::BarrierTrigger {
                barrier_id: barrier.id,
                trigger_gen: 3,
                previous_gen: 2,
                first_generation: 0,
                redop_id: 0,
            },
            &[],
        )
        .expect("trigger dispatch");
    assert!(!gen2.has_triggered(remote));
    assert!(!gen3.has_triggered(remote));
    assert!(log.lock().expect("log lock").is_empty());

    // the missing range connects both; waiters fire in generation order
    remote
        .handle_message(
            0,
            Message::BarrierTrigger {
                barrier_id: barrier.id,
                trigger_gen: 2,
                previous_gen: 1,
                first_generation: 0,
                redop_id: 0,
            },
            &[],
        )
        .expect("trigger dispatch");
    assert!(gen2.has_triggered(remote));
    assert!(gen3.has_triggered(remote));
    assert_eq!(*log.lock().expect("log lock"), vec![2, 3]);
}

#[test]
fn test_previous_phase_round_trip() {
    let (_mesh, nodes) = LoopbackMesh::with_nodes(1);
    let rt = &nodes[0];

    let barrier = Barrier::create(rt, 1);
    let next = barrier.advance();
    assert_eq!(next.get_previous_phase(), barrier);

    barrier.destroy(rt);
}
