// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-process runtime directory.
//!
//! One [`Runtime`] per node maps identifiers to their implementation
//! objects, allocates fresh ids from per-node free lists, owns the
//! reduction-op table, and routes incoming protocol messages to the right
//! state machine. Implementation objects for remote ids are materialized
//! on first touch as replicas of the owner's state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::api::Event;
use crate::barrier::reduction::{ReductionOp, ReductionOpId};
use crate::barrier::BarrierImpl;
use crate::config::BARRIER_TIMESTAMP_NODEID_SHIFT;
use crate::core::{Id, IdKind, NodeId};
use crate::event::waiter::EventWaiter;
use crate::event::GenEventImpl;
use crate::protocol::{decode_gen_list, Message};
use crate::transport::{NodeSet, Payload, Transport};

/// Directory and services of one node.
pub struct Runtime {
    node_id: NodeId,
    transport: Arc<dyn Transport>,
    events: DashMap<Id, Arc<GenEventImpl>>,
    barriers: DashMap<Id, Arc<BarrierImpl>>,
    /// Event ids whose implementation can be re-armed for a fresh handle.
    free_events: Mutex<Vec<Id>>,
    next_event_index: AtomicU64,
    next_barrier_index: AtomicU64,
    reduce_ops: DashMap<ReductionOpId, Arc<dyn ReductionOp>>,
    /// Source of `alter_arrival_count` timestamps; seeded so every node
    /// draws from a disjoint range.
    barrier_adjustment_timestamp: AtomicU64,
}

impl Runtime {
    /// Create a node runtime on top of `transport`.
    pub fn new(node_id: NodeId, transport: Arc<dyn Transport>) -> Arc<Runtime> {
        Arc::new(Self {
            node_id,
            transport,
            events: DashMap::new(),
            barriers: DashMap::new(),
            free_events: Mutex::new(Vec::new()),
            next_event_index: AtomicU64::new(0),
            next_barrier_index: AtomicU64::new(0),
            reduce_ops: DashMap::new(),
            barrier_adjustment_timestamp: AtomicU64::new(
                (u64::from(node_id) << BARRIER_TIMESTAMP_NODEID_SHIFT) + 1,
            ),
        })
    }

    #[must_use]
    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Register a reduction operator under `redop_id`. Every node that
    /// creates, arrives at, or reads a reducing barrier must register the
    /// same operator under the same id.
    pub fn register_reduction(&self, redop_id: ReductionOpId, op: Arc<dyn ReductionOp>) {
        assert_ne!(redop_id, 0, "reduction id 0 is reserved for \"no reduction\"");
        self.reduce_ops.insert(redop_id, op);
    }

    /// Look up a registered reduction operator.
    ///
    /// # Panics
    ///
    /// Panics when the id is unknown; a reducing barrier reaching a node
    /// without the operator is a deployment error nothing downstream can
    /// recover from.
    pub(crate) fn reduction(&self, redop_id: ReductionOpId) -> Arc<dyn ReductionOp> {
        match self.reduce_ops.get(&redop_id) {
            Some(op) => Arc::clone(op.value()),
            None => panic!(
                "reduction op {redop_id} is not registered on node {}",
                self.node_id
            ),
        }
    }

    // ------------------------------------------------------------------
    // Directory
    // ------------------------------------------------------------------

    /// Implementation object for an event id, creating a replica on first
    /// touch of a remote id.
    pub(crate) fn genevent(&self, id: Id) -> Arc<GenEventImpl> {
        debug_assert_eq!(id.kind(), IdKind::Event);
        if let Some(existing) = self.events.get(&id) {
            return existing.value().clone();
        }
        self.events
            .entry(id)
            .or_insert_with(|| Arc::new(GenEventImpl::new(id, id.node())))
            .clone()
    }

    /// Implementation object for a barrier id, creating a replica on
    /// first touch of a remote id.
    pub(crate) fn barrier_impl(&self, id: Id) -> Arc<BarrierImpl> {
        debug_assert_eq!(id.kind(), IdKind::Barrier);
        if let Some(existing) = self.barriers.get(&id) {
            return existing.value().clone();
        }
        self.barriers
            .entry(id)
            .or_insert_with(|| Arc::new(BarrierImpl::new(id, id.node())))
            .clone()
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate an event implementation, recycling a retired-to-free id
    /// when one is available.
    pub(crate) fn create_genevent(&self) -> Arc<GenEventImpl> {
        let recycled = self.free_events.lock().pop();
        let id = recycled.unwrap_or_else(|| {
            Id::new(
                IdKind::Event,
                self.node_id,
                self.next_event_index.fetch_add(1, Ordering::Relaxed),
            )
        });
        let event_impl = self.genevent(id);
        log::debug!(target: "event", "event created: event={}", event_impl.current_event());
        event_impl
    }

    /// Return an event id to the free list after its latest generation
    /// triggered. Waiters key themselves by `(id, gen)`, so the handle
    /// space stays unambiguous across reuse.
    pub(crate) fn recycle_genevent(&self, id: Id) {
        self.free_events.lock().push(id);
    }

    /// Allocate and arm a barrier owned by this node.
    pub(crate) fn create_barrier_impl(
        &self,
        expected_arrivals: u32,
        redop_id: ReductionOpId,
        initial_value: &[u8],
    ) -> Arc<BarrierImpl> {
        let id = Id::new(
            IdKind::Barrier,
            self.node_id,
            self.next_barrier_index.fetch_add(1, Ordering::Relaxed),
        );
        let redop = if redop_id == 0 {
            None
        } else {
            Some(self.reduction(redop_id))
        };
        let barrier_impl = Arc::new(BarrierImpl::new(id, self.node_id));
        barrier_impl.configure(expected_arrivals, redop_id, redop, initial_value);
        self.barriers.insert(id, Arc::clone(&barrier_impl));
        barrier_impl
    }

    // ------------------------------------------------------------------
    // Generic event operations (kind dispatch)
    // ------------------------------------------------------------------

    /// `(triggered, poisoned)` for any event handle, including barrier
    /// phases used as events and the null sentinel.
    pub(crate) fn event_has_triggered(&self, event: Event) -> (bool, bool) {
        if !event.exists() {
            return (true, false);
        }
        match event.id.kind() {
            IdKind::Event => self.genevent(event.id).has_triggered(event.gen),
            // barrier poison is pinned to the clean sentinel
            IdKind::Barrier => (self.barrier_impl(event.id).has_triggered(self, event.gen), false),
            IdKind::Null => (true, false),
        }
    }

    /// Register a waiter on any event handle (including barrier phases
    /// via [`crate::api::Barrier::as_event`]). Fires synchronously, after
    /// any internal lock is released, when the generation has already
    /// triggered; fires immediately for the null sentinel. This is the
    /// seam thread schedulers and other subsystems hook to suspend work
    /// on a generation.
    pub fn add_waiter(&self, event: Event, waiter: Arc<dyn EventWaiter>) {
        if !event.exists() {
            let _reclaim = waiter.notify(self, event, false);
            return;
        }
        match event.id.kind() {
            IdKind::Event => {
                self.genevent(event.id).add_waiter(self, event.gen, waiter);
            }
            IdKind::Barrier => {
                self.barrier_impl(event.id).add_waiter(self, event.gen, waiter);
            }
            IdKind::Null => {
                let _reclaim = waiter.notify(self, event, false);
            }
        }
    }

    /// Trigger a generational event from this node.
    pub(crate) fn trigger_event(&self, event: Event, poisoned: bool) {
        self.genevent(event.id)
            .trigger(self, event.gen, self.node_id, poisoned);
    }

    /// Next `alter_arrival_count` timestamp.
    pub(crate) fn next_barrier_timestamp(&self) -> u64 {
        self.barrier_adjustment_timestamp
            .fetch_add(1, Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Send one message.
    ///
    /// # Panics
    ///
    /// Panics when the transport reports a failure: the protocol's
    /// ordering guarantees do not survive lost messages.
    pub(crate) fn post(&self, dst: NodeId, msg: Message, payload: Payload) {
        if let Err(err) = self.transport.send(dst, msg, payload) {
            panic!("transport send from node {} to node {dst} failed: {err}", self.node_id);
        }
    }

    /// Broadcast one message. Same failure contract as [`post`](Self::post).
    pub(crate) fn post_broadcast(&self, targets: &NodeSet, msg: Message, payload: Payload) {
        if let Err(err) = self.transport.broadcast(targets, msg, payload) {
            panic!("transport broadcast from node {} failed: {err}", self.node_id);
        }
    }

    /// Route one incoming message to its state machine. `src` is the
    /// sending node as reported by the transport.
    pub fn handle_message(&self, src: NodeId, msg: Message, payload: &[u8]) -> crate::Result<()> {
        match msg {
            Message::EventSubscribe {
                event,
                previous_subscribe_gen,
            } => {
                self.genevent(event.id)
                    .handle_subscribe(self, src, event.gen, previous_subscribe_gen);
            }
            Message::EventTrigger { event, poisoned } => {
                log::debug!(
                    target: "event",
                    "remote trigger of event {event} from node {src}"
                );
                self.genevent(event.id).trigger(self, event.gen, src, poisoned);
            }
            Message::EventUpdate { event } => {
                let poisoned_generations = decode_gen_list(payload)?;
                log::debug!(
                    target: "event",
                    "event update: event={event} poisoned={poisoned_generations:?}"
                );
                self.genevent(event.id)
                    .process_update(self, event.gen, &poisoned_generations);
            }
            Message::BarrierAdjust {
                barrier,
                delta,
                wait_on,
            } => {
                log::info!(
                    target: "barrier",
                    "received barrier arrival: delta={delta} in={wait_on} out={barrier}"
                );
                let reduce_value = (!payload.is_empty()).then_some(payload);
                self.barrier_impl(barrier.id).adjust_arrival(
                    self,
                    barrier.gen,
                    delta,
                    barrier.timestamp,
                    wait_on,
                    reduce_value,
                );
            }
            Message::BarrierSubscribe {
                barrier_id,
                subscribe_gen,
            } => {
                self.barrier_impl(barrier_id)
                    .handle_subscribe(self, src, subscribe_gen);
            }
            Message::BarrierTrigger {
                barrier_id,
                trigger_gen,
                previous_gen,
                first_generation,
                redop_id,
            } => {
                self.barrier_impl(barrier_id).handle_trigger(
                    self,
                    trigger_gen,
                    previous_gen,
                    first_generation,
                    redop_id,
                    payload,
                );
            }
        }
        Ok(())
    }
}
