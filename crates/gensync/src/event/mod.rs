// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Generational event state machine.
//!
//! One [`GenEventImpl`] tracks every generation of a single event id. The
//! node that allocated the id (the owner) holds authoritative state; other
//! nodes keep a replica that is updated through subscription messages and
//! may run ahead of the owner for triggers it initiated itself.
//!
//! # Lock-free queries
//!
//! `has_triggered` must not take the mutex on the hot path. The protocol:
//! the writer appends to the poisoned-generation array, then publishes the
//! new `generation` with a release store; readers load `generation` with
//! acquire and may then scan the array without locking. A reader that
//! observes `needed_gen <= generation` therefore always sees the poison
//! entries for `needed_gen`.
//!
//! # Replica state
//!
//! On a non-owner, `generation` only advances when the poison status of
//! every prior generation is known (contiguous trigger or owner update).
//! Triggers this node initiated for later generations are parked in
//! `local_triggers` so local queries stay truthful before the owner's
//! update arrives.

pub mod merger;
pub mod waiter;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::api::Event;
use crate::config::POISONED_GENERATION_LIMIT;
use crate::core::{Id, NodeId};
use crate::protocol::{encode_gen_list, Message};
use crate::runtime::Runtime;
use crate::transport::{NodeSet, Payload};
use self::waiter::{fire_waiters, EventWaiter};

// ============================================================================
// State
// ============================================================================

#[derive(Default)]
struct GenEventState {
    /// Highest generation this node has subscribed to (0 on the owner).
    gen_subscribed: u64,
    /// Waiters blocked on `generation + 1`.
    current_local_waiters: Vec<Arc<dyn EventWaiter>>,
    /// Waiters blocked past `generation + 1`, keyed by generation.
    /// Populated only on non-owners; the owner always has complete
    /// information and triggers strictly in order.
    future_local_waiters: BTreeMap<u64, Vec<Arc<dyn EventWaiter>>>,
    /// Triggers this node initiated, with their poison bit, awaiting the
    /// owner's update.
    local_triggers: BTreeMap<u64, bool>,
    /// Owner only: nodes to notify on the next trigger.
    remote_waiters: NodeSet,
}

/// Implementation object behind one event id, all generations.
pub struct GenEventImpl {
    me: Id,
    owner: NodeId,
    /// Highest generation known triggered on this node. Published with
    /// release ordering after the poison array, read with acquire.
    generation: AtomicU64,
    num_poisoned_generations: AtomicUsize,
    poisoned_generations: [AtomicU64; POISONED_GENERATION_LIMIT],
    /// Lock-free hint that `local_triggers` is non-empty.
    has_local_triggers: AtomicBool,
    inner: Mutex<GenEventState>,
}

impl GenEventImpl {
    pub(crate) fn new(me: Id, owner: NodeId) -> Self {
        Self {
            me,
            owner,
            generation: AtomicU64::new(0),
            num_poisoned_generations: AtomicUsize::new(0),
            poisoned_generations: std::array::from_fn(|_| AtomicU64::new(0)),
            has_local_triggers: AtomicBool::new(false),
            inner: Mutex::new(GenEventState::default()),
        }
    }

    /// Handle for the next generation to trigger.
    pub(crate) fn current_event(&self) -> Event {
        self.make_event(self.generation.load(Ordering::Acquire) + 1)
    }

    #[inline]
    fn make_event(&self, gen: u64) -> Event {
        Event { id: self.me, gen }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Whether `gen` is on the published poison list. Safe to call without
    /// the mutex once `gen <= generation` has been observed with acquire
    /// ordering (see module docs).
    fn is_generation_poisoned(&self, gen: u64) -> bool {
        let count = self.num_poisoned_generations.load(Ordering::Relaxed);
        if count == 0 {
            return false;
        }
        let count = count.min(POISONED_GENERATION_LIMIT);
        self.poisoned_generations[..count]
            .iter()
            .any(|slot| slot.load(Ordering::Relaxed) == gen)
    }

    /// Snapshot of the published poison list.
    pub(crate) fn poisoned_snapshot(&self) -> Vec<u64> {
        let count = self
            .num_poisoned_generations
            .load(Ordering::Acquire)
            .min(POISONED_GENERATION_LIMIT);
        self.poisoned_generations[..count]
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect()
    }

    /// Returns `(triggered, poisoned)` for `needed_gen`.
    pub(crate) fn has_triggered(&self, needed_gen: u64) -> (bool, bool) {
        // lock-free fast path
        if needed_gen <= self.generation.load(Ordering::Acquire) {
            return (true, self.is_generation_poisoned(needed_gen));
        }

        // if this node never initiated a trigger, "not yet" is consistent
        if !self.has_local_triggers.load(Ordering::Acquire) {
            return (false, false);
        }

        // a trigger may have happened here ahead of the owner's update
        let state = self.inner.lock();
        match state.local_triggers.get(&needed_gen) {
            Some(&poisoned) => (true, poisoned),
            None => (false, false),
        }
    }

    // ------------------------------------------------------------------
    // Waiter registration
    // ------------------------------------------------------------------

    /// Register `waiter` for `needed_gen`. The waiter is either enqueued
    /// or fired synchronously (after the mutex is released), so this
    /// always returns `true`.
    pub(crate) fn add_waiter(
        &self,
        rt: &Runtime,
        needed_gen: u64,
        waiter: Arc<dyn EventWaiter>,
    ) -> bool {
        let mut trigger_now = false;
        let mut trigger_poisoned = false;
        let mut subscribe_previous_gen = None;

        {
            let mut state = self.inner.lock();
            let generation = self.generation.load(Ordering::Acquire);

            if needed_gen <= generation {
                // already triggered; poison info is on the published list
                trigger_now = true;
                trigger_poisoned = self.is_generation_poisoned(needed_gen);
            } else if let Some(&poisoned) = state.local_triggers.get(&needed_gen) {
                // triggered here before the owner's update arrived
                debug_assert_ne!(self.owner, rt.node_id());
                trigger_now = true;
                trigger_poisoned = poisoned;
            } else {
                log::debug!(
                    target: "event",
                    "event not ready: event={}/{} owner={} gen={} subscribed={}",
                    self.me, needed_gen, self.owner, generation, state.gen_subscribed
                );
                if needed_gen == generation + 1 {
                    state.current_local_waiters.push(Arc::clone(&waiter));
                } else {
                    assert_ne!(
                        self.owner,
                        rt.node_id(),
                        "future waiter on the owner of {}",
                        self.me
                    );
                    state
                        .future_local_waiters
                        .entry(needed_gen)
                        .or_default()
                        .push(Arc::clone(&waiter));
                }

                if self.owner != rt.node_id() && state.gen_subscribed < needed_gen {
                    subscribe_previous_gen = Some(state.gen_subscribed);
                    state.gen_subscribed = needed_gen;
                }
            }
        }

        if let Some(previous_subscribe_gen) = subscribe_previous_gen {
            rt.post(
                self.owner,
                Message::EventSubscribe {
                    event: self.make_event(needed_gen),
                    previous_subscribe_gen,
                },
                Payload::None,
            );
        }

        if trigger_now {
            let _reclaim = waiter.notify(rt, self.make_event(needed_gen), trigger_poisoned);
        }

        true
    }

    // ------------------------------------------------------------------
    // Triggering
    // ------------------------------------------------------------------

    /// Trigger `gen_triggered`, initiated by `trigger_node`.
    ///
    /// On the owner this is the authoritative trigger and must be for
    /// `generation + 1`. On any other node the owner is informed first and
    /// the replica state updated opportunistically.
    pub(crate) fn trigger(
        &self,
        rt: &Runtime,
        gen_triggered: u64,
        trigger_node: NodeId,
        poisoned: bool,
    ) {
        log::debug!(
            target: "event",
            "event triggered: event={}/{} by node {} poisoned={}",
            self.me, gen_triggered, trigger_node, poisoned
        );

        let mut to_wake: Vec<Arc<dyn EventWaiter>> = Vec::new();

        if rt.node_id() == self.owner {
            let to_update;
            let free_event;
            {
                let mut state = self.inner.lock();
                let generation = self.generation.load(Ordering::Relaxed);
                assert_eq!(
                    gen_triggered,
                    generation + 1,
                    "non-contiguous trigger on the owner of {}",
                    self.me
                );

                std::mem::swap(&mut to_wake, &mut state.current_local_waiters);
                assert!(
                    state.future_local_waiters.is_empty(),
                    "future waiter on the owner of {}",
                    self.me
                );
                to_update = state.remote_waiters.take();

                if poisoned {
                    let count = self.num_poisoned_generations.load(Ordering::Relaxed);
                    assert!(
                        count < POISONED_GENERATION_LIMIT,
                        "poisoned generation budget exceeded for {}",
                        self.me
                    );
                    self.poisoned_generations[count].store(gen_triggered, Ordering::Relaxed);
                    self.num_poisoned_generations
                        .store(count + 1, Ordering::Relaxed);
                }

                // the release store orders the poison writes above before
                // any reader that observes the new generation
                self.generation.store(gen_triggered, Ordering::Release);

                free_event = self.num_poisoned_generations.load(Ordering::Relaxed)
                    < POISONED_GENERATION_LIMIT;
            }

            if !to_update.is_empty() {
                let snapshot = encode_gen_list(&self.poisoned_snapshot());
                rt.post_broadcast(
                    &to_update,
                    Message::EventUpdate {
                        event: self.make_event(gen_triggered),
                    },
                    Payload::Keep(Arc::from(snapshot.into_boxed_slice())),
                );
            }

            if free_event {
                rt.recycle_genevent(self.me);
            } else {
                log::warn!(
                    target: "poison",
                    "event id retired, poisoned generation budget exhausted: event={}",
                    self.me
                );
            }
        } else {
            // somebody else's event: tell the owner first
            assert_eq!(trigger_node, rt.node_id());
            rt.post(
                self.owner,
                Message::EventTrigger {
                    event: self.make_event(gen_triggered),
                    poisoned,
                },
                Payload::None,
            );

            let mut subscribe_previous_gen = None;
            {
                let mut state = self.inner.lock();
                let generation = self.generation.load(Ordering::Relaxed);

                if gen_triggered == generation + 1 {
                    // complete information up to this generation
                    std::mem::swap(&mut to_wake, &mut state.current_local_waiters);
                    if let Some(next) = state.future_local_waiters.remove(&(gen_triggered + 1)) {
                        state.current_local_waiters = next;
                    }
                    if poisoned {
                        // this node initiated the trigger, so the poison
                        // bit is authoritative: publish it locally before
                        // the generation so lock-free queries see it (the
                        // owner's list will extend ours as a prefix), and
                        // keep the local-trigger entry until the owner's
                        // update acknowledges it
                        state.local_triggers.insert(gen_triggered, true);
                        self.has_local_triggers.store(true, Ordering::Release);
                        let count = self.num_poisoned_generations.load(Ordering::Relaxed);
                        assert!(
                            count < POISONED_GENERATION_LIMIT,
                            "poisoned generation budget exceeded for {}",
                            self.me
                        );
                        self.poisoned_generations[count].store(gen_triggered, Ordering::Relaxed);
                        self.num_poisoned_generations
                            .store(count + 1, Ordering::Relaxed);
                    }
                    self.generation.store(gen_triggered, Ordering::Release);
                } else {
                    // a generation beyond the next: poison of the skipped
                    // generations is unknown, so `generation` must not move
                    assert!(
                        gen_triggered > generation + 1,
                        "duplicate trigger of {}/{}",
                        self.me,
                        gen_triggered
                    );
                    if let Some(waiters) = state.future_local_waiters.remove(&gen_triggered) {
                        to_wake = waiters;
                    }
                    state.local_triggers.insert(gen_triggered, poisoned);
                    self.has_local_triggers.store(true, Ordering::Release);

                    if state.gen_subscribed < gen_triggered {
                        subscribe_previous_gen = Some(state.gen_subscribed);
                        state.gen_subscribed = gen_triggered;
                    }
                }
            }

            if let Some(previous_subscribe_gen) = subscribe_previous_gen {
                rt.post(
                    self.owner,
                    Message::EventSubscribe {
                        event: self.make_event(gen_triggered),
                        previous_subscribe_gen,
                    },
                    Payload::None,
                );
            }
        }

        fire_waiters(rt, to_wake, self.make_event(gen_triggered), poisoned);
    }

    // ------------------------------------------------------------------
    // Owner update processing (non-owner side)
    // ------------------------------------------------------------------

    /// Absorb an owner update: `current_gen` is the latest triggered
    /// generation and `new_poisoned` the full poison list.
    pub(crate) fn process_update(&self, rt: &Runtime, current_gen: u64, new_poisoned: &[u64]) {
        assert_ne!(
            self.owner,
            rt.node_id(),
            "owner received its own update for {}",
            self.me
        );

        // waiters may span several generations; keep them bucketed so each
        // bucket fires with its own poison bit
        let mut to_wake: BTreeMap<u64, Vec<Arc<dyn EventWaiter>>> = BTreeMap::new();

        {
            let mut state = self.inner.lock();
            let generation = self.generation.load(Ordering::Relaxed);
            let count = self.num_poisoned_generations.load(Ordering::Relaxed);

            // the update must extend our poison list as a prefix
            if new_poisoned.is_empty() {
                assert_eq!(count, 0, "poison list shrank for {}", self.me);
            } else {
                assert!(count <= new_poisoned.len(), "poison list shrank for {}", self.me);
                for (i, &gen) in new_poisoned.iter().enumerate().take(count) {
                    assert_eq!(
                        self.poisoned_generations[i].load(Ordering::Relaxed),
                        gen,
                        "poison list prefix mismatch for {}",
                        self.me
                    );
                }
            }

            // old news if we subscribed and then triggered it ourselves;
            // it still acknowledges our own triggers up to current_gen
            if current_gen <= generation {
                while let Some((gen, local_poisoned)) = state.local_triggers.pop_first() {
                    if gen > current_gen {
                        state.local_triggers.insert(gen, local_poisoned);
                        break;
                    }
                }
                self.has_local_triggers
                    .store(!state.local_triggers.is_empty(), Ordering::Release);
                return;
            }

            // adopt new poison entries before publishing the generation
            if new_poisoned.len() > count {
                assert!(new_poisoned.len() <= POISONED_GENERATION_LIMIT);
                for (i, &gen) in new_poisoned.iter().enumerate().skip(count) {
                    self.poisoned_generations[i].store(gen, Ordering::Relaxed);
                }
                self.num_poisoned_generations
                    .store(new_poisoned.len(), Ordering::Relaxed);
            }

            // current waiters were blocked on generation + 1
            if !state.current_local_waiters.is_empty() {
                to_wake.insert(
                    generation + 1,
                    std::mem::take(&mut state.current_local_waiters),
                );
            }

            // future waiters up to and including the update
            while let Some((gen, waiters)) = state.future_local_waiters.pop_first() {
                if gen > current_gen {
                    state.future_local_waiters.insert(gen, waiters);
                    break;
                }
                to_wake.insert(gen, waiters);
            }
            if let Some(next) = state.future_local_waiters.remove(&(current_gen + 1)) {
                state.current_local_waiters = next;
            }

            // local triggers covered by this update are now acknowledged
            while let Some((gen, poisoned)) = state.local_triggers.pop_first() {
                if gen > current_gen {
                    state.local_triggers.insert(gen, poisoned);
                    break;
                }
                assert_eq!(
                    poisoned,
                    self.is_generation_poisoned(gen),
                    "local trigger poison disagrees with owner for {}/{}",
                    self.me,
                    gen
                );
            }
            self.has_local_triggers
                .store(!state.local_triggers.is_empty(), Ordering::Release);

            self.generation.store(current_gen, Ordering::Release);
        }

        for (gen, waiters) in to_wake {
            let poisoned = self.is_generation_poisoned(gen);
            fire_waiters(rt, waiters, self.make_event(gen), poisoned);
        }
    }

    // ------------------------------------------------------------------
    // Subscription handling (owner side)
    // ------------------------------------------------------------------

    /// Record a subscription from `node` and send an immediate update when
    /// anything past `previous_subscribe_gen` has already triggered.
    pub(crate) fn handle_subscribe(
        &self,
        rt: &Runtime,
        node: NodeId,
        subscribe_gen: u64,
        previous_subscribe_gen: u64,
    ) {
        log::debug!(
            target: "event",
            "event subscription: node={} event={}/{}",
            node, self.me, subscribe_gen
        );

        let mut trigger_gen = 0;

        // early out without the mutex if the needed generation is long past
        let stale_gen = self.generation.load(Ordering::Acquire);
        if stale_gen >= subscribe_gen {
            trigger_gen = stale_gen;
        } else {
            let mut state = self.inner.lock();
            let generation = self.generation.load(Ordering::Relaxed);

            if generation > previous_subscribe_gen {
                trigger_gen = generation;
            }

            if subscribe_gen == generation + 1 {
                state.remote_waiters.add(node);
                log::debug!(
                    target: "event",
                    "event subscription recorded: node={} event={}/{}",
                    node, self.me, subscribe_gen
                );
            } else {
                // a subscription past generation + 1 would mean the remote
                // node knows about triggers the owner has not performed
                assert!(
                    subscribe_gen <= generation,
                    "subscription ahead of owner: node={} event={}/{}",
                    node,
                    self.me,
                    subscribe_gen
                );
            }
        }

        if trigger_gen > 0 {
            log::debug!(
                target: "event",
                "event subscription immediate update: node={} event={}/{}",
                node, self.me, trigger_gen
            );
            // the poison list is published before the generation, so this
            // lock-free snapshot is complete for trigger_gen
            let snapshot = encode_gen_list(&self.poisoned_snapshot());
            rt.post(
                node,
                Message::EventUpdate {
                    event: self.make_event(trigger_gen),
                },
                Payload::Copy(snapshot),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackMesh;

    struct CountingWaiter {
        fired: AtomicUsize,
        last_poisoned: AtomicBool,
    }

    impl CountingWaiter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fired: AtomicUsize::new(0),
                last_poisoned: AtomicBool::new(false),
            })
        }
    }

    impl EventWaiter for CountingWaiter {
        fn notify(&self, _rt: &Runtime, _event: Event, poisoned: bool) -> bool {
            self.fired.fetch_add(1, Ordering::SeqCst);
            self.last_poisoned.store(poisoned, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn test_owner_trigger_wakes_current_waiters() {
        let (_mesh, nodes) = LoopbackMesh::with_nodes(1);
        let rt = &nodes[0];

        let event_impl = rt.create_genevent();
        let e = event_impl.current_event();
        assert_eq!(event_impl.has_triggered(e.gen), (false, false));

        let waiter = CountingWaiter::new();
        event_impl.add_waiter(rt, e.gen, waiter.clone());

        event_impl.trigger(rt, e.gen, rt.node_id(), false);
        assert_eq!(waiter.fired.load(Ordering::SeqCst), 1);
        assert!(!waiter.last_poisoned.load(Ordering::SeqCst));
        assert_eq!(event_impl.has_triggered(e.gen), (true, false));
    }

    #[test]
    fn test_poisoned_trigger_published_lock_free() {
        let (_mesh, nodes) = LoopbackMesh::with_nodes(1);
        let rt = &nodes[0];

        let event_impl = rt.create_genevent();
        let e = event_impl.current_event();
        event_impl.trigger(rt, e.gen, rt.node_id(), true);

        assert_eq!(event_impl.has_triggered(e.gen), (true, true));
        assert_eq!(event_impl.poisoned_snapshot(), vec![e.gen]);
    }

    #[test]
    fn test_waiter_on_triggered_generation_fires_synchronously() {
        let (_mesh, nodes) = LoopbackMesh::with_nodes(1);
        let rt = &nodes[0];

        let event_impl = rt.create_genevent();
        let e = event_impl.current_event();
        event_impl.trigger(rt, e.gen, rt.node_id(), true);

        let waiter = CountingWaiter::new();
        event_impl.add_waiter(rt, e.gen, waiter.clone());
        assert_eq!(waiter.fired.load(Ordering::SeqCst), 1);
        assert!(waiter.last_poisoned.load(Ordering::SeqCst));
    }
}
