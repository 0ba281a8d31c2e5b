// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Phase barrier state machine.
//!
//! A [`BarrierImpl`] tracks arrivals for every generation of one barrier
//! id. The owner node counts adjustments; a generation triggers when the
//! base arrival count plus its accumulated delta reaches zero, and
//! contiguous satisfied generations trigger in one sweep. Subscribed
//! remote nodes receive one `BarrierTrigger` per notification covering
//! the generations they have not seen, with the reduction values for that
//! range attached.
//!
//! Trigger messages can be delivered out of order; receivers park
//! non-contiguous ranges in `held_triggers` and re-linearize them when
//! the missing predecessor arrives.
//!
//! Arrival adjustments carry a timestamp so that a decrement (an arrival)
//! issued after an increment (`alter_arrival_count`) on the same origin
//! node can never be counted first, which would trigger a generation
//! spuriously.
//!
//! Barrier waiters currently always receive a clean poison bit; fault
//! propagation through barrier generations is not wired through.

pub mod reduction;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::api::{Barrier, Event};
use crate::config::{BARRIER_TIMESTAMP_NODEID_SHIFT, DEFER_ARRIVALS_LOCALLY};
use crate::core::{Id, NodeId};
use crate::event::waiter::{fire_waiters, EventWaiter};
use crate::protocol::Message;
use crate::runtime::Runtime;
use crate::transport::Payload;
use self::reduction::{ReductionOp, ReductionOpId};

// ============================================================================
// Per-generation tracking
// ============================================================================

/// Ordering state for adjustments from one origin node.
#[derive(Debug, Default)]
struct PerNodeUpdates {
    /// Latest positive-adjustment timestamp applied.
    last_ts: u64,
    /// Negative adjustments waiting for their matching increment.
    pending: BTreeMap<u64, i64>,
}

/// Arrival tracking for one untriggered generation.
#[derive(Default)]
struct GenerationTracker {
    /// Net adjustment applied so far; the generation triggers when
    /// `base_arrival_count + unguarded_delta == 0`.
    unguarded_delta: i64,
    local_waiters: Vec<Arc<dyn EventWaiter>>,
    pernode: BTreeMap<NodeId, PerNodeUpdates>,
}

impl GenerationTracker {
    /// Apply `delta` under timestamp ordering.
    ///
    /// Untimestamped adjustments apply directly. A positive timestamped
    /// adjustment applies, raises the origin's watermark, and releases any
    /// parked decrements at or below it. A negative adjustment applies
    /// only once its origin's watermark has reached its timestamp.
    fn handle_adjustment(&mut self, timestamp: u64, delta: i64) {
        if timestamp == 0 {
            self.unguarded_delta += delta;
            return;
        }

        let node = (timestamp >> BARRIER_TIMESTAMP_NODEID_SHIFT) as NodeId;
        let pernode = self.pernode.entry(node).or_default();

        if delta > 0 {
            self.unguarded_delta += delta;
            pernode.last_ts = timestamp;
            while let Some((ts, pending_delta)) = pernode.pending.pop_first() {
                if ts > pernode.last_ts {
                    pernode.pending.insert(ts, pending_delta);
                    break;
                }
                log::info!(target: "barrier", "applying pending delta: ts={ts:#x} delta={pending_delta}");
                self.unguarded_delta += pending_delta;
            }
        } else if timestamp <= pernode.last_ts {
            log::debug!(target: "barrier", "adjustment applied immediately: ts={timestamp:#x} delta={delta}");
            self.unguarded_delta += delta;
        } else {
            log::info!(target: "barrier", "adjustment deferred: ts={timestamp:#x} delta={delta}");
            *pernode.pending.entry(timestamp).or_insert(0) += delta;
        }
    }
}

// ============================================================================
// Barrier state
// ============================================================================

struct BarrierState {
    /// Highest generation this non-owner has subscribed to.
    gen_subscribed: u64,
    /// Base offset of the reduction-value slots.
    first_generation: u64,
    /// One past the last generation this barrier may be re-armed for.
    free_generation: u64,
    base_arrival_count: i64,
    /// Trackers for untriggered generations, in generation order.
    generations: BTreeMap<u64, GenerationTracker>,
    /// Out-of-order trigger ranges: `previous_gen -> trigger_gen`.
    held_triggers: BTreeMap<u64, u64>,
    /// Owner only: the untriggered generation each remote is subscribed to.
    remote_subscribe_gens: BTreeMap<NodeId, u64>,
    /// Owner only: the last generation each remote was notified of.
    remote_trigger_gens: BTreeMap<NodeId, u64>,
    redop_id: ReductionOpId,
    redop: Option<Arc<dyn ReductionOp>>,
    initial_value: Vec<u8>,
    /// Contiguous result slots, `sizeof_lhs` bytes per generation,
    /// indexed by `gen - first_generation - 1`.
    final_values: Vec<u8>,
    /// Allocated slot count.
    value_capacity: usize,
}

impl BarrierState {
    /// Grow the result storage to `slots`, seeding new slots with the
    /// initial value.
    fn ensure_value_capacity(&mut self, slots: usize) {
        debug_assert!(!self.initial_value.is_empty());
        while self.value_capacity < slots {
            self.final_values.extend_from_slice(&self.initial_value);
            self.value_capacity += 1;
        }
    }
}

struct RemoteNotification {
    node: NodeId,
    trigger_gen: u64,
    previous_gen: u64,
}

/// Implementation object behind one barrier id, all generations.
pub struct BarrierImpl {
    me: Id,
    owner: NodeId,
    /// Highest triggered generation, readable without the mutex.
    generation: AtomicU64,
    inner: Mutex<BarrierState>,
}

impl BarrierImpl {
    pub(crate) fn new(me: Id, owner: NodeId) -> Self {
        Self {
            me,
            owner,
            generation: AtomicU64::new(0),
            inner: Mutex::new(BarrierState {
                gen_subscribed: 0,
                first_generation: 0,
                free_generation: 0,
                base_arrival_count: 0,
                generations: BTreeMap::new(),
                held_triggers: BTreeMap::new(),
                remote_subscribe_gens: BTreeMap::new(),
                remote_trigger_gens: BTreeMap::new(),
                redop_id: 0,
                redop: None,
                initial_value: Vec::new(),
                final_values: Vec::new(),
                value_capacity: 0,
            }),
        }
    }

    /// Arm a freshly allocated barrier on its owner.
    pub(crate) fn configure(
        &self,
        expected_arrivals: u32,
        redop_id: ReductionOpId,
        redop: Option<Arc<dyn ReductionOp>>,
        initial_value: &[u8],
    ) {
        assert!(expected_arrivals > 0, "barrier with zero expected arrivals");
        let mut state = self.inner.lock();
        state.base_arrival_count = i64::from(expected_arrivals);
        // alive until explicitly retired
        state.free_generation = u64::MAX;
        if let Some(redop) = redop {
            assert_ne!(redop_id, 0, "reduction op registered under the null id");
            assert_eq!(
                initial_value.len(),
                redop.sizeof_lhs(),
                "initial value size mismatch"
            );
            state.redop_id = redop_id;
            state.redop = Some(redop);
            state.initial_value = initial_value.to_vec();
        } else {
            assert!(initial_value.is_empty(), "initial value without a reduction op");
        }
        log::info!(
            target: "barrier",
            "barrier created: {} base_count={} redop={}",
            self.me, expected_arrivals, redop_id
        );
    }

    /// Handle for the next generation to trigger.
    pub(crate) fn current_barrier(&self) -> Barrier {
        self.make_barrier(self.generation.load(Ordering::Acquire) + 1, 0)
    }

    #[inline]
    fn make_barrier(&self, gen: u64, timestamp: u64) -> Barrier {
        Barrier {
            id: self.me,
            gen,
            timestamp,
        }
    }

    #[inline]
    fn make_event(&self, gen: u64) -> Event {
        Event { id: self.me, gen }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Whether `needed_gen` has triggered on this node. A non-owner that
    /// cannot answer "yes" subscribes to the owner as a side effect, so a
    /// later query (or waiter) will be satisfied by a trigger notice.
    pub(crate) fn has_triggered(&self, rt: &Runtime, needed_gen: u64) -> bool {
        if needed_gen <= self.generation.load(Ordering::Acquire) {
            return true;
        }

        if self.owner != rt.node_id() {
            let previous_subscription;
            {
                let mut state = self.inner.lock();
                previous_subscription = state.gen_subscribed;
                if state.gen_subscribed < needed_gen {
                    state.gen_subscribed = needed_gen;
                }
            }
            if previous_subscription < needed_gen {
                log::info!(target: "barrier", "subscribing to barrier {}/{}", self.me, needed_gen);
                rt.post(
                    self.owner,
                    Message::BarrierSubscribe {
                        barrier_id: self.me,
                        subscribe_gen: needed_gen,
                    },
                    Payload::None,
                );
            }
        }

        false
    }

    /// Copy the reduction result of `result_gen` into `value`.
    /// Returns `false` while the generation has not triggered here.
    pub(crate) fn get_result(&self, result_gen: u64, value: &mut [u8]) -> bool {
        let state = self.inner.lock();
        if result_gen > self.generation.load(Ordering::Acquire) {
            return false;
        }

        let Some(redop) = &state.redop else {
            panic!("result query on a barrier without a reduction op: {}", self.me);
        };
        let lhs_size = redop.sizeof_lhs();
        assert_eq!(value.len(), lhs_size, "result buffer size mismatch");

        let rel_gen = (result_gen - state.first_generation) as usize;
        assert!(
            rel_gen > 0 && rel_gen <= state.value_capacity,
            "triggered generation {result_gen} has no result slot"
        );
        value.copy_from_slice(&state.final_values[(rel_gen - 1) * lhs_size..rel_gen * lhs_size]);
        true
    }

    // ------------------------------------------------------------------
    // Waiters
    // ------------------------------------------------------------------

    /// Register `waiter` for `needed_gen`; fires synchronously (after the
    /// mutex is released) when the generation has already triggered.
    pub(crate) fn add_waiter(
        &self,
        rt: &Runtime,
        needed_gen: u64,
        waiter: Arc<dyn EventWaiter>,
    ) -> bool {
        let mut trigger_now = false;
        {
            let mut state = self.inner.lock();
            let generation = self.generation.load(Ordering::Relaxed);
            if needed_gen > generation {
                state
                    .generations
                    .entry(needed_gen)
                    .or_insert_with(|| {
                        log::info!(
                            target: "barrier",
                            "added tracker for barrier {} generation {needed_gen}",
                            self.me
                        );
                        GenerationTracker::default()
                    })
                    .local_waiters
                    .push(Arc::clone(&waiter));

                // a query must already have set up the subscription
                assert!(
                    self.owner == rt.node_id() || state.gen_subscribed >= needed_gen,
                    "waiter registered without subscription on {}",
                    self.me
                );
            } else {
                trigger_now = true;
            }
        }

        if trigger_now {
            // barrier poison is pinned to the clean sentinel
            let _reclaim = waiter.notify(rt, self.make_event(needed_gen), false);
        }

        true
    }

    // ------------------------------------------------------------------
    // Arrival adjustment
    // ------------------------------------------------------------------

    /// Adjust the arrival count of `barrier_gen` by `delta`.
    ///
    /// Positive deltas come from `alter_arrival_count`, negative ones from
    /// arrivals. An arrival gated on an untriggered `wait_on` is deferred:
    /// forwarded to the owner by default so the wait happens there, or
    /// parked locally when local deferral is configured. All non-deferred
    /// non-owner adjustments are forwarded to the owner.
    pub(crate) fn adjust_arrival(
        &self,
        rt: &Runtime,
        barrier_gen: u64,
        delta: i64,
        timestamp: u64,
        wait_on: Event,
        reduce_value: Option<&[u8]>,
    ) {
        let (wait_triggered, wait_poisoned) = rt.event_has_triggered(wait_on);
        if !wait_triggered {
            let barrier = self.make_barrier(barrier_gen, timestamp);
            if self.owner != rt.node_id() && !DEFER_ARRIVALS_LOCALLY {
                // defer on the owner: the precondition most often triggers
                // there, saving a hop
                log::info!(
                    target: "barrier",
                    "forwarding deferred barrier arrival: delta={delta} in={wait_on} out={barrier}"
                );
                rt.post(
                    self.owner,
                    Message::BarrierAdjust {
                        barrier,
                        delta,
                        wait_on,
                    },
                    reduce_payload(reduce_value),
                );
                return;
            }

            log::info!(
                target: "barrier",
                "deferring barrier arrival: delta={delta} in={wait_on} out={barrier}"
            );
            rt.add_waiter(
                wait_on,
                Arc::new(DeferredBarrierArrival {
                    barrier,
                    delta,
                    reduce_value: reduce_value.map(<[u8]>::to_vec),
                }),
            );
            return;
        }
        assert!(
            !wait_poisoned,
            "poisoned precondition on a barrier arrival: {wait_on}"
        );

        log::info!(
            target: "barrier",
            "barrier adjustment: barrier={}/{barrier_gen} delta={delta} ts={timestamp:#x}",
            self.me
        );

        if self.owner != rt.node_id() {
            let barrier = self.make_barrier(barrier_gen, timestamp);
            rt.post(
                self.owner,
                Message::BarrierAdjust {
                    barrier,
                    delta,
                    wait_on: Event::NO_EVENT,
                },
                reduce_payload(reduce_value),
            );
            return;
        }

        // owner path: count, maybe trigger a contiguous run of
        // generations, and work out who needs to hear about it
        let mut trigger_gen = 0;
        let mut local_notifications: Vec<Arc<dyn EventWaiter>> = Vec::new();
        let mut remote_notifications: Vec<RemoteNotification> = Vec::new();
        let mut oldest_previous = 0;
        let mut values_snapshot: Option<(Vec<u8>, usize)> = None;
        let first_generation;
        let redop_id;
        {
            let mut state = self.inner.lock();
            let generation = self.generation.load(Ordering::Relaxed);
            assert!(
                generation < state.free_generation,
                "adjustment on a retired barrier {}",
                self.me
            );
            assert!(state.base_arrival_count > 0);
            assert!(
                barrier_gen > generation,
                "adjustment for triggered generation {}/{barrier_gen}",
                self.me
            );

            state
                .generations
                .entry(barrier_gen)
                .or_insert_with(|| {
                    log::info!(
                        target: "barrier",
                        "added tracker for barrier {} generation {barrier_gen}",
                        self.me
                    );
                    GenerationTracker::default()
                })
                .handle_adjustment(timestamp, delta);

            // an update to the next generation may satisfy one or more
            // contiguous generations
            if barrier_gen == generation + 1 {
                let mut new_generation = generation;
                loop {
                    let Some((&gen, tracker)) = state.generations.first_key_value() else {
                        break;
                    };
                    if gen != new_generation + 1
                        || state.base_arrival_count + tracker.unguarded_delta != 0
                    {
                        break;
                    }
                    if let Some((gen, tracker)) = state.generations.pop_first() {
                        local_notifications.extend(tracker.local_waiters);
                        new_generation = gen;
                        trigger_gen = gen;
                    }
                }

                if trigger_gen > 0 {
                    self.generation.store(new_generation, Ordering::Release);

                    // notify subscribers; fully-served subscriptions retire
                    let BarrierState {
                        remote_subscribe_gens,
                        remote_trigger_gens,
                        first_generation,
                        ..
                    } = &mut *state;
                    remote_subscribe_gens.retain(|&node, subscribe_gen| {
                        let notify_gen = (*subscribe_gen).min(new_generation);
                        let previous_gen = match remote_trigger_gens.get_mut(&node) {
                            Some(last) => {
                                let previous = *last;
                                *last = notify_gen;
                                previous
                            }
                            None => {
                                remote_trigger_gens.insert(node, notify_gen);
                                *first_generation
                            }
                        };
                        if remote_notifications.is_empty() || previous_gen < oldest_previous {
                            oldest_previous = previous_gen;
                        }
                        remote_notifications.push(RemoteNotification {
                            node,
                            trigger_gen: notify_gen,
                            previous_gen,
                        });
                        *subscribe_gen > new_generation
                    });
                }
            }

            // apply reduction data even when the adjustment itself is
            // parked; no reason to keep raw values around
            if let Some(value) = reduce_value {
                let Some(redop) = state.redop.clone() else {
                    panic!("reduction value on a barrier without a reduction op: {}", self.me);
                };
                assert_eq!(redop.sizeof_rhs(), value.len(), "reduction value size mismatch");

                let rel_gen = (barrier_gen - state.first_generation) as usize;
                assert!(rel_gen > 0);
                state.ensure_value_capacity(rel_gen);
                let lhs_size = redop.sizeof_lhs();
                redop.apply(
                    &mut state.final_values[(rel_gen - 1) * lhs_size..rel_gen * lhs_size],
                    value,
                );
            }

            // snapshot the contiguous result range the notifications will
            // slice from, while the lock still pins it
            if trigger_gen > 0 && !remote_notifications.is_empty() {
                if let Some(redop) = state.redop.clone() {
                    let lhs_size = redop.sizeof_lhs();
                    let needed_slots = (trigger_gen - state.first_generation) as usize;
                    state.ensure_value_capacity(needed_slots);
                    let rel = (oldest_previous + 1 - state.first_generation) as usize;
                    assert!(rel > 0);
                    let start = (rel - 1) * lhs_size;
                    let len = ((trigger_gen - oldest_previous) as usize) * lhs_size;
                    values_snapshot = Some((state.final_values[start..start + len].to_vec(), lhs_size));
                }
            }

            first_generation = state.first_generation;
            redop_id = state.redop_id;
        }

        if trigger_gen > 0 {
            log::info!(target: "barrier", "barrier trigger: barrier={}/{trigger_gen}", self.me);

            // local waiters first, then the remote notices
            fire_waiters(
                rt,
                local_notifications,
                self.make_event(trigger_gen),
                false,
            );

            for notification in &remote_notifications {
                log::info!(
                    target: "barrier",
                    "sending remote trigger notification: {}/{} -> {}, dest={}",
                    self.me, notification.previous_gen, notification.trigger_gen, notification.node
                );
                let payload = match &values_snapshot {
                    Some((bytes, lhs_size)) => {
                        let start =
                            ((notification.previous_gen - oldest_previous) as usize) * lhs_size;
                        let len = ((notification.trigger_gen - notification.previous_gen) as usize)
                            * lhs_size;
                        Payload::Copy(bytes[start..start + len].to_vec())
                    }
                    None => Payload::None,
                };
                rt.post(
                    notification.node,
                    Message::BarrierTrigger {
                        barrier_id: self.me,
                        trigger_gen: notification.trigger_gen,
                        previous_gen: notification.previous_gen,
                        first_generation,
                        redop_id,
                    },
                    payload,
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Subscription handling (owner side)
    // ------------------------------------------------------------------

    /// Record a remote subscription; triggered generations the node has
    /// not seen are sent back immediately.
    pub(crate) fn handle_subscribe(&self, rt: &Runtime, node: NodeId, subscribe_gen: u64) {
        let mut trigger_gen = 0;
        let mut previous_gen = 0;
        let mut payload = Payload::None;
        let mut first_generation = 0;
        let mut redop_id = 0;
        {
            let mut state = self.inner.lock();
            let generation = self.generation.load(Ordering::Relaxed);

            assert!(
                subscribe_gen > state.first_generation,
                "subscription for a previous lifetime of {}",
                self.me
            );

            let mut already_subscribed = false;
            match state.remote_subscribe_gens.get_mut(&node) {
                Some(subscribed) => {
                    // live subscriptions are always for untriggered gens
                    assert!(*subscribed > generation);
                    if *subscribed >= subscribe_gen {
                        already_subscribed = true;
                    } else {
                        *subscribed = subscribe_gen;
                    }
                }
                None => {
                    // don't record subscriptions for generations that have
                    // already triggered; the catch-up below covers them
                    if subscribe_gen > generation {
                        state.remote_subscribe_gens.insert(node, subscribe_gen);
                    }
                }
            }

            if !already_subscribed && generation > state.first_generation {
                let notified_through = state.remote_trigger_gens.get(&node).copied();
                let needs_catch_up = match notified_through {
                    Some(last) => last < generation,
                    None => true,
                };
                if needs_catch_up {
                    previous_gen = notified_through.unwrap_or(state.first_generation);
                    trigger_gen = generation;
                    state.remote_trigger_gens.insert(node, generation);

                    if let Some(redop) = &state.redop {
                        let lhs_size = redop.sizeof_lhs();
                        let rel = (previous_gen + 1 - state.first_generation) as usize;
                        assert!(rel > 0);
                        let start = (rel - 1) * lhs_size;
                        let len = ((trigger_gen - previous_gen) as usize) * lhs_size;
                        payload = Payload::Copy(state.final_values[start..start + len].to_vec());
                    }
                    first_generation = state.first_generation;
                    redop_id = state.redop_id;
                }
            }
        }

        if trigger_gen > 0 {
            log::info!(
                target: "barrier",
                "sending immediate barrier trigger: {}/{previous_gen} -> {trigger_gen}, dest={node}",
                self.me
            );
            rt.post(
                node,
                Message::BarrierTrigger {
                    barrier_id: self.me,
                    trigger_gen,
                    previous_gen,
                    first_generation,
                    redop_id,
                },
                payload,
            );
        }
    }

    // ------------------------------------------------------------------
    // Trigger reception (non-owner side)
    // ------------------------------------------------------------------

    /// Absorb a trigger notice covering `(previous_gen, trigger_gen]`.
    ///
    /// Notices may arrive in any order; only a notice contiguous with the
    /// local generation publishes, pulling in any parked successors.
    pub(crate) fn handle_trigger(
        &self,
        rt: &Runtime,
        trigger_gen: u64,
        previous_gen: u64,
        first_generation: u64,
        redop_id: ReductionOpId,
        data: &[u8],
    ) {
        log::info!(
            target: "barrier",
            "received remote barrier trigger: {}/{previous_gen} -> {trigger_gen}",
            self.me
        );

        let mut local_notifications: Vec<Arc<dyn EventWaiter>> = Vec::new();
        let mut published_gen = trigger_gen;
        {
            let mut state = self.inner.lock();
            let generation = self.generation.load(Ordering::Relaxed);

            if previous_gen == generation {
                // chain any held ranges that now connect
                while let Some(&next) = state.held_triggers.get(&published_gen) {
                    log::info!(
                        target: "barrier",
                        "collapsing future trigger: {}/{previous_gen} -> {published_gen} -> {next}",
                        self.me
                    );
                    state.held_triggers.remove(&published_gen);
                    published_gen = next;
                }

                // collect waiters for everything now triggered
                while let Some((gen, tracker)) = state.generations.pop_first() {
                    if gen > published_gen {
                        state.generations.insert(gen, tracker);
                        break;
                    }
                    local_notifications.extend(tracker.local_waiters);
                }

                self.generation.store(published_gen, Ordering::Release);
            } else {
                log::info!(
                    target: "barrier",
                    "holding future trigger: {} ({previous_gen} -> {trigger_gen})",
                    self.me
                );
                state.held_triggers.insert(previous_gen, trigger_gen);
            }

            // adopt reduction results regardless of ordering; slots are
            // addressed absolutely so out-of-order copies are safe
            if !data.is_empty() {
                assert_ne!(redop_id, 0, "reduction payload without an op id");
                let redop = rt.reduction(redop_id);
                let lhs_size = redop.sizeof_lhs();
                assert_eq!(
                    data.len(),
                    lhs_size * ((trigger_gen - previous_gen) as usize),
                    "reduction payload length mismatch"
                );

                state.redop_id = redop_id;
                state.redop = Some(redop);
                state.first_generation = first_generation;

                let needed_slots = (trigger_gen - first_generation) as usize;
                if state.value_capacity < needed_slots {
                    // slots between data ranges are overwritten when their
                    // own notice arrives
                    state.final_values.resize(needed_slots * lhs_size, 0);
                    state.value_capacity = needed_slots;
                }
                let start = ((previous_gen - first_generation) as usize) * lhs_size;
                state.final_values[start..start + data.len()].copy_from_slice(data);
            }
        }

        fire_waiters(
            rt,
            local_notifications,
            self.make_event(published_gen),
            false,
        );
    }
}

// ============================================================================
// Deferred arrival
// ============================================================================

/// One-shot waiter that performs a parked arrival once its precondition
/// triggers.
struct DeferredBarrierArrival {
    barrier: Barrier,
    delta: i64,
    reduce_value: Option<Vec<u8>>,
}

impl EventWaiter for DeferredBarrierArrival {
    fn notify(&self, rt: &Runtime, _event: Event, poisoned: bool) -> bool {
        // fault propagation into barrier generations is not wired through;
        // failing loudly beats silently dropping an arrival
        assert!(
            !poisoned,
            "poisoned precondition on a deferred barrier arrival: {}",
            self.barrier
        );
        log::info!(
            target: "barrier",
            "deferred barrier arrival: {} delta={}",
            self.barrier, self.delta
        );
        rt.barrier_impl(self.barrier.id).adjust_arrival(
            rt,
            self.barrier.gen,
            self.delta,
            self.barrier.timestamp,
            Event::NO_EVENT,
            self.reduce_value.as_deref(),
        );
        true
    }
}

fn reduce_payload(reduce_value: Option<&[u8]>) -> Payload {
    match reduce_value {
        Some(value) => Payload::Copy(value.to_vec()),
        None => Payload::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untimestamped_adjustments_apply_directly() {
        let mut tracker = GenerationTracker::default();
        tracker.handle_adjustment(0, -1);
        tracker.handle_adjustment(0, -2);
        assert_eq!(tracker.unguarded_delta, -3);
    }

    #[test]
    fn test_decrement_waits_for_matching_increment() {
        let mut tracker = GenerationTracker::default();
        let ts = (4u64 << BARRIER_TIMESTAMP_NODEID_SHIFT) | 9;

        // the arrival that consumes the altered count arrives first
        tracker.handle_adjustment(ts, -1);
        assert_eq!(tracker.unguarded_delta, 0);

        // the increment with the same timestamp releases it
        tracker.handle_adjustment(ts, 1);
        assert_eq!(tracker.unguarded_delta, 0);
    }

    #[test]
    fn test_decrement_applies_after_watermark() {
        let mut tracker = GenerationTracker::default();
        let ts_inc = (4u64 << BARRIER_TIMESTAMP_NODEID_SHIFT) | 5;
        let ts_dec = (4u64 << BARRIER_TIMESTAMP_NODEID_SHIFT) | 3;

        tracker.handle_adjustment(ts_inc, 2);
        assert_eq!(tracker.unguarded_delta, 2);

        // an older decrement from the same origin applies immediately
        tracker.handle_adjustment(ts_dec, -1);
        assert_eq!(tracker.unguarded_delta, 1);
    }

    #[test]
    fn test_pending_decrements_accumulate_per_timestamp() {
        let mut tracker = GenerationTracker::default();
        let ts = (2u64 << BARRIER_TIMESTAMP_NODEID_SHIFT) | 7;

        tracker.handle_adjustment(ts, -1);
        tracker.handle_adjustment(ts, -1);
        assert_eq!(tracker.unguarded_delta, 0);

        tracker.handle_adjustment(ts, 2);
        assert_eq!(tracker.unguarded_delta, 0);
    }

    #[test]
    fn test_origins_are_independent() {
        let mut tracker = GenerationTracker::default();
        let ts_a = (1u64 << BARRIER_TIMESTAMP_NODEID_SHIFT) | 1;
        let ts_b = (2u64 << BARRIER_TIMESTAMP_NODEID_SHIFT) | 1;

        tracker.handle_adjustment(ts_a, -1);
        // node B's increment must not release node A's decrement
        tracker.handle_adjustment(ts_b, 1);
        assert_eq!(tracker.unguarded_delta, 1);

        tracker.handle_adjustment(ts_a, 1);
        assert_eq!(tracker.unguarded_delta, 1);
    }
}
