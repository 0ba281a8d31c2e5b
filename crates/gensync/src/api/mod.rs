// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Public synchronization handles.
//!
//! [`Event`], [`UserEvent`], and [`Barrier`] are small `Copy` value types
//! carrying `(id, generation[, timestamp])`. All state lives behind the
//! per-node [`Runtime`] directory, which every operation takes explicitly;
//! handles themselves are freely sendable between threads and nodes.
//!
//! The fault-unaware queries (`has_triggered`, `wait`) panic when they
//! meet a poisoned trigger: they exist for callers that predate fault
//! awareness and cannot act on poison. Use the `_faultaware` variants to
//! observe poison as data.

use std::fmt;
use std::sync::Arc;

use crate::barrier::reduction::ReductionOpId;
use crate::core::Id;
use crate::event::merger::merge_events;
use crate::event::waiter::{CondvarWaiter, DeferredEventTrigger};
use crate::runtime::Runtime;

// ============================================================================
// Event
// ============================================================================

/// A single-shot synchronization handle: one generation of one event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Event {
    pub id: Id,
    pub gen: u64,
}

impl Event {
    /// The null handle; has always triggered, clean.
    pub const NO_EVENT: Event = Event {
        id: Id::NULL,
        gen: 0,
    };

    /// Whether this is a real handle (the null sentinel "exists" nowhere
    /// but is always triggered).
    #[must_use]
    #[inline]
    pub fn exists(self) -> bool {
        !self.id.is_null()
    }

    /// Whether this generation has triggered.
    ///
    /// # Panics
    ///
    /// Panics if the trigger was poisoned; this query cannot report
    /// faults. Use [`has_triggered_faultaware`](Self::has_triggered_faultaware)
    /// where poison is expected.
    #[must_use]
    pub fn has_triggered(self, rt: &Runtime) -> bool {
        let (triggered, poisoned) = rt.event_has_triggered(self);
        if triggered {
            assert!(!poisoned, "poisoned event observed by fault-unaware query: {self}");
        }
        triggered
    }

    /// `(triggered, poisoned)` for this generation. Once `triggered` is
    /// observed `true`, it stays `true` and `poisoned` is stable.
    #[must_use]
    pub fn has_triggered_faultaware(self, rt: &Runtime) -> (bool, bool) {
        rt.event_has_triggered(self)
    }

    /// Block the calling thread until this generation triggers.
    ///
    /// # Panics
    ///
    /// Panics if the trigger was poisoned.
    pub fn wait(self, rt: &Runtime) {
        let poisoned = self.wait_faultaware(rt);
        assert!(!poisoned, "waited-on event is poisoned: {self}");
    }

    /// Block until this generation triggers; returns its poison bit.
    pub fn wait_faultaware(self, rt: &Runtime) -> bool {
        if !self.exists() {
            return false;
        }
        let (triggered, poisoned) = rt.event_has_triggered(self);
        if triggered {
            return poisoned;
        }

        log::info!(target: "event", "thread blocked: event={self}");
        let waiter = CondvarWaiter::new();
        rt.add_waiter(self, waiter.clone());
        let poisoned = waiter.block();
        log::info!(target: "event", "thread resumed: event={self} poisoned={poisoned}");
        poisoned
    }

    /// [`wait`](Self::wait) for threads outside the runtime's scheduler.
    ///
    /// # Panics
    ///
    /// Panics if the trigger was poisoned.
    pub fn external_wait(self, rt: &Runtime) {
        let poisoned = self.external_wait_faultaware(rt);
        assert!(!poisoned, "waited-on event is poisoned: {self}");
    }

    /// [`wait_faultaware`](Self::wait_faultaware) for threads outside the
    /// runtime's scheduler. Parks on a plain condition variable, so it is
    /// safe from any thread.
    pub fn external_wait_faultaware(self, rt: &Runtime) -> bool {
        if !self.exists() {
            return false;
        }
        let (triggered, poisoned) = rt.event_has_triggered(self);
        if triggered {
            return poisoned;
        }

        log::info!(target: "event", "external thread blocked: event={self}");
        let waiter = CondvarWaiter::new();
        rt.add_waiter(self, waiter.clone());
        let poisoned = waiter.block();
        log::info!(target: "event", "external thread resumed: event={self}");
        poisoned
    }

    /// An event that triggers once every input has.
    ///
    /// Poison on any input propagates to the result. Degenerate inputs
    /// collapse: an empty or fully-triggered clean set yields
    /// [`NO_EVENT`](Self::NO_EVENT), a single pending input is returned
    /// as-is, an already-poisoned input is returned unmodified.
    #[must_use]
    pub fn merge_events(rt: &Runtime, wait_for: &[Event]) -> Event {
        merge_events(rt, wait_for, false)
    }

    /// [`merge_events`](Self::merge_events), but the result triggers clean
    /// once every input has triggered, poisoned or not.
    #[must_use]
    pub fn merge_events_ignorefaults(rt: &Runtime, wait_for: &[Event]) -> Event {
        merge_events(rt, wait_for, true)
    }

    /// Two-input convenience form of [`merge_events`](Self::merge_events).
    #[must_use]
    pub fn merge(rt: &Runtime, a: Event, b: Event) -> Event {
        merge_events(rt, &[a, b], false)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.gen)
    }
}

// ============================================================================
// UserEvent
// ============================================================================

/// An event triggered explicitly by user code rather than by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserEvent(Event);

impl UserEvent {
    pub const NO_USER_EVENT: UserEvent = UserEvent(Event::NO_EVENT);

    /// Allocate a fresh user event at its first generation.
    #[must_use]
    pub fn create(rt: &Runtime) -> UserEvent {
        let event = rt.create_genevent().current_event();
        log::info!(target: "event", "user event created: event={event}");
        UserEvent(event)
    }

    /// The underlying waitable handle.
    #[must_use]
    #[inline]
    pub fn event(self) -> Event {
        self.0
    }

    /// Trigger once `wait_on` has triggered (immediately for an
    /// already-triggered or null `wait_on`). Poison on `wait_on`
    /// propagates to this event.
    pub fn trigger(self, rt: &Runtime, wait_on: Event) {
        let (triggered, poisoned) = rt.event_has_triggered(wait_on);
        if !triggered {
            log::info!(
                target: "event",
                "deferring user event trigger: event={} wait_on={wait_on}",
                self.0
            );
            rt.add_waiter(wait_on, Arc::new(DeferredEventTrigger::new(self.0)));
            return;
        }

        log::info!(target: "event", "user event trigger: event={} wait_on={wait_on}", self.0);
        rt.trigger_event(self.0, poisoned);
    }

    /// Trigger with poison, signaling that the producing computation
    /// failed. Downstream consumers observe the fault.
    pub fn cancel(self, rt: &Runtime) {
        log::info!(target: "event", "user event cancelled: event={}", self.0);
        rt.trigger_event(self.0, true);
    }
}

impl fmt::Display for UserEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// ============================================================================
// Barrier
// ============================================================================

/// One phase of a multi-generation collective barrier.
///
/// The timestamp orders arrival-count adjustments against the arrivals
/// that consume them; handles obtained anywhere but
/// [`alter_arrival_count`](Self::alter_arrival_count) carry timestamp 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Barrier {
    pub id: Id,
    pub gen: u64,
    pub timestamp: u64,
}

impl Barrier {
    /// Create a barrier expecting `expected_arrivals` per generation,
    /// with no reduction.
    #[must_use]
    pub fn create(rt: &Runtime, expected_arrivals: u32) -> Barrier {
        rt.create_barrier_impl(expected_arrivals, 0, &[])
            .current_barrier()
    }

    /// Create a barrier whose arrivals fold values with the reduction op
    /// registered under `redop_id`, starting each generation from
    /// `initial_value`.
    #[must_use]
    pub fn create_with_reduction(
        rt: &Runtime,
        expected_arrivals: u32,
        redop_id: ReductionOpId,
        initial_value: &[u8],
    ) -> Barrier {
        rt.create_barrier_impl(expected_arrivals, redop_id, initial_value)
            .current_barrier()
    }

    /// Request destruction. Reclamation of the underlying state is
    /// deliberately left undefined; the request is recorded only.
    pub fn destroy(self, rt: &Runtime) {
        let _ = rt;
        log::info!(target: "barrier", "barrier destruction request: {self}");
    }

    /// Handle for the next generation of the same barrier.
    #[must_use]
    pub fn advance(self) -> Barrier {
        Barrier {
            id: self.id,
            gen: self.gen + 1,
            timestamp: 0,
        }
    }

    /// Handle for the previous generation of the same barrier.
    #[must_use]
    pub fn get_previous_phase(self) -> Barrier {
        Barrier {
            id: self.id,
            gen: self.gen - 1,
            timestamp: self.timestamp,
        }
    }

    /// Adjust this generation's expected arrival count by `delta`.
    ///
    /// Returns a handle carrying the adjustment's timestamp; arrivals
    /// made through that handle are guaranteed not to be counted before
    /// the adjustment itself.
    #[must_use]
    pub fn alter_arrival_count(self, rt: &Runtime, delta: i64) -> Barrier {
        let timestamp = rt.next_barrier_timestamp();
        rt.barrier_impl(self.id).adjust_arrival(
            rt,
            self.gen,
            delta,
            timestamp,
            Event::NO_EVENT,
            None,
        );
        Barrier {
            id: self.id,
            gen: self.gen,
            timestamp,
        }
    }

    /// Arrive `count` times at this generation, optionally gated on
    /// `wait_on` and optionally contributing a reduction value.
    pub fn arrive(self, rt: &Runtime, count: u32, wait_on: Event, reduce_value: Option<&[u8]>) {
        rt.barrier_impl(self.id).adjust_arrival(
            rt,
            self.gen,
            -i64::from(count),
            self.timestamp,
            wait_on,
            reduce_value,
        );
    }

    /// Whether this generation has triggered on this node. A non-owner
    /// subscribes as a side effect, so polling eventually turns `true`
    /// without further messages.
    #[must_use]
    pub fn has_triggered(self, rt: &Runtime) -> bool {
        rt.barrier_impl(self.id).has_triggered(rt, self.gen)
    }

    /// Block the calling thread until this generation triggers.
    pub fn wait(self, rt: &Runtime) {
        if self.has_triggered(rt) {
            return;
        }
        log::info!(target: "barrier", "thread blocked: barrier={self}");
        let waiter = CondvarWaiter::new();
        rt.barrier_impl(self.id).add_waiter(rt, self.gen, waiter.clone());
        let _poisoned = waiter.block();
        log::info!(target: "barrier", "thread resumed: barrier={self}");
    }

    /// Copy this generation's reduction result into `value`. Returns
    /// `false` while the generation has not triggered here. `value` must
    /// be exactly one accumulator slot.
    #[must_use]
    pub fn get_result(self, rt: &Runtime, value: &mut [u8]) -> bool {
        rt.barrier_impl(self.id).get_result(self.gen, value)
    }

    /// This phase as a plain waitable event.
    #[must_use]
    #[inline]
    pub fn as_event(self) -> Event {
        Event {
            id: self.id,
            gen: self.gen,
        }
    }
}

impl fmt::Display for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.timestamp != 0 {
            write!(f, "{}/{} ({:#x})", self.id, self.gen, self.timestamp)
        } else {
            write!(f, "{}/{}", self.id, self.gen)
        }
    }
}
