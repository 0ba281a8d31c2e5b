// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lock-free event fan-in.
//!
//! An [`EventMerger`] waits on a set of input events and triggers a
//! synthesized finish event when all of them have fired. Poison on any
//! input propagates to the finish event eagerly (at most once), unless the
//! merger was built to ignore faults, in which case the finish event
//! triggers clean once every input has fired, poisoned or not.
//!
//! The merger counts with atomics only: `count_needed` starts at 1 (a
//! phantom input standing for "construction still in progress") and
//! [`EventMerger::arm`] retires the phantom once all inputs are added.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::api::Event;
use crate::runtime::Runtime;

use super::waiter::EventWaiter;

/// Fan-in waiter that triggers `finish_event` when all inputs have fired.
pub struct EventMerger {
    finish_event: Event,
    ignore_faults: bool,
    /// Pending input count, including the construction phantom.
    count_needed: AtomicU32,
    faults_observed: AtomicU32,
}

impl EventMerger {
    pub(crate) fn new(finish_event: Event, ignore_faults: bool) -> Self {
        Self {
            finish_event,
            ignore_faults,
            count_needed: AtomicU32::new(1),
            faults_observed: AtomicU32::new(0),
        }
    }

    /// Add one input. Already-poisoned inputs are counted as faults and do
    /// not raise the pending count; everything else registers the merger
    /// as a waiter (firing synchronously if already triggered clean).
    pub(crate) fn add_event(self: &Arc<Self>, rt: &Runtime, wait_for: Event) {
        if !wait_for.exists() {
            return;
        }

        let (triggered, poisoned) = rt.event_has_triggered(wait_for);
        if triggered && poisoned {
            self.observe_fault(rt);
            return;
        }

        self.count_needed.fetch_add(1, Ordering::AcqRel);
        rt.add_waiter(wait_for, Arc::clone(self) as Arc<dyn EventWaiter>);
    }

    /// Retire the construction phantom once all inputs have been added.
    /// Returns `true` if the merger finished right here, meaning the
    /// caller holds the last useful reference.
    pub(crate) fn arm(&self, rt: &Runtime) -> bool {
        self.input_triggered(rt, false)
    }

    /// Count a fault; the first one propagates poison to the finish event
    /// unless faults are ignored.
    fn observe_fault(&self, rt: &Runtime) {
        let first_fault = self.faults_observed.fetch_add(1, Ordering::AcqRel) == 0;
        if first_fault && !self.ignore_faults {
            log::info!(target: "poison", "event merger early poison: after={}", self.finish_event);
            rt.trigger_event(self.finish_event, true);
        }
    }

    fn input_triggered(&self, rt: &Runtime, poisoned: bool) -> bool {
        if poisoned {
            self.observe_fault(rt);
        }

        let count_before = self.count_needed.fetch_sub(1, Ordering::AcqRel);
        log::debug!(
            target: "event",
            "merger input fired: after={} left={} poisoned={}",
            self.finish_event,
            count_before - 1,
            poisoned
        );

        let last_trigger = count_before == 1;

        // trigger on the last input unless poison already went out early
        if last_trigger && (self.ignore_faults || self.faults_observed.load(Ordering::Acquire) == 0)
        {
            rt.trigger_event(self.finish_event, false);
        }

        last_trigger
    }
}

impl EventWaiter for EventMerger {
    fn notify(&self, rt: &Runtime, _event: Event, poisoned: bool) -> bool {
        self.input_triggered(rt, poisoned)
    }
}

/// Build an event that triggers once every input has.
///
/// Counts of zero or one untriggered input avoid allocating anything: an
/// all-triggered clean set collapses to [`Event::NO_EVENT`], a single
/// pending input is returned as-is (unless faults are ignored, which needs
/// a fresh event to guarantee a clean trigger), and an already-poisoned
/// input is handed back unmodified so the fault propagates.
pub(crate) fn merge_events(rt: &Runtime, wait_for: &[Event], ignore_faults: bool) -> Event {
    // scan until two untriggered inputs are seen; remember the first for
    // the count == 1 case
    let mut wait_count = 0;
    let mut first_wait = Event::NO_EVENT;
    for &ev in wait_for {
        if wait_count >= 2 {
            break;
        }
        if !ev.exists() {
            continue;
        }
        let (triggered, poisoned) = rt.event_has_triggered(ev);
        if triggered {
            if poisoned && !ignore_faults {
                log::info!(target: "poison", "merging events - {ev} already poisoned");
                return ev;
            }
        } else {
            if wait_count == 0 {
                first_wait = ev;
            }
            wait_count += 1;
        }
    }

    log::debug!(target: "event", "merging events - at least {wait_count} not triggered");

    if wait_count == 0 {
        return Event::NO_EVENT;
    }
    if wait_count == 1 && !ignore_faults {
        return first_wait;
    }

    let finish_event = rt.create_genevent().current_event();
    let merger = Arc::new(EventMerger::new(finish_event, ignore_faults));
    for &ev in wait_for {
        if !ev.exists() {
            continue;
        }
        log::debug!(target: "event", "event merging: event={finish_event} wait_on={ev}");
        merger.add_event(rt, ev);
    }

    // arm once all inputs are in; the merger may finish immediately, in
    // which case the Arc simply drops here
    let _finished = merger.arm(rt);

    finish_event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::UserEvent;
    use crate::transport::loopback::LoopbackMesh;

    #[test]
    fn test_merge_empty_is_no_event() {
        let (_mesh, nodes) = LoopbackMesh::with_nodes(1);
        assert_eq!(merge_events(&nodes[0], &[], false), Event::NO_EVENT);
    }

    #[test]
    fn test_merge_single_pending_returns_input() {
        let (_mesh, nodes) = LoopbackMesh::with_nodes(1);
        let rt = &nodes[0];
        let u = UserEvent::create(rt);
        assert_eq!(merge_events(rt, &[u.event()], false), u.event());
    }

    #[test]
    fn test_merge_single_pending_ignorefaults_allocates() {
        let (_mesh, nodes) = LoopbackMesh::with_nodes(1);
        let rt = &nodes[0];
        let u = UserEvent::create(rt);
        let merged = merge_events(rt, &[u.event()], true);
        assert_ne!(merged, u.event());
        assert!(merged.exists());
    }

    #[test]
    fn test_merge_all_triggered_is_no_event() {
        let (_mesh, nodes) = LoopbackMesh::with_nodes(1);
        let rt = &nodes[0];
        let u = UserEvent::create(rt);
        let e = u.event();
        u.trigger(rt, Event::NO_EVENT);
        assert_eq!(merge_events(rt, &[e], false), Event::NO_EVENT);
    }

    #[test]
    fn test_merge_poisoned_input_returned_unmodified() {
        let (_mesh, nodes) = LoopbackMesh::with_nodes(1);
        let rt = &nodes[0];
        let u = UserEvent::create(rt);
        let e = u.event();
        u.cancel(rt);
        assert_eq!(merge_events(rt, &[e], false), e);
    }
}
