// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Waiter callbacks fired when an event or barrier generation triggers.
//!
//! A waiter is notified exactly once per registration, always after the
//! notifying object's mutex has been released. The `bool` returned by
//! [`EventWaiter::notify`] is a reclaim hint: `true` means this was the
//! waiter's final notification and its registration may be released;
//! `false` means another party still owns it (a thread blocked on a
//! condition variable, or a merger that frees itself on its last input).

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::api::Event;
use crate::runtime::Runtime;

/// Callback invoked when a waited-on generation triggers.
///
/// Implementations must not re-enter the mutex of the event or barrier
/// that is notifying them; they may register on *other* events or post
/// messages.
pub trait EventWaiter: Send + Sync {
    /// Deliver the trigger. `event` carries the generation that fired and
    /// `poisoned` its fault bit. Returns the reclaim hint described in the
    /// module docs.
    fn notify(&self, rt: &Runtime, event: Event, poisoned: bool) -> bool;
}

/// Notify a batch of waiters collected under a lock, after its release.
pub(crate) fn fire_waiters(
    rt: &Runtime,
    waiters: Vec<Arc<dyn EventWaiter>>,
    event: Event,
    poisoned: bool,
) {
    for waiter in waiters {
        // the registration reference drops here either way; shared waiters
        // keep themselves alive through their own clones
        let _reclaim = waiter.notify(rt, event, poisoned);
    }
}

// ============================================================================
// Deferred event trigger
// ============================================================================

/// One-shot waiter that triggers `after_event` when its precondition
/// fires, forwarding poison.
pub(crate) struct DeferredEventTrigger {
    after_event: Event,
}

impl DeferredEventTrigger {
    pub(crate) fn new(after_event: Event) -> Self {
        Self { after_event }
    }
}

impl EventWaiter for DeferredEventTrigger {
    fn notify(&self, rt: &Runtime, _event: Event, poisoned: bool) -> bool {
        if poisoned {
            log::info!(target: "poison", "poisoned deferred event: event={}", self.after_event);
            rt.trigger_event(self.after_event, true);
        } else {
            log::info!(target: "event", "deferred trigger occurring: event={}", self.after_event);
            rt.trigger_event(self.after_event, false);
        }
        true
    }
}

// ============================================================================
// Condition-variable waiter
// ============================================================================

struct WaitState {
    fired: bool,
    poisoned: bool,
}

/// Blocks the registering thread until the generation triggers.
///
/// The waiting thread owns the storage (hence `notify` returns `false`);
/// registrations share it through `Arc` clones.
pub(crate) struct CondvarWaiter {
    state: Mutex<WaitState>,
    cond: Condvar,
}

impl CondvarWaiter {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WaitState {
                fired: false,
                poisoned: false,
            }),
            cond: Condvar::new(),
        })
    }

    /// Park until notified. Returns the poison bit of the trigger.
    pub(crate) fn block(&self) -> bool {
        let mut state = self.state.lock();
        while !state.fired {
            self.cond.wait(&mut state);
        }
        state.poisoned
    }
}

impl EventWaiter for CondvarWaiter {
    fn notify(&self, _rt: &Runtime, _event: Event, poisoned: bool) -> bool {
        let mut state = self.state.lock();
        state.fired = true;
        state.poisoned = poisoned;
        self.cond.notify_all();
        false
    }
}
