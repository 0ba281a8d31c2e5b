// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # gensync - distributed event and barrier synchronization
//!
//! The synchronization core of a parallel runtime: generational events
//! with distributed triggering and fault (poison) propagation, and phase
//! barriers with adjustable arrival counts and per-generation reductions.
//!
//! ## Quick Start
//!
//! ```rust
//! use gensync::{Event, LoopbackMesh, UserEvent};
//!
//! let (mesh, nodes) = LoopbackMesh::with_nodes(1);
//! let rt = &nodes[0];
//!
//! let a = UserEvent::create(rt);
//! let b = UserEvent::create(rt);
//! let both = Event::merge(rt, a.event(), b.event());
//!
//! a.trigger(rt, Event::NO_EVENT);
//! assert!(!both.has_triggered(rt));
//! b.trigger(rt, Event::NO_EVENT);
//! assert!(both.has_triggered(rt));
//! # let _ = mesh;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                     Handles (api)                            |
//! |        Event | UserEvent | Barrier  (id, gen[, ts])          |
//! +--------------------------------------------------------------+
//! |                  Runtime directory (runtime)                 |
//! |   id -> implementation object, free lists, reduction table   |
//! +--------------------------------------------------------------+
//! |              State machines (event, barrier)                 |
//! |   lock-free queries | waiter queues | generation tracking    |
//! +--------------------------------------------------------------+
//! |            Wire protocol + transport (protocol, transport)   |
//! |   7 messages, LE encoding | per-(src,dst) FIFO delivery      |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Event`] | Single-shot handle `(id, generation)` |
//! | [`UserEvent`] | Event triggered (or cancelled) by user code |
//! | [`Barrier`] | One phase of a reusable collective barrier |
//! | [`Runtime`] | Per-node directory all operations route through |
//! | [`LoopbackMesh`] | In-process multi-node wiring for tests |
//!
//! ## Fault model
//!
//! Triggers carry a poison bit. Poison propagates eagerly through event
//! merges (unless explicitly ignored) and through deferred user-event
//! triggers; fault-unaware queries panic on poisoned results.

/// Public synchronization handles (start here).
pub mod api;
/// Phase-barrier state machine and reduction operators.
pub mod barrier;
/// Tunable constants, single source of truth.
pub mod config;
/// Identifier encoding shared by all layers.
pub mod core;
/// Generational event state machine, waiters, and the merger.
pub mod event;
/// Wire messages and their little-endian codec.
pub mod protocol;
/// Per-node runtime directory and message dispatch.
pub mod runtime;
/// Transport contract and the in-process loopback mesh.
pub mod transport;

pub use crate::api::{Barrier, Event, UserEvent};
pub use crate::barrier::reduction::{MaxI32, ReductionOp, ReductionOpId, SumI32, SumU64};
pub use crate::core::{Id, IdKind, NodeId};
pub use crate::event::waiter::EventWaiter;
pub use crate::runtime::Runtime;
pub use crate::transport::loopback::LoopbackMesh;
pub use crate::transport::{NodeSet, Payload, Transport};

use std::fmt;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type for fallible crate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug)]
pub enum Error {
    /// Failure at the transport layer.
    Transport(transport::Error),
    /// A message or payload failed to decode.
    Decode(protocol::DecodeError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(err) => write!(f, "transport: {err}"),
            Error::Decode(err) => write!(f, "decode: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(err) => Some(err),
            Error::Decode(err) => Some(err),
        }
    }
}

impl From<transport::Error> for Error {
    fn from(err: transport::Error) -> Self {
        Error::Transport(err)
    }
}

impl From<protocol::DecodeError> for Error {
    fn from(err: protocol::DecodeError) -> Self {
        Error::Decode(err)
    }
}
