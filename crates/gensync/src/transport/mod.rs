// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Point-to-point message transport between nodes.
//!
//! The synchronization core never talks to the network directly; it posts
//! protocol messages through the [`Transport`] trait. The contract is:
//!
//! - delivery is best-effort reliable,
//! - messages between one `(src, dst)` pair arrive in send order,
//! - no ordering is guaranteed across different destinations.
//!
//! [`loopback`] provides the in-process implementation used by the test
//! suites and by single-process deployments.

pub mod loopback;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::core::NodeId;
use crate::protocol::Message;

// ============================================================================
// Payload disposition
// ============================================================================

/// Bytes attached to a message, with their ownership disposition.
///
/// `Copy` hands the transport an owned buffer it may retain as long as it
/// needs. `Keep` shares a buffer without copying; the reference count
/// guarantees liveness until delivery.
#[derive(Debug, Clone)]
pub enum Payload {
    /// No payload bytes.
    None,
    /// Owned buffer, moved into the transport.
    Copy(Vec<u8>),
    /// Shared buffer, alive until the last reference drops.
    Keep(Arc<[u8]>),
}

impl Payload {
    /// View the payload bytes (empty slice when `None`).
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match self {
            Payload::None => &[],
            Payload::Copy(v) => v,
            Payload::Keep(b) => b,
        }
    }
}

// ============================================================================
// Node sets
// ============================================================================

/// An ordered set of node ids, used for broadcast targets and the
/// remote-waiter bookkeeping of event owners.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSet(BTreeSet<NodeId>);

impl NodeSet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node. Returns `false` if it was already present.
    pub fn add(&mut self, node: NodeId) -> bool {
        self.0.insert(node)
    }

    /// Remove a node.
    pub fn remove(&mut self, node: NodeId) -> bool {
        self.0.remove(&node)
    }

    #[must_use]
    pub fn contains(&self, node: NodeId) -> bool {
        self.0.contains(&node)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Move the contents out, leaving this set empty.
    #[must_use]
    pub fn take(&mut self) -> NodeSet {
        NodeSet(std::mem::take(&mut self.0))
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<NodeId> for NodeSet {
    fn from_iter<T: IntoIterator<Item = NodeId>>(iter: T) -> Self {
        NodeSet(iter.into_iter().collect())
    }
}

// ============================================================================
// Transport contract
// ============================================================================

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Transport-level failures.
#[derive(Debug, Clone)]
pub enum Error {
    /// The destination node is not reachable through this transport.
    NoRoute(NodeId),
    /// The transport has been shut down.
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoRoute(node) => write!(f, "no route to node {node}"),
            Error::Closed => write!(f, "transport closed"),
        }
    }
}

impl std::error::Error for Error {}

/// Abstract point-to-point and broadcast message sending.
///
/// Implementations must preserve send order per `(src, dst)` pair; the
/// state machines rely on it for update/trigger sequencing. Delivery may
/// interleave arbitrarily across pairs.
pub trait Transport: Send + Sync {
    /// Send one message to one node.
    fn send(&self, dst: NodeId, msg: Message, payload: Payload) -> Result<()>;

    /// Send one message to every node in `targets`.
    ///
    /// Equivalent to a per-node [`send`](Transport::send); the payload must
    /// therefore not be consumed by the first delivery (use [`Payload::Keep`]
    /// or [`Payload::None`]).
    fn broadcast(&self, targets: &NodeSet, msg: Message, payload: Payload) -> Result<()> {
        for node in targets.iter() {
            self.send(node, msg, payload.clone())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_set_take_empties() {
        let mut set = NodeSet::new();
        assert!(set.add(3));
        assert!(set.add(1));
        assert!(!set.add(3));

        let taken = set.take();
        assert!(set.is_empty());
        assert_eq!(taken.len(), 2);
        assert_eq!(taken.iter().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_payload_bytes() {
        assert!(Payload::None.bytes().is_empty());
        assert_eq!(Payload::Copy(vec![1, 2]).bytes(), &[1, 2]);
        let shared: Arc<[u8]> = Arc::from(vec![9u8].into_boxed_slice());
        assert_eq!(Payload::Keep(shared).bytes(), &[9]);
    }
}
