// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global configuration - single source of truth for tunable constants.
//!
//! Centralizes every protocol constant used by the event and barrier state
//! machines. **Never hardcode these elsewhere!**

/// Number of bits in an [`crate::core::Id`] reserved for the kind tag.
pub const ID_KIND_BITS: u32 = 4;

/// Number of bits in an [`crate::core::Id`] reserved for the creator node.
pub const ID_NODE_BITS: u32 = 16;

/// Number of bits in an [`crate::core::Id`] reserved for the node-local index.
pub const ID_INDEX_BITS: u32 = 44;

/// Maximum number of poisoned generations one event id may accumulate.
///
/// The poisoned-generation list is a fixed-capacity append-only array so
/// that queries can read it without taking the event mutex. When an event
/// id reaches this limit it is retired instead of being recycled.
pub const POISONED_GENERATION_LIMIT: usize = 16;

/// Bit position of the node id inside a barrier adjustment timestamp.
///
/// A timestamp is `(node_id << BARRIER_TIMESTAMP_NODEID_SHIFT) | counter`,
/// so timestamps issued by different nodes never collide and the origin
/// node can be recovered for per-node ordering.
pub const BARRIER_TIMESTAMP_NODEID_SHIFT: u32 = 48;

/// Whether deferred barrier arrivals wait on the arriving node.
///
/// When `false`, a non-owner that must defer an arrival forwards it to the
/// barrier owner with the precondition attached, so the wait happens where
/// the precondition event is most likely to trigger (saves one hop of
/// latency on the common path).
pub const DEFER_ARRIVALS_LOCALLY: bool = false;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_field_widths_cover_u64() {
        assert_eq!(ID_KIND_BITS + ID_NODE_BITS + ID_INDEX_BITS, 64);
    }

    #[test]
    fn test_timestamp_shift_leaves_room_for_node_ids() {
        // 16-bit node ids must fit above the shift
        assert!(BARRIER_TIMESTAMP_NODEID_SHIFT + ID_NODE_BITS <= 64);
    }
}
