// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reduction operators for barrier arrivals.
//!
//! Values are untyped byte buffers on the wire and in the per-generation
//! result slots; an operator gives them meaning. Operators are registered
//! per runtime under a caller-chosen [`ReductionOpId`], and every node
//! that subscribes to a reducing barrier must register the same id.

use std::fmt;

/// Identifier of a registered reduction operator. `0` means "no
/// reduction" and must not be registered.
pub type ReductionOpId = u32;

/// An associative fold over untyped byte values.
///
/// `lhs` is an accumulator slot of [`sizeof_lhs`](ReductionOp::sizeof_lhs)
/// bytes; `rhs` is one arrival's contribution of
/// [`sizeof_rhs`](ReductionOp::sizeof_rhs) bytes.
pub trait ReductionOp: Send + Sync {
    /// Size of an accumulator slot in bytes.
    fn sizeof_lhs(&self) -> usize;

    /// Size of one contributed value in bytes.
    fn sizeof_rhs(&self) -> usize;

    /// Fold `rhs` into `lhs`. Both slices have exactly the advertised
    /// sizes.
    fn apply(&self, lhs: &mut [u8], rhs: &[u8]);
}

impl fmt::Debug for dyn ReductionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ReductionOp(lhs={}, rhs={})",
            self.sizeof_lhs(),
            self.sizeof_rhs()
        )
    }
}

// ============================================================================
// Built-in operators
// ============================================================================

macro_rules! int_reduction {
    ($name:ident, $ty:ty, $doc:literal, |$lhs:ident, $rhs:ident| $fold:expr) => {
        #[doc = $doc]
        #[derive(Debug, Default, Clone, Copy)]
        pub struct $name;

        impl ReductionOp for $name {
            fn sizeof_lhs(&self) -> usize {
                std::mem::size_of::<$ty>()
            }

            fn sizeof_rhs(&self) -> usize {
                std::mem::size_of::<$ty>()
            }

            fn apply(&self, lhs: &mut [u8], rhs: &[u8]) {
                let mut lhs_bytes = [0u8; std::mem::size_of::<$ty>()];
                lhs_bytes.copy_from_slice(lhs);
                let mut rhs_bytes = [0u8; std::mem::size_of::<$ty>()];
                rhs_bytes.copy_from_slice(rhs);

                let $lhs = <$ty>::from_le_bytes(lhs_bytes);
                let $rhs = <$ty>::from_le_bytes(rhs_bytes);
                lhs.copy_from_slice(&($fold).to_le_bytes());
            }
        }
    };
}

int_reduction!(SumI32, i32, "Wrapping sum of little-endian `i32` values.", |lhs, rhs| lhs
    .wrapping_add(rhs));
int_reduction!(MaxI32, i32, "Maximum of little-endian `i32` values.", |lhs, rhs| lhs.max(rhs));
int_reduction!(SumU64, u64, "Wrapping sum of little-endian `u64` values.", |lhs, rhs| lhs
    .wrapping_add(rhs));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_i32_folds() {
        let op = SumI32;
        let mut acc = 0i32.to_le_bytes();
        op.apply(&mut acc, &7i32.to_le_bytes());
        op.apply(&mut acc, &35i32.to_le_bytes());
        assert_eq!(i32::from_le_bytes(acc), 42);
    }

    #[test]
    fn test_sum_i32_negative_values() {
        let op = SumI32;
        let mut acc = 10i32.to_le_bytes();
        op.apply(&mut acc, &(-25i32).to_le_bytes());
        assert_eq!(i32::from_le_bytes(acc), -15);
    }

    #[test]
    fn test_max_i32_keeps_largest() {
        let op = MaxI32;
        let mut acc = (-5i32).to_le_bytes();
        op.apply(&mut acc, &3i32.to_le_bytes());
        op.apply(&mut acc, &(-9i32).to_le_bytes());
        assert_eq!(i32::from_le_bytes(acc), 3);
    }
}
