// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Core building blocks shared by every layer (identifier encoding).

mod id;

pub use id::{Id, IdKind, NodeId};
