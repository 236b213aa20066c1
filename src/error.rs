// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Router error kinds.

use crate::gpu::DeviceError;
use compact_str::CompactString;
use thiserror::Error;

/// Errors surfaced by the routing core.
///
/// `Capacity` and per-net step-budget expiry are recoverable and handled
/// inside the congestion loop; every other kind aborts the routing run.
#[derive(Debug, Error)]
pub enum RouteError {
    /// Invalid or inconsistent router configuration.
    #[error("invalid router configuration: {0}")]
    Config(String),

    /// Impossible adjacency in the imported routing graph.
    #[error("invalid routing graph: {0}")]
    Graph(String),

    /// Pre-existing locked routing that is partially present and partially
    /// missing (or unmappable / overlapping) for a single net.
    #[error("unsupported locked routing on net '{net}': {reason}")]
    FixedRoutingConflict {
        /// Name of the offending net.
        net: CompactString,
        /// What exactly is wrong with its pre-existing routing.
        reason: String,
    },

    /// A per-workgroup scratch queue overflowed during exploration.
    /// Caught by the scheduler: the net's attempt is aborted, its bounding
    /// box grows and it is retried.
    #[error("scratch queue '{queue}' overflowed for net '{net}'")]
    Capacity {
        /// Which queue overflowed (near / far / dirty).
        queue: &'static str,
        /// Name of the net being explored.
        net: CompactString,
    },

    /// The outer iteration cap was reached with overused nodes or unrouted
    /// nets remaining.
    #[error("routing did not converge after {0} iterations")]
    Unroutable(u32),

    /// The compute device reported a failure; propagated unchanged.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, RouteError>;
