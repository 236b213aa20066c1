// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Host-visible contract of the `ocular` device kernels.
//!
//! Everything in this module is shared verbatim with the device programs:
//! the packed per-net and per-workgroup configuration records, the cost
//! sentinels, and the ordered argument list of each kernel. Any device
//! backend implementing [`crate::gpu::ComputeDevice`] must follow these
//! layouts exactly; `CpuDevice` is the reference.

use crate::gpu::DevicePod;

/// Cost value meaning "not visited from the current source".
pub const INF_COST: i32 = 0x07FF_FFFF;

/// `uphill_edge` sentinel meaning "no predecessor edge".
pub const UNSET_EDGE: u32 = u32::MAX;

/// `WorkgroupConfig::net` value for an idle workgroup.
pub const NO_NET: i32 = -1;

/// One near/far wavefront expansion step for every in-flight net.
///
/// Argument order:
///  0. `wg_config`      — `[WorkgroupConfig; G]`, read
///  1. `net_config`     — `[NetConfig; max_in_flight]`, read
///  2. `wire_x`         — `[i16; W]`, read
///  3. `wire_y`         — `[i16; W]`, read
///  4. `adj_offset`     — `[u32; W + 1]`, read
///  5. `edge_dst`       — `[u32; E]`, read
///  6. `edge_cost`      — `[i32; E]`, read
///  7. `bound_count`    — `[u8; W]`, read
///  8. `current_cost`   — `[i32; W]`, atomic min
///  9. `uphill_edge`    — `[u32; W]`, written with the winning edge
/// 10. `near_src`       — `[u32; G * near_cap]`, current near queue entries
/// 11. `near_prefix`    — `[u32; G]`, within-net inclusive prefix sums of
///                        the current near counts (work lookup by binary
///                        search on the workgroup index)
/// 12. `near_dst`       — `[u32; G * near_cap]`, next near queue entries
/// 13. `near_dst_count` — `[u32; G]`, atomic append counters
/// 14. `far`            — `[u32; G * far_cap]`, far queue entries
/// 15. `far_count`      — `[u32; G]`, atomic append counters
/// 16. `dirty`          — `[u32; G * dirty_cap]`, first-visit node list
/// 17. `dirty_count`    — `[u32; G]`, atomic append counters
/// 18. `base_present_cost` — `u32` scalar
///
/// Queue appends stripe over the owning net's workgroup range keyed by the
/// destination node index, so a grown bounding box (more workgroups) raises
/// the net's effective queue capacity. A count may exceed its queue's
/// capacity; the excess entries are dropped and the host treats the
/// oversized count as an overflow signal.
pub const KERNEL_EXPAND: &str = "ocular_expand";

/// Per-workgroup minimum `current_cost` over the current near and far
/// queues.
///
/// Argument order:
///  0. `wg_config`    — read
///  1. `net_config`   — read
///  2. `current_cost` — read
///  3. `near`         — current near entries, read
///  4. `near_count`   — raw current near counts, read
///  5. `far`          — read
///  6. `far_count`    — read
///  7. `queue_min`    — `[i32; G]`, written: min over near and far
///  8. `far_min`      — `[i32; G]`, written: min over far only
///
/// Empty queues produce [`INF_COST`].
pub const KERNEL_QUEUE_MIN: &str = "ocular_queue_min";

/// Move far-queue entries at or below the (freshly raised) near/far
/// threshold of one slot into its current near queue, compacting the rest.
///
/// Argument order:
///  0. `wg_config`    — read
///  1. `net_config`   — read, `near_far_thresh` is the new threshold
///  2. `current_cost` — read
///  3. `near`         — current near entries, appended
///  4. `near_count`   — read/write
///  5. `far`          — compacted in place
///  6. `far_count`    — read/write
///  7. `slot`         — `i32` scalar, the slot to refill
pub const KERNEL_REFILL: &str = "ocular_refill";

/// Restore "no source explored" for one slot: reset `current_cost` to
/// [`INF_COST`] and `uphill_edge` to [`UNSET_EDGE`] for every dirty-listed
/// node, then zero the slot's queue counts.
///
/// Argument order:
///  0. `wg_config`     — read
///  1. `net_config`    — read, for the dirty capacity
///  2. `current_cost`  — written
///  3. `uphill_edge`   — written
///  4. `dirty`         — read
///  5. `dirty_count`   — zeroed
///  6. `near_count_a`  — zeroed
///  7. `near_count_b`  — zeroed
///  8. `far_count`     — zeroed
///  9. `slot`          — `i32` scalar, the slot to reset
pub const KERNEL_RESET: &str = "ocular_reset";

/// Per-in-flight-net configuration, read by every kernel.
///
/// Layout is the device's view: fields in declaration order, little-endian,
/// 16-bit coordinates then 32-bit words, no padding. 40 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NetConfig {
    /// Net bounding box, inclusive.
    pub x0: i16,
    pub y0: i16,
    pub x1: i16,
    pub y1: i16,
    /// Per-workgroup queue capacities.
    pub near_queue_size: i32,
    pub far_queue_size: i32,
    pub dirty_queue_size: i32,
    /// Workgroup range `[net_start, net_end)` assigned to this net.
    pub net_start: i32,
    pub net_end: i32,
    /// Present congestion cost multiplier for this iteration.
    pub curr_cong_cost: f32,
    /// Near/far cost threshold.
    pub near_far_thresh: i32,
    /// Nodes each workgroup pops per step.
    pub group_nodes: i32,
}

// SAFETY: repr(C), padding-free (4 x i16 then 8 x 32-bit words), no
// pointers, any bit pattern valid.
unsafe impl DevicePod for NetConfig {}

/// Per-workgroup configuration: which in-flight slot the group works for.
///
/// 8 bytes, two little-endian 32-bit words.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WorkgroupConfig {
    /// In-flight slot index, or [`NO_NET`] when idle.
    pub net: i32,
    /// Work-items in the group.
    pub size: u32,
}

impl Default for WorkgroupConfig {
    fn default() -> Self {
        WorkgroupConfig { net: NO_NET, size: 0 }
    }
}

// SAFETY: repr(C), two 32-bit words, padding-free, any bit pattern valid.
unsafe impl DevicePod for WorkgroupConfig {}

// The kernels index these records by byte layout; a silent size change
// would corrupt every launch.
const _: () = assert!(std::mem::size_of::<NetConfig>() == 40);
const _: () = assert!(std::mem::size_of::<WorkgroupConfig>() == 8);

/// The congestion penalty charged for relaxing into node `v`:
/// `round(base_present_cost * bound_count[v] * curr_cong_cost)`, clamped to
/// [`INF_COST`]. Unbound nodes are free.
#[inline]
pub fn congestion_penalty(base_present_cost: u32, bound_count: u8, curr_cong_cost: f32) -> i32 {
    let p = base_present_cost as f64 * bound_count as f64 * curr_cong_cost as f64;
    p.round().min(INF_COST as f64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn net_config_layout() {
        assert_eq!(std::mem::size_of::<NetConfig>(), 40);
        assert_eq!(offset_of!(NetConfig, x0), 0);
        assert_eq!(offset_of!(NetConfig, y0), 2);
        assert_eq!(offset_of!(NetConfig, x1), 4);
        assert_eq!(offset_of!(NetConfig, y1), 6);
        assert_eq!(offset_of!(NetConfig, near_queue_size), 8);
        assert_eq!(offset_of!(NetConfig, far_queue_size), 12);
        assert_eq!(offset_of!(NetConfig, dirty_queue_size), 16);
        assert_eq!(offset_of!(NetConfig, net_start), 20);
        assert_eq!(offset_of!(NetConfig, net_end), 24);
        assert_eq!(offset_of!(NetConfig, curr_cong_cost), 28);
        assert_eq!(offset_of!(NetConfig, near_far_thresh), 32);
        assert_eq!(offset_of!(NetConfig, group_nodes), 36);
    }

    #[test]
    fn workgroup_config_layout() {
        assert_eq!(std::mem::size_of::<WorkgroupConfig>(), 8);
        assert_eq!(offset_of!(WorkgroupConfig, net), 0);
        assert_eq!(offset_of!(WorkgroupConfig, size), 4);
    }

    #[test]
    fn penalty_scales_with_occupancy() {
        assert_eq!(congestion_penalty(500, 0, 1.0), 0);
        assert_eq!(congestion_penalty(500, 1, 1.0), 500);
        assert_eq!(congestion_penalty(500, 2, 2.0), 2000);
    }

    #[test]
    fn penalty_clamps_at_inf() {
        assert_eq!(congestion_penalty(u32::MAX, 255, 1.0e30), INF_COST);
    }
}
