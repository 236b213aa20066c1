// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Router configuration.

use crate::error::{Result, RouteError};
use serde::{Deserialize, Serialize};

/// All tunable knobs of the router.
///
/// The defaults reproduce the work partitioning and queue sizing the router
/// was brought up with; queue lengths are per workgroup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Conversion from float ns delays to integer cost units (ps).
    pub delay_scale: f32,
    /// Number of workgroups per kernel launch.
    pub num_workgroups: u32,
    /// Work-items per workgroup.
    pub workgroup_size: u32,
    /// Capacity of each per-workgroup near queue.
    pub near_queue_len: u32,
    /// Capacity of each per-workgroup far queue.
    pub far_queue_len: u32,
    /// Capacity of each per-workgroup dirtied-nodes list.
    pub dirty_queue_len: u32,
    /// Maximum number of nets explored concurrently.
    pub max_nets_in_flight: u32,
    /// Outer negotiated-congestion iteration cap.
    pub max_outer_iters: u32,
    /// Historical cost increment per unit of overuse per iteration.
    pub hist_cost_inc: i32,
    /// Growth factor applied to the present congestion multiplier each
    /// iteration. Must be > 1.
    pub present_cost_growth: f32,
    /// Maximum number of one-cell bounding box inflations per net.
    pub bbox_grow_cap: u8,
    /// Base present-congestion cost unit, in the same units as edge costs.
    /// The penalty for relaxing into node `v` is
    /// `round(base_present_cost * bound_count[v] * curr_cong_cost)`.
    pub base_present_cost: i32,
    /// Slack added to the minimum far-queue cost when recomputing the
    /// near/far threshold on refill.
    pub near_far_delta: i32,
    /// Maximum wavefront steps for a single net before its attempt is
    /// aborted and retried with a larger bounding box.
    pub max_steps_per_net: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            delay_scale: 1000.0,
            num_workgroups: 64,
            workgroup_size: 128,
            near_queue_len: 15000,
            far_queue_len: 100000,
            dirty_queue_len: 100000,
            max_nets_in_flight: 32,
            max_outer_iters: 50,
            hist_cost_inc: 1,
            present_cost_growth: 2.0,
            bbox_grow_cap: 8,
            base_present_cost: 500,
            near_far_delta: 5000,
            max_steps_per_net: 500,
        }
    }
}

impl RouterConfig {
    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        fn bad(msg: impl Into<String>) -> Result<()> {
            Err(RouteError::Config(msg.into()))
        }
        if self.num_workgroups == 0 {
            return bad("num_workgroups must be nonzero");
        }
        if self.workgroup_size == 0 {
            return bad("workgroup_size must be nonzero");
        }
        if self.near_queue_len == 0 || self.far_queue_len == 0 || self.dirty_queue_len == 0 {
            return bad("queue capacities must be nonzero");
        }
        if self.max_nets_in_flight == 0 {
            return bad("max_nets_in_flight must be nonzero");
        }
        // The grid occupancy map stores slot ids as i8, -1 meaning free.
        if self.max_nets_in_flight > 127 {
            return bad("max_nets_in_flight must fit in an i8 slot id (<= 127)");
        }
        if self.max_nets_in_flight > self.num_workgroups {
            return bad("max_nets_in_flight cannot exceed num_workgroups");
        }
        if self.max_outer_iters == 0 {
            return bad("max_outer_iters must be nonzero");
        }
        if !(self.present_cost_growth > 1.0) {
            return bad("present_cost_growth must be greater than 1.0");
        }
        if !(self.delay_scale > 0.0) {
            return bad("delay_scale must be positive");
        }
        if self.base_present_cost < 0 {
            return bad("base_present_cost must be non-negative");
        }
        if self.near_far_delta <= 0 {
            return bad("near_far_delta must be positive");
        }
        if self.max_steps_per_net == 0 {
            return bad("max_steps_per_net must be nonzero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RouterConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_queue_capacity_rejected() {
        let cfg = RouterConfig {
            near_queue_len: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(RouteError::Config(_))));
    }

    #[test]
    fn slot_id_must_fit_i8() {
        let cfg = RouterConfig {
            max_nets_in_flight: 200,
            num_workgroups: 256,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn growth_factor_must_exceed_one() {
        let cfg = RouterConfig {
            present_cost_growth: 1.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
