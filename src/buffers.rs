// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! The buffer pool: exclusive owner of every device buffer.
//!
//! Allocated once per routing run from the fixed configuration; the
//! scheduler and binder borrow buffers from here and decide where the
//! explicit mirror/device synchronization points are.

use crate::config::RouterConfig;
use crate::gpu::{Access, ComputeDevice, DeviceError, GpuBuffer};
use crate::graph::RoutingGraph;
use crate::kernel::{NetConfig, WorkgroupConfig, INF_COST, UNSET_EDGE};

/// Every device-resident buffer of the router.
///
/// The static graph arrays are uploaded once here; the per-node state
/// starts out as "no source explored" (all costs infinite).
pub struct RouteBuffers {
    // Static routing graph.
    pub wire_x: GpuBuffer<i16>,
    pub wire_y: GpuBuffer<i16>,
    pub adj_offset: GpuBuffer<u32>,
    pub edge_dst: GpuBuffer<u32>,
    /// Effective edge costs; re-uploaded each outer iteration as history
    /// costs fold in.
    pub edge_cost: GpuBuffer<i32>,

    // Per-node routing state.
    pub current_cost: GpuBuffer<i32>,
    pub uphill_edge: GpuBuffer<u32>,
    /// Nets bound per node. Mutated on the host only, outside launches.
    pub bound_count: GpuBuffer<u8>,

    // Per-workgroup scratch queues. A and B swap roles every step.
    pub near_a: GpuBuffer<u32>,
    pub near_b: GpuBuffer<u32>,
    pub near_count_a: GpuBuffer<u32>,
    pub near_count_b: GpuBuffer<u32>,
    /// Within-net prefix sums of the current near counts, rebuilt by the
    /// host before every expand launch.
    pub near_prefix: GpuBuffer<u32>,
    pub far: GpuBuffer<u32>,
    pub far_count: GpuBuffer<u32>,
    pub dirty: GpuBuffer<u32>,
    pub dirty_count: GpuBuffer<u32>,

    // Per-workgroup reduction outputs.
    pub queue_min: GpuBuffer<i32>,
    pub far_min: GpuBuffer<i32>,

    // Per-slot and per-workgroup configuration.
    pub net_config: GpuBuffer<NetConfig>,
    pub wg_config: GpuBuffer<WorkgroupConfig>,
}

impl RouteBuffers {
    /// Allocate everything and upload the static graph tables.
    pub fn alloc(
        dev: &dyn ComputeDevice,
        cfg: &RouterConfig,
        graph: &RoutingGraph,
    ) -> Result<Self, DeviceError> {
        let w = graph.num_wires();
        let e = graph.num_edges();
        let g = cfg.num_workgroups as usize;

        let mut bufs = RouteBuffers {
            wire_x: GpuBuffer::new(dev, w, Access::ReadOnly)?,
            wire_y: GpuBuffer::new(dev, w, Access::ReadOnly)?,
            adj_offset: GpuBuffer::new(dev, w + 1, Access::ReadOnly)?,
            edge_dst: GpuBuffer::new(dev, e, Access::ReadOnly)?,
            edge_cost: GpuBuffer::new(dev, e, Access::ReadOnly)?,
            current_cost: GpuBuffer::new(dev, w, Access::ReadWrite)?,
            uphill_edge: GpuBuffer::new(dev, w, Access::ReadWrite)?,
            bound_count: GpuBuffer::new(dev, w, Access::ReadOnly)?,
            near_a: GpuBuffer::new(dev, g * cfg.near_queue_len as usize, Access::ReadWrite)?,
            near_b: GpuBuffer::new(dev, g * cfg.near_queue_len as usize, Access::ReadWrite)?,
            near_count_a: GpuBuffer::new(dev, g, Access::ReadWrite)?,
            near_count_b: GpuBuffer::new(dev, g, Access::ReadWrite)?,
            near_prefix: GpuBuffer::new(dev, g, Access::ReadOnly)?,
            far: GpuBuffer::new(dev, g * cfg.far_queue_len as usize, Access::ReadWrite)?,
            far_count: GpuBuffer::new(dev, g, Access::ReadWrite)?,
            dirty: GpuBuffer::new(dev, g * cfg.dirty_queue_len as usize, Access::ReadWrite)?,
            dirty_count: GpuBuffer::new(dev, g, Access::ReadWrite)?,
            queue_min: GpuBuffer::new(dev, g, Access::WriteOnly)?,
            far_min: GpuBuffer::new(dev, g, Access::WriteOnly)?,
            net_config: GpuBuffer::new(dev, cfg.max_nets_in_flight as usize, Access::ReadOnly)?,
            wg_config: GpuBuffer::new(dev, g, Access::ReadOnly)?,
        };

        bufs.wire_x.host_mut().copy_from_slice(graph.wire_x());
        bufs.wire_x.upload(dev)?;
        bufs.wire_y.host_mut().copy_from_slice(graph.wire_y());
        bufs.wire_y.upload(dev)?;
        bufs.adj_offset.host_mut().copy_from_slice(graph.adj_offset());
        bufs.adj_offset.upload(dev)?;
        bufs.edge_dst.host_mut().copy_from_slice(graph.edge_dst());
        bufs.edge_dst.upload(dev)?;
        bufs.edge_cost.host_mut().copy_from_slice(graph.edge_cost());
        bufs.edge_cost.upload(dev)?;

        bufs.current_cost.host_mut().fill(INF_COST);
        bufs.current_cost.upload(dev)?;
        bufs.uphill_edge.host_mut().fill(UNSET_EDGE);
        bufs.uphill_edge.upload(dev)?;
        bufs.bound_count.upload(dev)?;

        for wg in bufs.wg_config.host_mut() {
            wg.size = cfg.workgroup_size;
        }
        bufs.wg_config.upload(dev)?;
        bufs.net_config.upload(dev)?;

        Ok(bufs)
    }

    /// Near-queue entry buffer for one side of the A/B swap.
    pub fn near_entries(&self, side: bool) -> &GpuBuffer<u32> {
        if !side {
            &self.near_a
        } else {
            &self.near_b
        }
    }

    /// Near-queue entry buffer, mutably.
    pub fn near_entries_mut(&mut self, side: bool) -> &mut GpuBuffer<u32> {
        if !side {
            &mut self.near_a
        } else {
            &mut self.near_b
        }
    }

    /// Near-queue count buffer for one side of the A/B swap.
    pub fn near_counts(&self, side: bool) -> &GpuBuffer<u32> {
        if !side {
            &self.near_count_a
        } else {
            &self.near_count_b
        }
    }

    /// Near-queue count buffer, mutably.
    pub fn near_counts_mut(&mut self, side: bool) -> &mut GpuBuffer<u32> {
        if !side {
            &mut self.near_count_a
        } else {
            &mut self.near_count_b
        }
    }
}
