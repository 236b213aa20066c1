// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! In-flight net scheduling and wavefront pumping.
//!
//! Keeps up to `max_nets_in_flight` nets exploring concurrently. Admission
//! is gated by the grid arbiter (no two in-flight bounding boxes may
//! overlap) and by the availability of a contiguous workgroup range sized
//! proportionally to the net's bounding box area. One `step` advances every
//! in-flight net by one wavefront: host-side prefix sums divide the current
//! near queues across each net's workgroups, a single expand launch relaxes
//! them, and the host then inspects per-slot progress to refill from the far
//! queue, catch queue overflows, detect stuck nets and hand converged nets
//! to the binder.

use crate::arch::Architecture;
use crate::binder::bind_net;
use crate::buffers::RouteBuffers;
use crate::config::RouterConfig;
use crate::error::Result;
use crate::gpu::{ComputeDevice, KernelArg};
use crate::graph::RoutingGraph;
use crate::grid::{GridArbiter, FREE};
use crate::kernel::{
    NetConfig, INF_COST, KERNEL_EXPAND, KERNEL_QUEUE_MIN, KERNEL_REFILL, KERNEL_RESET, NO_NET,
    UNSET_EDGE,
};
use crate::nets::RouteNet;
use std::collections::VecDeque;

/// Workgroup share for a bounding box covering `area` of `grid_area` cells.
fn workgroup_share(area: i64, grid_area: i64, num_workgroups: u32) -> u32 {
    let a = area.max(1) as u128;
    let ga = grid_area.max(1) as u128;
    let g = num_workgroups as u128;
    ((a * g + ga - 1) / ga).clamp(1, g) as u32
}

/// One occupied in-flight slot.
struct Slot {
    net_idx: usize,
    wg_start: usize,
    wg_end: usize,
    /// Sinks not yet settled.
    pending_sinks: Vec<u32>,
    /// Wavefront steps consumed by this attempt.
    steps: u32,
    /// Queue totals and queue minimum after the previous step, for stuck
    /// detection.
    last_progress: (u64, u64, i64),
    stale_steps: u8,
}

/// What the per-slot inspection decided after a step.
enum SlotAction {
    Keep,
    Bind,
    Retry(&'static str),
}

pub struct Scheduler {
    slots: Vec<Option<Slot>>,
    /// Which near buffer is "current": false = A, true = B.
    parity: bool,
    pending: VecDeque<usize>,
    /// Total expand launches.
    pub kernel_steps: u64,
    /// Most nets ever simultaneously in flight.
    pub peak_in_flight: usize,
    /// Queue-overflow retries performed.
    pub capacity_retries: u32,
}

impl Scheduler {
    pub fn new(cfg: &RouterConfig) -> Self {
        Scheduler {
            slots: (0..cfg.max_nets_in_flight).map(|_| None).collect(),
            parity: false,
            pending: VecDeque::new(),
            kernel_steps: 0,
            peak_in_flight: 0,
            capacity_retries: 0,
        }
    }

    fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Route every net in `order` to completion (or exhaustion of its
    /// bounding box growth budget) for one outer iteration.
    #[allow(clippy::too_many_arguments)]
    pub fn run_iteration<C: Architecture + ?Sized>(
        &mut self,
        ctx: &mut C,
        graph: &RoutingGraph,
        cfg: &RouterConfig,
        bufs: &mut RouteBuffers,
        arbiter: &mut GridArbiter,
        dev: &dyn ComputeDevice,
        nets: &mut [RouteNet],
        order: &[usize],
        curr_cong_cost: f32,
    ) -> Result<()> {
        self.pending = order
            .iter()
            .copied()
            .filter(|&i| nets[i].needs_routing() && !nets[i].routed)
            .collect();

        loop {
            self.try_admit(cfg, graph, bufs, arbiter, dev, nets, curr_cong_cost)?;
            if self.active_count() == 0 {
                if self.pending.is_empty() {
                    break;
                }
                // The grid is empty here, so a net that still cannot be
                // admitted has an unusable bounding box; drop it for this
                // iteration rather than spinning.
                let i = self.pending.pop_front().unwrap();
                clilog::warn!(
                    "net '{}' could not be admitted, leaving unrouted",
                    nets[i].name
                );
                continue;
            }
            self.step(ctx, graph, cfg, bufs, arbiter, dev, nets)?;
        }
        Ok(())
    }

    /// Fill free slots with admittable pending nets, in order.
    #[allow(clippy::too_many_arguments)]
    fn try_admit(
        &mut self,
        cfg: &RouterConfig,
        graph: &RoutingGraph,
        bufs: &mut RouteBuffers,
        arbiter: &mut GridArbiter,
        dev: &dyn ComputeDevice,
        nets: &mut [RouteNet],
        curr_cong_cost: f32,
    ) -> Result<()> {
        let grid_area = {
            let (w, h) = graph.dims();
            w as i64 * h as i64
        };
        'fill: while let Some(slot_id) = self.slots.iter().position(Option::is_none) {
            for qi in 0..self.pending.len() {
                let net_idx = self.pending[qi];
                let bb = nets[net_idx].bb;
                if !arbiter.check_region(&bb, FREE) {
                    continue;
                }
                let desired = workgroup_share(bb.area(), grid_area, cfg.num_workgroups);
                let Some((ws, we)) = self.find_workgroup_run(bufs, desired) else {
                    continue;
                };
                self.pending.remove(qi);
                self.admit(
                    slot_id,
                    net_idx,
                    ws,
                    we,
                    cfg,
                    bufs,
                    arbiter,
                    dev,
                    nets,
                    curr_cong_cost,
                )?;
                continue 'fill;
            }
            break;
        }
        Ok(())
    }

    /// Find a contiguous run of idle workgroups, preferring one that fits
    /// the desired share, otherwise the longest available run.
    fn find_workgroup_run(&self, bufs: &RouteBuffers, desired: u32) -> Option<(usize, usize)> {
        let wg = bufs.wg_config.host();
        let desired = desired as usize;
        let mut best: Option<(usize, usize)> = None;
        let mut g = 0;
        while g < wg.len() {
            if wg[g].net != NO_NET {
                g += 1;
                continue;
            }
            let start = g;
            while g < wg.len() && wg[g].net == NO_NET {
                g += 1;
            }
            if g - start >= desired {
                return Some((start, start + desired));
            }
            if best.map_or(true, |(bs, be)| g - start > be - bs) {
                best = Some((start, g));
            }
        }
        best
    }

    #[allow(clippy::too_many_arguments)]
    fn admit(
        &mut self,
        slot_id: usize,
        net_idx: usize,
        wg_start: usize,
        wg_end: usize,
        cfg: &RouterConfig,
        bufs: &mut RouteBuffers,
        arbiter: &mut GridArbiter,
        dev: &dyn ComputeDevice,
        nets: &mut [RouteNet],
        curr_cong_cost: f32,
    ) -> Result<()> {
        let net = &nets[net_idx];
        let driver = net.driver.expect("admitted net has a driver") as usize;
        arbiter.mark_region(&net.bb, slot_id as i8);

        for g in wg_start..wg_end {
            bufs.wg_config.host_mut()[g].net = slot_id as i32;
        }
        bufs.wg_config.upload_range(dev, wg_start..wg_end)?;

        bufs.net_config.host_mut()[slot_id] = NetConfig {
            x0: net.bb.x0,
            y0: net.bb.y0,
            x1: net.bb.x1,
            y1: net.bb.y1,
            near_queue_size: cfg.near_queue_len as i32,
            far_queue_size: cfg.far_queue_len as i32,
            dirty_queue_size: cfg.dirty_queue_len as i32,
            net_start: wg_start as i32,
            net_end: wg_end as i32,
            curr_cong_cost,
            near_far_thresh: cfg.near_far_delta,
            group_nodes: 1,
        };
        bufs.net_config.upload_range(dev, slot_id..slot_id + 1)?;

        // Seed the driver at cost zero into the slot's first workgroup, and
        // dirty-list it so the eventual reset restores it too.
        bufs.current_cost.host_mut()[driver] = 0;
        bufs.current_cost.upload_range(dev, driver..driver + 1)?;

        let near_cap = cfg.near_queue_len as usize;
        let parity = self.parity;
        let entries = bufs.near_entries_mut(parity);
        entries.host_mut()[wg_start * near_cap] = driver as u32;
        entries.upload_range(dev, wg_start * near_cap..wg_start * near_cap + 1)?;
        let counts = bufs.near_counts_mut(parity);
        counts.host_mut()[wg_start] = 1;
        counts.upload_range(dev, wg_start..wg_start + 1)?;

        let dirty_cap = cfg.dirty_queue_len as usize;
        bufs.dirty.host_mut()[wg_start * dirty_cap] = driver as u32;
        bufs.dirty
            .upload_range(dev, wg_start * dirty_cap..wg_start * dirty_cap + 1)?;
        bufs.dirty_count.host_mut()[wg_start] = 1;
        bufs.dirty_count.upload_range(dev, wg_start..wg_start + 1)?;

        clilog::trace!(
            "net '{}' admitted to slot {} (workgroups {}..{})",
            net.name,
            slot_id,
            wg_start,
            wg_end
        );
        self.slots[slot_id] = Some(Slot {
            net_idx,
            wg_start,
            wg_end,
            pending_sinks: net.sinks.to_vec(),
            steps: 0,
            last_progress: (u64::MAX, u64::MAX, -1),
            stale_steps: 0,
        });
        self.peak_in_flight = self.peak_in_flight.max(self.active_count());
        Ok(())
    }

    /// One wavefront step over every in-flight net.
    #[allow(clippy::too_many_arguments)]
    fn step<C: Architecture + ?Sized>(
        &mut self,
        ctx: &mut C,
        graph: &RoutingGraph,
        cfg: &RouterConfig,
        bufs: &mut RouteBuffers,
        arbiter: &mut GridArbiter,
        dev: &dyn ComputeDevice,
        nets: &mut [RouteNet],
    ) -> Result<()> {
        let near_cap = cfg.near_queue_len as usize;
        let src_side = self.parity;

        // Per-slot pop budget and within-net prefix sums over the current
        // near counts: one step drains the whole current queue, spread
        // evenly over the net's workgroups.
        let src_counts: Vec<u32> = bufs.near_counts(src_side).host().to_vec();
        {
            let prefix = bufs.near_prefix.host_mut();
            prefix.fill(0);
        }
        for (slot_id, slot) in self.slots.iter().enumerate() {
            let Some(slot) = slot else { continue };
            let mut run = 0u32;
            for gi in slot.wg_start..slot.wg_end {
                run += (src_counts[gi] as usize).min(near_cap) as u32;
                bufs.near_prefix.host_mut()[gi] = run;
            }
            let groups = (slot.wg_end - slot.wg_start) as u64;
            let gn = (run as u64).div_ceil(groups).max(1);
            bufs.net_config.host_mut()[slot_id].group_nodes = gn as i32;
        }
        bufs.near_prefix.upload(dev)?;
        bufs.net_config.upload(dev)?;

        let args = [
            KernelArg::Buffer(bufs.wg_config.id()),
            KernelArg::Buffer(bufs.net_config.id()),
            KernelArg::Buffer(bufs.wire_x.id()),
            KernelArg::Buffer(bufs.wire_y.id()),
            KernelArg::Buffer(bufs.adj_offset.id()),
            KernelArg::Buffer(bufs.edge_dst.id()),
            KernelArg::Buffer(bufs.edge_cost.id()),
            KernelArg::Buffer(bufs.bound_count.id()),
            KernelArg::Buffer(bufs.current_cost.id()),
            KernelArg::Buffer(bufs.uphill_edge.id()),
            KernelArg::Buffer(bufs.near_entries(src_side).id()),
            KernelArg::Buffer(bufs.near_prefix.id()),
            KernelArg::Buffer(bufs.near_entries(!src_side).id()),
            KernelArg::Buffer(bufs.near_counts(!src_side).id()),
            KernelArg::Buffer(bufs.far.id()),
            KernelArg::Buffer(bufs.far_count.id()),
            KernelArg::Buffer(bufs.dirty.id()),
            KernelArg::Buffer(bufs.dirty_count.id()),
            KernelArg::UInt(cfg.base_present_cost as u32),
        ];
        dev.launch(KERNEL_EXPAND, cfg.num_workgroups, cfg.workgroup_size, &args)?;
        self.kernel_steps += 1;

        // The source queues are drained; zero their counts before they
        // become the append side of the next step.
        bufs.near_counts_mut(src_side).host_mut().fill(0);
        bufs.near_counts(src_side).upload(dev)?;

        // Swap A/B: the freshly appended queue becomes current.
        self.parity = !self.parity;
        let cur_side = self.parity;

        bufs.near_counts_mut(cur_side).download(dev)?;
        bufs.far_count.download(dev)?;
        bufs.dirty_count.download(dev)?;

        self.launch_queue_min(cfg, bufs, dev, cur_side)?;

        // Inspect every slot.
        for slot_id in 0..self.slots.len() {
            let Some(slot) = self.slots[slot_id].as_mut() else {
                continue;
            };
            slot.steps += 1;
            let net_idx = slot.net_idx;
            let range = slot.wg_start..slot.wg_end;

            let near_tot: u64 = bufs.near_counts(cur_side).host()[range.clone()]
                .iter()
                .map(|&c| c as u64)
                .sum();
            let far_tot: u64 = bufs.far_count.host()[range.clone()]
                .iter()
                .map(|&c| c as u64)
                .sum();
            let overflowed = bufs.near_counts(cur_side).host()[range.clone()]
                .iter()
                .any(|&c| c > cfg.near_queue_len)
                || bufs.far_count.host()[range.clone()]
                    .iter()
                    .any(|&c| c > cfg.far_queue_len)
                || bufs.dirty_count.host()[range.clone()]
                    .iter()
                    .any(|&c| c > cfg.dirty_queue_len);

            let action = if overflowed {
                self.capacity_retries += 1;
                clilog::warn!(
                    "scratch queue overflow on net '{}', growing bounding box",
                    nets[net_idx].name
                );
                SlotAction::Retry("queue overflow")
            } else if slot.steps > cfg.max_steps_per_net {
                SlotAction::Retry("step budget exhausted")
            } else {
                // Settle test: a sink is done once its cost cannot be
                // beaten by anything still queued for this net.
                let qmin = bufs.queue_min.host()[range.clone()]
                    .iter()
                    .copied()
                    .min()
                    .unwrap_or(INF_COST);
                let mut newly_settled = false;
                let mut still_pending = Vec::new();
                for &t in &slot.pending_sinks {
                    bufs.current_cost
                        .download_range(dev, t as usize..t as usize + 1)?;
                    let ct = bufs.current_cost.host()[t as usize];
                    if ct < INF_COST && ct <= qmin {
                        newly_settled = true;
                    } else {
                        still_pending.push(t);
                    }
                }
                slot.pending_sinks = still_pending;

                if slot.pending_sinks.is_empty() {
                    SlotAction::Bind
                } else if near_tot == 0 && far_tot == 0 {
                    SlotAction::Retry("region exhausted")
                } else {
                    let sig = (near_tot, far_tot, qmin as i64);
                    if !newly_settled && sig == slot.last_progress {
                        slot.stale_steps += 1;
                    } else {
                        slot.stale_steps = 0;
                    }
                    slot.last_progress = sig;
                    if slot.stale_steps >= 2 {
                        SlotAction::Retry("no wavefront progress")
                    } else {
                        if near_tot == 0 {
                            self.refill_slot(slot_id, cfg, bufs, dev, cur_side)?;
                        }
                        SlotAction::Keep
                    }
                }
            };

            match action {
                SlotAction::Keep => {}
                SlotAction::Bind => {
                    bind_net(ctx, graph, bufs, dev, &mut nets[net_idx])?;
                    bufs.bound_count.upload(dev)?;
                    clilog::trace!(
                        "net '{}' routed ({} pips)",
                        nets[net_idx].name,
                        nets[net_idx].bound_pips.len()
                    );
                    self.retire_slot(slot_id, false, cfg, graph, bufs, arbiter, dev, nets)?;
                }
                SlotAction::Retry(reason) => {
                    clilog::trace!("net '{}' attempt aborted: {}", nets[net_idx].name, reason);
                    self.retire_slot(slot_id, true, cfg, graph, bufs, arbiter, dev, nets)?;
                }
            }
        }
        Ok(())
    }

    /// Raise one slot's near/far threshold past the cheapest far entry and
    /// pull the now-near work back into its current near queue.
    fn refill_slot(
        &mut self,
        slot_id: usize,
        cfg: &RouterConfig,
        bufs: &mut RouteBuffers,
        dev: &dyn ComputeDevice,
        cur_side: bool,
    ) -> Result<()> {
        let slot = self.slots[slot_id].as_ref().expect("refilling an empty slot");
        let range = slot.wg_start..slot.wg_end;
        let fmin = bufs.far_min.host()[range]
            .iter()
            .copied()
            .min()
            .unwrap_or(INF_COST);
        let thresh = fmin.saturating_add(cfg.near_far_delta).min(INF_COST);
        bufs.net_config.host_mut()[slot_id].near_far_thresh = thresh;
        bufs.net_config.upload_range(dev, slot_id..slot_id + 1)?;

        let args = [
            KernelArg::Buffer(bufs.wg_config.id()),
            KernelArg::Buffer(bufs.net_config.id()),
            KernelArg::Buffer(bufs.current_cost.id()),
            KernelArg::Buffer(bufs.near_entries(cur_side).id()),
            KernelArg::Buffer(bufs.near_counts(cur_side).id()),
            KernelArg::Buffer(bufs.far.id()),
            KernelArg::Buffer(bufs.far_count.id()),
            KernelArg::Int(slot_id as i32),
        ];
        dev.launch(KERNEL_REFILL, cfg.num_workgroups, cfg.workgroup_size, &args)?;
        bufs.near_counts_mut(cur_side).download(dev)?;
        bufs.far_count.download(dev)?;
        Ok(())
    }

    fn launch_queue_min(
        &self,
        cfg: &RouterConfig,
        bufs: &mut RouteBuffers,
        dev: &dyn ComputeDevice,
        cur_side: bool,
    ) -> Result<()> {
        let args = [
            KernelArg::Buffer(bufs.wg_config.id()),
            KernelArg::Buffer(bufs.net_config.id()),
            KernelArg::Buffer(bufs.current_cost.id()),
            KernelArg::Buffer(bufs.near_entries(cur_side).id()),
            KernelArg::Buffer(bufs.near_counts(cur_side).id()),
            KernelArg::Buffer(bufs.far.id()),
            KernelArg::Buffer(bufs.far_count.id()),
            KernelArg::Buffer(bufs.queue_min.id()),
            KernelArg::Buffer(bufs.far_min.id()),
        ];
        dev.launch(
            KERNEL_QUEUE_MIN,
            cfg.num_workgroups,
            cfg.workgroup_size,
            &args,
        )?;
        bufs.queue_min.download(dev)?;
        bufs.far_min.download(dev)?;
        Ok(())
    }

    /// Vacate a slot: reset its per-node state, unstamp its region, free
    /// its workgroups, and either requeue the net with a grown bounding box
    /// or drop it for this iteration.
    #[allow(clippy::too_many_arguments)]
    fn retire_slot(
        &mut self,
        slot_id: usize,
        requeue: bool,
        cfg: &RouterConfig,
        graph: &RoutingGraph,
        bufs: &mut RouteBuffers,
        arbiter: &mut GridArbiter,
        dev: &dyn ComputeDevice,
        nets: &mut [RouteNet],
    ) -> Result<()> {
        let slot = self.slots[slot_id].take().expect("retiring an empty slot");
        let range = slot.wg_start..slot.wg_end;

        // A dirty overflow means some touched nodes were never recorded;
        // fall back to sweeping the whole bounding box afterwards.
        let dirty_overflowed = bufs.dirty_count.host()[range.clone()]
            .iter()
            .any(|&c| c > cfg.dirty_queue_len);

        let args = [
            KernelArg::Buffer(bufs.wg_config.id()),
            KernelArg::Buffer(bufs.net_config.id()),
            KernelArg::Buffer(bufs.current_cost.id()),
            KernelArg::Buffer(bufs.uphill_edge.id()),
            KernelArg::Buffer(bufs.dirty.id()),
            KernelArg::Buffer(bufs.dirty_count.id()),
            KernelArg::Buffer(bufs.near_count_a.id()),
            KernelArg::Buffer(bufs.near_count_b.id()),
            KernelArg::Buffer(bufs.far_count.id()),
            KernelArg::Int(slot_id as i32),
        ];
        dev.launch(KERNEL_RESET, cfg.num_workgroups, cfg.workgroup_size, &args)?;

        // Keep the count mirrors coherent with what the kernel just did.
        for gi in range.clone() {
            bufs.near_count_a.host_mut()[gi] = 0;
            bufs.near_count_b.host_mut()[gi] = 0;
            bufs.far_count.host_mut()[gi] = 0;
            bufs.dirty_count.host_mut()[gi] = 0;
        }

        let net = &mut nets[slot.net_idx];
        if dirty_overflowed {
            for i in 0..graph.num_wires() {
                let (x, y) = graph.centroid(i as u32);
                if net.bb.contains(x, y) {
                    bufs.current_cost.host_mut()[i] = INF_COST;
                    bufs.current_cost.upload_range(dev, i..i + 1)?;
                    bufs.uphill_edge.host_mut()[i] = UNSET_EDGE;
                    bufs.uphill_edge.upload_range(dev, i..i + 1)?;
                }
            }
        }

        arbiter.mark_region(&net.bb, FREE);
        for gi in range.clone() {
            bufs.wg_config.host_mut()[gi].net = NO_NET;
        }
        bufs.wg_config.upload_range(dev, range)?;

        if requeue {
            if net.grow_count < cfg.bbox_grow_cap {
                let (w, h) = graph.dims();
                net.bb.grow(1, w, h);
                net.grow_count += 1;
                self.pending.push_back(slot.net_idx);
            } else {
                clilog::warn!(
                    "net '{}' left unrouted this iteration (growth budget exhausted)",
                    net.name
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workgroup_share_is_proportional_and_clamped() {
        // 2 of 16 cells on 4 groups: 1 group.
        assert_eq!(workgroup_share(2, 16, 4), 1);
        // 8 of 16 cells: 2 groups.
        assert_eq!(workgroup_share(8, 16, 4), 2);
        // 12 of 16 cells: rounds up to 3.
        assert_eq!(workgroup_share(12, 16, 4), 3);
        // Whole grid: everything.
        assert_eq!(workgroup_share(16, 16, 4), 4);
        // Degenerate boxes still get one group.
        assert_eq!(workgroup_share(0, 16, 4), 1);
        // Oversized boxes clamp.
        assert_eq!(workgroup_share(100, 16, 4), 4);
    }
}
