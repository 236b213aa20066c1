// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! The router: negotiated-congestion outer loop and public entry point.
//!
//! Classic pathfinder shape around the parallel wavefront core: rip up
//! everything non-fixed, route all nets through the scheduler, then inflate
//! the cost of overused nodes and go again until the solution is legal or
//! the iteration cap is hit. Present congestion cost multiplies up every
//! iteration; history cost accumulates per overused node and is folded into
//! the incoming edge costs, so iteration `k+1` starts from a well-defined
//! input that never gets cheaper.

use crate::arch::{Architecture, NetProvider};
use crate::buffers::RouteBuffers;
use crate::config::RouterConfig;
use crate::error::{Result, RouteError};
use crate::gpu::ComputeDevice;
use crate::graph::RoutingGraph;
use crate::grid::GridArbiter;
use crate::kernel::INF_COST;
use crate::nets::{import_nets, RouteNet};
use crate::scheduler::Scheduler;

/// Summary of a routing run.
#[derive(Debug, Clone, Default)]
pub struct RouteStats {
    /// Outer iterations consumed.
    pub iterations: u32,
    /// Nets routed by exploration (excludes fixed and skipped nets).
    pub routed_nets: usize,
    /// Nets imported with locked pre-existing routing.
    pub fixed_nets: usize,
    /// Total pips bound on success.
    pub bound_pips: usize,
    /// Wavefront kernel launches across the whole run.
    pub kernel_steps: u64,
    /// Most nets simultaneously in flight.
    pub peak_in_flight: usize,
    /// Queue-overflow retries.
    pub capacity_retries: u32,
}

/// The router. A self-contained value: every table lives inside it, and the
/// architecture, net database and compute device are explicit collaborators
/// handed to the constructor.
pub struct OcularRouter<'ctx, C: Architecture + NetProvider + ?Sized> {
    ctx: &'ctx mut C,
    dev: &'ctx dyn ComputeDevice,
    cfg: RouterConfig,
    graph: RoutingGraph,
    nets: Vec<RouteNet>,
    bufs: RouteBuffers,
    arbiter: GridArbiter,
    sched: Scheduler,
    /// Accumulated history cost per node, folded into edge costs.
    hist_cost: Vec<i32>,
    /// Present congestion multiplier for the current iteration.
    curr_cong_cost: f32,
}

impl<'ctx, C: Architecture + NetProvider + ?Sized> OcularRouter<'ctx, C> {
    /// Build the routing graph, allocate the buffer pool and import nets.
    pub fn new(
        ctx: &'ctx mut C,
        dev: &'ctx dyn ComputeDevice,
        cfg: RouterConfig,
    ) -> Result<Self> {
        cfg.validate()?;
        let graph = RoutingGraph::build(&*ctx, cfg.delay_scale)?;
        let mut bufs = RouteBuffers::alloc(dev, &cfg, &graph)?;
        let descs = ctx.nets();
        let nets = import_nets(ctx, descs, &graph, bufs.bound_count.host_mut())?;
        let (width, height) = graph.dims();
        let hist_cost = vec![0; graph.num_wires()];
        let sched = Scheduler::new(&cfg);
        Ok(OcularRouter {
            ctx,
            dev,
            cfg,
            graph,
            nets,
            bufs,
            arbiter: GridArbiter::new(width, height),
            sched,
            hist_cost,
            curr_cong_cost: 1.0,
        })
    }

    /// Run the negotiated-congestion loop to completion.
    ///
    /// On success every driven net is bound and no node is overused. On
    /// failure the database is left at the last fully-legal snapshot: only
    /// the imported fixed routing remains bound.
    pub fn route(&mut self) -> Result<RouteStats> {
        let timer = clilog::stimer!("route");
        for iteration in 1..=self.cfg.max_outer_iters {
            self.rip_up();
            self.fold_edge_costs();
            self.bufs.edge_cost.upload(self.dev)?;
            self.bufs.bound_count.upload(self.dev)?;

            let order = self.route_order();
            self.sched.run_iteration(
                &mut *self.ctx,
                &self.graph,
                &self.cfg,
                &mut self.bufs,
                &mut self.arbiter,
                self.dev,
                &mut self.nets,
                &order,
                self.curr_cong_cost,
            )?;

            let overused = self
                .bufs
                .bound_count
                .host()
                .iter()
                .filter(|&&c| c > 1)
                .count();
            let unrouted = self
                .nets
                .iter()
                .filter(|n| n.needs_routing() && !n.routed)
                .count();
            clilog::info!(
                "iteration {}: {} overused nodes, {} unrouted nets",
                iteration,
                overused,
                unrouted
            );

            if overused == 0 && unrouted == 0 {
                let stats = RouteStats {
                    iterations: iteration,
                    routed_nets: self.nets.iter().filter(|n| n.routed && !n.fixed_routing).count(),
                    fixed_nets: self.nets.iter().filter(|n| n.fixed_routing).count(),
                    bound_pips: self.nets.iter().map(|n| n.bound_pips.len()).sum(),
                    kernel_steps: self.sched.kernel_steps,
                    peak_in_flight: self.sched.peak_in_flight,
                    capacity_retries: self.sched.capacity_retries,
                };
                clilog::finish!(timer);
                return Ok(stats);
            }

            self.update_history();
            self.curr_cong_cost *= self.cfg.present_cost_growth;
            self.grow_congested_boxes();
        }

        // Give up: restore the last fully-legal snapshot.
        self.rip_up();
        clilog::finish!(timer);
        Err(RouteError::Unroutable(self.cfg.max_outer_iters))
    }

    /// Rip up every non-fixed net and rebuild `bound_count` from the fixed
    /// nets' contributions.
    fn rip_up(&mut self) {
        for net in &mut self.nets {
            if net.fixed_routing {
                continue;
            }
            if net.routed || !net.bound_pips.is_empty() {
                self.ctx.ripup_net(net.handle);
            }
            net.bound_pips.clear();
            net.bound_nodes.clear();
            net.routed = false;
        }
        let bound = self.bufs.bound_count.host_mut();
        bound.fill(0);
        for net in &self.nets {
            if net.fixed_routing {
                for &n in &net.bound_nodes {
                    bound[n as usize] = bound[n as usize].saturating_add(1);
                }
            }
        }
    }

    /// Effective edge cost: base delay cost plus the destination node's
    /// history cost, scaled to present-cost units. `hist_cost` only grows,
    /// so no edge ever gets cheaper across iterations.
    fn fold_edge_costs(&mut self) {
        let base = self.graph.edge_cost();
        let dst = self.graph.edge_dst();
        let folded = self.bufs.edge_cost.host_mut();
        for e in 0..base.len() {
            let hist =
                self.hist_cost[dst[e] as usize] as i64 * self.cfg.base_present_cost as i64;
            folded[e] = (base[e] as i64 + hist).min(INF_COST as i64) as i32;
        }
    }

    fn update_history(&mut self) {
        for (i, &c) in self.bufs.bound_count.host().iter().enumerate() {
            if c > 1 {
                let overuse = (c - 1) as i32;
                self.hist_cost[i] =
                    self.hist_cost[i].saturating_add(overuse * self.cfg.hist_cost_inc);
            }
        }
    }

    /// Inflate the bounding boxes of nets that are still unrouted or that
    /// route through an overused node.
    fn grow_congested_boxes(&mut self) {
        let (width, height) = self.graph.dims();
        let bound = self.bufs.bound_count.host();
        for net in &mut self.nets {
            if net.fixed_routing || net.grow_count >= self.cfg.bbox_grow_cap {
                continue;
            }
            let unrouted = net.needs_routing() && !net.routed;
            let overused = net.bound_nodes.iter().any(|&n| bound[n as usize] > 1);
            if unrouted || overused {
                net.bb.grow(1, width, height);
                net.grow_count += 1;
            }
        }
    }

    /// Nets to route, most critical first, stable on the import index.
    fn route_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.nets.len())
            .filter(|&i| self.nets[i].needs_routing())
            .collect();
        order.sort_by(|&a, &b| {
            self.nets[b]
                .criticality
                .total_cmp(&self.nets[a].criticality)
                .then(a.cmp(&b))
        });
        order
    }
}

/// Convenience entry point: construct a router over the given collaborators
/// and run it.
pub fn route_nets<C: Architecture + NetProvider + ?Sized>(
    ctx: &mut C,
    dev: &dyn ComputeDevice,
    cfg: RouterConfig,
) -> Result<RouteStats> {
    OcularRouter::new(ctx, dev, cfg)?.route()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{BindStrength, WireHandle};
    use crate::cpu::CpuDevice;
    use crate::kernel::UNSET_EDGE;
    use crate::testgrid::TestArch;
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;

    fn small_cfg() -> RouterConfig {
        RouterConfig {
            num_workgroups: 4,
            workgroup_size: 8,
            near_queue_len: 64,
            far_queue_len: 128,
            dirty_queue_len: 256,
            max_nets_in_flight: 2,
            max_outer_iters: 10,
            max_steps_per_net: 100,
            ..Default::default()
        }
    }

    /// Serial Dijkstra over the flattened graph, on the base edge costs.
    fn dijkstra(graph: &RoutingGraph, src: u32, dst: u32) -> i64 {
        let mut dist = vec![i64::MAX; graph.num_wires()];
        let mut heap = BinaryHeap::new();
        dist[src as usize] = 0;
        heap.push(Reverse((0i64, src)));
        while let Some(Reverse((d, u))) = heap.pop() {
            if d > dist[u as usize] {
                continue;
            }
            if u == dst {
                return d;
            }
            for e in graph.adj_offset()[u as usize]..graph.adj_offset()[u as usize + 1] {
                let v = graph.edge_dst()[e as usize];
                let nd = d + graph.edge_cost()[e as usize] as i64;
                if nd < dist[v as usize] {
                    dist[v as usize] = nd;
                    heap.push(Reverse((nd, v)));
                }
            }
        }
        i64::MAX
    }

    /// S1: a single two-node net binds exactly one pip.
    #[test]
    fn single_two_node_net() {
        let mut arch = TestArch::new();
        let a = arch.add_wire(0, 0, 0.0);
        let b = arch.add_wire(1, 0, 0.0);
        arch.add_pip(a, b, 0.1);
        let ni = arch.add_net("n", Some(a), &[b], 0.0);

        let dev = CpuDevice::new();
        let mut router = OcularRouter::new(&mut arch, &dev, small_cfg()).unwrap();
        let stats = router.route().unwrap();
        assert_eq!(stats.iterations, 1);
        assert_eq!(stats.routed_nets, 1);
        assert_eq!(stats.bound_pips, 1);

        let bi = router.graph.wire_index(WireHandle(b as u64)).unwrap();
        assert_eq!(router.bufs.bound_count.host()[bi as usize], 1);
        drop(router);
        assert_eq!(arch.pips_of_net(ni).len(), 1);
        assert_eq!(arch.bound_cost(ni, 1000.0), 100);
    }

    /// S2: two nets with disjoint boxes are in flight together and both
    /// bind in the first iteration.
    #[test]
    fn disjoint_nets_route_concurrently() {
        let mut arch = TestArch::new();
        let chain = |y: i16, arch: &mut TestArch| {
            let w0 = arch.add_wire(0, y, 0.0);
            let w1 = arch.add_wire(1, y, 0.0);
            let w2 = arch.add_wire(2, y, 0.0);
            arch.add_pip(w0, w1, 0.1);
            arch.add_pip(w1, w2, 0.1);
            (w0, w2)
        };
        let (a0, a2) = chain(0, &mut arch);
        let (b0, b2) = chain(3, &mut arch);
        let na = arch.add_net("a", Some(a0), &[a2], 0.0);
        let nb = arch.add_net("b", Some(b0), &[b2], 0.0);

        let dev = CpuDevice::new();
        let stats = route_nets(&mut arch, &dev, small_cfg()).unwrap();
        assert_eq!(stats.iterations, 1);
        assert_eq!(stats.routed_nets, 2);
        assert_eq!(stats.peak_in_flight, 2);
        assert_eq!(arch.pips_of_net(na).len(), 2);
        assert_eq!(arch.pips_of_net(nb).len(), 2);
    }

    /// S3: two nets forced through one node negotiate; the loser detours at
    /// higher cost once history and box growth kick in.
    #[test]
    fn forced_contention_negotiates_a_detour() {
        let mut arch = TestArch::new();
        let a_src = arch.add_wire(1, 0, 0.0);
        let mid = arch.add_wire(1, 1, 0.0);
        let a_dst = arch.add_wire(1, 2, 0.0);
        let b_src = arch.add_wire(0, 1, 0.0);
        let b_dst = arch.add_wire(2, 1, 0.0);
        // Net A's only path is vertical through mid.
        arch.add_pip(a_src, mid, 0.1);
        arch.add_pip(mid, a_dst, 0.1);
        // Net B: direct through mid, or a detour along y = 2.
        arch.add_pip(b_src, mid, 0.1);
        arch.add_pip(mid, b_dst, 0.1);
        let d1 = arch.add_wire(0, 2, 0.0);
        let d2 = arch.add_wire(1, 2, 0.0);
        let d3 = arch.add_wire(2, 2, 0.0);
        arch.add_pip(b_src, d1, 0.1);
        arch.add_pip(d1, d2, 0.1);
        arch.add_pip(d2, d3, 0.1);
        arch.add_pip(d3, b_dst, 0.1);

        let na = arch.add_net("a", Some(a_src), &[a_dst], 1.0);
        let nb = arch.add_net("b", Some(b_src), &[b_dst], 0.5);

        let cfg = RouterConfig {
            max_nets_in_flight: 1,
            ..small_cfg()
        };
        let dev = CpuDevice::new();
        let mut router = OcularRouter::new(&mut arch, &dev, cfg).unwrap();
        let stats = router.route().unwrap();
        assert!(stats.iterations > 1);

        // Legal: no node carries two nets.
        assert!(router.bufs.bound_count.host().iter().all(|&c| c <= 1));
        drop(router);
        assert_eq!(arch.pips_of_net(na).len(), 2);
        assert_eq!(arch.pips_of_net(nb).len(), 4);
        // The negotiated solution costs more than the unconstrained sum.
        assert_eq!(arch.bound_cost(na, 1000.0), 200);
        assert!(arch.bound_cost(nb, 1000.0) > 200);
    }

    /// S4: a near queue of four cannot hold a ten-way fanout; the overflow
    /// is caught, the box grows (buying more workgroups) and the retry
    /// succeeds.
    #[test]
    fn queue_overflow_recovers_by_growing() {
        let mut arch = TestArch::new();
        let driver = arch.add_wire(0, 1, 0.0);
        let mids: Vec<usize> = (0..10).map(|_| arch.add_wire(0, 2, 0.0)).collect();
        let sink = arch.add_wire(0, 2, 0.0);
        for &m in &mids {
            arch.add_pip(driver, m, 0.1);
            arch.add_pip(m, sink, 0.1);
        }
        // Pad the grid so the initial box maps to a single workgroup.
        arch.add_wire(3, 3, 0.0);
        let ni = arch.add_net("fan", Some(driver), &[sink], 0.0);

        let cfg = RouterConfig {
            near_queue_len: 4,
            far_queue_len: 64,
            dirty_queue_len: 64,
            max_nets_in_flight: 1,
            ..small_cfg()
        };
        let dev = CpuDevice::new();
        let stats = route_nets(&mut arch, &dev, cfg).unwrap();
        assert!(stats.capacity_retries >= 1);
        assert_eq!(stats.routed_nets, 1);
        assert_eq!(arch.pips_of_net(ni).len(), 2);
    }

    /// S5: a net imported with complete locked routing is never explored,
    /// and other nets route around its occupied wires.
    #[test]
    fn fixed_routing_is_preserved_and_avoided() {
        let mut arch = TestArch::grid(3, 3, 0.1);
        let a = arch.wire_at(0, 1);
        let m = arch.wire_at(1, 1);
        let b = arch.wire_at(2, 1);
        let clk = arch.add_net("clk", Some(a), &[b], 0.0);
        arch.prebind(clk, &[a, m, b], BindStrength::Locked);

        let src = arch.wire_at(1, 0);
        let dst = arch.wire_at(1, 2);
        let n2 = arch.add_net("n2", Some(src), &[dst], 0.0);

        let dev = CpuDevice::new();
        let mut router = OcularRouter::new(&mut arch, &dev, small_cfg()).unwrap();
        let stats = router.route().unwrap();
        assert_eq!(stats.fixed_nets, 1);
        assert_eq!(stats.routed_nets, 1);

        let mi = router.graph.wire_index(WireHandle(m as u64)).unwrap();
        assert_eq!(router.bufs.bound_count.host()[mi as usize], 1);
        assert!(router.bufs.bound_count.host().iter().all(|&c| c <= 1));
        drop(router);
        // The fixed net was neither ripped nor re-bound by the router.
        assert!(!arch.was_ripped(clk));
        assert!(arch.pips_of_net(clk).is_empty());
        // The second net detours around the locked middle wire.
        for p in arch.pips_of_net(n2) {
            assert_ne!(arch.pips[p].src, m);
            assert_ne!(arch.pips[p].dst, m);
        }
    }

    /// S6: a driver with no downhill pips is unroutable; after the retries
    /// run out nothing is left bound.
    #[test]
    fn unroutable_leaves_no_bindings() {
        let mut arch = TestArch::new();
        let a = arch.add_wire(0, 0, 0.0);
        let b = arch.add_wire(1, 0, 0.0);
        // No pips at all.
        arch.add_net("dead", Some(a), &[b], 0.0);

        let cfg = RouterConfig {
            max_outer_iters: 2,
            bbox_grow_cap: 1,
            ..small_cfg()
        };
        let dev = CpuDevice::new();
        let err = route_nets(&mut arch, &dev, cfg).unwrap_err();
        assert!(matches!(err, RouteError::Unroutable(2)));
        assert!(arch.pip_bindings.is_empty());
    }

    /// With one slot and one workgroup the parallel core must match a
    /// serial Dijkstra on the same cost snapshot.
    #[test]
    fn matches_serial_dijkstra_on_first_iteration() {
        let mut arch = TestArch::grid(6, 6, 0.1);
        let src = arch.wire_at(0, 0);
        let dst = arch.wire_at(5, 5);
        let ni = arch.add_net("diag", Some(src), &[dst], 0.0);

        let cfg = RouterConfig {
            num_workgroups: 1,
            max_nets_in_flight: 1,
            near_queue_len: 256,
            far_queue_len: 512,
            dirty_queue_len: 512,
            ..small_cfg()
        };
        let dev = CpuDevice::new();
        let mut router = OcularRouter::new(&mut arch, &dev, cfg).unwrap();
        let si = router.graph.wire_index(WireHandle(src as u64)).unwrap();
        let di = router.graph.wire_index(WireHandle(dst as u64)).unwrap();
        let expect = dijkstra(&router.graph, si, di);
        router.route().unwrap();
        drop(router);
        assert_eq!(arch.bound_cost(ni, 1000.0), expect);
    }

    /// A multi-sink net binds one connected tree: the trunk edge through
    /// the bottleneck is bound once, not once per sink.
    #[test]
    fn multi_sink_net_shares_a_tree() {
        let mut arch = TestArch::new();
        let src = arch.add_wire(0, 0, 0.0);
        let trunk = arch.add_wire(1, 0, 0.0);
        let s1 = arch.add_wire(2, 0, 0.0);
        let s2 = arch.add_wire(2, 1, 0.0);
        arch.add_pip(src, trunk, 0.1);
        arch.add_pip(trunk, s1, 0.1);
        arch.add_pip(trunk, s2, 0.1);
        let ni = arch.add_net("fanout", Some(src), &[s1, s2], 0.0);

        let dev = CpuDevice::new();
        let mut router = OcularRouter::new(&mut arch, &dev, small_cfg()).unwrap();
        router.route().unwrap();
        assert!(router.bufs.bound_count.host().iter().all(|&c| c <= 1));
        drop(router);
        let pips = arch.pips_of_net(ni);
        // Three pips, not four: src->trunk is shared between the sinks.
        assert_eq!(pips.len(), 3);
        // Every bound pip's source is the driver or another bound dst:
        // the result is one connected tree reaching both sinks.
        let dsts: Vec<usize> = pips.iter().map(|&p| arch.pips[p].dst).collect();
        for &p in &pips {
            let s = arch.pips[p].src;
            assert!(s == src || dsts.contains(&s));
        }
        for &t in &[s1, s2] {
            assert!(dsts.contains(&t));
        }
    }

    /// Dirty-list completeness: after a run, every node is back to the
    /// unexplored state.
    #[test]
    fn per_node_state_resets_after_run() {
        let mut arch = TestArch::grid(4, 4, 0.1);
        let src = arch.wire_at(0, 0);
        let dst = arch.wire_at(3, 3);
        arch.add_net("n", Some(src), &[dst], 0.0);

        let dev = CpuDevice::new();
        let mut router = OcularRouter::new(&mut arch, &dev, small_cfg()).unwrap();
        router.route().unwrap();
        router.bufs.current_cost.download(&dev).unwrap();
        router.bufs.uphill_edge.download(&dev).unwrap();
        assert!(router
            .bufs
            .current_cost
            .host()
            .iter()
            .all(|&c| c == INF_COST));
        assert!(router
            .bufs
            .uphill_edge
            .host()
            .iter()
            .all(|&e| e == UNSET_EDGE));
    }

    /// Edge costs never decrease across iterations as history accumulates.
    #[test]
    fn folded_edge_costs_are_monotone() {
        let mut arch = TestArch::grid(3, 3, 0.1);
        let src = arch.wire_at(0, 0);
        let dst = arch.wire_at(2, 2);
        arch.add_net("n", Some(src), &[dst], 0.0);

        let dev = CpuDevice::new();
        let mut router = OcularRouter::new(&mut arch, &dev, small_cfg()).unwrap();
        router.fold_edge_costs();
        let before = router.bufs.edge_cost.host().to_vec();
        for h in router.hist_cost.iter_mut() {
            *h += 2;
        }
        router.fold_edge_costs();
        let after = router.bufs.edge_cost.host().to_vec();
        assert!(before.iter().zip(&after).all(|(b, a)| a >= b));
    }

    /// An undriven net and a sinkless net are skipped without error.
    #[test]
    fn degenerate_nets_are_skipped() {
        let mut arch = TestArch::grid(2, 2, 0.1);
        let a = arch.wire_at(0, 0);
        let b = arch.wire_at(1, 1);
        arch.add_net("undriven", None, &[b], 0.0);
        arch.add_net("sinkless", Some(a), &[], 0.0);

        let dev = CpuDevice::new();
        let stats = route_nets(&mut arch, &dev, small_cfg()).unwrap();
        assert_eq!(stats.iterations, 1);
        assert_eq!(stats.routed_nets, 0);
        assert_eq!(stats.bound_pips, 0);
    }
}
