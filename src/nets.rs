// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Net import: per-net routing metadata.
//!
//! Materializes the router's view of every net: driver and sink node
//! indices, the bounding box spanned by their bel locations, and whether the
//! net carries locked pre-existing routing that must be preserved instead of
//! explored.

use crate::arch::{Architecture, BindStrength, BoundBox, NetDesc, NetHandle};
use crate::error::{Result, RouteError};
use crate::graph::RoutingGraph;
use compact_str::CompactString;
use smallvec::SmallVec;
use std::collections::HashSet;

/// Router-side state of one net.
#[derive(Debug, Clone)]
pub struct RouteNet {
    /// Handle for binding operations.
    pub handle: NetHandle,
    /// Stable name, diagnostics only.
    pub name: CompactString,
    /// Driver node index, or `None` for an undriven net.
    pub driver: Option<u32>,
    /// Sink node indices.
    pub sinks: SmallVec<[u32; 4]>,
    /// Current bounding box; inflated across iterations as needed.
    pub bb: BoundBox,
    /// Locked pre-existing routing; never explored, nodes stay occupied.
    pub fixed_routing: bool,
    /// Timing criticality, orders the routing queue.
    pub criticality: f32,
    /// How many one-cell inflations have been applied.
    pub grow_count: u8,
    /// Nodes currently bound to this net (for fixed nets: the imported
    /// wires, permanently).
    pub bound_nodes: Vec<u32>,
    /// Edge indices bound to this net in the current iteration.
    pub bound_pips: Vec<u32>,
    /// Whether every sink was bound in the current iteration.
    pub routed: bool,
}

impl RouteNet {
    /// Whether the scheduler has anything to do for this net.
    pub fn needs_routing(&self) -> bool {
        !self.fixed_routing && self.driver.is_some() && !self.sinks.is_empty()
    }
}

/// Import every net. Fixed routing increments `bound_count` for each of its
/// wires; loose partial routing is ripped up in the architecture database.
pub fn import_nets<C: Architecture + ?Sized>(
    ctx: &mut C,
    descs: Vec<NetDesc>,
    graph: &RoutingGraph,
    bound_count: &mut [u8],
) -> Result<Vec<RouteNet>> {
    let timer = clilog::stimer!("import nets");
    let (width, height) = graph.dims();
    let mut nets = Vec::with_capacity(descs.len());

    for desc in descs {
        let mut bb = BoundBox::null_space(width, height);
        let driver = match desc.driver {
            Some(ep) => {
                bb.extend(ep.loc.0, ep.loc.1);
                Some(graph.wire_index(ep.wire).ok_or_else(|| {
                    RouteError::Graph(format!(
                        "driver wire of net '{}' is not in the routing graph",
                        desc.name
                    ))
                })?)
            }
            None => None,
        };
        let mut sinks = SmallVec::new();
        for ep in &desc.sinks {
            bb.extend(ep.loc.0, ep.loc.1);
            sinks.push(graph.wire_index(ep.wire).ok_or_else(|| {
                RouteError::Graph(format!(
                    "sink wire of net '{}' is not in the routing graph",
                    desc.name
                ))
            })?);
        }

        let mut net = RouteNet {
            handle: desc.handle,
            name: desc.name.clone(),
            driver,
            sinks,
            bb,
            fixed_routing: false,
            criticality: desc.criticality,
            grow_count: 0,
            bound_nodes: Vec::new(),
            bound_pips: Vec::new(),
            routed: false,
        };

        // Check for existing routing (e.g. global clocks routed earlier).
        if !desc.bound_wires.is_empty() {
            let bound: HashSet<_> = desc.bound_wires.iter().map(|&(w, _)| w).collect();
            let mut invalid_route = false;
            for ep in &desc.sinks {
                if !bound.contains(&ep.wire) {
                    invalid_route = true;
                } else if desc
                    .bound_wires
                    .iter()
                    .any(|&(w, s)| w == ep.wire && s > BindStrength::Strong)
                {
                    net.fixed_routing = true;
                }
            }
            if net.fixed_routing {
                if invalid_route {
                    return Err(RouteError::FixedRoutingConflict {
                        net: net.name,
                        reason: "combination of locked and incomplete routing".into(),
                    });
                }
                // Mark wires as used so they carry a congestion penalty.
                for &(wire, _) in &desc.bound_wires {
                    let idx = graph.wire_index(wire).ok_or_else(|| {
                        RouteError::FixedRoutingConflict {
                            net: net.name.clone(),
                            reason: format!("locked wire {wire:?} is not in the routing graph"),
                        }
                    })?;
                    if bound_count[idx as usize] != 0 {
                        // No overlaps allowed for locked routing.
                        return Err(RouteError::FixedRoutingConflict {
                            net: net.name,
                            reason: format!("locked wire {wire:?} overlaps other locked routing"),
                        });
                    }
                    bound_count[idx as usize] += 1;
                    net.bound_nodes.push(idx);
                }
                net.routed = true;
            } else {
                // Routing isn't locked; rip it up so it doesn't get in the way.
                ctx.ripup_net(desc.handle);
            }
        }

        nets.push(net);
    }

    let fixed = nets.iter().filter(|n| n.fixed_routing).count();
    let undriven = nets.iter().filter(|n| n.driver.is_none()).count();
    clilog::info!(
        "imported {} nets ({} fixed, {} undriven)",
        nets.len(),
        fixed,
        undriven
    );
    clilog::finish!(timer);
    Ok(nets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::NetProvider;
    use crate::testgrid::TestArch;

    fn setup(arch: &TestArch) -> (RoutingGraph, Vec<u8>) {
        let graph = RoutingGraph::build(arch, 1000.0).unwrap();
        let bound = vec![0u8; graph.num_wires()];
        (graph, bound)
    }

    #[test]
    fn bounding_box_unions_endpoints() {
        let mut arch = TestArch::grid(6, 6, 0.1);
        let a = arch.wire_at(1, 2);
        let b = arch.wire_at(4, 3);
        let c = arch.wire_at(2, 5);
        arch.add_net("n", Some(a), &[b, c], 0.0);
        let (graph, mut bound) = setup(&arch);
        let descs = arch.nets();
        let nets = import_nets(&mut arch, descs, &graph, &mut bound).unwrap();
        assert_eq!(
            nets[0].bb,
            BoundBox {
                x0: 1,
                y0: 2,
                x1: 4,
                y1: 5
            }
        );
        assert!(nets[0].needs_routing());
    }

    #[test]
    fn undriven_net_is_skipped() {
        let mut arch = TestArch::grid(3, 3, 0.1);
        let b = arch.wire_at(1, 1);
        arch.add_net("floating", None, &[b], 0.0);
        let (graph, mut bound) = setup(&arch);
        let descs = arch.nets();
        let nets = import_nets(&mut arch, descs, &graph, &mut bound).unwrap();
        assert!(!nets[0].needs_routing());
    }

    #[test]
    fn locked_routing_marks_nodes_occupied() {
        let mut arch = TestArch::grid(3, 1, 0.1);
        let (a, m, b) = (arch.wire_at(0, 0), arch.wire_at(1, 0), arch.wire_at(2, 0));
        let net = arch.add_net("clk", Some(a), &[b], 0.0);
        arch.prebind(net, &[a, m, b], BindStrength::Locked);
        let (graph, mut bound) = setup(&arch);
        let descs = arch.nets();
        let nets = import_nets(&mut arch, descs, &graph, &mut bound).unwrap();
        assert!(nets[0].fixed_routing);
        assert!(!nets[0].needs_routing());
        assert_eq!(bound.iter().filter(|&&c| c == 1).count(), 3);
    }

    #[test]
    fn mixed_locked_and_missing_routing_is_fatal() {
        let mut arch = TestArch::grid(3, 1, 0.1);
        let (a, b) = (arch.wire_at(0, 0), arch.wire_at(2, 0));
        let extra = arch.wire_at(1, 0);
        let net = arch.add_net("clk", Some(a), &[b, extra], 0.0);
        // Sink `b` is locked, sink `extra` has no binding at all.
        arch.prebind(net, &[a, b], BindStrength::Locked);
        let (graph, mut bound) = setup(&arch);
        let descs = arch.nets();
        let err = import_nets(&mut arch, descs, &graph, &mut bound).unwrap_err();
        assert!(matches!(err, RouteError::FixedRoutingConflict { .. }));
    }

    #[test]
    fn loose_partial_routing_is_ripped_up() {
        let mut arch = TestArch::grid(3, 1, 0.1);
        let (a, b) = (arch.wire_at(0, 0), arch.wire_at(2, 0));
        let net = arch.add_net("n", Some(a), &[b], 0.0);
        arch.prebind(net, &[a], BindStrength::Normal);
        let (graph, mut bound) = setup(&arch);
        let descs = arch.nets();
        let nets = import_nets(&mut arch, descs, &graph, &mut bound).unwrap();
        assert!(!nets[0].fixed_routing);
        assert!(nets[0].needs_routing());
        assert!(arch.was_ripped(net));
        assert!(bound.iter().all(|&c| c == 0));
    }

    #[test]
    fn overlapping_locked_routing_is_fatal() {
        let mut arch = TestArch::grid(3, 1, 0.1);
        let (a, m, b) = (arch.wire_at(0, 0), arch.wire_at(1, 0), arch.wire_at(2, 0));
        let n1 = arch.add_net("clk1", Some(a), &[m], 0.0);
        let n2 = arch.add_net("clk2", Some(b), &[m], 0.0);
        arch.prebind(n1, &[a, m], BindStrength::Locked);
        arch.prebind(n2, &[b, m], BindStrength::Locked);
        let (graph, mut bound) = setup(&arch);
        let descs = arch.nets();
        let err = import_nets(&mut arch, descs, &graph, &mut bound).unwrap_err();
        assert!(matches!(err, RouteError::FixedRoutingConflict { .. }));
    }
}
