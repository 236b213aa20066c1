// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Backtrace and pip binding.
//!
//! Once every sink of a net has settled, the host walks the predecessor
//! edges from each sink back towards the driver and commits the traversed
//! pips to the architecture database. The predecessor forest is never
//! materialized: `uphill_edge` plus the CSR row offsets are enough to
//! recover each edge's source wire.

use crate::arch::{Architecture, BindStrength};
use crate::buffers::RouteBuffers;
use crate::error::Result;
use crate::gpu::ComputeDevice;
use crate::graph::RoutingGraph;
use crate::kernel::UNSET_EDGE;
use crate::nets::RouteNet;
use std::collections::HashSet;

/// Bind a net whose sinks have all settled.
///
/// Walks each sink to the driver, or to any node already on this net's tree
/// (a later sink reuses the routing of an earlier one, which is what turns
/// the per-sink paths into a Steiner tree). Emits pips driver-first and
/// increments `bound_count` for every newly used node.
pub fn bind_net<C: Architecture + ?Sized>(
    ctx: &mut C,
    graph: &RoutingGraph,
    bufs: &mut RouteBuffers,
    dev: &dyn ComputeDevice,
    net: &mut RouteNet,
) -> Result<()> {
    let Some(driver) = net.driver else {
        return Ok(());
    };

    bufs.uphill_edge.download(dev)?;
    let uphill = bufs.uphill_edge.host();
    let bound_count = bufs.bound_count.host_mut();

    let mut on_tree: HashSet<u32> = net.bound_nodes.iter().copied().collect();
    if on_tree.insert(driver) {
        ctx.bind_wire(graph.wire_handle(driver), net.handle, BindStrength::Normal);
        net.bound_nodes.push(driver);
        bound_count[driver as usize] = bound_count[driver as usize].saturating_add(1);
    }

    let sinks: Vec<u32> = net.sinks.iter().copied().collect();
    for sink in sinks {
        // Collect the edge chain sink-to-tree, then bind it driver-first.
        let mut chain = Vec::new();
        let mut cur = sink;
        while !on_tree.contains(&cur) {
            let e = uphill[cur as usize];
            assert!(
                e != UNSET_EDGE && chain.len() <= graph.num_wires(),
                "broken predecessor chain for settled sink {cur} of net '{}'",
                net.name
            );
            chain.push(e);
            cur = graph.edge_src(e);
        }
        for &e in chain.iter().rev() {
            let v = graph.edge_dst()[e as usize];
            ctx.bind_pip(graph.edge_pip(e), net.handle);
            net.bound_pips.push(e);
            if on_tree.insert(v) {
                net.bound_nodes.push(v);
                bound_count[v as usize] = bound_count[v as usize].saturating_add(1);
            }
        }
    }

    net.routed = true;
    Ok(())
}
