// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Routing graph flattener.
//!
//! Builds the GPU-oriented, flattened routing graph from the architecture
//! database: a CSR adjacency list with integer edge costs, plus per-wire
//! centroid coordinates for bounding box tests. The graph only needs to be
//! linked downhill because exploration is forward-only.
//!
//! Costs are converted to `i32` so the kernels can relax them with atomic
//! updates; congestion inflation later only ever raises them.

use crate::arch::{Architecture, PipHandle, WireHandle};
use crate::error::{Result, RouteError};
use indexmap::IndexMap;

/// The flattened, immutable routing graph.
///
/// Wire indices are dense in `[0, W)`, assigned in database iteration order,
/// so the whole build is a pure function of the database snapshot.
pub struct RoutingGraph {
    /// Wire centroid coordinates, for bounding box hit-testing.
    wire_x: Vec<i16>,
    wire_y: Vec<i16>,
    /// CSR row offsets, length `W + 1`; `adj_offset[W]` is the edge count.
    adj_offset: Vec<u32>,
    /// Destination wire index of each edge.
    edge_dst: Vec<u32>,
    /// Base integer cost of each edge: pip delay plus driven-wire delay.
    edge_cost: Vec<i32>,
    /// The concrete pip behind each edge. The device never sees this; it is
    /// needed to bind the result back into the architecture database.
    edge_pip: Vec<PipHandle>,
    /// External handle of each wire, by index.
    wires: Vec<WireHandle>,
    wire_to_index: IndexMap<WireHandle, u32>,
    width: i16,
    height: i16,
}

impl RoutingGraph {
    /// Flatten the architecture database.
    ///
    /// Pips that are unavailable, or whose destination wire is unavailable,
    /// are omitted; everything else is costed as
    /// `round((pip_delay_ns + dst_wire_delay_ns) * delay_scale)`.
    pub fn build<A: Architecture + ?Sized>(arch: &A, delay_scale: f32) -> Result<Self> {
        let timer = clilog::stimer!("import routing graph");
        let mut g = RoutingGraph {
            wire_x: Vec::new(),
            wire_y: Vec::new(),
            adj_offset: Vec::new(),
            edge_dst: Vec::new(),
            edge_cost: Vec::new(),
            edge_pip: Vec::new(),
            wires: Vec::new(),
            wire_to_index: IndexMap::new(),
            width: 0,
            height: 0,
        };

        // First pass: assign each wire the next dense index and record its
        // centroid for hit-testing.
        for wire in arch.wires() {
            let bounds = arch.wire_bounds(wire);
            let cx = (bounds.x0 + bounds.x1) / 2;
            let cy = (bounds.y0 + bounds.y1) / 2;
            g.wire_x.push(cx);
            g.wire_y.push(cy);
            let idx = g.wires.len() as u32;
            if g.wire_to_index.insert(wire, idx).is_some() {
                return Err(RouteError::Graph(format!(
                    "wire {wire:?} enumerated twice by the architecture"
                )));
            }
            g.wires.push(wire);
            g.width = g.width.max(bounds.x1 + 1);
            g.height = g.height.max(bounds.y1 + 1);
        }

        // Second pass: construct the CSR adjacency list.
        g.adj_offset.reserve(g.wires.len() + 1);
        for i in 0..g.wires.len() {
            g.adj_offset.push(g.edge_dst.len() as u32);
            let wire = g.wires[i];
            for pip in arch.pips_downhill(wire) {
                // Skip permanently unavailable pips, and pips bound before
                // the router runs (e.g. for global clocks).
                if !arch.pip_available(pip) {
                    continue;
                }
                let dst = arch.pip_dst(pip);
                if !arch.wire_available(dst) {
                    continue;
                }
                let dst_idx = *g.wire_to_index.get(&dst).ok_or_else(|| {
                    RouteError::Graph(format!("pip {pip:?} drives unknown wire {dst:?}"))
                })?;
                // Combined cost of the pip and the wire it drives.
                let cost =
                    ((arch.pip_delay_ns(pip) + arch.wire_delay_ns(dst)) * delay_scale).round();
                g.edge_cost.push(cost as i32);
                g.edge_dst.push(dst_idx);
                g.edge_pip.push(pip);
                if g.edge_dst.len() > u32::MAX as usize {
                    return Err(RouteError::Graph(
                        "edge count overflows 32-bit adjacency indices".into(),
                    ));
                }
            }
        }
        // Sentinel offset closing the last row.
        g.adj_offset.push(g.edge_dst.len() as u32);

        clilog::info!(
            "imported {} wires, {} pips, grid {}x{}",
            g.wires.len(),
            g.edge_dst.len(),
            g.width,
            g.height
        );
        clilog::finish!(timer);
        Ok(g)
    }

    /// Number of routing nodes.
    pub fn num_wires(&self) -> usize {
        self.wires.len()
    }

    /// Number of edges.
    pub fn num_edges(&self) -> usize {
        self.edge_dst.len()
    }

    /// Grid extent.
    pub fn dims(&self) -> (i16, i16) {
        (self.width, self.height)
    }

    /// Dense index of an external wire handle.
    pub fn wire_index(&self, wire: WireHandle) -> Option<u32> {
        self.wire_to_index.get(&wire).copied()
    }

    /// External handle of a wire index.
    pub fn wire_handle(&self, idx: u32) -> WireHandle {
        self.wires[idx as usize]
    }

    /// Centroid of a wire index.
    pub fn centroid(&self, idx: u32) -> (i16, i16) {
        (self.wire_x[idx as usize], self.wire_y[idx as usize])
    }

    pub fn wire_x(&self) -> &[i16] {
        &self.wire_x
    }

    pub fn wire_y(&self) -> &[i16] {
        &self.wire_y
    }

    pub fn adj_offset(&self) -> &[u32] {
        &self.adj_offset
    }

    pub fn edge_dst(&self) -> &[u32] {
        &self.edge_dst
    }

    /// Base edge costs, before congestion folding.
    pub fn edge_cost(&self) -> &[i32] {
        &self.edge_cost
    }

    pub fn edge_pip(&self, e: u32) -> PipHandle {
        self.edge_pip[e as usize]
    }

    /// Source wire of an edge, recovered from the CSR row offsets by binary
    /// search. This is how predecessor chains are walked without ever
    /// materializing a pointer graph.
    pub fn edge_src(&self, e: u32) -> u32 {
        debug_assert!((e as usize) < self.edge_dst.len());
        // partition_point finds the first row whose offset exceeds e; the
        // row containing e is the one before it.
        let row = self.adj_offset.partition_point(|&off| off <= e);
        (row - 1) as u32
    }
}
