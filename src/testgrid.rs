// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! In-memory architecture and net database used by the tests.

use crate::arch::{
    Architecture, BindStrength, BoundBox, Endpoint, NetDesc, NetHandle, NetProvider, PipHandle,
    WireHandle,
};
use compact_str::CompactString;

pub struct TestWire {
    pub x: i16,
    pub y: i16,
    pub delay_ns: f32,
    pub avail: bool,
}

pub struct TestPip {
    pub src: usize,
    pub dst: usize,
    pub delay_ns: f32,
    pub avail: bool,
}

pub struct TestNet {
    pub name: CompactString,
    pub driver: Option<usize>,
    pub sinks: Vec<usize>,
    pub prebound: Vec<(usize, BindStrength)>,
    pub criticality: f32,
}

/// A little fabric: wires at grid locations, directed pips between them,
/// and a recording implementation of the binding operations.
#[derive(Default)]
pub struct TestArch {
    pub wires: Vec<TestWire>,
    pub pips: Vec<TestPip>,
    downhill: Vec<Vec<usize>>,
    pub nets: Vec<TestNet>,
    /// Recorded (pip, net) bindings, in bind order.
    pub pip_bindings: Vec<(usize, usize)>,
    /// Recorded (wire, net, strength) bindings.
    pub wire_bindings: Vec<(usize, usize, BindStrength)>,
    /// Nets that were ripped up, in call order.
    pub ripped: Vec<usize>,
}

impl TestArch {
    pub fn new() -> Self {
        Self::default()
    }

    /// A full grid: one wire per cell and bidirectional pips between
    /// 4-neighbors, all with the same delay.
    pub fn grid(width: i16, height: i16, delay_ns: f32) -> Self {
        let mut arch = Self::new();
        for y in 0..height {
            for x in 0..width {
                arch.add_wire(x, y, delay_ns);
            }
        }
        let at = |x: i16, y: i16| (y * width + x) as usize;
        for y in 0..height {
            for x in 0..width {
                if x + 1 < width {
                    arch.add_pip(at(x, y), at(x + 1, y), delay_ns);
                    arch.add_pip(at(x + 1, y), at(x, y), delay_ns);
                }
                if y + 1 < height {
                    arch.add_pip(at(x, y), at(x, y + 1), delay_ns);
                    arch.add_pip(at(x, y + 1), at(x, y), delay_ns);
                }
            }
        }
        arch
    }

    pub fn add_wire(&mut self, x: i16, y: i16, delay_ns: f32) -> usize {
        self.wires.push(TestWire {
            x,
            y,
            delay_ns,
            avail: true,
        });
        self.downhill.push(Vec::new());
        self.wires.len() - 1
    }

    pub fn add_pip(&mut self, src: usize, dst: usize, delay_ns: f32) -> usize {
        self.pips.push(TestPip {
            src,
            dst,
            delay_ns,
            avail: true,
        });
        let id = self.pips.len() - 1;
        self.downhill[src].push(id);
        id
    }

    /// First wire located at `(x, y)`.
    pub fn wire_at(&self, x: i16, y: i16) -> usize {
        self.wires
            .iter()
            .position(|w| w.x == x && w.y == y)
            .expect("no wire at location")
    }

    pub fn block_wire(&mut self, wire: usize) {
        self.wires[wire].avail = false;
    }

    pub fn block_pip(&mut self, pip: usize) {
        self.pips[pip].avail = false;
    }

    pub fn add_net(
        &mut self,
        name: &str,
        driver: Option<usize>,
        sinks: &[usize],
        criticality: f32,
    ) -> usize {
        self.nets.push(TestNet {
            name: name.into(),
            driver,
            sinks: sinks.to_vec(),
            prebound: Vec::new(),
            criticality,
        });
        self.nets.len() - 1
    }

    /// Record pre-existing routing for a net, as the net database would
    /// report it.
    pub fn prebind(&mut self, net: usize, wires: &[usize], strength: BindStrength) {
        self.nets[net]
            .prebound
            .extend(wires.iter().map(|&w| (w, strength)));
    }

    pub fn was_ripped(&self, net: usize) -> bool {
        self.ripped.contains(&net)
    }

    /// Pips currently bound to a net, in bind order.
    pub fn pips_of_net(&self, net: usize) -> Vec<usize> {
        self.pip_bindings
            .iter()
            .filter(|&&(_, n)| n == net)
            .map(|&(p, _)| p)
            .collect()
    }

    /// Wires currently bound to a net.
    pub fn wires_of_net(&self, net: usize) -> Vec<usize> {
        self.wire_bindings
            .iter()
            .filter(|&&(_, n, _)| n == net)
            .map(|&(w, _, _)| w)
            .collect()
    }

    /// Total delay cost of a net's bound pips at the given scale, matching
    /// the graph builder's edge cost arithmetic.
    pub fn bound_cost(&self, net: usize, delay_scale: f32) -> i64 {
        self.pips_of_net(net)
            .iter()
            .map(|&p| {
                let pip = &self.pips[p];
                ((pip.delay_ns + self.wires[pip.dst].delay_ns) * delay_scale).round() as i64
            })
            .sum()
    }
}

impl Architecture for TestArch {
    fn wires(&self) -> Box<dyn Iterator<Item = WireHandle> + '_> {
        Box::new((0..self.wires.len()).map(|i| WireHandle(i as u64)))
    }

    fn wire_bounds(&self, wire: WireHandle) -> BoundBox {
        let w = &self.wires[wire.0 as usize];
        BoundBox {
            x0: w.x,
            y0: w.y,
            x1: w.x,
            y1: w.y,
        }
    }

    fn pips_downhill(&self, wire: WireHandle) -> Box<dyn Iterator<Item = PipHandle> + '_> {
        Box::new(
            self.downhill[wire.0 as usize]
                .iter()
                .map(|&p| PipHandle(p as u64)),
        )
    }

    fn pip_available(&self, pip: PipHandle) -> bool {
        self.pips[pip.0 as usize].avail
    }

    fn wire_available(&self, wire: WireHandle) -> bool {
        self.wires[wire.0 as usize].avail
    }

    fn pip_delay_ns(&self, pip: PipHandle) -> f32 {
        self.pips[pip.0 as usize].delay_ns
    }

    fn wire_delay_ns(&self, wire: WireHandle) -> f32 {
        self.wires[wire.0 as usize].delay_ns
    }

    fn pip_dst(&self, pip: PipHandle) -> WireHandle {
        WireHandle(self.pips[pip.0 as usize].dst as u64)
    }

    fn bind_pip(&mut self, pip: PipHandle, net: NetHandle) {
        self.pip_bindings.push((pip.0 as usize, net.0 as usize));
    }

    fn unbind_pip(&mut self, pip: PipHandle) {
        self.pip_bindings.retain(|&(p, _)| p != pip.0 as usize);
    }

    fn bind_wire(&mut self, wire: WireHandle, net: NetHandle, strength: BindStrength) {
        self.wire_bindings
            .push((wire.0 as usize, net.0 as usize, strength));
    }

    fn unbind_wire(&mut self, wire: WireHandle) {
        self.wire_bindings.retain(|&(w, _, _)| w != wire.0 as usize);
    }

    fn ripup_net(&mut self, net: NetHandle) {
        let n = net.0 as usize;
        self.pip_bindings.retain(|&(_, bn)| bn != n);
        self.wire_bindings.retain(|&(_, bn, _)| bn != n);
        self.ripped.push(n);
    }
}

impl NetProvider for TestArch {
    fn nets(&self) -> Vec<NetDesc> {
        self.nets
            .iter()
            .enumerate()
            .map(|(i, net)| {
                let endpoint = |w: usize| Endpoint {
                    wire: WireHandle(w as u64),
                    loc: (self.wires[w].x, self.wires[w].y),
                };
                NetDesc {
                    handle: NetHandle(i as u64),
                    name: net.name.clone(),
                    driver: net.driver.map(endpoint),
                    sinks: net.sinks.iter().map(|&s| endpoint(s)).collect(),
                    bound_wires: net
                        .prebound
                        .iter()
                        .map(|&(w, s)| (WireHandle(w as u64), s))
                        .collect(),
                    criticality: net.criticality,
                }
            })
            .collect()
    }
}
