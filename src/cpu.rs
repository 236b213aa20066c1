// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! CPU reference implementation of the `ocular` kernels.
//!
//! This is the canonical reference for the device programs: every relaxation
//! and queue append follows the contract in [`crate::kernel`] exactly, with
//! workgroups dispatched in parallel through rayon and all cross-workgroup
//! mutation going through real atomics, mirroring the accelerator's memory
//! model. GPU backends are validated against this implementation.
//!
//! Work-items inside a workgroup are folded into the sequential per-group
//! loop; the contract only fixes what a workgroup as a whole observes.

use crate::gpu::{Access, BufferId, ComputeDevice, DeviceError, DevicePod, KernelArg};
use crate::kernel::{
    congestion_penalty, NetConfig, WorkgroupConfig, INF_COST, KERNEL_EXPAND, KERNEL_QUEUE_MIN,
    KERNEL_REFILL, KERNEL_RESET, UNSET_EDGE,
};
use rayon::prelude::*;
use std::cell::RefCell;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// One device allocation. Backed by `u64` words so every typed view is
/// sufficiently aligned.
struct Alloc {
    data: RefCell<Vec<u64>>,
    len: usize,
    #[allow(dead_code)]
    access: Access,
}

/// An in-process compute device.
///
/// Single host thread; kernel launches fan out over rayon internally.
pub struct CpuDevice {
    allocs: RefCell<Vec<Alloc>>,
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuDevice {
    pub fn new() -> Self {
        CpuDevice {
            allocs: RefCell::new(Vec::new()),
        }
    }
}

fn words_for(len: usize) -> usize {
    len.div_ceil(8)
}

/// Read-only typed view of an allocation's bytes.
fn view<T: DevicePod>(words: &[u64], len_bytes: usize) -> &[T] {
    debug_assert!(len_bytes % std::mem::size_of::<T>() == 0);
    // SAFETY: the u64 backing store is aligned for any DevicePod, the byte
    // length is within the allocation, and DevicePod admits any bit pattern.
    unsafe {
        std::slice::from_raw_parts(words.as_ptr() as *const T, len_bytes / std::mem::size_of::<T>())
    }
}

/// Shared-atomic view of an exclusively borrowed allocation.
///
/// The `&mut` origin guarantees no other non-atomic access exists for the
/// lifetime of the view, so handing out `&[AtomicU32]`/`&[AtomicI32]` to
/// concurrently running workgroups is sound.
fn atomic_u32(words: &mut [u64], len_bytes: usize) -> &[AtomicU32] {
    debug_assert!(len_bytes % 4 == 0);
    // SAFETY: AtomicU32 has the same size and bit validity as u32.
    unsafe { std::slice::from_raw_parts(words.as_mut_ptr() as *const AtomicU32, len_bytes / 4) }
}

fn atomic_i32(words: &mut [u64], len_bytes: usize) -> &[AtomicI32] {
    debug_assert!(len_bytes % 4 == 0);
    // SAFETY: as above for AtomicI32/i32.
    unsafe { std::slice::from_raw_parts(words.as_mut_ptr() as *const AtomicI32, len_bytes / 4) }
}

fn arg_buf(args: &[KernelArg], i: usize) -> Result<usize, DeviceError> {
    match args.get(i) {
        Some(KernelArg::Buffer(BufferId(id))) => Ok(*id as usize),
        other => Err(DeviceError::Launch(format!(
            "argument {i} must be a buffer, got {other:?}"
        ))),
    }
}

fn arg_i32(args: &[KernelArg], i: usize) -> Result<i32, DeviceError> {
    match args.get(i) {
        Some(KernelArg::Int(v)) => Ok(*v),
        other => Err(DeviceError::Launch(format!(
            "argument {i} must be an i32 scalar, got {other:?}"
        ))),
    }
}

fn arg_u32(args: &[KernelArg], i: usize) -> Result<u32, DeviceError> {
    match args.get(i) {
        Some(KernelArg::UInt(v)) => Ok(*v),
        other => Err(DeviceError::Launch(format!(
            "argument {i} must be a u32 scalar, got {other:?}"
        ))),
    }
}

/// Resolve buffer argument `i` against the allocation table.
fn get_alloc<'a>(
    allocs: &'a [Alloc],
    args: &[KernelArg],
    i: usize,
) -> Result<&'a Alloc, DeviceError> {
    let idx = arg_buf(args, i)?;
    allocs
        .get(idx)
        .ok_or_else(|| DeviceError::InvalidAccess(format!("unknown buffer arg {i}")))
}

/// Append `node` to a per-workgroup queue. An append beyond capacity is
/// dropped but still counted; the host reads the oversized count as the
/// overflow signal.
fn queue_push(entries: &[AtomicU32], counts: &[AtomicU32], cap: i32, group: usize, node: u32) {
    let cap = cap.max(0) as usize;
    let idx = counts[group].fetch_add(1, Ordering::Relaxed) as usize;
    if idx < cap {
        entries[group * cap + idx].store(node, Ordering::Relaxed);
    }
}

impl ComputeDevice for CpuDevice {
    fn alloc(&self, len: usize, access: Access) -> Result<BufferId, DeviceError> {
        let mut allocs = self.allocs.borrow_mut();
        let id = allocs.len() as u32;
        allocs.push(Alloc {
            data: RefCell::new(vec![0u64; words_for(len)]),
            len,
            access,
        });
        Ok(BufferId(id))
    }

    fn upload(&self, buf: BufferId, offset: usize, data: &[u8]) -> Result<(), DeviceError> {
        let allocs = self.allocs.borrow();
        let alloc = allocs
            .get(buf.0 as usize)
            .ok_or_else(|| DeviceError::InvalidAccess(format!("unknown buffer {buf:?}")))?;
        if offset + data.len() > alloc.len {
            return Err(DeviceError::InvalidAccess(format!(
                "upload of {} bytes at offset {} exceeds buffer of {} bytes",
                data.len(),
                offset,
                alloc.len
            )));
        }
        let mut words = alloc.data.borrow_mut();
        // SAFETY: in-bounds byte view of the u64 backing store.
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, alloc.len)
        };
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn download(&self, buf: BufferId, offset: usize, out: &mut [u8]) -> Result<(), DeviceError> {
        let allocs = self.allocs.borrow();
        let alloc = allocs
            .get(buf.0 as usize)
            .ok_or_else(|| DeviceError::InvalidAccess(format!("unknown buffer {buf:?}")))?;
        if offset + out.len() > alloc.len {
            return Err(DeviceError::InvalidAccess(format!(
                "download of {} bytes at offset {} exceeds buffer of {} bytes",
                out.len(),
                offset,
                alloc.len
            )));
        }
        let words = alloc.data.borrow();
        // SAFETY: in-bounds byte view of the u64 backing store.
        let bytes =
            unsafe { std::slice::from_raw_parts(words.as_ptr() as *const u8, alloc.len) };
        out.copy_from_slice(&bytes[offset..offset + out.len()]);
        Ok(())
    }

    fn launch(
        &self,
        kernel: &str,
        num_groups: u32,
        _group_size: u32,
        args: &[KernelArg],
    ) -> Result<(), DeviceError> {
        match kernel {
            KERNEL_EXPAND => self.k_expand(num_groups, args),
            KERNEL_QUEUE_MIN => self.k_queue_min(num_groups, args),
            KERNEL_REFILL => self.k_refill(num_groups, args),
            KERNEL_RESET => self.k_reset(num_groups, args),
            other => Err(DeviceError::UnknownKernel(other.to_string())),
        }
    }
}

impl CpuDevice {
    fn k_expand(&self, num_groups: u32, args: &[KernelArg]) -> Result<(), DeviceError> {
        let allocs = self.allocs.borrow();
        let a = |i: usize| get_alloc(&allocs, args, i);

        let (a_wg, a_net) = (a(0)?, a(1)?);
        let (a_wx, a_wy) = (a(2)?, a(3)?);
        let (a_adj, a_dst, a_ecost, a_bound) = (a(4)?, a(5)?, a(6)?, a(7)?);
        let (a_cost, a_uphill) = (a(8)?, a(9)?);
        let (a_nsrc, a_nprefix) = (a(10)?, a(11)?);
        let (a_ndst, a_ndst_cnt) = (a(12)?, a(13)?);
        let (a_far, a_far_cnt) = (a(14)?, a(15)?);
        let (a_dirty, a_dirty_cnt) = (a(16)?, a(17)?);
        let base_present = arg_u32(args, 18)?;

        let g_wg = a_wg.data.borrow();
        let wg: &[WorkgroupConfig] = view(&g_wg, a_wg.len);
        let g_net = a_net.data.borrow();
        let nets: &[NetConfig] = view(&g_net, a_net.len);
        let g_wx = a_wx.data.borrow();
        let wire_x: &[i16] = view(&g_wx, a_wx.len);
        let g_wy = a_wy.data.borrow();
        let wire_y: &[i16] = view(&g_wy, a_wy.len);
        let g_adj = a_adj.data.borrow();
        let adj_offset: &[u32] = view(&g_adj, a_adj.len);
        let g_dst = a_dst.data.borrow();
        let edge_dst: &[u32] = view(&g_dst, a_dst.len);
        let g_ecost = a_ecost.data.borrow();
        let edge_cost: &[i32] = view(&g_ecost, a_ecost.len);
        let g_bound = a_bound.data.borrow();
        let bound_count: &[u8] = view(&g_bound, a_bound.len);
        let g_nsrc = a_nsrc.data.borrow();
        let near_src: &[u32] = view(&g_nsrc, a_nsrc.len);
        let g_nprefix = a_nprefix.data.borrow();
        let near_prefix: &[u32] = view(&g_nprefix, a_nprefix.len);

        let mut g_cost = a_cost.data.borrow_mut();
        let cost = atomic_i32(&mut g_cost, a_cost.len);
        let mut g_uphill = a_uphill.data.borrow_mut();
        let uphill = atomic_u32(&mut g_uphill, a_uphill.len);
        let mut g_ndst = a_ndst.data.borrow_mut();
        let near_dst = atomic_u32(&mut g_ndst, a_ndst.len);
        let mut g_ndst_cnt = a_ndst_cnt.data.borrow_mut();
        let near_dst_count = atomic_u32(&mut g_ndst_cnt, a_ndst_cnt.len);
        let mut g_far = a_far.data.borrow_mut();
        let far = atomic_u32(&mut g_far, a_far.len);
        let mut g_far_cnt = a_far_cnt.data.borrow_mut();
        let far_count = atomic_u32(&mut g_far_cnt, a_far_cnt.len);
        let mut g_dirty = a_dirty.data.borrow_mut();
        let dirty = atomic_u32(&mut g_dirty, a_dirty.len);
        let mut g_dirty_cnt = a_dirty_cnt.data.borrow_mut();
        let dirty_count = atomic_u32(&mut g_dirty_cnt, a_dirty_cnt.len);

        let num_groups = (num_groups as usize).min(wg.len());
        (0..num_groups).into_par_iter().for_each(|g| {
            let slot = wg[g].net;
            if slot < 0 || slot as usize >= nets.len() {
                return;
            }
            let c = &nets[slot as usize];
            let ns = c.net_start as usize;
            let ne = c.net_end as usize;
            if g < ns || g >= ne || ne > near_prefix.len() {
                return;
            }
            let prefix = &near_prefix[ns..ne];
            let total = *prefix.last().unwrap_or(&0) as usize;
            let group_nodes = c.group_nodes.max(0) as usize;
            let begin = (g - ns) * group_nodes;
            let end = total.min(begin + group_nodes);
            let near_cap = c.near_queue_size.max(0) as usize;
            let num_net_groups = ne - ns;

            for p in begin..end {
                // Locate the source workgroup holding work position p.
                let rel = prefix.partition_point(|&s| s as usize <= p);
                let before = if rel == 0 { 0 } else { prefix[rel - 1] as usize };
                let u = near_src[(ns + rel) * near_cap + (p - before)] as usize;

                let cu = cost[u].load(Ordering::Relaxed);
                if cu >= INF_COST {
                    continue;
                }
                let lo = adj_offset[u] as usize;
                let hi = adj_offset[u + 1] as usize;
                for e in lo..hi {
                    let v = edge_dst[e] as usize;
                    let (vx, vy) = (wire_x[v], wire_y[v]);
                    if vx < c.x0 || vx > c.x1 || vy < c.y0 || vy > c.y1 {
                        continue;
                    }
                    let pen = congestion_penalty(base_present, bound_count[v], c.curr_cong_cost);
                    let nc64 = cu as i64 + edge_cost[e] as i64 + pen as i64;
                    if nc64 >= INF_COST as i64 {
                        continue;
                    }
                    let nc = nc64 as i32;
                    let old = cost[v].fetch_min(nc, Ordering::Relaxed);
                    if nc < old {
                        uphill[v].store(e as u32, Ordering::Relaxed);
                        let tgt = ns + v % num_net_groups;
                        if old >= INF_COST {
                            queue_push(dirty, dirty_count, c.dirty_queue_size, tgt, v as u32);
                        }
                        if nc < c.near_far_thresh {
                            queue_push(near_dst, near_dst_count, c.near_queue_size, tgt, v as u32);
                        } else {
                            queue_push(far, far_count, c.far_queue_size, tgt, v as u32);
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn k_queue_min(&self, num_groups: u32, args: &[KernelArg]) -> Result<(), DeviceError> {
        let allocs = self.allocs.borrow();
        let a = |i: usize| get_alloc(&allocs, args, i);
        let (a_wg, a_net, a_cost) = (a(0)?, a(1)?, a(2)?);
        let (a_near, a_near_cnt, a_far, a_far_cnt) = (a(3)?, a(4)?, a(5)?, a(6)?);
        let (a_qmin, a_fmin) = (a(7)?, a(8)?);

        let g_wg = a_wg.data.borrow();
        let wg: &[WorkgroupConfig] = view(&g_wg, a_wg.len);
        let g_net = a_net.data.borrow();
        let nets: &[NetConfig] = view(&g_net, a_net.len);
        let g_cost = a_cost.data.borrow();
        let cost: &[i32] = view(&g_cost, a_cost.len);
        let g_near = a_near.data.borrow();
        let near: &[u32] = view(&g_near, a_near.len);
        let g_near_cnt = a_near_cnt.data.borrow();
        let near_count: &[u32] = view(&g_near_cnt, a_near_cnt.len);
        let g_far = a_far.data.borrow();
        let far: &[u32] = view(&g_far, a_far.len);
        let g_far_cnt = a_far_cnt.data.borrow();
        let far_count: &[u32] = view(&g_far_cnt, a_far_cnt.len);

        let mut g_qmin = a_qmin.data.borrow_mut();
        let queue_min = atomic_i32(&mut g_qmin, a_qmin.len);
        let mut g_fmin = a_fmin.data.borrow_mut();
        let far_min = atomic_i32(&mut g_fmin, a_fmin.len);

        let num_groups = (num_groups as usize).min(wg.len());
        (0..num_groups).into_par_iter().for_each(|g| {
            let slot = wg[g].net;
            if slot < 0 || slot as usize >= nets.len() {
                queue_min[g].store(INF_COST, Ordering::Relaxed);
                far_min[g].store(INF_COST, Ordering::Relaxed);
                return;
            }
            let c = &nets[slot as usize];
            let near_cap = c.near_queue_size.max(0) as usize;
            let far_cap = c.far_queue_size.max(0) as usize;

            let mut nmin = INF_COST;
            let n = (near_count[g] as usize).min(near_cap);
            for i in 0..n {
                nmin = nmin.min(cost[near[g * near_cap + i] as usize]);
            }
            let mut fmin = INF_COST;
            let n = (far_count[g] as usize).min(far_cap);
            for i in 0..n {
                fmin = fmin.min(cost[far[g * far_cap + i] as usize]);
            }
            queue_min[g].store(nmin.min(fmin), Ordering::Relaxed);
            far_min[g].store(fmin, Ordering::Relaxed);
        });
        Ok(())
    }

    fn k_refill(&self, num_groups: u32, args: &[KernelArg]) -> Result<(), DeviceError> {
        let allocs = self.allocs.borrow();
        let a = |i: usize| get_alloc(&allocs, args, i);
        let (a_wg, a_net, a_cost) = (a(0)?, a(1)?, a(2)?);
        let (a_near, a_near_cnt, a_far, a_far_cnt) = (a(3)?, a(4)?, a(5)?, a(6)?);
        let slot_filter = arg_i32(args, 7)?;

        let g_wg = a_wg.data.borrow();
        let wg: &[WorkgroupConfig] = view(&g_wg, a_wg.len);
        let g_net = a_net.data.borrow();
        let nets: &[NetConfig] = view(&g_net, a_net.len);
        let g_cost = a_cost.data.borrow();
        let cost: &[i32] = view(&g_cost, a_cost.len);

        let mut g_near = a_near.data.borrow_mut();
        let near = atomic_u32(&mut g_near, a_near.len);
        let mut g_near_cnt = a_near_cnt.data.borrow_mut();
        let near_count = atomic_u32(&mut g_near_cnt, a_near_cnt.len);
        let mut g_far = a_far.data.borrow_mut();
        let far = atomic_u32(&mut g_far, a_far.len);
        let mut g_far_cnt = a_far_cnt.data.borrow_mut();
        let far_count = atomic_u32(&mut g_far_cnt, a_far_cnt.len);

        let num_groups = (num_groups as usize).min(wg.len());
        (0..num_groups).into_par_iter().for_each(|g| {
            let slot = wg[g].net;
            if slot < 0 || slot != slot_filter || slot as usize >= nets.len() {
                return;
            }
            let c = &nets[slot as usize];
            let near_cap = c.near_queue_size.max(0) as usize;
            let far_cap = c.far_queue_size.max(0) as usize;
            let thresh = c.near_far_thresh;

            let mut ncount = (near_count[g].load(Ordering::Relaxed) as usize).min(near_cap);
            let fcount = (far_count[g].load(Ordering::Relaxed) as usize).min(far_cap);
            let mut kept = 0usize;
            for i in 0..fcount {
                let v = far[g * far_cap + i].load(Ordering::Relaxed);
                if cost[v as usize] <= thresh && ncount < near_cap {
                    near[g * near_cap + ncount].store(v, Ordering::Relaxed);
                    ncount += 1;
                } else {
                    far[g * far_cap + kept].store(v, Ordering::Relaxed);
                    kept += 1;
                }
            }
            near_count[g].store(ncount as u32, Ordering::Relaxed);
            far_count[g].store(kept as u32, Ordering::Relaxed);
        });
        Ok(())
    }

    fn k_reset(&self, num_groups: u32, args: &[KernelArg]) -> Result<(), DeviceError> {
        let allocs = self.allocs.borrow();
        let a = |i: usize| get_alloc(&allocs, args, i);
        let (a_wg, a_net, a_cost, a_uphill) = (a(0)?, a(1)?, a(2)?, a(3)?);
        let (a_dirty, a_dirty_cnt) = (a(4)?, a(5)?);
        let (a_ncnt_a, a_ncnt_b, a_far_cnt) = (a(6)?, a(7)?, a(8)?);
        let slot_filter = arg_i32(args, 9)?;

        let g_wg = a_wg.data.borrow();
        let wg: &[WorkgroupConfig] = view(&g_wg, a_wg.len);
        let g_net = a_net.data.borrow();
        let nets: &[NetConfig] = view(&g_net, a_net.len);
        let g_dirty = a_dirty.data.borrow();
        let dirty: &[u32] = view(&g_dirty, a_dirty.len);

        let mut g_cost = a_cost.data.borrow_mut();
        let cost = atomic_i32(&mut g_cost, a_cost.len);
        let mut g_uphill = a_uphill.data.borrow_mut();
        let uphill = atomic_u32(&mut g_uphill, a_uphill.len);
        let mut g_dirty_cnt = a_dirty_cnt.data.borrow_mut();
        let dirty_count = atomic_u32(&mut g_dirty_cnt, a_dirty_cnt.len);
        let mut g_ncnt_a = a_ncnt_a.data.borrow_mut();
        let near_count_a = atomic_u32(&mut g_ncnt_a, a_ncnt_a.len);
        let mut g_ncnt_b = a_ncnt_b.data.borrow_mut();
        let near_count_b = atomic_u32(&mut g_ncnt_b, a_ncnt_b.len);
        let mut g_far_cnt = a_far_cnt.data.borrow_mut();
        let far_count = atomic_u32(&mut g_far_cnt, a_far_cnt.len);

        let num_groups = (num_groups as usize).min(wg.len());
        (0..num_groups).into_par_iter().for_each(|g| {
            let slot = wg[g].net;
            if slot < 0 || slot != slot_filter || slot as usize >= nets.len() {
                return;
            }
            let c = &nets[slot as usize];
            let dirty_cap = c.dirty_queue_size.max(0) as usize;
            let n = (dirty_count[g].load(Ordering::Relaxed) as usize).min(dirty_cap);
            for i in 0..n {
                let node = dirty[g * dirty_cap + i] as usize;
                cost[node].store(INF_COST, Ordering::Relaxed);
                uphill[node].store(UNSET_EDGE, Ordering::Relaxed);
            }
            dirty_count[g].store(0, Ordering::Relaxed);
            near_count_a[g].store(0, Ordering::Relaxed);
            near_count_b[g].store(0, Ordering::Relaxed);
            far_count[g].store(0, Ordering::Relaxed);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::GpuBuffer;

    /// Hand-built launch of one expand step over a 3-wire fan:
    /// 0 -> 1 (cost 10), 0 -> 2 (cost 90000), driver 0 at cost 0.
    /// Wires sit at x = 0, 1, 2 on row 0; `x1` trims the bounding box.
    fn expand_fixture(
        thresh: i32,
        x1: i16,
    ) -> (CpuDevice, Vec<GpuBuffer<u32>>, GpuBuffer<i32>, GpuBuffer<u32>) {
        let dev = CpuDevice::new();
        let w = 3usize;
        let cap = 8i32;

        let mut wg = GpuBuffer::<WorkgroupConfig>::new(&dev, 1, Access::ReadOnly).unwrap();
        wg.host_mut()[0] = WorkgroupConfig { net: 0, size: 1 };
        wg.upload(&dev).unwrap();

        let mut net = GpuBuffer::<NetConfig>::new(&dev, 1, Access::ReadOnly).unwrap();
        net.host_mut()[0] = NetConfig {
            x0: 0,
            y0: 0,
            x1,
            y1: 3,
            near_queue_size: cap,
            far_queue_size: cap,
            dirty_queue_size: cap,
            net_start: 0,
            net_end: 1,
            curr_cong_cost: 1.0,
            near_far_thresh: thresh,
            group_nodes: 8,
        };
        net.upload(&dev).unwrap();

        let mut wire_x = GpuBuffer::<i16>::new(&dev, w, Access::ReadOnly).unwrap();
        wire_x.host_mut().copy_from_slice(&[0, 1, 2]);
        wire_x.upload(&dev).unwrap();
        let mut wire_y = GpuBuffer::<i16>::new(&dev, w, Access::ReadOnly).unwrap();
        wire_y.host_mut().copy_from_slice(&[0, 0, 0]);
        wire_y.upload(&dev).unwrap();

        let mut adj = GpuBuffer::<u32>::new(&dev, w + 1, Access::ReadOnly).unwrap();
        adj.host_mut().copy_from_slice(&[0, 2, 2, 2]);
        adj.upload(&dev).unwrap();
        let mut dst = GpuBuffer::<u32>::new(&dev, 2, Access::ReadOnly).unwrap();
        dst.host_mut().copy_from_slice(&[1, 2]);
        dst.upload(&dev).unwrap();
        let mut ecost = GpuBuffer::<i32>::new(&dev, 2, Access::ReadOnly).unwrap();
        ecost.host_mut().copy_from_slice(&[10, 90000]);
        ecost.upload(&dev).unwrap();
        let bound = GpuBuffer::<u8>::new(&dev, w, Access::ReadOnly).unwrap();
        bound.upload(&dev).unwrap();

        let mut cost = GpuBuffer::<i32>::new(&dev, w, Access::ReadWrite).unwrap();
        cost.host_mut().fill(INF_COST);
        cost.host_mut()[0] = 0;
        cost.upload(&dev).unwrap();
        let mut uphill = GpuBuffer::<u32>::new(&dev, w, Access::ReadWrite).unwrap();
        uphill.host_mut().fill(UNSET_EDGE);
        uphill.upload(&dev).unwrap();

        let mut near_src = GpuBuffer::<u32>::new(&dev, cap as usize, Access::ReadWrite).unwrap();
        near_src.host_mut()[0] = 0; // the driver
        near_src.upload(&dev).unwrap();
        let mut near_prefix = GpuBuffer::<u32>::new(&dev, 1, Access::ReadOnly).unwrap();
        near_prefix.host_mut()[0] = 1;
        near_prefix.upload(&dev).unwrap();
        let near_dst = GpuBuffer::<u32>::new(&dev, cap as usize, Access::ReadWrite).unwrap();
        let near_dst_cnt = GpuBuffer::<u32>::new(&dev, 1, Access::ReadWrite).unwrap();
        let far = GpuBuffer::<u32>::new(&dev, cap as usize, Access::ReadWrite).unwrap();
        let far_cnt = GpuBuffer::<u32>::new(&dev, 1, Access::ReadWrite).unwrap();
        let dirty = GpuBuffer::<u32>::new(&dev, cap as usize, Access::ReadWrite).unwrap();
        let dirty_cnt = GpuBuffer::<u32>::new(&dev, 1, Access::ReadWrite).unwrap();

        let args = vec![
            KernelArg::Buffer(wg.id()),
            KernelArg::Buffer(net.id()),
            KernelArg::Buffer(wire_x.id()),
            KernelArg::Buffer(wire_y.id()),
            KernelArg::Buffer(adj.id()),
            KernelArg::Buffer(dst.id()),
            KernelArg::Buffer(ecost.id()),
            KernelArg::Buffer(bound.id()),
            KernelArg::Buffer(cost.id()),
            KernelArg::Buffer(uphill.id()),
            KernelArg::Buffer(near_src.id()),
            KernelArg::Buffer(near_prefix.id()),
            KernelArg::Buffer(near_dst.id()),
            KernelArg::Buffer(near_dst_cnt.id()),
            KernelArg::Buffer(far.id()),
            KernelArg::Buffer(far_cnt.id()),
            KernelArg::Buffer(dirty.id()),
            KernelArg::Buffer(dirty_cnt.id()),
            KernelArg::UInt(0),
        ];
        dev.launch(KERNEL_EXPAND, 1, 1, &args).unwrap();

        // Return the buffers the assertions need.
        (dev, vec![near_dst, near_dst_cnt, far, far_cnt, dirty, dirty_cnt], cost, uphill)
    }

    #[test]
    fn expand_splits_near_and_far_by_threshold() {
        let (dev, mut queues, mut cost, mut uphill) = expand_fixture(1000, 3);
        cost.download(&dev).unwrap();
        uphill.download(&dev).unwrap();
        assert_eq!(cost.host(), &[0, 10, 90000]);
        assert_eq!(uphill.host()[1], 0);
        assert_eq!(uphill.host()[2], 1);

        queues[1].download(&dev).unwrap();
        queues[3].download(&dev).unwrap();
        queues[5].download(&dev).unwrap();
        assert_eq!(queues[1].host()[0], 1); // node 1 at cost 10 < 1000
        assert_eq!(queues[3].host()[0], 1); // node 2 at cost 90000
        assert_eq!(queues[5].host()[0], 2); // both first visits

        queues[0].download(&dev).unwrap();
        assert_eq!(queues[0].host()[0], 1);
        queues[2].download(&dev).unwrap();
        assert_eq!(queues[2].host()[0], 2);
    }

    #[test]
    fn expand_ignores_nodes_outside_bounding_box() {
        // Shrink the box so wire 2 at x = 2 is excluded.
        let (dev, mut queues, mut cost, _) = expand_fixture(1000, 1);
        cost.download(&dev).unwrap();
        assert_eq!(cost.host()[2], INF_COST);
        queues[3].download(&dev).unwrap();
        assert_eq!(queues[3].host()[0], 0);
    }

    #[test]
    fn reset_restores_unvisited_state() {
        let (dev, queues, mut cost, mut uphill) = expand_fixture(1000, 3);
        // queues: [near_dst, near_dst_cnt, far, far_cnt, dirty, dirty_cnt]
        // Reuse the dirty list to reset everything touched by the step.
        let mut wg = GpuBuffer::<WorkgroupConfig>::new(&dev, 1, Access::ReadOnly).unwrap();
        wg.host_mut()[0] = WorkgroupConfig { net: 0, size: 1 };
        wg.upload(&dev).unwrap();
        let mut net = GpuBuffer::<NetConfig>::new(&dev, 1, Access::ReadOnly).unwrap();
        net.host_mut()[0] = NetConfig {
            dirty_queue_size: 8,
            net_start: 0,
            net_end: 1,
            ..Default::default()
        };
        net.upload(&dev).unwrap();
        let other_near_cnt = GpuBuffer::<u32>::new(&dev, 1, Access::ReadWrite).unwrap();
        let args = vec![
            KernelArg::Buffer(wg.id()),
            KernelArg::Buffer(net.id()),
            KernelArg::Buffer(cost.id()),
            KernelArg::Buffer(uphill.id()),
            KernelArg::Buffer(queues[4].id()),
            KernelArg::Buffer(queues[5].id()),
            KernelArg::Buffer(queues[1].id()),
            KernelArg::Buffer(other_near_cnt.id()),
            KernelArg::Buffer(queues[3].id()),
            KernelArg::Int(0),
        ];
        dev.launch(KERNEL_RESET, 1, 1, &args).unwrap();

        cost.download(&dev).unwrap();
        uphill.download(&dev).unwrap();
        // Nodes 1 and 2 were dirtied and are back to unvisited; the driver
        // was seeded by the host and is reset by the host when reseeding.
        assert_eq!(cost.host()[1], INF_COST);
        assert_eq!(cost.host()[2], INF_COST);
        assert_eq!(uphill.host()[1], UNSET_EDGE);
        assert_eq!(uphill.host()[2], UNSET_EDGE);
    }

    #[test]
    fn unknown_kernel_is_rejected() {
        let dev = CpuDevice::new();
        assert!(matches!(
            dev.launch("nonexistent", 1, 1, &[]),
            Err(DeviceError::UnknownKernel(_))
        ));
    }

    #[test]
    fn queue_overflow_counts_past_capacity() {
        let entries: Vec<AtomicU32> = (0..4).map(|_| AtomicU32::new(0)).collect();
        let counts: Vec<AtomicU32> = (0..1).map(|_| AtomicU32::new(0)).collect();
        for v in 0..10u32 {
            queue_push(&entries, &counts, 4, 0, v);
        }
        // All ten appends counted, only four landed.
        assert_eq!(counts[0].load(Ordering::Relaxed), 10);
        assert_eq!(entries[3].load(Ordering::Relaxed), 3);
    }
}
