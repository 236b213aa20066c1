// SPDX-FileCopyrightText: Copyright (c) 2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Compute device abstraction: typed host-mirrored buffers and kernel launch.
//!
//! The router talks to the accelerator exclusively through [`ComputeDevice`]:
//! raw byte allocations, explicit upload/download at scheduler-chosen
//! boundaries, and a kernel-launch primitive taking a kernel identity plus an
//! ordered argument list. [`GpuBuffer`] layers a typed host mirror on top.
//!
//! Device backends (CUDA, Metal, OpenCL) implement this trait outside the
//! core; the in-tree [`crate::cpu::CpuDevice`] is the canonical reference
//! implementation of the kernels and is what the tests run against.

use std::ops::Range;
use thiserror::Error;

/// Failures reported by a compute device. Propagated to the caller
/// unchanged.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Allocation of a device buffer failed.
    #[error("device allocation of {0} bytes failed")]
    Alloc(usize),
    /// A transfer or launch referenced a buffer out of bounds.
    #[error("invalid buffer access: {0}")]
    InvalidAccess(String),
    /// The device does not know the requested kernel.
    #[error("unknown kernel '{0}'")]
    UnknownKernel(String),
    /// A kernel launch failed.
    #[error("kernel launch failed: {0}")]
    Launch(String),
}

/// How the accelerator is allowed to touch a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Device reads only; the host uploads.
    ReadOnly,
    /// Device reads and writes.
    ReadWrite,
    /// Device writes only; the host downloads.
    WriteOnly,
}

/// Handle to a device-resident allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferId(pub u32);

/// One entry of a kernel's ordered argument list.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg {
    /// A device buffer binding.
    Buffer(BufferId),
    /// A 32-bit signed scalar.
    Int(i32),
    /// A 32-bit unsigned scalar.
    UInt(u32),
}

/// The kernel-launch and transfer primitive offered by the environment.
///
/// Offsets and lengths are in bytes. Kernels must provide 32-bit integer
/// atomics (`atomic_min`, `atomic_add`) to their work-items; work-items
/// across workgroups coordinate only through those.
pub trait ComputeDevice {
    /// Allocate `len` bytes of zero-initialized device memory.
    fn alloc(&self, len: usize, access: Access) -> Result<BufferId, DeviceError>;

    /// Copy host bytes into a device buffer at `offset`.
    fn upload(&self, buf: BufferId, offset: usize, data: &[u8]) -> Result<(), DeviceError>;

    /// Copy device bytes at `offset` into host memory.
    fn download(&self, buf: BufferId, offset: usize, out: &mut [u8]) -> Result<(), DeviceError>;

    /// Launch `num_groups` workgroups of `group_size` work-items of the
    /// named kernel. Blocks until the kernel completes.
    fn launch(
        &self,
        kernel: &str,
        num_groups: u32,
        group_size: u32,
        args: &[KernelArg],
    ) -> Result<(), DeviceError>;
}

/// Marker for plain-old-data types that cross the host/device boundary as
/// raw bytes.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` (or a primitive), contain no padding
/// bytes and no pointers, and must tolerate any bit pattern.
pub unsafe trait DevicePod: Copy + Default + 'static {}

unsafe impl DevicePod for u8 {}
unsafe impl DevicePod for i8 {}
unsafe impl DevicePod for i16 {}
unsafe impl DevicePod for u16 {}
unsafe impl DevicePod for u32 {}
unsafe impl DevicePod for i32 {}
unsafe impl DevicePod for f32 {}

/// Reinterpret a typed slice as bytes.
pub fn as_bytes<T: DevicePod>(s: &[T]) -> &[u8] {
    // SAFETY: DevicePod guarantees no padding and no invalid bit patterns.
    unsafe { std::slice::from_raw_parts(s.as_ptr().cast(), std::mem::size_of_val(s)) }
}

/// Reinterpret a typed slice as mutable bytes.
pub fn as_bytes_mut<T: DevicePod>(s: &mut [T]) -> &mut [u8] {
    // SAFETY: as above; any bit pattern written back is a valid T.
    unsafe { std::slice::from_raw_parts_mut(s.as_mut_ptr().cast(), std::mem::size_of_val(s)) }
}

/// A typed device buffer with a host-side mirror.
///
/// The mirror and the device copy are only as coherent as the explicit
/// `upload`/`download` calls make them; the scheduler decides where those
/// boundaries are.
pub struct GpuBuffer<T: DevicePod> {
    host: Vec<T>,
    id: BufferId,
    access: Access,
}

impl<T: DevicePod> GpuBuffer<T> {
    /// Allocate a buffer of `len` elements; the mirror starts out as
    /// `T::default()` and the device copy as zeroes.
    pub fn new(dev: &dyn ComputeDevice, len: usize, access: Access) -> Result<Self, DeviceError> {
        let id = dev.alloc(len * std::mem::size_of::<T>(), access)?;
        Ok(GpuBuffer {
            host: vec![T::default(); len],
            id,
            access,
        })
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.host.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    /// Device handle, for kernel argument lists.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// The host mirror.
    pub fn host(&self) -> &[T] {
        &self.host
    }

    /// The host mirror, mutably.
    pub fn host_mut(&mut self) -> &mut [T] {
        &mut self.host
    }

    /// Copy the whole mirror to the device.
    pub fn upload(&self, dev: &dyn ComputeDevice) -> Result<(), DeviceError> {
        self.upload_range(dev, 0..self.host.len())
    }

    /// Copy `range` of the mirror to the device.
    pub fn upload_range(
        &self,
        dev: &dyn ComputeDevice,
        range: Range<usize>,
    ) -> Result<(), DeviceError> {
        debug_assert!(
            self.access != Access::WriteOnly,
            "uploading into a device-write-only buffer"
        );
        let offset = range.start * std::mem::size_of::<T>();
        dev.upload(self.id, offset, as_bytes(&self.host[range]))
    }

    /// Refresh the whole mirror from the device.
    pub fn download(&mut self, dev: &dyn ComputeDevice) -> Result<(), DeviceError> {
        self.download_range(dev, 0..self.host.len())
    }

    /// Refresh `range` of the mirror from the device.
    pub fn download_range(
        &mut self,
        dev: &dyn ComputeDevice,
        range: Range<usize>,
    ) -> Result<(), DeviceError> {
        debug_assert!(
            self.access != Access::ReadOnly,
            "downloading from a device-read-only buffer"
        );
        let offset = range.start * std::mem::size_of::<T>();
        dev.download(self.id, offset, as_bytes_mut(&mut self.host[range]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuDevice;

    #[test]
    fn mirror_roundtrip() {
        let dev = CpuDevice::new();
        let mut buf = GpuBuffer::<u32>::new(&dev, 16, Access::ReadWrite).unwrap();
        for (i, v) in buf.host_mut().iter_mut().enumerate() {
            *v = i as u32 * 3;
        }
        buf.upload(&dev).unwrap();
        buf.host_mut().fill(0);
        buf.download(&dev).unwrap();
        assert_eq!(buf.host()[5], 15);
        assert_eq!(buf.host()[15], 45);
    }

    #[test]
    fn range_transfers_leave_rest_untouched() {
        let dev = CpuDevice::new();
        let mut buf = GpuBuffer::<i32>::new(&dev, 8, Access::ReadWrite).unwrap();
        buf.host_mut().fill(7);
        buf.upload(&dev).unwrap();
        buf.host_mut()[3] = 42;
        buf.upload_range(&dev, 3..4).unwrap();
        buf.host_mut().fill(0);
        buf.download(&dev).unwrap();
        assert_eq!(buf.host(), &[7, 7, 7, 42, 7, 7, 7, 7]);
    }

    #[test]
    fn out_of_bounds_transfer_is_an_error() {
        let dev = CpuDevice::new();
        let buf = GpuBuffer::<u32>::new(&dev, 4, Access::ReadWrite).unwrap();
        let big = [0u8; 64];
        assert!(matches!(
            dev.upload(buf.id(), 0, &big),
            Err(DeviceError::InvalidAccess(_))
        ));
    }
}
