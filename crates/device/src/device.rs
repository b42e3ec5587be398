// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The device abstraction shared by tensors and operators.

use crate::{AllocationStats, DevicePtr, Kernel};
use std::fmt;
use std::str::FromStr;

/// Whether a copy completes before the call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Blocks until the copy is done.
    Sync,
    /// Queues the copy on the device's stream; call
    /// [`Device::synchronize`] before touching either side.
    Async,
}

/// Which kind of device backs a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Gpu => f.write_str("gpu"),
        }
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "gpu" | "cuda" => Ok(Self::Gpu),
            other => Err(format!("unknown device type '{other}' (expected 'cpu' or 'gpu')")),
        }
    }
}

/// A memory space plus the compute attached to it.
///
/// Devices are shared as `Arc<dyn Device>`: every tensor and operator holds
/// a handle to the device it allocates from, and the device outlives all of
/// them. Allocation failures and invariant violations are fatal.
pub trait Device: Send + Sync + fmt::Debug {
    /// The kind of this device.
    fn kind(&self) -> DeviceKind;

    /// Returns a block of at least `len` bytes, aligned to
    /// [`ALIGN_SIZE`](crate::ALIGN_SIZE).
    fn allocate(&self, len: usize) -> DevicePtr;

    /// Returns a block obtained from [`allocate`](Device::allocate).
    fn free_device(&self, ptr: DevicePtr);

    /// Returns host-visible staging memory. Never pooled.
    fn allocate_host(&self, len: usize) -> DevicePtr;

    /// Releases memory from [`allocate_host`](Device::allocate_host).
    fn free_host(&self, ptr: DevicePtr);

    /// Copies `len` bytes from host memory into device memory.
    ///
    /// # Safety
    /// `host` must be readable and `device` writable for `len` bytes, and
    /// both must stay valid until the copy completes (for
    /// [`CopyMode::Async`], until [`synchronize`](Device::synchronize)).
    unsafe fn host2device_copy(&self, device: DevicePtr, host: *const u8, len: usize, mode: CopyMode);

    /// Copies `len` bytes from device memory into host memory.
    ///
    /// # Safety
    /// As for [`host2device_copy`](Device::host2device_copy).
    unsafe fn device2host_copy(&self, host: *mut u8, device: DevicePtr, len: usize, mode: CopyMode);

    /// Copies `len` bytes between two device blocks.
    ///
    /// # Safety
    /// As for [`host2device_copy`](Device::host2device_copy).
    unsafe fn device2device_copy(&self, dst: DevicePtr, src: DevicePtr, len: usize, mode: CopyMode);

    /// Waits for every queued asynchronous operation.
    fn synchronize(&self);

    /// The compute kernels for this device, if it has any.
    fn kernel(&self) -> Option<&Kernel>;

    /// Snapshot of the device's allocation statistics.
    fn stats(&self) -> AllocationStats;

    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;
}
