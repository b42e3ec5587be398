// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Scratch memory shared by every operator of a graph.

use device::{infer_assert, Device, DeviceKind, DevicePtr};
use std::sync::Arc;

/// One device block sized for the hungriest operator.
///
/// Operators run one at a time, so they all borrow the same block.
pub struct WorkSpace {
    device: Arc<dyn Device>,
    ptr: Option<DevicePtr>,
    len: usize,
}

impl WorkSpace {
    /// Allocates `len` bytes; a zero-byte workspace holds no block.
    pub fn new(device: Arc<dyn Device>, len: usize) -> Self {
        let ptr = (len > 0).then(|| device.allocate(len));
        Self { device, ptr, len }
    }

    /// Capacity in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn ptr(&self) -> Option<DevicePtr> {
        self.ptr
    }

    /// The first `n` floats of the workspace.
    ///
    /// Asking for more than was reserved is fatal.
    pub fn f32_mut(&mut self, n: usize) -> &mut [f32] {
        let bytes = n * std::mem::size_of::<f32>();
        infer_assert!(bytes <= self.len, "workspace underflow: need {bytes} bytes, have {}", self.len);
        infer_assert!(
            self.device.kind() == DeviceKind::Cpu,
            "workspace on {} is not host addressable",
            self.device.name()
        );
        match self.ptr {
            // SAFETY: the block holds `len >= bytes` bytes, is 32-byte
            // aligned, and `&mut self` makes this the only view.
            Some(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr().cast::<f32>(), n) },
            None => &mut [],
        }
    }
}

impl Drop for WorkSpace {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            self.device.free_device(ptr);
        }
    }
}

impl std::fmt::Debug for WorkSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkSpace")
            .field("device", &self.device.name())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device::CpuDevice;

    #[test]
    fn test_empty_workspace_allocates_nothing() {
        let dev: Arc<dyn Device> = Arc::new(CpuDevice::new(1));
        let mut ws = WorkSpace::new(dev.clone(), 0);
        assert!(ws.is_empty());
        assert!(ws.f32_mut(0).is_empty());
        assert_eq!(dev.stats().total_allocations, 0);
    }

    #[test]
    fn test_workspace_returned_on_drop() {
        let dev: Arc<dyn Device> = Arc::new(CpuDevice::new(1));
        {
            let mut ws = WorkSpace::new(dev.clone(), 64);
            ws.f32_mut(16).fill(1.0);
            assert_eq!(dev.stats().live_bytes, 64);
        }
        assert_eq!(dev.stats().live_bytes, 0);
    }

    #[test]
    #[should_panic(expected = "workspace underflow")]
    fn test_underflow_is_fatal() {
        let dev: Arc<dyn Device> = Arc::new(CpuDevice::new(1));
        let mut ws = WorkSpace::new(dev, 16);
        let _ = ws.f32_mut(5);
    }
}
