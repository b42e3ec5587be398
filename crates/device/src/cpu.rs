// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The host device.

use crate::host_alloc::{aligned_alloc, aligned_free, HostAllocator};
use crate::pool::{BlockPool, PoolMode};
use crate::{AllocationStats, CopyMode, Device, DeviceKind, DevicePtr, Kernel};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thread_pool::SpinBudget;

/// Host memory plus a thread-pooled kernel set.
///
/// All allocator state sits behind a mutex. In practice only the thread
/// driving the graph allocates, so the lock is uncontended; workers inside
/// kernels never touch the allocator.
///
/// # Example
/// ```
/// use device::{CpuDevice, Device};
///
/// let dev = CpuDevice::new(2);
/// let a = dev.allocate(1024);
/// dev.free_device(a);
/// // Same size again: served from the free list.
/// let b = dev.allocate(1024);
/// assert_eq!(a, b);
/// assert_eq!(dev.stats().pool_hits, 1);
/// # dev.free_device(b);
/// ```
pub struct CpuDevice {
    pool: Mutex<BlockPool<HostAllocator>>,
    host_blocks: Mutex<HashMap<DevicePtr, usize>>,
    kernel: Kernel,
}

impl CpuDevice {
    /// Creates a CPU device whose kernels run on `nr_threads` participants.
    pub fn new(nr_threads: usize) -> Self {
        Self::with_options(nr_threads, PoolMode::default(), SpinBudget::default())
    }

    /// Creates a CPU device with an explicit pool mode and spin budget.
    pub fn with_options(nr_threads: usize, mode: PoolMode, budget: SpinBudget) -> Self {
        tracing::info!(nr_threads, ?mode, "cpu device ready");
        Self {
            pool: Mutex::new(BlockPool::new(HostAllocator, mode)),
            host_blocks: Mutex::new(HashMap::new()),
            kernel: Kernel::new(nr_threads, budget),
        }
    }

    /// The pool's recycling mode.
    pub fn pool_mode(&self) -> PoolMode {
        self.pool().mode()
    }

    fn pool(&self) -> MutexGuard<'_, BlockPool<HostAllocator>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn host_blocks(&self) -> MutexGuard<'_, HashMap<DevicePtr, usize>> {
        self.host_blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Device for CpuDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn allocate(&self, len: usize) -> DevicePtr {
        self.pool().allocate(len)
    }

    fn free_device(&self, ptr: DevicePtr) {
        self.pool().free(ptr);
    }

    fn allocate_host(&self, len: usize) -> DevicePtr {
        let ptr = aligned_alloc(len);
        self.host_blocks().insert(ptr, len);
        ptr
    }

    fn free_host(&self, ptr: DevicePtr) {
        let Some(len) = self.host_blocks().remove(&ptr) else {
            fatal!("host memory {ptr:?} is not allocated by the CpuDevice");
        };
        // SAFETY: the block came from `aligned_alloc(len)` above.
        unsafe { aligned_free(ptr, len) };
    }

    unsafe fn host2device_copy(&self, device: DevicePtr, host: *const u8, len: usize, _mode: CopyMode) {
        std::ptr::copy_nonoverlapping(host, device.as_ptr(), len);
    }

    unsafe fn device2host_copy(&self, host: *mut u8, device: DevicePtr, len: usize, _mode: CopyMode) {
        std::ptr::copy_nonoverlapping(device.as_ptr(), host, len);
    }

    unsafe fn device2device_copy(&self, dst: DevicePtr, src: DevicePtr, len: usize, _mode: CopyMode) {
        std::ptr::copy(src.as_ptr(), dst.as_ptr(), len);
    }

    fn synchronize(&self) {}

    fn kernel(&self) -> Option<&Kernel> {
        Some(&self.kernel)
    }

    fn stats(&self) -> AllocationStats {
        self.pool().stats()
    }

    fn name(&self) -> &'static str {
        "CpuDevice"
    }
}

impl Drop for CpuDevice {
    fn drop(&mut self) {
        let host = std::mem::take(&mut *self.host_blocks());
        if !host.is_empty() {
            tracing::warn!(blocks = host.len(), "releasing host staging buffers still held at teardown");
        }
        for (ptr, len) in host {
            // SAFETY: every entry came from `aligned_alloc(len)`.
            unsafe { aligned_free(ptr, len) };
        }
        tracing::debug!(stats = %self.pool().stats().summary(), "cpu device teardown");
    }
}

impl std::fmt::Debug for CpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuDevice")
            .field("pool", &*self.pool())
            .field("nr_threads", &self.kernel.nr_threads())
            .finish()
    }
}
