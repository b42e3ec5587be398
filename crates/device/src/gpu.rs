// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! CUDA device memory through the `cudarc` driver API.
//!
//! Only memory management and copies live here. The device has no kernels,
//! so graphs cannot execute on it yet.

use crate::pool::{BlockPool, PoolMode, RawAllocator};
use crate::{AllocationStats, CopyMode, Device, DeviceKind, DevicePtr, Kernel};
use cudarc::driver::{result, sys, DriverError};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

fn check<T>(what: &str, r: Result<T, DriverError>) -> T {
    match r {
        Ok(v) => v,
        Err(e) => fatal!("CUDA error in {what}: {e:?}"),
    }
}

/// [`RawAllocator`] over `cuMemAlloc`.
#[derive(Debug)]
pub struct CudaAllocator {
    ctx: sys::CUcontext,
}

// SAFETY: the context handle is only used to make it current before driver
// calls; the driver API is thread-safe.
unsafe impl Send for CudaAllocator {}

impl CudaAllocator {
    fn bind(&self) {
        // SAFETY: `ctx` is a retained primary context.
        check("cuCtxSetCurrent", unsafe { result::ctx::set_current(self.ctx) });
    }
}

impl RawAllocator for CudaAllocator {
    fn name(&self) -> &'static str {
        "GpuDevice"
    }

    fn raw_alloc(&mut self, len: usize) -> DevicePtr {
        self.bind();
        // SAFETY: the context is current.
        let addr = check("cuMemAlloc", unsafe { result::malloc_sync(len) });
        match DevicePtr::from_addr(addr as usize) {
            Some(ptr) => ptr,
            None => fatal!("cuMemAlloc({len}) returned a null address"),
        }
    }

    unsafe fn raw_free(&mut self, ptr: DevicePtr, _len: usize) {
        self.bind();
        check("cuMemFree", result::free_sync(ptr.addr() as sys::CUdeviceptr));
    }
}

/// A CUDA GPU: pooled device memory, host staging buffers and one stream.
pub struct GpuDevice {
    device_id: i32,
    cu_device: sys::CUdevice,
    ctx: sys::CUcontext,
    stream: sys::CUstream,
    pool: Mutex<BlockPool<CudaAllocator>>,
    host_blocks: Mutex<HashMap<DevicePtr, usize>>,
}

// SAFETY: the raw handles are driver objects usable from any thread once the
// context is made current, which every entry point does first.
unsafe impl Send for GpuDevice {}
unsafe impl Sync for GpuDevice {}

impl GpuDevice {
    /// Opens GPU `device_id` with the default pool mode.
    pub fn new(device_id: i32) -> Self {
        Self::with_mode(device_id, PoolMode::default())
    }

    /// Opens GPU `device_id`, retaining its primary context and creating
    /// one non-blocking stream.
    pub fn with_mode(device_id: i32, mode: PoolMode) -> Self {
        check("cuInit", result::init());
        let cu_device = check("cuDeviceGet", result::device::get(device_id));
        // SAFETY: `cu_device` is a valid ordinal.
        let ctx = check("cuDevicePrimaryCtxRetain", unsafe { result::primary_ctx::retain(cu_device) });
        // SAFETY: `ctx` was just retained.
        check("cuCtxSetCurrent", unsafe { result::ctx::set_current(ctx) });
        let stream = check("cuStreamCreate", result::stream::create(result::stream::StreamKind::NonBlocking));
        tracing::info!(device_id, ?mode, "gpu device ready");

        Self {
            device_id,
            cu_device,
            ctx,
            stream,
            pool: Mutex::new(BlockPool::new(CudaAllocator { ctx }, mode)),
            host_blocks: Mutex::new(HashMap::new()),
        }
    }

    /// CUDA ordinal of this device.
    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    fn bind(&self) {
        // SAFETY: `ctx` stays retained for the device's lifetime.
        check("cuCtxSetCurrent", unsafe { result::ctx::set_current(self.ctx) });
    }

    fn pool(&self) -> MutexGuard<'_, BlockPool<CudaAllocator>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn host_blocks(&self) -> MutexGuard<'_, HashMap<DevicePtr, usize>> {
        self.host_blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Device for GpuDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Gpu
    }

    fn allocate(&self, len: usize) -> DevicePtr {
        self.pool().allocate(len)
    }

    fn free_device(&self, ptr: DevicePtr) {
        self.pool().free(ptr);
    }

    /// Page-locked staging memory from `cuMemHostAlloc`, so async copies
    /// overlap with the host.
    fn allocate_host(&self, len: usize) -> DevicePtr {
        self.bind();
        // SAFETY: the context is current.
        let addr = check("cuMemHostAlloc", unsafe { result::malloc_host(len.max(1), 0) });
        let Some(ptr) = DevicePtr::from_addr(addr as usize) else {
            fatal!("cuMemHostAlloc({len}) returned a null address");
        };
        self.host_blocks().insert(ptr, len);
        ptr
    }

    fn free_host(&self, ptr: DevicePtr) {
        if self.host_blocks().remove(&ptr).is_none() {
            fatal!("host memory {ptr:?} is not allocated by the GpuDevice");
        }
        self.bind();
        // SAFETY: the block came from `cuMemHostAlloc` above.
        check("cuMemFreeHost", unsafe { result::free_host(ptr.addr() as *mut std::ffi::c_void) });
    }

    unsafe fn host2device_copy(&self, device: DevicePtr, host: *const u8, len: usize, mode: CopyMode) {
        self.bind();
        let src = std::slice::from_raw_parts(host, len);
        let dst = device.addr() as sys::CUdeviceptr;
        match mode {
            CopyMode::Sync => check("cuMemcpyHtoD", result::memcpy_htod_sync(dst, src)),
            CopyMode::Async => check("cuMemcpyHtoDAsync", result::memcpy_htod_async(dst, src, self.stream)),
        }
    }

    unsafe fn device2host_copy(&self, host: *mut u8, device: DevicePtr, len: usize, mode: CopyMode) {
        self.bind();
        let dst = std::slice::from_raw_parts_mut(host, len);
        let src = device.addr() as sys::CUdeviceptr;
        match mode {
            CopyMode::Sync => check("cuMemcpyDtoH", result::memcpy_dtoh_sync(dst, src)),
            CopyMode::Async => check("cuMemcpyDtoHAsync", result::memcpy_dtoh_async(dst, src, self.stream)),
        }
    }

    unsafe fn device2device_copy(&self, dst: DevicePtr, src: DevicePtr, len: usize, mode: CopyMode) {
        self.bind();
        let (dst, src) = (dst.addr() as sys::CUdeviceptr, src.addr() as sys::CUdeviceptr);
        match mode {
            CopyMode::Sync => check("cuMemcpyDtoD", result::memcpy_dtod_sync(dst, src, len)),
            CopyMode::Async => check("cuMemcpyDtoDAsync", result::memcpy_dtod_async(dst, src, len, self.stream)),
        }
    }

    fn synchronize(&self) {
        self.bind();
        // SAFETY: the stream belongs to this device.
        check("cuStreamSynchronize", unsafe { result::stream::synchronize(self.stream) });
    }

    fn kernel(&self) -> Option<&Kernel> {
        None
    }

    fn stats(&self) -> AllocationStats {
        self.pool().stats()
    }

    fn name(&self) -> &'static str {
        "GpuDevice"
    }
}

impl Drop for GpuDevice {
    fn drop(&mut self) {
        self.synchronize();
        for (ptr, len) in std::mem::take(&mut *self.host_blocks()) {
            tracing::warn!(?ptr, len, "pinned host block still allocated at teardown");
            // SAFETY: every entry came from `cuMemHostAlloc`.
            check("cuMemFreeHost", unsafe { result::free_host(ptr.addr() as *mut std::ffi::c_void) });
        }
        // Release pooled blocks while the context is still alive.
        let pool = std::mem::replace(
            &mut *self.pool(),
            BlockPool::new(CudaAllocator { ctx: self.ctx }, PoolMode::Direct),
        );
        drop(pool);
        // SAFETY: no work is queued on the stream any more.
        check("cuStreamDestroy", unsafe { result::stream::destroy(self.stream) });
        // SAFETY: balances the retain in `with_mode`.
        check("cuDevicePrimaryCtxRelease", unsafe { result::primary_ctx::release(self.cu_device) });
    }
}

impl std::fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuDevice")
            .field("device_id", &self.device_id)
            .field("pool", &*self.pool())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "needs a CUDA device"]
    fn test_pinned_staging_round_trip() {
        let gpu = GpuDevice::new(0);
        let host = gpu.allocate_host(256);
        assert_eq!(host.addr() % crate::ALIGN_SIZE, 0);
        let dev = gpu.allocate(256);

        let data: Vec<u8> = (0..=255).collect();
        let mut back = vec![0u8; 256];
        // SAFETY: both host buffers are 256 bytes and outlive the synchronize.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), host.addr() as *mut u8, 256);
            gpu.host2device_copy(dev, host.addr() as *const u8, 256, CopyMode::Async);
            gpu.device2host_copy(back.as_mut_ptr(), dev, 256, CopyMode::Async);
        }
        gpu.synchronize();
        assert_eq!(back, data);

        gpu.free_device(dev);
        gpu.free_host(host);
    }

    #[test]
    #[ignore = "needs a CUDA device"]
    #[should_panic(expected = "not allocated by the GpuDevice")]
    fn test_foreign_host_free_is_fatal() {
        let gpu = GpuDevice::new(0);
        let host = gpu.allocate_host(64);
        gpu.free_host(host);
        gpu.free_host(host);
    }
}
