// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Aligned host memory, the platform primitive behind the CPU device.

use crate::pool::RawAllocator;
use crate::DevicePtr;
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Alignment of every block handed out by a device.
pub const ALIGN_SIZE: usize = 32;

fn layout(len: usize) -> Layout {
    match Layout::from_size_align(len.max(1), ALIGN_SIZE) {
        Ok(layout) => layout,
        Err(e) => crate::fatal!("invalid allocation of {len} bytes: {e}"),
    }
}

/// Allocates `len` bytes aligned to [`ALIGN_SIZE`].
///
/// Aborts through [`alloc::handle_alloc_error`] if the system is out of
/// memory.
pub fn aligned_alloc(len: usize) -> DevicePtr {
    let layout = layout(len);
    // SAFETY: `layout` has non-zero size.
    let raw = unsafe { alloc::alloc(layout) };
    match NonNull::new(raw) {
        Some(ptr) => DevicePtr::new(ptr),
        None => alloc::handle_alloc_error(layout),
    }
}

/// Releases a block from [`aligned_alloc`].
///
/// # Safety
/// `ptr` must come from `aligned_alloc(len)` with the same `len` and must not
/// be used afterwards.
pub unsafe fn aligned_free(ptr: DevicePtr, len: usize) {
    alloc::dealloc(ptr.as_ptr(), layout(len));
}

/// [`RawAllocator`] over the system heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostAllocator;

impl RawAllocator for HostAllocator {
    fn name(&self) -> &'static str {
        "CpuDevice"
    }

    fn raw_alloc(&mut self, len: usize) -> DevicePtr {
        aligned_alloc(len)
    }

    unsafe fn raw_free(&mut self, ptr: DevicePtr, len: usize) {
        aligned_free(ptr, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        for len in [1, 7, 32, 33, 4096] {
            let p = aligned_alloc(len);
            assert_eq!(p.addr() % ALIGN_SIZE, 0);
            unsafe { aligned_free(p, len) };
        }
    }

    #[test]
    fn test_zero_length_is_valid() {
        let p = aligned_alloc(0);
        unsafe { aligned_free(p, 0) };
    }
}
