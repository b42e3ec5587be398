// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Allocation statistics for profiling and diagnostics.
//!
//! [`AllocationStats`] tracks how well the block pool recycles memory: how
//! many requests were served from the free list, how much memory was ever
//! reserved from the platform, and the live high-water mark.

/// Cumulative statistics about a device's block pool.
///
/// Byte counters use the recorded block size, which may exceed the requested
/// length when best-fit hands out a larger block.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct AllocationStats {
    /// Total number of allocation requests.
    pub total_allocations: u64,
    /// Requests served from the free list.
    pub pool_hits: u64,
    /// Requests that reached the platform allocator.
    pub fresh_allocations: u64,
    /// Blocks returned with `free_device`.
    pub total_frees: u64,
    /// Bytes in blocks currently handed out.
    pub live_bytes: usize,
    /// Bytes in blocks sitting in the free list.
    pub pooled_bytes: usize,
    /// Bytes obtained from the platform and not yet released.
    pub reserved_bytes: usize,
    /// High-water mark of `live_bytes`.
    pub peak_live_bytes: usize,
}

impl AllocationStats {
    /// Returns the fraction of requests served from the free list.
    ///
    /// Returns `0.0` if no allocations have been made.
    pub fn hit_ratio(&self) -> f64 {
        if self.total_allocations == 0 {
            return 0.0;
        }
        self.pool_hits as f64 / self.total_allocations as f64
    }

    pub(crate) fn record_hit(&mut self, block_size: usize) {
        self.total_allocations += 1;
        self.pool_hits += 1;
        self.pooled_bytes -= block_size;
        self.add_live(block_size);
    }

    pub(crate) fn record_fresh(&mut self, block_size: usize) {
        self.total_allocations += 1;
        self.fresh_allocations += 1;
        self.reserved_bytes += block_size;
        self.add_live(block_size);
    }

    /// A block went back to the free list.
    pub(crate) fn record_pooled_free(&mut self, block_size: usize) {
        self.total_frees += 1;
        self.live_bytes -= block_size;
        self.pooled_bytes += block_size;
    }

    /// A block went straight back to the platform.
    pub(crate) fn record_direct_free(&mut self, block_size: usize) {
        self.total_frees += 1;
        self.live_bytes -= block_size;
        self.reserved_bytes -= block_size;
    }

    fn add_live(&mut self, block_size: usize) {
        self.live_bytes += block_size;
        self.peak_live_bytes = self.peak_live_bytes.max(self.live_bytes);
    }

    /// Returns a human-readable summary.
    pub fn summary(&self) -> String {
        const MB: f64 = 1024.0 * 1024.0;
        format!(
            "Allocations: {} total ({} pooled, {} fresh, {:.0}% hit rate), {} frees, \
             live {:.2} MB, pooled {:.2} MB, reserved {:.2} MB, peak {:.2} MB",
            self.total_allocations,
            self.pool_hits,
            self.fresh_allocations,
            self.hit_ratio() * 100.0,
            self.total_frees,
            self.live_bytes as f64 / MB,
            self.pooled_bytes as f64 / MB,
            self.reserved_bytes as f64 / MB,
            self.peak_live_bytes as f64 / MB,
        )
    }
}
