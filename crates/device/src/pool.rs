// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Best-fit block pool shared by every device.
//!
//! The [`BlockPool`] sits between a device and its platform allocator. It:
//!
//! 1. Records every block ever obtained from the platform in an allocation
//!    table (address → true size, in-use marker).
//! 2. Keeps returned blocks in a free list bucketed by exact recorded size.
//!    A request is served from the smallest bucket whose size is ≥ the
//!    request, so a block may be handed out larger than asked for.
//! 3. Returns memory to the platform only when the pool is dropped.
//!
//! # Size Classes
//! Unlike a power-of-two binned allocator, buckets are keyed by the size of
//! the first request that created the block. A graph re-executes the same
//! request sequence every pass, so after the first pass every request hits
//! its own bucket exactly.
//!
//! # Direct Mode
//! [`PoolMode::Direct`] sends every request straight to the platform. It is
//! the default when the crate is built with the `direct-alloc` feature, so
//! sanitizers and leak checkers see every buffer.

use crate::{AllocationStats, DevicePtr};
use std::collections::{BTreeMap, HashMap};

/// The platform primitive a [`BlockPool`] draws from.
pub trait RawAllocator: Send {
    /// Device name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Obtains `len` bytes from the platform. Failure is fatal.
    fn raw_alloc(&mut self, len: usize) -> DevicePtr;

    /// Returns a block to the platform.
    ///
    /// # Safety
    /// `ptr` must come from `raw_alloc(len)` on this allocator and must not
    /// be used afterwards.
    unsafe fn raw_free(&mut self, ptr: DevicePtr, len: usize);
}

/// Whether freed blocks are recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// Freed blocks go to the free list and are reused best-fit.
    Pooled,
    /// Every allocate and free reaches the platform.
    Direct,
}

impl Default for PoolMode {
    fn default() -> Self {
        if cfg!(feature = "direct-alloc") {
            Self::Direct
        } else {
            Self::Pooled
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Block {
    size: usize,
    in_use: bool,
}

/// A best-fit pooled allocator over a [`RawAllocator`].
///
/// Not internally synchronised; devices wrap it in a `Mutex`.
pub struct BlockPool<A: RawAllocator> {
    raw: A,
    mode: PoolMode,
    /// Every block obtained from the platform and not yet released.
    blocks: HashMap<DevicePtr, Block>,
    /// Free blocks bucketed by recorded size. Buckets are never empty.
    free: BTreeMap<usize, Vec<DevicePtr>>,
    stats: AllocationStats,
}

impl<A: RawAllocator> BlockPool<A> {
    /// Creates an empty pool.
    pub fn new(raw: A, mode: PoolMode) -> Self {
        Self {
            raw,
            mode,
            blocks: HashMap::new(),
            free: BTreeMap::new(),
            stats: AllocationStats::default(),
        }
    }

    /// Returns a block of at least `len` bytes.
    ///
    /// Zero-length requests are served as one byte.
    pub fn allocate(&mut self, len: usize) -> DevicePtr {
        let len = len.max(1);
        if self.mode == PoolMode::Pooled {
            if let Some(ptr) = self.take_best_fit(len) {
                return ptr;
            }
        }

        let ptr = self.raw.raw_alloc(len);
        let previous = self.blocks.insert(ptr, Block { size: len, in_use: true });
        infer_assert!(
            previous.is_none(),
            "{} returned {ptr:?} which is already tracked",
            self.raw.name()
        );
        self.stats.record_fresh(len);
        ptr
    }

    fn take_best_fit(&mut self, len: usize) -> Option<DevicePtr> {
        let (size, ptr, drained) = self
            .free
            .range_mut(len..)
            .next()
            .map(|(&size, ptrs)| (size, ptrs.pop(), ptrs.is_empty()))?;
        if drained {
            self.free.remove(&size);
        }
        let Some(ptr) = ptr else {
            fatal!("free list bucket {size} was empty");
        };

        match self.blocks.get_mut(&ptr) {
            Some(block) if !block.in_use && block.size == size => block.in_use = true,
            other => fatal!("free list entry {ptr:?} ({size} bytes) disagrees with table: {other:?}"),
        }
        self.stats.record_hit(size);
        Some(ptr)
    }

    /// Returns a block to the pool.
    ///
    /// Freeing a pointer this pool never handed out, or freeing a block
    /// twice, is fatal.
    pub fn free(&mut self, ptr: DevicePtr) {
        let Some(block) = self.blocks.get_mut(&ptr) else {
            fatal!("memory {ptr:?} is not allocated by the {}", self.raw.name());
        };
        infer_assert!(block.in_use, "double free of {ptr:?} ({} bytes)", block.size);
        let size = block.size;

        match self.mode {
            PoolMode::Pooled => {
                block.in_use = false;
                self.free.entry(size).or_default().push(ptr);
                self.stats.record_pooled_free(size);
            }
            PoolMode::Direct => {
                self.blocks.remove(&ptr);
                // SAFETY: the block came from `raw_alloc(size)` and is no
                // longer tracked.
                unsafe { self.raw.raw_free(ptr, size) };
                self.stats.record_direct_free(size);
            }
        }
    }

    /// Recorded size of a live or pooled block.
    pub fn block_size(&self, ptr: DevicePtr) -> Option<usize> {
        self.blocks.get(&ptr).map(|b| b.size)
    }

    /// Number of blocks currently in the free list.
    pub fn free_blocks(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    /// Number of blocks currently handed out.
    pub fn live_blocks(&self) -> usize {
        self.blocks.values().filter(|b| b.in_use).count()
    }

    /// The pool's recycling mode.
    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    /// Returns a snapshot of allocation statistics.
    pub fn stats(&self) -> AllocationStats {
        self.stats.clone()
    }
}

impl<A: RawAllocator> Drop for BlockPool<A> {
    fn drop(&mut self) {
        let free = std::mem::take(&mut self.free);
        for (size, ptrs) in free {
            for ptr in ptrs {
                infer_assert!(
                    self.blocks.remove(&ptr).is_some(),
                    "memory {ptr:?} is not allocated by the {}",
                    self.raw.name()
                );
                // SAFETY: pooled blocks are unreachable by any caller.
                unsafe { self.raw.raw_free(ptr, size) };
            }
        }

        // Whatever is left is still held by a caller.
        if !self.blocks.is_empty() {
            let leaked: usize = self.blocks.values().map(|b| b.size).sum();
            tracing::warn!(
                device = self.raw.name(),
                blocks = self.blocks.len(),
                bytes = leaked,
                "device torn down with blocks still in use; leaking them"
            );
        }
    }
}

impl<A: RawAllocator> std::fmt::Debug for BlockPool<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("device", &self.raw.name())
            .field("mode", &self.mode)
            .field("live_blocks", &self.live_blocks())
            .field("free_blocks", &self.free_blocks())
            .finish()
    }
}
