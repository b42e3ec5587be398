// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # device
//!
//! Per-device memory management and compute for the inference runtime.
//!
//! # Key Components
//!
//! - [`Device`]: the trait every tensor and operator allocates through,
//!   shared as `Arc<dyn Device>`.
//! - [`CpuDevice`]: host memory from `std::alloc` plus a [`Kernel`] that runs
//!   numeric kernels on a [`thread_pool::ThreadPool`].
//! - `GpuDevice` (feature `cuda`): device memory and copies through the CUDA
//!   driver API. It has no kernels.
//! - [`BlockPool`]: the best-fit pooled allocator behind both devices.
//! - [`AllocationStats`]: pool hit rate, live/pooled/reserved bytes, peak.
//! - [`infer_assert!`] and [`fatal!`]: fail-fast diagnostics for invariant
//!   violations.
//!
//! # Block Lifecycle
//!
//! ```text
//! allocate(len) ──► free list has size ≥ len? ──yes──► pop smallest bucket
//!                              │ no
//!                              ▼
//!                   platform alloc, record in table
//!
//! free_device(ptr) ──► table lookup (fatal if unknown / double free)
//!                  ──► push onto its size bucket
//!
//! drop(device) ──► release free-list blocks, warn about blocks still in use
//! ```

#[macro_use]
pub mod fatal;

mod cpu;
mod device;
#[cfg(feature = "cuda")]
mod gpu;
pub mod host_alloc;
pub mod kernel;
pub mod pool;
mod ptr;
mod stats;

pub use cpu::CpuDevice;
pub use device::{CopyMode, Device, DeviceKind};
#[cfg(feature = "cuda")]
pub use gpu::GpuDevice;
pub use host_alloc::{HostAllocator, ALIGN_SIZE};
pub use kernel::Kernel;
pub use pool::{BlockPool, PoolMode, RawAllocator};
pub use ptr::DevicePtr;
pub use stats::AllocationStats;
