// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! CPU numeric kernels, parallelised over the device's thread pool.
//!
//! Every kernel validates its slice lengths up front on the dispatching
//! thread, then splits the work into independent units (output columns,
//! rows, heads or elements) and hands them to [`ThreadPool::add_task`].
//! Participants write disjoint regions of the destination through
//! [`SyncPtr`].

mod attention;
mod elementwise;
mod embedding;
mod matmul;
mod norm;

pub use attention::{AttentionDims, KvCache};

use half::f16;
use thread_pool::{SpinBudget, ThreadPool};

/// A read-only view of weight data in its stored precision.
#[derive(Debug, Clone, Copy)]
pub enum Weights<'a> {
    F32(&'a [f32]),
    F16(&'a [f16]),
}

impl Weights<'_> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Self::F32(w) => w.len(),
            Self::F16(w) => w.len(),
        }
    }

    /// Returns `true` if the view holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dot product of row `row` (of width `x.len()`) with `x`.
    #[inline]
    pub fn row_dot(&self, row: usize, x: &[f32]) -> f32 {
        let k = x.len();
        match self {
            Self::F32(w) => w[row * k..(row + 1) * k]
                .iter()
                .zip(x)
                .map(|(a, b)| a * b)
                .sum(),
            Self::F16(w) => w[row * k..(row + 1) * k]
                .iter()
                .zip(x)
                .map(|(a, b)| a.to_f32() * b)
                .sum(),
        }
    }

    /// Adds row `row` (of width `dst.len()`) into `dst`.
    #[inline]
    pub fn add_row_into(&self, row: usize, dst: &mut [f32]) {
        let k = dst.len();
        match self {
            Self::F32(w) => {
                for (d, v) in dst.iter_mut().zip(&w[row * k..(row + 1) * k]) {
                    *d += v;
                }
            }
            Self::F16(w) => {
                for (d, v) in dst.iter_mut().zip(&w[row * k..(row + 1) * k]) {
                    *d += v.to_f32();
                }
            }
        }
    }
}

/// A raw destination pointer that pool participants write through.
///
/// Each participant must only touch indices inside its own partition.
#[derive(Clone, Copy)]
pub(crate) struct SyncPtr(*mut f32);

// SAFETY: participants write disjoint index ranges, and `add_task` joins
// every participant before the borrow the pointer came from ends.
unsafe impl Send for SyncPtr {}
unsafe impl Sync for SyncPtr {}

impl SyncPtr {
    pub(crate) fn new(dst: &mut [f32]) -> Self {
        Self(dst.as_mut_ptr())
    }

    /// # Safety
    /// `start..start + len` must be in bounds and owned by the caller's
    /// partition.
    #[inline]
    pub(crate) unsafe fn slice<'a>(self, start: usize, len: usize) -> &'a mut [f32] {
        std::slice::from_raw_parts_mut(self.0.add(start), len)
    }

    /// # Safety
    /// `index` must be in bounds and owned by the caller's partition.
    #[inline]
    pub(crate) unsafe fn write(self, index: usize, value: f32) {
        *self.0.add(index) = value;
    }
}

/// The compute handle of a CPU device.
///
/// Owns the device's [`ThreadPool`]; all kernels dispatch through it.
pub struct Kernel {
    pool: ThreadPool,
}

impl Kernel {
    /// Creates a kernel set with a pool of `nr_threads` participants.
    pub fn new(nr_threads: usize, budget: SpinBudget) -> Self {
        Self {
            pool: ThreadPool::with_spin_budget(nr_threads, budget),
        }
    }

    /// Number of pool participants.
    pub fn nr_threads(&self) -> usize {
        self.pool.nr_threads()
    }

    /// The underlying thread pool.
    pub fn thread_pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// Lets idle workers spin between operators.
    pub fn active(&self) {
        self.pool.active();
    }

    /// Parks idle workers immediately, for use between requests.
    pub fn deactive(&self) {
        self.pool.deactive();
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("nr_threads", &self.nr_threads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_row_dot() {
        let w = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let x = [1.0f32, 0.0, -1.0];
        assert_eq!(Weights::F32(&w).row_dot(0, &x), -2.0);
        assert_eq!(Weights::F32(&w).row_dot(1, &x), -2.0);

        let h: Vec<f16> = w.iter().map(|&v| f16::from_f32(v)).collect();
        assert_eq!(Weights::F16(&h).row_dot(1, &x), -2.0);
        assert_eq!(Weights::F16(&h).len(), 6);
    }

    #[test]
    fn test_weights_add_row() {
        let w = [1.0f32, 2.0, 3.0, 4.0];
        let mut dst = [10.0f32, 10.0];
        Weights::F32(&w).add_row_into(1, &mut dst);
        assert_eq!(dst, [13.0, 14.0]);
    }
}
