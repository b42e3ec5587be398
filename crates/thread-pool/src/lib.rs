// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # thread-pool
//!
//! A fixed-size worker pool tuned for the inference hot path, where every
//! operator issues one small, embarrassingly-parallel task per token.
//!
//! # Key Components
//!
//! - [`ThreadPool`]: owns `nr_threads - 1` persistent workers; the
//!   dispatching thread is the last participant and runs its own partition.
//! - [`TaskId`]: the partition bounds handed to the task callback.
//! - [`SpinBudget`]: how long each side spins before blocking.
//!
//! # Dispatch Model
//!
//! ```text
//! add_task(task, nr_task)
//!     │  publish task, raise work flags
//!     ├──────────────► worker 0: spin ─► (block) ─► task(0..k)
//!     ├──────────────► worker 1: spin ─► (block) ─► task(k..2k)
//!     │  task(last partition) on the caller
//!     ▼
//!   sync()  spin ─► (block) until every work flag is lowered
//! ```
//!
//! Workers spin briefly so back-to-back operators see almost no wake-up
//! latency, then fall back to a condition variable so an idle pool does not
//! burn CPU between requests.
//!
//! # Example
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use thread_pool::ThreadPool;
//!
//! let pool = ThreadPool::new(4);
//! let units = AtomicUsize::new(0);
//! pool.add_task(&|id| { units.fetch_add(id.len(), Ordering::Relaxed); }, 17);
//! assert_eq!(units.load(Ordering::Relaxed), 17);
//! ```

mod partition;
mod pool;
mod spin;

pub use partition::{partition, TaskId};
pub use pool::ThreadPool;
pub use spin::SpinBudget;
