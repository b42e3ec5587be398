// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Work partitioning across pool participants.

/// The slice of a task assigned to one participant.
///
/// `start..end` is a half-open range of work units; `thread_id` is the
/// participant index in `0..nr_threads` (the dispatching thread is always
/// `nr_threads - 1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId {
    pub start: usize,
    pub end: usize,
    pub thread_id: usize,
}

impl TaskId {
    /// Number of work units in this partition.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns `true` if the partition holds no work.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Iterates over the work units in this partition.
    pub fn units(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }
}

/// Computes the partition of `nr_task` units owned by participant `index`.
///
/// Units are spread as evenly as possible: every participant gets
/// `nr_task / nr_threads`, and the first `nr_task % nr_threads`
/// participants get one extra.
///
/// # Examples
/// ```
/// use thread_pool::partition;
/// // 17 units over 4 participants: 5, 4, 4, 4.
/// assert_eq!(partition(17, 4, 0).len(), 5);
/// assert_eq!(partition(17, 4, 3).start, 13);
/// ```
pub fn partition(nr_task: usize, nr_threads: usize, index: usize) -> TaskId {
    let nr_threads = nr_threads.max(1);
    let base = nr_task / nr_threads;
    let extra = nr_task % nr_threads;
    let start = index * base + index.min(extra);
    let len = base + usize::from(index < extra);
    TaskId {
        start,
        end: start + len,
        thread_id: index,
    }
}
