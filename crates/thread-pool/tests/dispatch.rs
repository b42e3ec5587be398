// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Dispatch tests through the public API only.

use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use thread_pool::{partition, SpinBudget, TaskId, ThreadPool};

// ── Helpers ────────────────────────────────────────────────────

/// Runs one task and returns every `TaskId` the callback saw, sorted.
fn collect_ids(pool: &ThreadPool, nr_task: usize) -> Vec<TaskId> {
    let seen = Mutex::new(Vec::new());
    pool.add_task(&|id| seen.lock().unwrap().push(id), nr_task);
    let mut ids = seen.into_inner().unwrap();
    ids.sort_by_key(|id| id.start);
    ids
}

// ── Partitioning ───────────────────────────────────────────────

#[test]
fn test_seventeen_units_over_four_threads() {
    let pool = ThreadPool::new(4);
    let ids = collect_ids(&pool, 17);

    let ranges: Vec<_> = ids.iter().map(|id| (id.start, id.end)).collect();
    assert_eq!(ranges, vec![(0, 5), (5, 9), (9, 13), (13, 17)]);
    // The dispatching thread runs the last partition.
    assert_eq!(ids[3].thread_id, 3);
}

#[test]
fn test_empty_partitions_not_invoked() {
    let pool = ThreadPool::new(4);
    let ids = collect_ids(&pool, 2);
    assert_eq!(ids.len(), 2);
    assert!(ids.iter().all(|id| id.len() == 1));
}

#[test]
fn test_caller_participates() {
    let pool = ThreadPool::new(3);
    let caller = std::thread::current().id();
    let on_caller = AtomicU32::new(0);
    pool.add_task(
        &|id| {
            if std::thread::current().id() == caller {
                assert_eq!(id.thread_id, 2);
                on_caller.fetch_add(1, Ordering::Relaxed);
            }
        },
        9,
    );
    assert_eq!(on_caller.load(Ordering::Relaxed), 1);
}

// ── Reuse ──────────────────────────────────────────────────────

#[test]
fn test_parallel_sum_matches_serial() {
    let data: Vec<u64> = (0..10_000).collect();
    let pool = ThreadPool::new(4);
    let partial = Mutex::new(0u64);

    for _ in 0..50 {
        *partial.lock().unwrap() = 0;
        pool.add_task(
            &|id| {
                let s: u64 = data[id.units()].iter().sum();
                *partial.lock().unwrap() += s;
            },
            data.len(),
        );
        assert_eq!(*partial.lock().unwrap(), data.iter().sum::<u64>());
    }
}

#[test]
fn test_idle_between_dispatches() {
    let pool = ThreadPool::with_spin_budget(
        4,
        SpinBudget {
            main: 10,
            worker: 10,
        },
    );
    let total = AtomicU32::new(0);
    for round in 0..5 {
        // Long enough for every worker to park.
        std::thread::sleep(std::time::Duration::from_millis(10));
        if round % 2 == 0 {
            pool.deactive();
        }
        pool.add_task(&|id| { total.fetch_add(id.len() as u32, Ordering::Relaxed); }, 12);
    }
    assert_eq!(total.load(Ordering::Relaxed), 60);
}

#[test]
fn test_drop_joins_idle_workers() {
    for n in 1..6 {
        let pool = ThreadPool::new(n);
        pool.add_task(&|_| {}, 32);
        drop(pool);
    }
}

// ── Properties ─────────────────────────────────────────────────

proptest! {
    #[test]
    fn prop_partition_covers_range(nr_task in 0usize..500, nr_threads in 1usize..17) {
        let sizes: Vec<_> = (0..nr_threads)
            .map(|i| partition(nr_task, nr_threads, i).len())
            .collect();
        prop_assert_eq!(sizes.iter().sum::<usize>(), nr_task);
        let max = *sizes.iter().max().unwrap();
        let min = *sizes.iter().min().unwrap();
        prop_assert!(max - min <= 1);
    }
}
