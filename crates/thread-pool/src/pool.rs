// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The persistent worker pool.
//!
//! # Synchronisation
//!
//! The dispatcher publishes a [`Dispatch`] descriptor and raises one work
//! flag per worker. Flags are the only handshake on the fast path:
//!
//! - a worker reads the descriptor only while its own flag is raised;
//! - the dispatcher rewrites the descriptor only after `sync()` observed
//!   every flag lowered (via the `pending` counter).
//!
//! The mutex and the two condition variables are touched only when one side
//! exhausted its spin budget and parked.

use crate::spin::spin_until;
use crate::{partition, SpinBudget, TaskId};
use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

type Task = dyn Fn(TaskId) + Sync;

/// The task currently being executed by the pool.
#[derive(Clone, Copy)]
struct Dispatch {
    task: &'static Task,
    nr_task: usize,
}

/// Per-worker state visible to the dispatcher.
///
/// Aligned to a cache line so that workers polling their own flag do not
/// contend with each other.
#[repr(align(64))]
#[derive(Default)]
struct Worker {
    work_flag: AtomicBool,
}

struct Shared {
    nr_threads: usize,
    budget: SpinBudget,
    workers: Vec<Worker>,
    dispatch: UnsafeCell<Option<Dispatch>>,
    /// Workers that have not yet lowered their flag for the current task.
    pending: AtomicUsize,
    /// Workers parked on `work_cv`.
    sleepers: AtomicUsize,
    main_waiting: AtomicBool,
    active: AtomicBool,
    stop: AtomicBool,
    panicked: AtomicBool,
    mutex: Mutex<()>,
    work_cv: Condvar,
    done_cv: Condvar,
}

// SAFETY: `dispatch` is written only by the dispatcher while every work flag
// is lowered and read by a worker only while its own flag is raised. The
// release store of the flag (dispatcher) and its acquire load (worker), and
// the release decrement of `pending` (worker) and its acquire load
// (dispatcher), order every access to the cell.
unsafe impl Sync for Shared {}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A fixed-size pool of persistent worker threads.
///
/// The pool has `nr_threads` participants: `nr_threads - 1` spawned workers
/// plus the thread that calls [`add_task`](ThreadPool::add_task), which runs
/// the last partition itself. A pool of one spawns nothing and runs every
/// task inline.
///
/// Only one task may be in flight at a time; dispatching from inside a task
/// or from two threads at once is a programming error and panics.
pub struct ThreadPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
    busy: AtomicBool,
}

impl ThreadPool {
    /// Creates a pool with the default [`SpinBudget`].
    pub fn new(nr_threads: usize) -> Self {
        Self::with_spin_budget(nr_threads, SpinBudget::default())
    }

    /// Creates a pool with an explicit spin budget.
    ///
    /// `nr_threads` is clamped to at least 1.
    pub fn with_spin_budget(nr_threads: usize, budget: SpinBudget) -> Self {
        let nr_threads = nr_threads.max(1);
        if let Ok(cores) = std::thread::available_parallelism() {
            if nr_threads > cores.get() {
                tracing::warn!(
                    "thread pool oversubscribed: {nr_threads} threads on {} cores",
                    cores.get()
                );
            }
        }

        let shared = Arc::new(Shared {
            nr_threads,
            budget,
            workers: (0..nr_threads - 1).map(|_| Worker::default()).collect(),
            dispatch: UnsafeCell::new(None),
            pending: AtomicUsize::new(0),
            sleepers: AtomicUsize::new(0),
            main_waiting: AtomicBool::new(false),
            active: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            panicked: AtomicBool::new(false),
            mutex: Mutex::new(()),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
        });

        let handles = (0..nr_threads - 1)
            .map(|id| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("infer-worker-{id}"))
                    .spawn(move || worker_loop(&shared, id))
                    .unwrap_or_else(|e| {
                        tracing::error!("failed to spawn worker {id}: {e}");
                        panic!("failed to spawn worker thread {id}: {e}")
                    })
            })
            .collect();

        tracing::debug!(
            nr_threads,
            main_spin = budget.main,
            worker_spin = budget.worker,
            "thread pool started"
        );

        Self {
            shared,
            handles,
            busy: AtomicBool::new(false),
        }
    }

    /// Number of participants, including the dispatching thread.
    pub fn nr_threads(&self) -> usize {
        self.shared.nr_threads
    }

    /// Returns the spin budget this pool was created with.
    pub fn spin_budget(&self) -> SpinBudget {
        self.shared.budget
    }

    /// Runs `task` over `nr_task` units split across every participant and
    /// returns once all partitions are done.
    ///
    /// Partitions must be independent: the callback for one `TaskId` may not
    /// depend on the output of another within the same call.
    ///
    /// # Panics
    /// Panics if the pool is already running a task, or if any partition
    /// panicked.
    pub fn add_task(&self, task: &(dyn Fn(TaskId) + Sync), nr_task: usize) {
        if nr_task == 0 {
            return;
        }
        let nr_threads = self.shared.nr_threads;
        if nr_threads == 1 || nr_task == 1 {
            task(TaskId {
                start: 0,
                end: nr_task,
                thread_id: nr_threads - 1,
            });
            return;
        }

        if self.busy.swap(true, Ordering::Acquire) {
            tracing::error!("thread pool dispatch while a task is in flight");
            panic!("multi-thread task already running on this pool");
        }
        self.active();

        // SAFETY: the erased borrow is reachable by workers only until
        // `sync()` below has observed every partition finished, which
        // happens before this function returns or unwinds.
        let task: &'static Task =
            unsafe { std::mem::transmute::<&(dyn Fn(TaskId) + Sync), &'static Task>(task) };
        let shared = &*self.shared;
        // SAFETY: every work flag is lowered (no task in flight).
        unsafe { *shared.dispatch.get() = Some(Dispatch { task, nr_task }) };

        shared.pending.store(shared.workers.len(), Ordering::SeqCst);
        for worker in &shared.workers {
            worker.work_flag.store(true, Ordering::SeqCst);
        }
        if shared.sleepers.load(Ordering::SeqCst) > 0 {
            let _guard = shared.lock();
            shared.work_cv.notify_all();
        }

        let own = partition(nr_task, nr_threads, nr_threads - 1);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            if !own.is_empty() {
                task(own);
            }
        }));

        self.sync();
        // SAFETY: `sync()` returned, every flag is lowered again.
        unsafe { *shared.dispatch.get() = None };
        self.busy.store(false, Ordering::Release);

        if let Err(payload) = result {
            panic::resume_unwind(payload);
        }
        if shared.panicked.swap(false, Ordering::AcqRel) {
            panic!("a worker thread panicked while running a task");
        }
    }

    /// Blocks until every worker finished its partition of the current task.
    ///
    /// Spins for the main-thread budget first, then parks. Returns
    /// immediately when nothing is in flight.
    pub fn sync(&self) {
        let shared = &*self.shared;
        let finished = || shared.pending.load(Ordering::Acquire) == 0;
        if spin_until(shared.budget.main, finished) {
            return;
        }

        let mut guard = shared.lock();
        shared.main_waiting.store(true, Ordering::SeqCst);
        while shared.pending.load(Ordering::SeqCst) != 0 {
            guard = shared
                .done_cv
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
        shared.main_waiting.store(false, Ordering::SeqCst);
    }

    /// Lets idle workers spin before parking. Called implicitly by `add_task`.
    pub fn active(&self) {
        self.shared.active.store(true, Ordering::Release);
    }

    /// Makes idle workers park immediately instead of spinning.
    ///
    /// Use between requests to stop burning CPU while nothing is decoding.
    pub fn deactive(&self) {
        let _guard = self.shared.lock();
        self.shared.active.store(false, Ordering::Release);
    }

    /// Returns `true` if idle workers currently spin before parking.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }
}

/// Waits for this worker's flag (or shutdown). Returns `false` on shutdown.
fn wait_for_work(shared: &Shared, worker: &Worker) -> bool {
    let ready =
        || worker.work_flag.load(Ordering::Acquire) || shared.stop.load(Ordering::Acquire);
    if shared.active.load(Ordering::Acquire) && spin_until(shared.budget.worker, ready) {
        return !shared.stop.load(Ordering::Acquire);
    }

    let mut guard = shared.lock();
    shared.sleepers.fetch_add(1, Ordering::SeqCst);
    while !worker.work_flag.load(Ordering::SeqCst) && !shared.stop.load(Ordering::SeqCst) {
        guard = shared
            .work_cv
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner);
    }
    shared.sleepers.fetch_sub(1, Ordering::SeqCst);
    !shared.stop.load(Ordering::Acquire)
}

fn worker_loop(shared: &Shared, id: usize) {
    let worker = &shared.workers[id];
    while wait_for_work(shared, worker) {
        // SAFETY: our flag is raised, see `Shared`.
        let dispatch = unsafe { *shared.dispatch.get() };
        if let Some(Dispatch { task, nr_task }) = dispatch {
            let part = partition(nr_task, shared.nr_threads, id);
            if !part.is_empty() && panic::catch_unwind(AssertUnwindSafe(|| task(part))).is_err() {
                tracing::error!(thread_id = id, "task panicked on worker");
                shared.panicked.store(true, Ordering::Release);
            }
        }

        worker.work_flag.store(false, Ordering::Release);
        if shared.pending.fetch_sub(1, Ordering::SeqCst) == 1
            && shared.main_waiting.load(Ordering::SeqCst)
        {
            let _guard = shared.lock();
            shared.done_cv.notify_one();
        }
    }
    tracing::trace!(thread_id = id, "worker exiting");
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let _guard = self.shared.lock();
            self.shared.stop.store(true, Ordering::SeqCst);
            self.shared.active.store(false, Ordering::SeqCst);
            self.shared.work_cv.notify_all();
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked during shutdown");
            }
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("nr_threads", &self.nr_threads())
            .field("active", &self.is_active())
            .field("spin_budget", &self.shared.budget)
            .finish()
    }
}
