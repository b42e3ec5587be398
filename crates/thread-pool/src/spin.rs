// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Spin phase of the two-phase wait.

/// Spin iterations before a waiting thread blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SpinBudget {
    /// Iterations the dispatching thread spins in `sync()`.
    pub main: u32,
    /// Iterations an idle worker spins before parking on the condvar.
    pub worker: u32,
}

impl SpinBudget {
    /// Dispatcher spin iterations.
    pub const MAIN_THREAD_ACTIVE_WAIT: u32 = 10_000;
    /// Worker spin iterations.
    pub const WORKER_ACTIVE_WAIT: u32 = 2_000;
    /// Iterations that always use pause bursts before alternating with yields.
    pub const ACTIVE_WAIT_PAUSE_LIMIT: u32 = 16;
    /// CPU pause hints issued per pause burst.
    const PAUSE_BURST: u32 = 16;

    /// A budget that never spins: every wait goes straight to the condvar.
    pub fn blocking() -> Self {
        Self { main: 0, worker: 0 }
    }
}

impl Default for SpinBudget {
    fn default() -> Self {
        Self {
            main: Self::MAIN_THREAD_ACTIVE_WAIT,
            worker: Self::WORKER_ACTIVE_WAIT,
        }
    }
}

/// One spin iteration: a burst of pause hints, alternating with a yield
/// once past the pause-only prefix.
#[inline]
pub(crate) fn relax(iteration: u32) {
    if iteration < SpinBudget::ACTIVE_WAIT_PAUSE_LIMIT || iteration & 1 == 1 {
        for _ in 0..SpinBudget::PAUSE_BURST {
            std::hint::spin_loop();
        }
    } else {
        std::thread::yield_now();
    }
}

/// Spins up to `budget` iterations until `done` returns `true`.
///
/// Returns whether the condition was observed.
#[inline]
pub(crate) fn spin_until(budget: u32, mut done: impl FnMut() -> bool) -> bool {
    for it in 0..budget {
        if done() {
            return true;
        }
        relax(it);
    }
    done()
}
