// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Election plumbing: the level-triggered one-shot latches the Bully
//! candidate blocks on, and the single-flight guard that keeps at most one
//! election task alive.
//!
//! The latch protocol is clear, arm, wait-with-timeout, read. A latch must
//! be cleared before each election; a set that races ahead of the wait is
//! still observed (level-triggered, not edge-triggered).

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct LatchState<T> {
    set: bool,
    value: Option<T>,
}

/// One-shot latch with an associated data slot.
///
/// `ANSWER` arrivals set a unit latch; `COORDINATOR` arrivals set a latch
/// whose slot carries the announced leader.
pub struct Latch<T> {
    state: Mutex<LatchState<T>>,
    cv: Condvar,
}

impl<T: Clone> Latch<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState {
                set: false,
                value: None,
            }),
            cv: Condvar::new(),
        }
    }

    /// Disarm before a new election so a stale set is not mistaken for a
    /// fresh one.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.set = false;
        state.value = None;
    }

    /// Trip the latch and wake every waiter.
    pub fn set(&self, value: T) {
        let mut state = self.state.lock();
        state.set = true;
        state.value = Some(value);
        self.cv.notify_all();
    }

    /// Wait until the latch trips or `timeout` elapses. Returns the slot
    /// value on success, `None` on timeout.
    pub fn wait(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.set {
            if self.cv.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.set {
            state.value.clone()
        } else {
            None
        }
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.state.lock().set
    }
}

impl<T: Clone> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct GuardState {
    in_flight: bool,
    since: Option<Instant>,
}

/// Single-flight election guard: `try_begin` admits one task and turns
/// re-triggers within the holdoff window into no-ops. A crashed or timed-out
/// election that never called `finish` stops blocking once the holdoff
/// expires.
pub struct ElectionGuard {
    state: Mutex<GuardState>,
}

impl ElectionGuard {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GuardState {
                in_flight: false,
                since: None,
            }),
        }
    }

    /// Attempt to start an election. Returns false when one started within
    /// `holdoff` and has not finished.
    pub fn try_begin(&self, holdoff: Duration) -> bool {
        let mut state = self.state.lock();
        if state.in_flight {
            if let Some(since) = state.since {
                if since.elapsed() < holdoff {
                    return false;
                }
            }
        }
        state.in_flight = true;
        state.since = Some(Instant::now());
        true
    }

    /// Release the guard so the next trigger may run.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        state.in_flight = false;
        state.since = None;
    }

    #[must_use]
    pub fn in_flight(&self) -> bool {
        self.state.lock().in_flight
    }
}

impl Default for ElectionGuard {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
