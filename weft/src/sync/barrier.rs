// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::Cell;
use core::fmt;

use crate::error::Error;
use crate::runtime::runtime;
use crate::sync::wait_queue::WaitQueue;

/// A count-down gate: the first `parties - 1` callers of [`wait`] block,
/// the last one releases them all at once.
///
/// Single-use. The countdown is not rearmed when the cohort is released;
/// start the next cycle with a fresh `Barrier`.
///
/// [`wait`]: Barrier::wait
pub struct Barrier {
    count: Cell<usize>,
    waiters: WaitQueue,
}

impl Barrier {
    /// A barrier releasing once `parties` fibers have reached it.
    pub const fn new(parties: usize) -> Self {
        Barrier {
            count: Cell::new(parties),
            waiters: WaitQueue::new(),
        }
    }

    /// Arrive at the barrier, blocking until all parties have.
    ///
    /// Exactly one arrival per cycle — the one that completed the
    /// countdown — observes [`BarrierWaitResult::is_leader`].
    ///
    /// # Errors
    ///
    /// [`Error::Invalid`] when the barrier has already released its cohort
    /// or is destroyed mid-wait; [`Error::Deadlock`] when the countdown can
    /// never complete because every other fiber is blocked.
    pub fn wait(&self) -> Result<BarrierWaitResult, Error> {
        let remaining = match self.count.get() {
            0 => return Err(Error::Invalid),
            n => n - 1,
        };
        self.count.set(remaining);
        if remaining == 0 {
            self.waiters.wake_all(runtime(), Ok(0));
            Ok(BarrierWaitResult { leader: true })
        } else {
            self.waiters.block_on(runtime())?;
            Ok(BarrierWaitResult { leader: false })
        }
    }

    /// Wake every queued waiter with [`Error::Invalid`]. The barrier must
    /// not be used afterwards; dropping it runs the same teardown.
    pub fn destroy(&self) {
        self.waiters.wake_all(runtime(), Err(Error::Invalid));
    }
}

impl Drop for Barrier {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier")
            .field("remaining", &self.count.get())
            .finish_non_exhaustive()
    }
}

/// Told apart by [`is_leader`]: the arrival that completed the countdown.
///
/// [`is_leader`]: BarrierWaitResult::is_leader
#[derive(Debug)]
pub struct BarrierWaitResult {
    leader: bool,
}

impl BarrierWaitResult {
    /// True for exactly one arrival per barrier cycle.
    pub fn is_leader(&self) -> bool {
        self.leader
    }
}
