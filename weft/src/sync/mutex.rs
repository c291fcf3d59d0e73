// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::ops::{Deref, DerefMut};

use crate::error::Error;
use crate::runtime::runtime;
use crate::sync::wait_queue::WaitQueue;

/// A fair mutual-exclusion lock for fibers.
///
/// Contended locks are handed off: unlocking with waiters present transfers
/// ownership directly to the head of the FIFO, so the lock bit never clears
/// in between and late arrivals cannot barge. There is no poisoning; a
/// fiber that never unlocks simply deadlocks its peers, which the scheduler
/// reports (see [`Error::Deadlock`]).
pub struct Mutex<T> {
    locked: Cell<bool>,
    waiters: WaitQueue,
    data: UnsafeCell<T>,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Mutex {
            locked: Cell::new(false),
            waiters: WaitQueue::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the mutex, blocking the calling fiber while another fiber
    /// holds it. The lock is released when the returned guard drops.
    ///
    /// # Errors
    ///
    /// [`Error::Deadlock`] when the wait can never be satisfied (the caller
    /// already holds the mutex and nothing else is runnable, or the program
    /// as a whole is blocked); [`Error::Invalid`] when the mutex is
    /// destroyed while the caller waits.
    pub fn lock(&self) -> Result<MutexGuard<'_, T>, Error> {
        if self.locked.get() {
            // Queue up. A successful wake is a hand-off: the unlocking
            // fiber left `locked` set on our behalf.
            self.waiters.block_on(runtime())?;
        } else {
            self.locked.set(true);
        }
        Ok(MutexGuard { mutex: self })
    }

    /// Acquire the mutex only if it is free.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] when another fiber holds it.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, Error> {
        if self.locked.get() {
            return Err(Error::Busy);
        }
        self.locked.set(true);
        Ok(MutexGuard { mutex: self })
    }

    /// Wake every queued waiter with [`Error::Invalid`]. The mutex must not
    /// be used afterwards; dropping it runs the same teardown.
    pub fn destroy(&self) {
        self.waiters.wake_all(runtime(), Err(Error::Invalid));
    }

    fn unlock(&self) {
        // Hand off to the head waiter if there is one; only with an empty
        // queue does the lock actually open.
        if !self.waiters.wake_one(runtime(), Ok(0)) {
            self.locked.set(false);
        }
    }
}

impl<T> Drop for Mutex<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Ok(guard) => d.field("data", &&*guard),
            Err(_) => d.field("data", &format_args!("<locked>")),
        };
        d.finish()
    }
}

/// Exclusive access to the data of a locked [`Mutex`]; unlocks on drop.
#[must_use = "the mutex unlocks immediately when an unused guard is dropped"]
pub struct MutexGuard<'a, T> {
    pub(in crate::sync) mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves this fiber holds the mutex.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves this fiber holds the mutex.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<T: fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
