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

const WRITE_HELD: isize = -1;

/// A reader–writer lock with writer priority.
///
/// `reading` counts active readers, is `0` when the lock is free and `-1`
/// while a writer holds it. A queued writer blocks newly arriving readers
/// even before it acquires, so a steady stream of readers cannot starve it;
/// conversely, once the last queued writer releases, the whole blocked
/// reader cohort is admitted at once.
///
/// Grants are decided by the *releasing* fiber: handing off to a writer
/// keeps `reading` at `-1`, releasing `k` readers sets `reading`
/// to `k`, in both cases before any woken fiber runs. A fiber scheduled in
/// the wake-to-resume window therefore sees the lock in its post-grant
/// state and cannot acquire it out of turn.
pub struct RwLock<T> {
    reading: Cell<isize>,
    rd_waiters: WaitQueue,
    wr_waiters: WaitQueue,
    data: UnsafeCell<T>,
}

impl<T> RwLock<T> {
    pub const fn new(value: T) -> Self {
        RwLock {
            reading: Cell::new(0),
            rd_waiters: WaitQueue::new(),
            wr_waiters: WaitQueue::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock shared, blocking while a writer holds it or any
    /// writer is queued.
    ///
    /// # Errors
    ///
    /// [`Error::Deadlock`] when the wait can never be satisfied,
    /// [`Error::Invalid`] when the lock is destroyed while the caller
    /// waits.
    pub fn read(&self) -> Result<RwLockReadGuard<'_, T>, Error> {
        if self.reading.get() == WRITE_HELD || !self.wr_waiters.is_empty() {
            // Writer priority: queue behind every writer, even ones that
            // have not acquired yet. A successful wake means the releasing
            // writer already counted this cohort into `reading`.
            self.rd_waiters.block_on(runtime())?;
        } else {
            self.reading.set(self.reading.get() + 1);
        }
        Ok(RwLockReadGuard { lock: self })
    }

    /// Acquire the lock exclusively, blocking while anybody holds it.
    ///
    /// # Errors
    ///
    /// [`Error::Deadlock`] when the wait can never be satisfied,
    /// [`Error::Invalid`] when the lock is destroyed while the caller
    /// waits.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, T>, Error> {
        if self.reading.get() != 0 {
            // A successful wake is a hand-off: the releasing fiber left
            // `reading` at WRITE_HELD for us.
            self.wr_waiters.block_on(runtime())?;
        } else {
            self.reading.set(WRITE_HELD);
        }
        Ok(RwLockWriteGuard { lock: self })
    }

    /// Acquire shared without blocking.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] whenever [`read`][RwLock::read] would block.
    pub fn try_read(&self) -> Result<RwLockReadGuard<'_, T>, Error> {
        if self.reading.get() == WRITE_HELD || !self.wr_waiters.is_empty() {
            return Err(Error::Busy);
        }
        self.reading.set(self.reading.get() + 1);
        Ok(RwLockReadGuard { lock: self })
    }

    /// Acquire exclusively without blocking.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] whenever [`write`][RwLock::write] would block.
    pub fn try_write(&self) -> Result<RwLockWriteGuard<'_, T>, Error> {
        if self.reading.get() != 0 {
            return Err(Error::Busy);
        }
        self.reading.set(WRITE_HELD);
        Ok(RwLockWriteGuard { lock: self })
    }

    /// Wake every queued reader and writer with [`Error::Invalid`]. The
    /// lock must not be used afterwards; dropping it runs the same
    /// teardown.
    pub fn destroy(&self) {
        let rt = runtime();
        self.rd_waiters.wake_all(rt, Err(Error::Invalid));
        self.wr_waiters.wake_all(rt, Err(Error::Invalid));
    }

    fn unlock_read(&self) {
        let remaining = self.reading.get() - 1;
        self.reading.set(remaining);
        if remaining == 0 && self.wr_waiters.wake_one(runtime(), Ok(0)) {
            // Last reader out hands the lock to the next writer.
            self.reading.set(WRITE_HELD);
        }
    }

    fn unlock_write(&self) {
        let rt = runtime();
        if self.wr_waiters.wake_one(rt, Ok(0)) {
            // Writer-to-writer hand-off; queued readers keep waiting and
            // `reading` stays WRITE_HELD.
            return;
        }
        // No writer queued: admit the whole reader cohort, counting it in
        // before any of them runs.
        let cohort = self.rd_waiters.wake_all(rt, Ok(0));
        self.reading
            .set(isize::try_from(cohort).expect("reader cohort exceeds isize"));
    }
}

impl<T> Drop for RwLock<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<T: fmt::Debug> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("RwLock");
        match self.try_read() {
            Ok(guard) => d.field("data", &&*guard),
            Err(_) => d.field("data", &format_args!("<write-locked>")),
        };
        d.finish()
    }
}

/// Shared access to the data of an [`RwLock`]; releases on drop.
#[must_use = "the lock releases immediately when an unused guard is dropped"]
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: read guards only exist while no writer holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

impl<T: fmt::Debug> fmt::Debug for RwLockReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Exclusive access to the data of an [`RwLock`]; releases on drop.
#[must_use = "the lock releases immediately when an unused guard is dropped"]
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves this fiber holds the write side.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves this fiber holds the write side.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_write();
    }
}

impl<T: fmt::Debug> fmt::Debug for RwLockWriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
