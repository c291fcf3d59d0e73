// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization primitives for fibers.
//!
//! All of these are built on the same wait-queue substrate the scheduler
//! uses for `join`, and they share its rules: waiters are queued and woken
//! in FIFO order, a blocked call returns the value its waker delivered, and
//! destroying a primitive wakes every waiter with
//! [`Error::Invalid`](crate::Error::Invalid). None of these types can leave
//! the thread whose runtime their waiters belong to.

mod barrier;
mod condvar;
mod mutex;
mod rwlock;
pub(crate) mod wait_queue;

pub use barrier::{Barrier, BarrierWaitResult};
pub use condvar::Condvar;
pub use mutex::{Mutex, MutexGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
