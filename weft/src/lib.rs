//! A cooperative fiber runtime for a single OS thread.
//!
//! weft multiplexes many lightweight execution contexts ("fibers") over one
//! kernel thread. Each fiber owns a guard-paged stack (switched by
//! [`weft-fiber`](weft_fiber)) and runs until it explicitly yields, blocks
//! or exits — there is no preemption, no parallelism, and consequently no
//! data race a fiber could lose: everything between two suspension points is
//! atomic with respect to every other fiber.
//!
//! ```
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! let counter = Rc::new(Cell::new(0));
//! let c = counter.clone();
//! let handle = weft::spawn(move || {
//!     c.set(c.get() + 1);
//!     weft::yield_now();
//!     c.set(c.get() + 1);
//!     7
//! })
//! .unwrap();
//!
//! assert_eq!(handle.join().unwrap(), 7);
//! assert_eq!(counter.get(), 2);
//! ```
//!
//! # Scheduling
//!
//! Runnable fibers sit on a strict FIFO ready queue; [`yield_now`] requeues
//! the caller at the tail, [`yield_to`] runs a chosen ready fiber
//! immediately without disturbing the rest of the order. Blocked fibers sit
//! on the wait queue of whatever they are blocked on (a [`JoinHandle`], a
//! [`sync`] primitive) and are woken in FIFO order too. When nothing at all
//! is runnable, the scheduler wakes the most recently blocked fiber with
//! [`Error::Deadlock`] so the stuck call reports the cycle instead of
//! hanging the thread.
//!
//! # Threads
//!
//! Each OS thread that touches the API lazily gets its own independent
//! runtime, with the thread itself adopted as the root fiber. Nothing here
//! is `Send` or `Sync`: fibers, handles and synchronization primitives are
//! pinned to their thread by construction, which is what makes the
//! cooperative atomicity above sound.

mod error;
mod fiber;
mod runtime;
pub mod sync;

pub use error::Error;
pub use fiber::{Builder, Fiber, JoinHandle, current, exit, spawn, yield_now, yield_to};
