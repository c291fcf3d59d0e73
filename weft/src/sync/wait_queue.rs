// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The wait-queue substrate every blocking primitive is built on.
//!
//! A [`WaitQueue`] is a FIFO of blocked fibers, linked through the same
//! intrusive chain the ready queue uses (an FCB is on at most one list at a
//! time). Wakers deliver a [`WakeValue`] into the slot the blocked fiber
//! published when it went to sleep: `Ok` with a pointer-sized payload for a
//! normal wake (join return values, zero elsewhere), or the error that ends
//! the wait — [`Error::Invalid`] from teardown, [`Error::Deadlock`] from the
//! scheduler's deadlock detector. The blocked call returns that value
//! verbatim.
//!
//! [`Error::Invalid`]: crate::Error::Invalid
//! [`Error::Deadlock`]: crate::Error::Deadlock

use core::cell::RefCell;
use core::ptr::NonNull;

use cordyceps::list::List;

use crate::error::Error;
use crate::fiber::Fcb;
use crate::runtime::Runtime;

/// Value delivered from a waker to a blocked fiber.
pub(crate) type WakeValue = Result<usize, Error>;

/// A FIFO of blocked fibers.
///
/// The queue references FCBs but never owns them; FCB lifetime is governed
/// by the reference count alone. Fibers are always woken head-to-tail.
pub(crate) struct WaitQueue {
    waiters: RefCell<List<Fcb>>,
}

impl WaitQueue {
    pub(crate) const fn new() -> Self {
        WaitQueue {
            waiters: RefCell::new(List::new()),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.borrow().is_empty()
    }

    pub(crate) fn push(&self, f: NonNull<Fcb>) {
        self.waiters.borrow_mut().push_back(f);
    }

    /// Unlink `f` from this queue. The caller asserts (via `blocked_on`)
    /// that `f` is linked here.
    pub(crate) fn remove(&self, f: NonNull<Fcb>) {
        // Safety: the caller guarantees `f` is an element of this queue.
        let removed = unsafe { self.waiters.borrow_mut().remove(f) };
        debug_assert!(removed.is_some(), "fiber was not linked on this queue");
    }

    /// Block the calling fiber on this queue until a waker delivers a value.
    pub(crate) fn block_on(&self, rt: &Runtime) -> WakeValue {
        rt.block_current(self)
    }

    /// Wake the head waiter, delivering `val`; false if the queue was empty.
    pub(crate) fn wake_one(&self, rt: &Runtime, val: WakeValue) -> bool {
        let head = self.waiters.borrow_mut().pop_front();
        match head {
            Some(f) => {
                rt.make_ready(f, val);
                true
            }
            None => false,
        }
    }

    /// Wake every current waiter in FIFO order, delivering `val` to each;
    /// returns how many were woken.
    ///
    /// Each fiber is unlinked before it is made ready, so the queue is never
    /// observed half-mutated even though waking touches the ready queue.
    pub(crate) fn wake_all(&self, rt: &Runtime, val: WakeValue) -> usize {
        let mut woken = 0;
        loop {
            let head = self.waiters.borrow_mut().pop_front();
            let Some(f) = head else { break };
            rt.make_ready(f, val);
            woken += 1;
        }
        woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::runtime;
    use crate::{spawn, yield_now};
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc;

    #[test]
    fn wake_order_is_fifo() {
        let queue = Rc::new(WaitQueue::new());
        let log: Rc<StdRefCell<Vec<(&str, usize)>>> = Rc::new(StdRefCell::new(Vec::new()));

        let qa = queue.clone();
        let la = log.clone();
        let a = spawn(move || {
            let v = qa.block_on(runtime()).unwrap();
            la.borrow_mut().push(("a", v));
            0
        })
        .unwrap();

        let qb = queue.clone();
        let lb = log.clone();
        let b = spawn(move || {
            let v = qb.block_on(runtime()).unwrap();
            lb.borrow_mut().push(("b", v));
            0
        })
        .unwrap();

        // Let both block, in spawn order.
        yield_now();
        assert!(log.borrow().is_empty());

        assert!(queue.wake_one(runtime(), Ok(10)));
        assert!(queue.wake_one(runtime(), Ok(20)));
        assert!(!queue.wake_one(runtime(), Ok(30)));

        a.join().unwrap();
        b.join().unwrap();
        assert_eq!(*log.borrow(), [("a", 10), ("b", 20)]);
    }

    #[test]
    fn wake_all_releases_in_fifo_order_and_counts() {
        let queue = Rc::new(WaitQueue::new());
        let log: Rc<StdRefCell<Vec<usize>>> = Rc::new(StdRefCell::new(Vec::new()));
        let mut handles = Vec::new();

        for i in 0..5 {
            let q = queue.clone();
            let l = log.clone();
            handles.push(
                spawn(move || {
                    q.block_on(runtime()).unwrap();
                    l.borrow_mut().push(i);
                    0
                })
                .unwrap(),
            );
        }

        yield_now();
        assert_eq!(queue.wake_all(runtime(), Ok(0)), 5);
        assert_eq!(queue.wake_all(runtime(), Ok(0)), 0);

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*log.borrow(), [0, 1, 2, 3, 4]);
    }
}
