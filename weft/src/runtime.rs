// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-thread runtime: ready queue, FCB pool, and the scheduler that
//! moves the CPU between fibers.
//!
//! All of this state belongs to exactly one OS thread. None of it is
//! `Send` or `Sync`, so the compiler already rules out cross-thread use; the
//! [`RefCell`]s below are never contended, they only keep list surgery
//! honest. The one iron rule is that no borrow may be held across
//! [`Runtime::switch_to`]: a borrow taken on one fiber's stack would stay
//! live while arbitrary other fibers run.

use core::cell::{Cell, RefCell};
use core::ptr::NonNull;

use cordyceps::list::List;
use weft_fiber::FiberStack;

use crate::error::Error;
use crate::fiber::{Fcb, SpawnFlags, State};
use crate::sync::wait_queue::{WaitQueue, WakeValue};

/// Upper bound on pooled FCBs.
///
/// Must be at least 1: a fiber's final context switch still runs on its own
/// stack, so the most recent exiter's stack has to stay mapped until a later
/// release pushes it toward the eviction end.
pub(crate) const FREE_LIST_MAX: usize = 1;
static_assertions::const_assert!(FREE_LIST_MAX >= 1);

thread_local! {
    static RUNTIME: Cell<*mut Runtime> = const { Cell::new(core::ptr::null_mut()) };
}

/// This thread's runtime, created on first use.
///
/// Creation adopts the calling thread as the root fiber. The runtime lives
/// for the rest of the process (it is leaked deliberately); the returned
/// reference is still thread-bound because [`Runtime`] is neither `Send`
/// nor `Sync`.
pub(crate) fn runtime() -> &'static Runtime {
    RUNTIME.with(|slot| {
        let mut ptr = slot.get();
        if ptr.is_null() {
            ptr = Box::into_raw(Box::new(Runtime::new()));
            slot.set(ptr);
        }
        // Safety: the box is never freed, and only the owning thread can
        // reach this slot.
        unsafe { &*ptr }
    })
}

struct FreeList {
    list: List<Fcb>,
    len: usize,
}

pub(crate) struct Runtime {
    /// The running fiber. Always `State::Ready`, never on the ready queue.
    current: Cell<NonNull<Fcb>>,
    /// FIFO of runnable fibers, excluding `current`.
    ready: RefCell<List<Fcb>>,
    /// Reclaimed FCB+stack pairs awaiting reuse or eviction.
    free: RefCell<FreeList>,
    /// The most recent fiber to block, still blocked; the deadlock victim.
    /// Cleared whenever that fiber is woken.
    last_blocked: Cell<Option<NonNull<Fcb>>>,
    /// Number of non-dead fibers, the root included.
    live: Cell<usize>,
    next_id: Cell<u64>,
}

impl Runtime {
    fn new() -> Self {
        let root = Box::new(Fcb::new(0, None));
        root.flags.set(SpawnFlags::STICKY);
        let root = NonNull::from(Box::leak(root));
        Runtime {
            current: Cell::new(root),
            ready: RefCell::new(List::new()),
            free: RefCell::new(FreeList {
                list: List::new(),
                len: 0,
            }),
            last_blocked: Cell::new(None),
            live: Cell::new(1),
            next_id: Cell::new(1),
        }
    }

    pub(crate) fn current_fcb(&self) -> NonNull<Fcb> {
        self.current.get()
    }

    pub(crate) fn add_live(&self, n: usize) {
        self.live.set(self.live.get() + n);
    }

    // === scheduling ===

    /// Mark `f` runnable and queue it at the tail of the ready queue.
    pub(crate) fn ready_fiber(&self, f: NonNull<Fcb>) {
        // Safety: every FCB pointer held by the runtime is kept live by its
        // reference count.
        unsafe { f.as_ref() }.state.set(State::Ready);
        self.ready.borrow_mut().push_back(f);
    }

    /// Unlink a ready, non-current fiber from the ready queue (`yield_to`).
    pub(crate) fn detach_ready(&self, f: NonNull<Fcb>) {
        // Safety: a READY fiber that is not `current` is linked on the ready
        // queue (and on no other list).
        let removed = unsafe { self.ready.borrow_mut().remove(f) };
        debug_assert!(removed.is_some(), "ready fiber was not on the ready queue");
    }

    /// Deliver `val` to an already-unlinked blocked fiber and make it
    /// runnable.
    pub(crate) fn make_ready(&self, f: NonNull<Fcb>, val: WakeValue) {
        // Safety: see `ready_fiber`.
        let fcb = unsafe { f.as_ref() };
        debug_assert_eq!(fcb.state.get(), State::Blocked);
        fcb.blocked_on.set(None);
        if let Some(slot) = fcb.wake_slot.take() {
            // Safety: the slot points into the fiber's suspended
            // `block_current` frame, which stays live until it resumes.
            unsafe { slot.as_ptr().write(Some(val)) };
        }
        if self.last_blocked.get() == Some(f) {
            self.last_blocked.set(None);
        }
        tracing::trace!(fiber = fcb.id.get(), ok = val.is_ok(), "wake");
        self.ready_fiber(f);
    }

    /// Wake a blocked fiber wherever it is queued.
    pub(crate) fn wake(&self, f: NonNull<Fcb>, val: WakeValue) {
        // Safety: see `ready_fiber`.
        let fcb = unsafe { f.as_ref() };
        let queue = fcb
            .blocked_on
            .get()
            .expect("woken fiber is not blocked on any queue");
        // Safety: `blocked_on` is set exactly while the fiber is linked on
        // that queue, and the queue outlives its waiters (teardown wakes
        // them first).
        unsafe { queue.as_ref() }.remove(f);
        self.make_ready(f, val);
    }

    /// Block the current fiber on `queue` and run something else. Returns
    /// the value the eventual waker delivered.
    pub(crate) fn block_current(&self, queue: &WaitQueue) -> WakeValue {
        let mut slot: Option<WakeValue> = None;
        let cur = self.current.get();
        // Safety: see `ready_fiber`.
        let fcb = unsafe { cur.as_ref() };
        fcb.wake_slot.set(Some(NonNull::from(&mut slot)));
        fcb.state.set(State::Blocked);
        fcb.blocked_on.set(Some(NonNull::from(queue)));
        queue.push(cur);
        self.last_blocked.set(Some(cur));
        tracing::trace!(fiber = fcb.id.get(), "block");
        self.schedule();
        // Somebody woke us and filled the slot before requeueing us.
        slot.expect("fiber resumed without a wake value")
    }

    /// Pick the next fiber and switch to it.
    ///
    /// The caller must already have parked the current fiber somewhere: on
    /// the ready queue (`yield`), on a wait queue (`block_current`), or
    /// nowhere because it is dead (`exit_current`).
    pub(crate) fn schedule(&self) {
        if self.ready.borrow().is_empty() {
            // Nothing can run. Force-wake the most recent blocker so its
            // blocking call reports the deadlock instead of hanging the
            // whole thread.
            let victim = self
                .last_blocked
                .take()
                .expect("deadlock with no blocked fiber to deliver it to");
            // Safety: `last_blocked` is cleared whenever that fiber is
            // woken, so it still points at a live, blocked fiber.
            tracing::warn!(
                fiber = unsafe { victim.as_ref() }.id.get(),
                "no runnable fibers, waking most recent blocker with deadlock error"
            );
            self.wake(victim, Err(Error::Deadlock));
        }
        let next = self
            .ready
            .borrow_mut()
            .pop_front()
            .expect("ready queue empty after deadlock wake");
        self.switch_to(next);
    }

    /// Switch the CPU to `next`. No-op when `next` is already current.
    ///
    /// Returns when something later switches back to the calling fiber.
    pub(crate) fn switch_to(&self, next: NonNull<Fcb>) {
        let prev = self.current.get();
        if prev == next {
            return;
        }
        self.current.set(next);
        // Safety: both FCBs are live; `next` left the ready queue (or was
        // just detached from it), so nothing else will restore its context.
        // No RefCell borrow is held at this point.
        unsafe {
            debug_assert!(next.as_ref().saved_sp.get().is_some());
            let save = prev.as_ref().saved_sp.as_ptr();
            let restore = next.as_ref().saved_sp.as_ptr().cast_const();
            weft_fiber::switch(save, restore);
        }
    }

    /// Kill the current fiber: record `rv`, wake the joiners, drop the
    /// fiber's own reference and move on. Terminates the process when this
    /// was the last live fiber.
    pub(crate) fn exit_current(&self, rv: usize) -> ! {
        let live = self.live.get() - 1;
        self.live.set(live);
        if live == 0 {
            tracing::trace!(rv, "last fiber exited, terminating the process");
            let status = i32::try_from(rv & 0xff).expect("exit status masked to one byte");
            std::process::exit(status);
        }

        let cur = self.current.get();
        // Safety: see `ready_fiber`.
        let fcb = unsafe { cur.as_ref() };
        tracing::trace!(fiber = fcb.id.get(), rv, live, "exit");
        fcb.return_value.set(rv);
        fcb.state.set(State::Dead);
        fcb.join_waiters.wake_all(self, Ok(rv));
        // May push this FCB onto the free list. Fine: eviction frees the
        // *other* end, so the stack we are still standing on survives the
        // switch below.
        self.unref_fiber(cur);
        self.schedule();
        unreachable!("dead fiber was scheduled again")
    }

    // === reference counting and the FCB pool ===

    pub(crate) fn ref_fiber(&self, f: NonNull<Fcb>) {
        // Safety: see `ready_fiber`.
        let fcb = unsafe { f.as_ref() };
        if fcb.flags.get().contains(SpawnFlags::STICKY) {
            return;
        }
        fcb.refs.set(fcb.refs.get() + 1);
    }

    pub(crate) fn unref_fiber(&self, f: NonNull<Fcb>) {
        // Safety: see `ready_fiber`.
        let fcb = unsafe { f.as_ref() };
        if fcb.flags.get().contains(SpawnFlags::STICKY) {
            return;
        }
        let refs = fcb.refs.get() - 1;
        fcb.refs.set(refs);
        if refs == 0 {
            debug_assert_eq!(fcb.state.get(), State::Dead);
            self.release_fcb(f);
        }
    }

    /// Get an FCB with at least `stack_size` bytes of stack, preferring the
    /// pool.
    pub(crate) fn alloc_fcb(&self, stack_size: usize) -> Result<NonNull<Fcb>, Error> {
        let recycled = {
            let mut free = self.free.borrow_mut();
            match free.list.pop_front() {
                // Reuse both the FCB and its stack when the stack is big
                // enough for the request.
                Some(f) if unsafe { f.as_ref() }.stack_capacity() >= stack_size => {
                    free.len -= 1;
                    Some(f)
                }
                // Too small: leave it pooled and allocate fresh.
                Some(f) => {
                    free.list.push_front(f);
                    None
                }
                None => None,
            }
        };

        if let Some(f) = recycled {
            // Safety: pooled FCBs have no outstanding references.
            unsafe { f.as_ref() }.reset(self.next_id());
            return Ok(f);
        }

        let stack = FiberStack::new(stack_size).map_err(|_| Error::OutOfMemory)?;
        let fcb = Box::new(Fcb::new(self.next_id(), Some(stack)));
        Ok(NonNull::from(Box::leak(fcb)))
    }

    /// Pool a dead, unreferenced FCB; evict (and actually free) the
    /// least-recently pooled one if the pool is over capacity.
    fn release_fcb(&self, f: NonNull<Fcb>) {
        let mut free = self.free.borrow_mut();
        free.list.push_front(f);
        free.len += 1;
        if free.len > FREE_LIST_MAX {
            let victim = free.list.pop_back().expect("free list is over capacity");
            free.len -= 1;
            // FREE_LIST_MAX >= 1, so the victim is never the FCB pushed
            // above: an exiting fiber's stack is not unmapped under it.
            debug_assert_ne!(victim, f);
            // Safety: refcount reached zero and the FCB is linked nowhere;
            // this re-owns the allocation made in `alloc_fcb`.
            let victim = unsafe { Box::from_raw(victim.as_ptr()) };
            tracing::trace!(fiber = victim.id.get(), "evicting pooled fiber");
            drop(victim);
        }
    }

    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }
}
