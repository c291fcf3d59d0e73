// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fiber control blocks and the fiber lifecycle: spawn, yield, join, exit.

use core::cell::Cell;
use core::fmt;
use core::mem::{self, offset_of};
use core::ptr::NonNull;
use std::panic::{AssertUnwindSafe, catch_unwind};

use cordyceps::{Linked, list};
use weft_fiber::{DEFAULT_STACK_SIZE, FiberStack, StackPointer};

use crate::error::Error;
use crate::runtime::runtime;
use crate::sync::wait_queue::{WaitQueue, WakeValue};

/// The entry closure, boxed twice so it travels through the machine layer as
/// a single thin pointer.
type EntryClosure = Box<dyn FnOnce() -> usize>;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct SpawnFlags: u8 {
        /// No joinable handle reference was retained for this fiber.
        const DETACHED = 1 << 0;
        /// The fiber ignores ref/unref and is never reclaimed. Only the root
        /// fiber carries this.
        const STICKY = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    /// Runnable: either running right now (the current fiber) or linked on
    /// the ready queue.
    Ready,
    /// Linked on some wait queue, recorded in `blocked_on`.
    Blocked,
    /// Exited. Only the reference count keeps the FCB around.
    Dead,
}

/// A fiber control block.
///
/// Heap-allocated and address-stable for its whole life; every queue in the
/// runtime links FCBs through [`Self::links`] and none of them owns the
/// block. Ownership is the reference count: the block is handed to the free
/// list exactly when `refs` drops to zero.
pub(crate) struct Fcb {
    /// Intrusive chain link. An FCB is linked into at most one list at any
    /// instant: the ready queue, one wait queue, or the free list.
    links: list::Links<Fcb>,
    pub(crate) id: Cell<u64>,
    pub(crate) state: Cell<State>,
    pub(crate) flags: Cell<SpawnFlags>,
    pub(crate) refs: Cell<usize>,
    /// `None` only for the root fiber, which runs on the thread's native
    /// stack. Owned for the FCB's lifetime, recycled together with it.
    stack: Option<FiberStack>,
    /// Where this fiber's context went when it last switched away. `None`
    /// until the fiber first suspends (or, for a fresh fiber, until
    /// `init_stack` seeds it).
    pub(crate) saved_sp: Cell<Option<StackPointer>>,
    pub(crate) return_value: Cell<usize>,
    /// Fibers blocked in `join` on this fiber; drained when it exits.
    pub(crate) join_waiters: WaitQueue,
    /// The wait queue this FCB is linked on while `state == Blocked`.
    /// Non-owning; only dereferenced to unlink the FCB on wake.
    pub(crate) blocked_on: Cell<Option<NonNull<WaitQueue>>>,
    /// Where the waker should deposit the wake value; points into the
    /// suspended `block_current` frame on this fiber's stack.
    pub(crate) wake_slot: Cell<Option<NonNull<Option<WakeValue>>>>,
}

impl Fcb {
    pub(crate) fn new(id: u64, stack: Option<FiberStack>) -> Self {
        Fcb {
            links: list::Links::new(),
            id: Cell::new(id),
            state: Cell::new(State::Ready),
            flags: Cell::new(SpawnFlags::empty()),
            refs: Cell::new(1),
            stack,
            saved_sp: Cell::new(None),
            return_value: Cell::new(0),
            join_waiters: WaitQueue::new(),
            blocked_on: Cell::new(None),
            wake_slot: Cell::new(None),
        }
    }

    pub(crate) fn stack(&self) -> Option<&FiberStack> {
        self.stack.as_ref()
    }

    pub(crate) fn stack_capacity(&self) -> usize {
        self.stack.as_ref().map_or(0, FiberStack::size)
    }

    /// Make a recycled FCB indistinguishable from a fresh one (the stack is
    /// kept and reused as-is).
    pub(crate) fn reset(&self, id: u64) {
        debug_assert_eq!(self.state.get(), State::Dead);
        debug_assert!(self.join_waiters.is_empty());
        self.id.set(id);
        self.state.set(State::Ready);
        self.flags.set(SpawnFlags::empty());
        self.refs.set(1);
        self.saved_sp.set(None);
        self.return_value.set(0);
        self.blocked_on.set(None);
        self.wake_slot.set(None);
    }
}

// Safety: FCBs are heap-allocated and never move until they are freed, and
// `links` is only manipulated through the single list the FCB is currently
// on.
unsafe impl Linked<list::Links<Fcb>> for Fcb {
    type Handle = NonNull<Self>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }
    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }
    unsafe fn links(ptr: NonNull<Self>) -> NonNull<list::Links<Self>> {
        ptr.map_addr(|addr| {
            let offset = offset_of!(Self, links);
            addr.checked_add(offset).unwrap()
        })
        .cast()
    }
}

// === public handles ===

/// A reference-counted handle to a fiber.
///
/// Cloning takes a reference, dropping releases it; the fiber's control
/// block stays alive (and e.g. its exit status observable) as long as any
/// handle does. Handles cannot leave the thread whose runtime owns the
/// fiber.
pub struct Fiber {
    fcb: NonNull<Fcb>,
}

impl Fiber {
    pub(crate) fn from_fcb(fcb: NonNull<Fcb>) -> Self {
        Fiber { fcb }
    }

    pub(crate) fn fcb(&self) -> NonNull<Fcb> {
        self.fcb
    }

    /// An identifier unique among the fibers of this thread's runtime.
    pub fn id(&self) -> u64 {
        // Safety: the handle holds a reference, the FCB is live.
        unsafe { self.fcb.as_ref() }.id.get()
    }
}

impl Clone for Fiber {
    fn clone(&self) -> Self {
        runtime().ref_fiber(self.fcb);
        Fiber { fcb: self.fcb }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        runtime().unref_fiber(self.fcb);
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        self.fcb == other.fcb
    }
}

impl Eq for Fiber {}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber").field("id", &self.id()).finish()
    }
}

/// An owned permission to [`join`][JoinHandle::join] a fiber.
///
/// Dropping the handle without joining detaches the fiber: it keeps running
/// and its return value is discarded when it exits.
#[derive(Debug)]
pub struct JoinHandle {
    fiber: Fiber,
}

impl JoinHandle {
    /// The fiber this handle refers to.
    pub fn fiber(&self) -> &Fiber {
        &self.fiber
    }

    /// Wait for the fiber to exit and return its return value.
    ///
    /// Returns immediately for a fiber that has already exited; otherwise
    /// the caller blocks until the target calls [`exit`] or returns from its
    /// entry closure. In both cases the handle's reference is released. A
    /// self-join is refused before any of that: the handle is forgotten and
    /// the reference it held stays counted against the fiber.
    ///
    /// # Errors
    ///
    /// [`Error::Deadlock`] when joining the calling fiber itself, or when
    /// the wait can never be satisfied because every other fiber is blocked
    /// too.
    pub fn join(self) -> Result<usize, Error> {
        let rt = runtime();
        let target = self.fiber.fcb;
        if target == rt.current_fcb() {
            // Refused before the reference accounting: the unref happens
            // only on the completed or blocked paths below.
            mem::forget(self);
            return Err(Error::Deadlock);
        }
        // Safety: the handle holds a reference, the FCB is live.
        let fcb = unsafe { target.as_ref() };
        if fcb.state.get() == State::Dead {
            return Ok(fcb.return_value.get());
        }
        rt.block_current(&fcb.join_waiters)
    }
}

// === spawning ===

/// Configuration for a new fiber.
///
/// ```
/// let handle = weft::Builder::new()
///     .stack_size(64 * 1024)
///     .spawn(|| 7)
///     .unwrap();
/// assert_eq!(handle.join().unwrap(), 7);
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    stack_size: usize,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Usable stack capacity for the new fiber, in bytes. Rounded up to the
    /// platform minimum; the default is 8 MiB.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Spawn a joinable fiber running `f`.
    ///
    /// The fiber is enqueued ready but does not run until the caller yields
    /// or blocks.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] when the stack cannot be allocated.
    pub fn spawn<F>(self, f: F) -> Result<JoinHandle, Error>
    where
        F: FnOnce() -> usize + 'static,
    {
        let fcb = spawn_inner(self.stack_size, SpawnFlags::empty(), Box::new(f))?;
        Ok(JoinHandle {
            fiber: Fiber::from_fcb(fcb),
        })
    }

    /// Spawn a detached fiber running `f`: no handle is retained and the
    /// FCB is reclaimed as soon as the fiber exits.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] when the stack cannot be allocated.
    pub fn spawn_detached<F>(self, f: F) -> Result<(), Error>
    where
        F: FnOnce() -> usize + 'static,
    {
        spawn_inner(self.stack_size, SpawnFlags::DETACHED, Box::new(f))?;
        Ok(())
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_inner(
    stack_size: usize,
    flags: SpawnFlags,
    f: EntryClosure,
) -> Result<NonNull<Fcb>, Error> {
    let rt = runtime();
    let fcb_ptr = rt.alloc_fcb(stack_size)?;
    // Safety: freshly allocated or just recycled, nobody else references it.
    let fcb = unsafe { fcb_ptr.as_ref() };
    fcb.flags.set(flags);
    // One reference owned by the running fiber itself (dropped on exit) and,
    // unless detached, one owned by the JoinHandle.
    fcb.refs
        .set(if flags.contains(SpawnFlags::DETACHED) { 1 } else { 2 });

    let arg = Box::into_raw(Box::new(f)).cast::<()>();
    let stack = fcb.stack().expect("spawned fiber has no stack");
    // Safety: the stack is fresh or holds only a completed fiber's dead
    // frames; the shims match the machine layer's contract.
    let sp = unsafe { weft_fiber::init_stack(stack, fiber_entry, arg, fiber_exit) };
    fcb.saved_sp.set(Some(sp));

    tracing::trace!(
        fiber = fcb.id.get(),
        stack_size,
        detached = flags.contains(SpawnFlags::DETACHED),
        "spawn"
    );
    rt.add_live(1);
    rt.ready_fiber(fcb_ptr);
    Ok(fcb_ptr)
}

/// First code a fresh fiber runs, called by the machine-layer trampoline.
unsafe extern "C" fn fiber_entry(arg: *mut ()) -> usize {
    // Safety: `arg` is the box written by `spawn_inner`, consumed exactly
    // once.
    let f = unsafe { *Box::from_raw(arg.cast::<EntryClosure>()) };
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(rv) => rv,
        Err(_) => {
            // A panic cannot unwind across the context-switch boundary, and
            // there is no thread edge to absorb it.
            tracing::error!("fiber panicked, aborting");
            std::process::abort()
        }
    }
}

extern "C" fn fiber_exit(rv: usize) -> ! {
    exit(rv)
}

// === free functions ===

/// Spawn a joinable fiber with the default stack size.
///
/// Shorthand for [`Builder::new().spawn(f)`][Builder::spawn].
///
/// # Errors
///
/// [`Error::OutOfMemory`] when the stack cannot be allocated.
pub fn spawn<F>(f: F) -> Result<JoinHandle, Error>
where
    F: FnOnce() -> usize + 'static,
{
    Builder::new().spawn(f)
}

/// A handle to the calling fiber.
pub fn current() -> Fiber {
    let rt = runtime();
    let fcb = rt.current_fcb();
    rt.ref_fiber(fcb);
    Fiber::from_fcb(fcb)
}

/// Give up the CPU, moving the calling fiber to the tail of the ready queue.
///
/// Returns once the scheduler comes back around to it. A no-op when no other
/// fiber is ready.
pub fn yield_now() {
    let rt = runtime();
    rt.ready_fiber(rt.current_fcb());
    rt.schedule();
}

/// Yield directly to `target`, bypassing the fibers queued ahead of it.
///
/// The caller is requeued at the tail of the ready queue, so the rest of the
/// ready order is undisturbed. Yielding to oneself is a no-op.
///
/// # Errors
///
/// [`Error::NoSuch`] when `target` is dead, [`Error::Busy`] when it is
/// blocked.
pub fn yield_to(target: &Fiber) -> Result<(), Error> {
    let rt = runtime();
    let t = target.fcb();
    if t == rt.current_fcb() {
        return Ok(());
    }
    // Safety: the caller's handle keeps the FCB live.
    match unsafe { t.as_ref() }.state.get() {
        State::Dead => Err(Error::NoSuch),
        State::Blocked => Err(Error::Busy),
        State::Ready => {
            rt.detach_ready(t);
            rt.ready_fiber(rt.current_fcb());
            rt.switch_to(t);
            Ok(())
        }
    }
}

/// Exit the calling fiber with the given return value, waking all joiners.
///
/// Never returns. When this was the last live fiber the whole process exits,
/// with the low byte of `rv` as its status. Reached implicitly when a
/// fiber's entry closure returns.
///
/// Note that `exit` abandons the fiber's stack as-is: destructors of values
/// still live in its frames do not run. Returning from the entry closure
/// instead drops everything normally.
pub fn exit(rv: usize) -> ! {
    runtime().exit_current(rv)
}
