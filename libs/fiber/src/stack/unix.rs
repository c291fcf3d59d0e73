// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::stack::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE, StackPointer};
use std::io;
use std::ptr;

/// A fiber stack backed by an anonymous mapping, with one inaccessible page
/// at the low end so an overflow traps instead of scribbling over whatever
/// happens to live below. Never moved or resized; unmapped on drop.
pub struct FiberStack {
    /// Start of the whole mapping; the guard page lives here.
    base: *mut libc::c_void,
    /// Length of the whole mapping, guard page included.
    len: usize,
    /// Guard page length, recorded at map time.
    guard: usize,
}

impl FiberStack {
    /// Map a new stack with at least `size` usable bytes.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the mapping cannot be created, typically
    /// address-space or memory exhaustion.
    pub fn new(size: usize) -> io::Result<Self> {
        let guard = host_page_size();
        let usable = size.max(MIN_STACK_SIZE).next_multiple_of(guard);
        let len = usable + guard;

        #[cfg(target_os = "openbsd")]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK;
        #[cfg(not(target_os = "openbsd"))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        // Safety: a fresh anonymous mapping aliases nothing, and the
        // mprotect stays within it.
        unsafe {
            let base = libc::mmap(ptr::null_mut(), len, libc::PROT_NONE, flags, -1, 0);
            if base == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            // Construct before the mprotect so a failure past this point
            // unmaps everything again on the way out.
            let stack = FiberStack { base, len, guard };
            let rw = libc::PROT_READ | libc::PROT_WRITE;
            if libc::mprotect(base.byte_add(guard), usable, rw) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(stack)
        }
    }

    /// Highest address of the stack; frames grow downwards from here.
    pub fn top(&self) -> StackPointer {
        StackPointer::new(self.base as usize + self.len).unwrap()
    }

    /// Lowest address of the mapping, guard page included.
    pub fn bottom(&self) -> StackPointer {
        StackPointer::new(self.base as usize).unwrap()
    }

    /// Usable bytes between the guard page and the top.
    pub fn size(&self) -> usize {
        self.len - self.guard
    }
}

impl Default for FiberStack {
    fn default() -> Self {
        Self::new(DEFAULT_STACK_SIZE).expect("failed to allocate stack")
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        // Safety: `base`/`len` describe a mapping we own, and nothing runs
        // on it anymore.
        let rc = unsafe { libc::munmap(self.base, self.len) };
        debug_assert_eq!(rc, 0);
    }
}

fn host_page_size() -> usize {
    // Safety: pure query, no side effects.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(raw).expect("page size query failed")
}
