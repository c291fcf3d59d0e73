// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! SysV x86_64 switching.
//!
//! A suspended context is its six callee-saved registers pushed below a
//! return address:
//!
//! ```text
//! top -  8   return address (trampoline on first entry)
//! top - 16   rbp
//! top - 24   rbx
//! top - 32   r12
//! top - 40   r13
//! top - 48   r14
//! top - 56   r15   <- saved stack pointer
//! ```
//!
//! For a fresh fiber, [`init_stack`] seeds RBX/R12/R13 with the entry
//! function, its argument and the exit function; the restore half of
//! [`switch`] pops them and returns into [`stack_init_trampoline`].

use crate::stack::{FiberStack, StackPointer};
use crate::{EntryFn, ExitFn};
use core::arch::naked_asm;

pub const STACK_ALIGNMENT: usize = 16;

/// Write the initial frame for a fresh fiber onto `stack` and return the
/// stack pointer to later restore from.
///
/// # Safety
///
/// `stack` must be unused (or hold only completed fibers' dead frames), and
/// the returned pointer must be restored at most once.
pub unsafe fn init_stack(
    stack: &FiberStack,
    entry: EntryFn,
    arg: *mut (),
    exit_fn: ExitFn,
) -> StackPointer {
    // Safety: the frame fits comfortably above the guard page; the slot
    // layout mirrors the pops in `switch`.
    unsafe {
        let top = stack.top().get();
        debug_assert_eq!(top % STACK_ALIGNMENT, 0);
        let sp = top - 56;
        // After the restore: RSP ends up at `top`, which keeps the trampoline's
        // CALL instructions 16-byte aligned as the ABI wants.
        (sp as *mut usize).write(0); // r15
        ((sp + 8) as *mut usize).write(0); // r14
        ((sp + 16) as *mut usize).write(exit_fn as usize); // r13
        ((sp + 24) as *mut usize).write(arg as usize); // r12
        ((sp + 32) as *mut usize).write(entry as usize); // rbx
        ((sp + 40) as *mut usize).write(0); // rbp
        ((sp + 48) as *mut usize).write(stack_init_trampoline as usize);
        StackPointer::new_unchecked(sp)
    }
}

#[unsafe(naked)]
unsafe extern "C" fn stack_init_trampoline() {
    naked_asm! {
        ".balign 16",
        // The restore half of `switch` just popped the frame written by
        // init_stack() and returned here: the entry function is in RBX, its
        // argument in R12, the exit function in R13, RSP at the stack top.
        "mov rdi, r12",
        "call rbx",
        // Hand the entry function's return value to the exit function. It
        // never returns; the trap below catches a broken one.
        "mov rdi, rax",
        "call r13",
        "ud2",
    }
}

/// Save the current context through `save` and resume the one stored at
/// `restore`.
///
/// Returns when some other context later restores from `save`.
///
/// # Safety
///
/// `save` must be valid for a write. `restore` must hold a stack pointer
/// produced by [`init_stack`] or by an earlier save, for a context that has
/// not run since, and must not be `None` (the niche of
/// [`StackPointer`] — the assembly stores and loads these slots as plain
/// machine words).
#[unsafe(naked)]
pub unsafe extern "C" fn switch(
    save: *mut Option<StackPointer>,
    restore: *const Option<StackPointer>,
) {
    naked_asm! {
        // Callee-saved under the SysV ABI: RBP, RBX, R12-R15. Everything
        // else is dead across an extern "C" call.
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    }
}
