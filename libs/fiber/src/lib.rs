//! Safe stack switching support for the weft runtime.
//!
//! This crate implements the machine-dependent half of cooperative fibers:
//! guard-paged stacks and the register save/restore that moves the CPU from
//! one fiber's stack to another's. The scheduler above it uses exactly two
//! operations:
//!
//! - [`init_stack`] writes an initial frame onto a fresh stack such that the
//!   first [`switch`] into it enters a trampoline, which calls the supplied
//!   entry function and hands whatever it returns to the supplied exit
//!   function. The exit function must never return; a fiber's stack has no
//!   caller frame to return into.
//! - [`switch`] saves the callee-saved register state of the running context
//!   (everything the psABI requires a function call to preserve, including
//!   the callee-saved FP registers on aarch64 and riscv64), stores the
//!   resulting stack pointer through `save`, and resumes the context whose
//!   stack pointer is stored at `restore`. The caller appears to return from
//!   `switch` when some other context later switches back to it.
//!
//! Caller-saved registers need no treatment: `switch` is an `extern "C"`
//! call, so the compiler has already spilled anything live across it.
//!
//! Supported targets are x86_64 (SysV), aarch64 and riscv64 on unix hosts;
//! anything else fails to compile.

mod arch;
pub mod stack;

pub use arch::{init_stack, switch};
pub use stack::{DEFAULT_STACK_SIZE, FiberStack, MIN_STACK_SIZE, STACK_ALIGNMENT, StackPointer};

/// A fiber's entry function, as seen by the trampoline: one opaque pointer
/// in, one machine word out.
pub type EntryFn = unsafe extern "C" fn(arg: *mut ()) -> usize;

/// The function the trampoline calls with the entry function's return value.
///
/// Must never return; the trampoline has nothing to return into.
pub type ExitFn = extern "C" fn(rv: usize) -> !;
