cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::FiberStack;
    } else {
        compile_error!("Unsupported host, fiber stacks need mmap");
    }
}

pub type StackPointer = core::num::NonZeroUsize;

/// Minimum size of a stack, excluding guard pages.
pub const MIN_STACK_SIZE: usize = 4096;

/// Stack size used when the caller does not request one explicitly.
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;

pub use crate::arch::STACK_ALIGNMENT;
