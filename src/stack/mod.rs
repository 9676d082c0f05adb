//! Fiber stack allocation.
//!
//! Every fiber owns a fixed-size region obtained from the platform's page
//! allocator (§6: "a page allocator returning page-aligned, committed memory
//! chunks"), with a guard page at the low end so a stack overflow faults
//! instead of silently corrupting an adjacent fiber's stack.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::Stack;
    } else if #[cfg(windows)] {
        mod windows;
        pub use windows::Stack;
    }
}

/// Default stack size for ordinary fibers (§9 Open Questions: "typical
/// values observed are 128 fibers of 64 KiB each").
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Stack size for fibers declared stack-hungry at rent time.
pub const LARGE_STACK_SIZE: usize = 512 * 1024;

pub const MIN_STACK_SIZE: usize = 4096;
