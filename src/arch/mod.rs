//! Per-ABI implementation of the raw context switch (component C1).
//!
//! Every variant exposes the same three free functions:
//!
//! - [`STACK_ALIGNMENT`]: required alignment of a fresh stack pointer.
//! - `init_stack`: lays out a brand-new stack so that the first switch into
//!   it lands on the fiber trampoline.
//! - `swap_context`: the symmetric stack swap itself.
//!
//! Unlike the asymmetric "coroutine" switch used by generator-style crates,
//! fiberjobs fibers switch peer-to-peer: either side of a `swap_context` call
//! may resume either other fiber next, which is what the job scheduler's
//! ready-fiber queue requires (see `fiber_pool.rs`).

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", not(windows)))] {
        mod x86_64;
        pub use x86_64::*;
    } else if #[cfg(all(target_arch = "x86_64", windows))] {
        mod x86_64_windows;
        pub use x86_64_windows::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    } else {
        compile_error!("fiberjobs: unsupported target architecture (supported: x86_64, aarch64)");
    }
}

/// Non-naked landing point jumped to by every arch's trampoline stub once the
/// switch's `data` word has been moved into the first argument register.
/// Exists so each `arch::*` module doesn't need to know about `fiber_pool`.
pub(crate) unsafe extern "C" fn fiber_entry_trampoline(data: u64) -> ! {
    crate::fiber_pool::fiber_entry(data)
}
