//! x86-64 System V context switch.
//!
//! Adapted from the linked-stack switch in `corosensei`-style fiber crates,
//! simplified to a *symmetric* peer-to-peer swap: there is no distinguished
//! "parent" stack, any fiber may resume any other. Unwinding across a switch
//! is not supported (jobs are run inside `catch_unwind`, see `worker.rs`), so
//! the CFI bookkeeping such crates carry is dropped here.

use core::arch::naked_asm;

pub const STACK_ALIGNMENT: usize = 16;

/// Lay out a fresh stack so the first `swap_context` into it starts
/// executing the fiber trampoline with the switch's `data` word as its
/// argument.
///
/// # Safety
/// `top` must be the aligned, writable top of a region at least large enough
/// to hold the fake register-save frame constructed here.
pub unsafe fn init_stack(top: usize) -> usize {
    // Safety: caller guarantees `top` is a valid, aligned, writable stack top.
    unsafe {
        let mut sp = top;

        // The landing stub expects to `ret` into it; push its address as the
        // fake return address below the callee-saved register slots.
        sp -= 8;
        *(sp as *mut u64) = trampoline_landing as usize as u64;

        // Six callee-saved register slots (rbp, rbx, r12-r15). Their initial
        // values are never read because `trampoline_landing` never restores
        // the fiber's own "previous" state - it's the first run.
        for _ in 0..6 {
            sp -= 8;
            *(sp as *mut u64) = 0;
        }

        // Seven words (the trampoline slot plus six register slots) below a
        // 16-aligned `top` leaves `sp` at `top - 56`, which is `8 mod 16`,
        // not `0`: the same residue a normal `call` leaves behind (return
        // address pushed, no further alignment), since `trampoline_landing`
        // is reached via this fake "return address" rather than a `call`.
        debug_assert_eq!(sp % STACK_ALIGNMENT, 8);
        sp
    }
}

/// Symmetric stack swap. Saves the calling fiber's callee-saved registers and
/// stack pointer into `*save_sp`, switches to `new_sp`, and restores the
/// registers that were saved there by a previous call to this function (or
/// the fake frame built by [`init_stack`]).
///
/// Returns the `data` word handed to us by whoever switched into us. This is
/// symmetric with the `data` argument: the side that performs the switch
/// passes `data`, the side that is resumed receives it as the return value
/// of its own still-pending `swap_context` call.
///
/// # Safety
/// `new_sp` must point at a stack previously parked by this function (or
/// freshly initialized by [`init_stack`]); `save_sp` must be a valid, writable
/// location that nobody else concurrently writes to.
#[unsafe(naked)]
pub unsafe extern "C" fn swap_context(new_sp: u64, save_sp: *mut u64, data: u64) -> u64 {
    naked_asm!(
        // Save the six callee-saved registers of the *current* side. rbx/rbp
        // are LLVM-reserved and cannot be listed as clobbers, so they are
        // pushed explicitly like the rest.
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // Park our stack pointer where the caller can find it again.
        "mov [rsi], rsp",
        // Switch to the target fiber's stack.
        "mov rsp, rdi",
        // Restore the registers that fiber last saved (or the zeroed
        // placeholders from `init_stack`).
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        // `data` arrived in rdx; the System V return-value register is rax.
        "mov rax, rdx",
        // Returns into whatever address sits on top of the target's stack:
        // either back into a prior `swap_context` call, or into
        // `trampoline_landing` on a fiber's first resumption.
        "ret",
    );
}

/// Tiny landing pad run on a fiber's first resumption. `swap_context` returns
/// its `data` argument in `rax`; this moves it into `rdi` (the first
/// argument register) and jumps (not calls - there is nothing to return to)
/// into the real, non-naked entry point.
#[unsafe(naked)]
unsafe extern "C" fn trampoline_landing() -> ! {
    naked_asm!("mov rdi, rax", "jmp {entry}", entry = sym super::fiber_entry_trampoline);
}
