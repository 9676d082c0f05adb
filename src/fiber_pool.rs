//! Fiber pool (C2): owns all fiber memory, rents/returns handles, and
//! performs the raw context switch via `arch::swap_context`.

use crate::arch;
use crate::scratch::ScratchArena;
use crate::stack::{self, Stack};
use spin::Mutex;
use static_assertions::const_assert_eq;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

// A fiber handle is meant to travel inside the tagged `u64` data word every
// `swap_context` call carries (`worker::SwitchReason`); it must stay small
// enough to fit alongside the tag bits.
const_assert_eq!(size_of::<FiberHandle>(), 4);

/// A small integer identifying a fiber in the pool. Handles are reused once
/// a fiber is returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FiberHandle(pub(crate) u32);

struct FiberSlot {
    stack: Stack,
    /// Saved stack pointer. Only ever read/written by the fiber pool's
    /// `switch`, and only ever touched by the one worker currently holding
    /// this handle checked out (§3 invariant).
    sp: Cell<usize>,
    scratch: ScratchArena,
    /// Set while a switch is landing on this fiber for the first time, to
    /// detect the (programmer-error) case of renting a fiber that is
    /// somehow still mid-switch. Not load-bearing for correctness beyond a
    /// debug assertion.
    being_switched_into: AtomicBool,
}

/// Owns every fiber's stack and scratch arena for the lifetime of the
/// scheduler. Fibers are allocated once at startup and never freed
/// individually (§5 Memory reclamation).
pub(crate) struct FiberPool {
    slots: Vec<FiberSlot>,
    free_normal: Mutex<Vec<FiberHandle>>,
    free_large: Mutex<Vec<FiberHandle>>,
    normal_count: usize,
}

// Safety: a slot's `sp` cell and scratch arena are touched only by the one
// worker that currently has that slot's handle checked out (never two
// workers at once, by the free-list and `being_switched_into` invariants),
// even though the pool itself is shared across every worker thread.
unsafe impl Sync for FiberPool {}

impl FiberPool {
    pub(crate) fn new(normal_count: usize, large_count: usize) -> Self {
        let mut slots = Vec::with_capacity(normal_count + large_count);
        let mut free_normal = Vec::with_capacity(normal_count);
        let mut free_large = Vec::with_capacity(large_count);

        for i in 0..normal_count {
            slots.push(FiberSlot {
                stack: Stack::new(stack::DEFAULT_STACK_SIZE)
                    .expect("failed to allocate fiber stack"),
                sp: Cell::new(0),
                scratch: ScratchArena::new(),
                being_switched_into: AtomicBool::new(false),
            });
            free_normal.push(FiberHandle(i as u32));
        }
        for i in 0..large_count {
            let handle = FiberHandle((normal_count + i) as u32);
            slots.push(FiberSlot {
                stack: Stack::new(stack::LARGE_STACK_SIZE)
                    .expect("failed to allocate large fiber stack"),
                sp: Cell::new(0),
                scratch: ScratchArena::new(),
                being_switched_into: AtomicBool::new(false),
            });
            free_large.push(handle);
        }

        Self {
            slots,
            free_normal: Mutex::new(free_normal),
            free_large: Mutex::new(free_large),
            normal_count,
        }
    }

    /// Whether `handle` refers to a large-stack slot (slots are laid out
    /// `[normal..][large..]`, so this is a single comparison).
    pub(crate) fn is_large(&self, handle: FiberHandle) -> bool {
        handle.0 as usize >= self.normal_count
    }

    /// Rent a fiber from the pool, initializing its stack so the first
    /// switch into it lands on the common dispatch-loop trampoline.
    /// Exhaustion is a fatal configuration error (§4.2, §7): the pool size
    /// is fixed at startup and callers are expected to bound parallelism so
    /// this never happens in a correctly configured engine.
    pub(crate) fn rent(&self, large_stack: bool) -> FiberHandle {
        let free_list = if large_stack { &self.free_large } else { &self.free_normal };
        let handle = free_list.lock().pop().unwrap_or_else(|| {
            tracing::error!(large_stack, "fiber pool exhausted");
            panic!(
                "fiber pool exhausted (large_stack={large_stack}); this is a fatal configuration \
                 error, not a runtime fault - increase the pool size or reduce parallelism"
            );
        });

        let slot = &self.slots[handle.0 as usize];
        debug_assert!(
            !slot.being_switched_into.load(Ordering::Acquire),
            "fiber {handle:?} rented while still mid-switch"
        );
        // Safety: the stack just came off the free list, so nothing else
        // references it.
        let sp = unsafe { arch::init_stack(slot.stack.top()) };
        slot.sp.set(sp);
        handle
    }

    /// Return a fiber to the free list. Its scratch arena is reset here
    /// (§4.2, §8).
    pub(crate) fn recycle(&self, handle: FiberHandle, large_stack: bool) {
        self.slots[handle.0 as usize].scratch.reset();
        let free_list = if large_stack { &self.free_large } else { &self.free_normal };
        free_list.lock().push(handle);
    }

    pub(crate) fn scratch(&self, handle: FiberHandle) -> &ScratchArena {
        &self.slots[handle.0 as usize].scratch
    }

    /// Perform the raw stack switch from `current` to `target`, carrying
    /// `data` across. Returns the data word handed to `current` by whoever
    /// next switches back into it.
    ///
    /// # Safety
    /// `current` must be the fiber the calling OS thread is presently
    /// executing on, and `target` must be checked out to nobody else.
    pub(crate) unsafe fn switch(&self, current: FiberHandle, target: FiberHandle, data: u64) -> u64 {
        let current_slot = &self.slots[current.0 as usize];
        let target_slot = &self.slots[target.0 as usize];

        target_slot.being_switched_into.store(true, Ordering::Release);
        let save_sp = current_slot.sp.as_ptr() as *mut u64;
        let new_sp = target_slot.sp.get() as u64;

        // Safety: the caller's contract guarantees exclusive access to both
        // `current` (we're running on it) and `target` (checked out to us).
        let ret = unsafe { arch::swap_context(new_sp, save_sp, data) };
        target_slot.being_switched_into.store(false, Ordering::Release);
        ret
    }

    /// Switch from the native OS thread stack into `target`, saving the
    /// native stack pointer into `save_sp`. Used once per worker at startup
    /// (§4.5) and again at shutdown to switch back out.
    ///
    /// # Safety
    /// `save_sp` must be a stack slot that outlives the switch back (i.e. a
    /// local in a function that does not return until resumed), and `target`
    /// must be checked out to nobody else.
    pub(crate) unsafe fn switch_from_native(
        &self,
        save_sp: &Cell<usize>,
        target: FiberHandle,
        data: u64,
    ) -> u64 {
        let target_slot = &self.slots[target.0 as usize];
        target_slot.being_switched_into.store(true, Ordering::Release);
        let new_sp = target_slot.sp.get() as u64;
        // Safety: see function safety doc.
        let ret = unsafe { arch::swap_context(new_sp, save_sp.as_ptr() as *mut u64, data) };
        target_slot.being_switched_into.store(false, Ordering::Release);
        ret
    }

    /// Switch from `current` back onto a previously-saved native stack
    /// pointer. Does not return on `current`'s side until something targets
    /// `current` again with another `switch`/`switch_from_native` call.
    ///
    /// # Safety
    /// `current` must be the fiber the calling OS thread is presently
    /// executing on, and `native_sp` must be the slot a matching
    /// `switch_from_native` saved into.
    pub(crate) unsafe fn switch_to_native(
        &self,
        current: FiberHandle,
        native_sp: usize,
        data: u64,
    ) -> u64 {
        let current_slot = &self.slots[current.0 as usize];
        let save_sp = current_slot.sp.as_ptr() as *mut u64;
        // Safety: see function safety doc.
        unsafe { arch::swap_context(native_sp as u64, save_sp, data) }
    }
}

/// Reconstructs which fiber is "self" and which scheduler owns it from the
/// thread-local set up by the worker before its first switch, then enters
/// the dispatch loop. This is the "common entry point" every rented fiber
/// starts at (§4.2).
///
/// # Safety
/// Must only ever be reached as the target of the very first `swap_context`
/// into a freshly initialized stack (i.e. only called from the
/// `arch::*::trampoline_landing` stubs).
pub(crate) unsafe extern "C" fn fiber_entry(data: u64) -> ! {
    crate::worker::run_dispatch_loop(data)
}
