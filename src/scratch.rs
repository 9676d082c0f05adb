//! Per-fiber scratch allocator (C8): a bump arena reset whenever its owning
//! fiber is returned to the pool.

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

const PAGE_SIZE: usize = 4096;
/// Arenas that grew past this many pages during a fiber's lifetime keep
/// their extra pages after a reset, instead of giving them back to the
/// system, to avoid thrashing allocate/free cycles for fibers that
/// consistently need more scratch space than the default.
const SHRINK_THRESHOLD_PAGES: usize = 4;

struct Chunk {
    base: NonNull<u8>,
    layout: Layout,
}

// Safety: a `Chunk` is only ever accessed through its owning `ScratchArena`,
// which is itself only used by the single fiber it belongs to (§4.8
// "single-threaded").
unsafe impl Send for Chunk {}

impl Drop for Chunk {
    fn drop(&mut self) {
        // Safety: `base`/`layout` came from a matching `alloc::alloc` call.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

struct Inner {
    chunks: Vec<Chunk>,
    /// Bump cursor within the last chunk, as an offset from its base.
    cursor: usize,
}

/// A linear (bump) arena bound to one fiber. Allocations are never freed
/// individually; the whole arena rewinds to empty in O(1) when the fiber
/// that owns it is returned to the pool.
pub(crate) struct ScratchArena {
    inner: RefCell<Inner>,
    high_water_pages: Cell<usize>,
}

impl ScratchArena {
    pub(crate) fn new() -> Self {
        Self { inner: RefCell::new(Inner { chunks: Vec::new(), cursor: 0 }), high_water_pages: Cell::new(0) }
    }

    /// Bump-allocate `size` bytes aligned to `align`. Grows by requesting a
    /// fresh page-sized chunk from the system allocator on demand.
    pub(crate) fn alloc(&self, size: usize, align: usize) -> NonNull<u8> {
        let mut inner = self.inner.borrow_mut();

        if let Some(chunk) = inner.chunks.last() {
            let base = chunk.base.as_ptr() as usize;
            let cursor = inner.cursor;
            let aligned = (base + cursor).next_multiple_of(align) - base;
            if aligned + size <= chunk.layout.size() {
                inner.cursor = aligned + size;
                // Safety: `aligned + size <= chunk.layout.size()`, within bounds.
                return unsafe { NonNull::new_unchecked(chunk.base.as_ptr().add(aligned)) };
            }
        }

        let chunk_size = (size + align).max(PAGE_SIZE).next_multiple_of(PAGE_SIZE);
        let layout = Layout::from_size_align(chunk_size, align.max(8))
            .expect("scratch arena chunk layout overflow");
        // Safety: `layout` has nonzero size.
        let base = unsafe { alloc::alloc(layout) };
        let base = NonNull::new(base).expect("scratch arena chunk allocation failed");

        inner.chunks.push(Chunk { base, layout });
        let pages = inner.chunks.len();
        if pages > self.high_water_pages.get() {
            self.high_water_pages.set(pages);
        }
        inner.cursor = size;
        base
    }

    /// Rewind the arena to empty. Called when the owning fiber is returned
    /// to the free list (§4.2, §8).
    pub(crate) fn reset(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.cursor = 0;

        if self.high_water_pages.get() > SHRINK_THRESHOLD_PAGES {
            inner.chunks.clear();
        } else if let Some(first) = inner.chunks.drain(1..).last() {
            drop(first);
        }

        self.high_water_pages.set(inner.chunks.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocations_stay_within_a_chunk_when_possible() {
        let arena = ScratchArena::new();
        let a = arena.alloc(64, 8);
        let b = arena.alloc(64, 8);
        assert_ne!(a, b);
        assert_eq!(arena.inner.borrow().chunks.len(), 1);
    }

    #[test]
    fn reset_rewinds_cursor_and_keeps_one_chunk() {
        let arena = ScratchArena::new();
        arena.alloc(64, 8);
        arena.reset();
        assert_eq!(arena.inner.borrow().cursor, 0);
        assert_eq!(arena.inner.borrow().chunks.len(), 1);
    }

    #[test]
    fn reset_drops_extra_chunks_past_the_shrink_threshold() {
        let arena = ScratchArena::new();
        // Force well more than SHRINK_THRESHOLD_PAGES chunks by allocating
        // more than a page at a time.
        for _ in 0..(SHRINK_THRESHOLD_PAGES + 2) {
            arena.alloc(PAGE_SIZE + 1, 8);
        }
        assert!(arena.inner.borrow().chunks.len() > SHRINK_THRESHOLD_PAGES);
        arena.reset();
        // Over the threshold: every page, including what would otherwise be
        // the kept first chunk, is given back rather than held resident.
        assert_eq!(arena.inner.borrow().chunks.len(), 0);
    }
}

/// A handle to the calling job's fiber-scoped bump arena (C8), obtained via
/// [`crate::current_scratch`]. Valid only while the fiber it was issued for
/// is still running its current job; do not stash it past `execute()`
/// returning.
pub struct Scratch<'a>(&'a ScratchArena);

impl<'a> Scratch<'a> {
    pub(crate) fn new(arena: &'a ScratchArena) -> Self {
        Self(arena)
    }

    /// Bump-allocates `layout`'s worth of scratch memory. Never individually
    /// freed; reclaimed in bulk when the fiber returns to the pool.
    pub fn alloc(&self, layout: Layout) -> NonNull<u8> {
        self.0.alloc(layout.size(), layout.align())
    }
}
