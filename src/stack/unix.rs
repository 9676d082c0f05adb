use crate::stack::MIN_STACK_SIZE;
use std::io;
use std::ptr;

/// A guard-paged stack obtained via `mmap`.
pub struct Stack {
    top: usize,
    mmap_len: usize,
}

impl Stack {
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(MIN_STACK_SIZE);
        let page_size = page_size();
        let mmap_len = size
            .checked_add(page_size)
            .expect("integer overflow while calculating stack size")
            .next_multiple_of(page_size);

        // Safety: mmap with MAP_ANONYMOUS | MAP_PRIVATE is always safe to call.
        unsafe {
            let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            let base = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if base == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            // Leave the lowest page as an inaccessible guard page; the rest
            // is the usable stack.
            if libc::mprotect(
                base.cast::<u8>().add(page_size).cast(),
                mmap_len - page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                let err = io::Error::last_os_error();
                libc::munmap(base, mmap_len);
                return Err(err);
            }

            Ok(Self { top: base as usize + mmap_len, mmap_len })
        }
    }

    pub fn top(&self) -> usize {
        self.top
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // Safety: `top - mmap_len` is exactly the base address returned by
        // the `mmap` call that created this stack.
        unsafe {
            let base = self.top - self.mmap_len;
            let ret = libc::munmap(base as *mut _, self.mmap_len);
            debug_assert_eq!(ret, 0, "munmap of fiber stack failed");
        }
    }
}

fn page_size() -> usize {
    // Safety: sysconf(_SC_PAGESIZE) has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(page_size.is_power_of_two());
    page_size
}
