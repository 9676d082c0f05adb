use crate::stack::MIN_STACK_SIZE;
use std::io;
use std::ptr;
use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_GUARD, PAGE_NOACCESS, PAGE_READWRITE, VirtualAlloc,
    VirtualFree,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// A guard-paged stack obtained via `VirtualAlloc`.
pub struct Stack {
    top: usize,
    base: *mut core::ffi::c_void,
}

// Safety: the raw pointer is only ever touched by `Drop`, and ownership of a
// `Stack` implies exclusive access to the memory it describes.
unsafe impl Send for Stack {}

impl Stack {
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(MIN_STACK_SIZE);
        let page_size = page_size();
        let reserve_len = size
            .checked_add(page_size)
            .expect("integer overflow while calculating stack size")
            .next_multiple_of(page_size);

        // Safety: VirtualAlloc/VirtualFree calls below follow the documented
        // reserve-then-commit-then-guard protocol.
        unsafe {
            let base = VirtualAlloc(ptr::null_mut(), reserve_len, MEM_RESERVE, PAGE_READWRITE);
            if base.is_null() {
                return Err(io::Error::last_os_error());
            }

            let committed =
                VirtualAlloc(base, reserve_len, MEM_COMMIT, PAGE_READWRITE);
            if committed.is_null() {
                let err = io::Error::last_os_error();
                VirtualFree(base, 0, MEM_RELEASE);
                return Err(err);
            }

            // Turn the lowest page into a guard page so overflow traps.
            let mut old_protect = 0u32;
            let guard_ok = windows_sys::Win32::System::Memory::VirtualProtect(
                base,
                page_size,
                PAGE_NOACCESS | PAGE_GUARD,
                &mut old_protect,
            );
            if guard_ok == 0 {
                let err = io::Error::last_os_error();
                VirtualFree(base, 0, MEM_RELEASE);
                return Err(err);
            }

            Ok(Self { top: base as usize + reserve_len, base })
        }
    }

    pub fn top(&self) -> usize {
        self.top
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // Safety: `self.base` was returned by `VirtualAlloc` in `new`.
        unsafe {
            let ok = VirtualFree(self.base, 0, MEM_RELEASE);
            debug_assert_ne!(ok, 0, "VirtualFree of fiber stack failed");
        }
    }
}

fn page_size() -> usize {
    // Safety: GetSystemInfo writes into a stack-local, fully-initialized struct.
    unsafe {
        let mut info: SYSTEM_INFO = core::mem::zeroed();
        GetSystemInfo(&mut info);
        info.dwPageSize as usize
    }
}
