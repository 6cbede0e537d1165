use std::ptr::NonNull;

pub const PAGE_SIZE: usize = 4096;

/// Map `size` bytes of zeroed, page-aligned anonymous memory.
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    debug_assert!(size.is_multiple_of(PAGE_SIZE));
    // SAFETY: anonymous private mapping with no address hint.
    let ptr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        None
    } else {
        NonNull::new(ptr as *mut u8)
    }
}

pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr/size must come from a map_memory call.
    let _ = unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, size) };
}
