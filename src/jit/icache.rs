//! Instruction-cache maintenance after writing code.

use std::sync::atomic::{Ordering, compiler_fence};

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

#[cfg(all(target_arch = "aarch64", target_vendor = "apple"))]
unsafe extern "C" {
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

/// Make instructions written to `[start, end)` visible to instruction fetch.
///
/// x86 keeps the caches coherent, so only a compiler fence is needed there.
pub fn invalidate(start: *const u8, end: *const u8) {
    debug_assert!(start <= end);

    #[cfg(all(target_arch = "aarch64", target_os = "linux"))]
    // SAFETY: __clear_cache only performs cache maintenance on the range.
    unsafe {
        __clear_cache(start as *mut libc::c_char, end as *mut libc::c_char);
    }

    #[cfg(all(target_arch = "aarch64", target_vendor = "apple"))]
    // SAFETY: as above.
    unsafe {
        sys_icache_invalidate(start as *mut libc::c_void, end as usize - start as usize);
    }

    #[cfg(not(target_arch = "aarch64"))]
    let _ = (start, end);

    compiler_fence(Ordering::SeqCst);
}
