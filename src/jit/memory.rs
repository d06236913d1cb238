//! Executable memory management using mmap.
//!
//! Code lives in a single reserved region. Pages start inaccessible and are
//! toggled between read+write and read+execute, never both, and only while
//! the safepoint barrier is held.

use std::io;
use std::ptr::NonNull;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::debug;

use super::icache;
use super::safepoint::SafepointGuard;
use crate::error::{MemoryError, fatal};

/// Largest page size we accept from the OS.
const MAX_PAGE_SIZE: i64 = 1 << 30;

/// Step between placement attempts near the crate's own code.
#[cfg(target_os = "linux")]
const PROBE_STEP: usize = 4 * 1024 * 1024;

/// Alignment of each code block written to a region.
const CODE_ALIGN: usize = 16;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// The system page size, queried once.
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as i64;
        validate_page_size(raw).unwrap_or_else(|e| fatal(&e.to_string()))
    })
}

fn validate_page_size(raw: i64) -> Result<usize, MemoryError> {
    if raw <= 0 || raw > MAX_PAGE_SIZE {
        return Err(MemoryError::BadPageSize(raw));
    }
    Ok(raw as usize)
}

fn round_up_to_page(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page) * page
}

fn mmap_none(hint: *mut libc::c_void, size: usize, extra_flags: libc::c_int) -> Option<NonNull<u8>> {
    // SAFETY: anonymous PROT_NONE mapping; MAP_FIXED is never used, so no
    // existing mapping can be replaced.
    let ptr = unsafe {
        libc::mmap(
            hint,
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        None
    } else {
        NonNull::new(ptr.cast())
    }
}

/// Reserve `size` bytes of inaccessible address space, preferably within
/// `i32::MAX` bytes of this crate's code so generated code can reach it
/// with 32-bit displacements. Aborts if no address space is available.
pub fn reserve_address_space(size: usize) -> NonNull<u8> {
    let page = page_size();
    let sample = reserve_address_space as *const () as usize;

    #[cfg(target_os = "linux")]
    let reserved = {
        let limit = sample.saturating_add(i32::MAX as usize);
        let mut req = sample.div_ceil(page) * page;
        let mut found = None;
        while req < limit {
            if let Some(p) = mmap_none(req as *mut _, size, libc::MAP_FIXED_NOREPLACE) {
                found = Some(p);
                break;
            }
            req += PROBE_STEP;
        }
        found
    };

    #[cfg(not(target_os = "linux"))]
    let reserved = mmap_none((sample & !(page - 1)) as *mut _, size, 0);

    let reserved = reserved.or_else(|| mmap_none(std::ptr::null_mut(), size, 0));
    match reserved {
        Some(base) => {
            debug!(target: "jitcore::jit", base = ?base, size, "reserved code region");
            base
        }
        None => fatal(&format!(
            "failed to reserve {size} bytes of code memory: {}",
            io::Error::last_os_error()
        )),
    }
}

/// Make `[addr, addr + size)` readable and writable.
pub fn mark_writable(addr: *mut u8, size: usize) -> Result<(), MemoryError> {
    // SAFETY: mprotect only changes protection; callers pass page-aligned
    // ranges inside a reservation.
    let rc = unsafe { libc::mprotect(addr.cast(), size, libc::PROT_READ | libc::PROT_WRITE) };
    if rc != 0 {
        return Err(MemoryError::ProtectionFailed {
            addr: addr as usize,
            size,
            reason: io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}

/// Make `[addr, addr + size)` readable and executable. Aborts on failure.
pub fn mark_executable(addr: *mut u8, size: usize) {
    if size == 0 {
        return;
    }
    // SAFETY: as in mark_writable.
    let rc = unsafe { libc::mprotect(addr.cast(), size, libc::PROT_READ | libc::PROT_EXEC) };
    if rc != 0 {
        fatal(&format!(
            "mprotect(PROT_EXEC) failed at {:#x} ({size} bytes): {}",
            addr as usize,
            io::Error::last_os_error()
        ));
    }
}

/// Protection of one page of a code region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Protection {
    NoAccess = 0,
    Writable = 1,
    Executable = 2,
}

impl Protection {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Protection::Writable,
            2 => Protection::Executable,
            _ => Protection::NoAccess,
        }
    }
}

/// Entry address of code written to a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodePtr(NonNull<u8>);

impl CodePtr {
    pub(crate) fn from_raw(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(CodePtr)
    }

    pub fn as_ptr(self) -> *const u8 {
        self.0.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

// SAFETY: a CodePtr is an address into a region that is never unmapped.
unsafe impl Send for CodePtr {}
unsafe impl Sync for CodePtr {}

/// A reserved block of code memory.
///
/// Regions are never unmapped: compiled code may be referenced from frames
/// and caches the JIT cannot enumerate.
pub struct CodeRegion {
    base: NonNull<u8>,
    size: usize,
    write_pos: usize,
    pages: Vec<AtomicU8>,
}

// SAFETY: the region owns its mapping; mutation of contents and protection
// requires a safepoint guard.
unsafe impl Send for CodeRegion {}
unsafe impl Sync for CodeRegion {}

impl CodeRegion {
    /// Reserve a region of at least `size` bytes.
    pub fn reserve(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }
        let size = round_up_to_page(size);
        let base = reserve_address_space(size);
        let pages = (0..size / page_size())
            .map(|_| AtomicU8::new(Protection::NoAccess as u8))
            .collect();
        Ok(Self {
            base,
            size,
            write_pos: 0,
            pages,
        })
    }

    pub fn base(&self) -> *const u8 {
        self.base.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes consumed by written code, alignment padding included.
    pub fn used(&self) -> usize {
        self.write_pos
    }

    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.size
    }

    /// Tracked protection of the page containing `offset`.
    pub fn protection(&self, offset: usize) -> Protection {
        self.pages
            .get(offset / page_size())
            .map_or(Protection::NoAccess, |p| Protection::from_u8(p.load(Ordering::Acquire)))
    }

    pub fn page_states(&self) -> Vec<Protection> {
        self.pages
            .iter()
            .map(|p| Protection::from_u8(p.load(Ordering::Acquire)))
            .collect()
    }

    /// Page-aligned span covering `[offset, offset + len)`.
    fn page_span(&self, offset: usize, len: usize) -> Result<(usize, usize), MemoryError> {
        let end = offset.checked_add(len).filter(|end| *end <= self.size);
        let Some(end) = end else {
            return Err(MemoryError::OutOfCodeMemory {
                needed: len,
                available: self.size.saturating_sub(offset),
            });
        };
        let page = page_size();
        let start = offset / page * page;
        let end = end.div_ceil(page) * page;
        Ok((start, end - start))
    }

    fn record(&self, start: usize, len: usize, prot: Protection) {
        let page = page_size();
        for state in &self.pages[start / page..(start + len) / page] {
            state.store(prot as u8, Ordering::Release);
        }
    }

    /// Make the pages covering `[offset, offset + len)` writable.
    pub fn mark_writable(
        &self,
        _guard: &SafepointGuard<'_>,
        offset: usize,
        len: usize,
    ) -> Result<(), MemoryError> {
        let (start, span) = self.page_span(offset, len)?;
        if span == 0 {
            return Ok(());
        }
        // SAFETY: the span lies inside the reservation.
        mark_writable(unsafe { self.base.as_ptr().add(start) }, span)?;
        self.record(start, span, Protection::Writable);
        Ok(())
    }

    /// Make the pages covering `[offset, offset + len)` executable.
    pub fn mark_executable(
        &self,
        _guard: &SafepointGuard<'_>,
        offset: usize,
        len: usize,
    ) -> Result<(), MemoryError> {
        let (start, span) = self.page_span(offset, len)?;
        // SAFETY: the span lies inside the reservation.
        mark_executable(unsafe { self.base.as_ptr().add(start) }, span);
        self.record(start, span, Protection::Executable);
        Ok(())
    }

    /// Append `code` to the region and return its entry address.
    ///
    /// The pages touched are made writable, written, flushed from the
    /// instruction cache and made executable again before this returns.
    pub fn write(&mut self, guard: &SafepointGuard<'_>, code: &[u8]) -> Result<CodePtr, MemoryError> {
        if code.is_empty() {
            return Err(MemoryError::InvalidSize(0));
        }
        let offset = self.write_pos.div_ceil(CODE_ALIGN) * CODE_ALIGN;
        self.page_span(offset, code.len())?;

        self.mark_writable(guard, offset, code.len())?;
        // SAFETY: bounds checked by page_span; the pages are writable.
        let dst = unsafe { self.base.as_ptr().add(offset) };
        unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), dst, code.len()) };
        // SAFETY: `dst + len` is inside the region.
        icache::invalidate(dst, unsafe { dst.add(code.len()) });
        self.mark_executable(guard, offset, code.len())?;

        self.write_pos = offset + code.len();
        Ok(CodePtr(unsafe { NonNull::new_unchecked(dst) }))
    }
}
