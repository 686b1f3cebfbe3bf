//! The page-granularity memory provider that backs every other module
//!
//! All memory handed out here comes straight from anonymous mappings, so
//! none of the lock-free structures in this crate ever re-enter the process
//! allocator. Mappings can either be activated (readable and writable) right
//! away or merely reserved as inaccessible address space and promoted later
//! with [`protect`], which is how the hazard-pointer table grows.
//!
//! Running out of address space is not recoverable for the callers in this
//! crate, so a refused mapping aborts the process with a diagnostic.

use std::sync::atomic;

static PAGE_SIZE: atomic::AtomicUsize = atomic::AtomicUsize::new(0);
static TOTAL_MAPPED: atomic::AtomicUsize = atomic::AtomicUsize::new(0);

/// The Page-Size of the running System in bytes
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(atomic::Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }

    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    PAGE_SIZE.store(size, atomic::Ordering::Relaxed);
    size
}

/// Rounds the given Size up to the next multiple of the Page-Size
pub fn round_to_pages(size: usize) -> usize {
    let mask = page_size() - 1;
    (size + mask) & !mask
}

/// The total number of bytes currently mapped through this module
pub fn mapped_bytes() -> usize {
    TOTAL_MAPPED.load(atomic::Ordering::Relaxed)
}

/// Allocates a fresh page-rounded anonymous mapping of at least `size` bytes
///
/// If `activate` is set the returned pages are readable and writable,
/// otherwise the range is only reserved address space and every access traps
/// until it is promoted with [`protect`].
///
/// Never returns null, a refused mapping aborts the process.
pub fn alloc(size: usize, activate: bool) -> *mut u8 {
    let size = round_to_pages(size);
    let prot = if activate {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_NONE
    };

    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        eprintln!("hazalloc: the OS refused to map {} bytes", size);
        std::process::abort();
    }

    TOTAL_MAPPED.fetch_add(size, atomic::Ordering::Relaxed);
    addr as *mut u8
}

/// Allocates a page-rounded anonymous mapping whose address is a multiple of
/// `alignment`, which must be a power of two
///
/// The alignment is realised by over-allocating by one alignment unit and
/// trimming the misaligned head and the surplus tail back off.
pub fn alloc_aligned(size: usize, alignment: usize, activate: bool) -> *mut u8 {
    debug_assert!(alignment.is_power_of_two());
    debug_assert!(alignment >= page_size());

    let size = round_to_pages(size);
    let mem = alloc(size + alignment, activate);

    let aligned = ((mem as usize + (alignment - 1)) & !(alignment - 1)) as *mut u8;

    let head = aligned as usize - mem as usize;
    if head > 0 {
        unsafe { free(mem, head) };
    }
    let tail = alignment - head;
    if tail > 0 {
        unsafe { free(aligned.add(size), tail) };
    }

    aligned
}

/// Returns a mapping obtained from [`alloc`] or [`alloc_aligned`] to the OS
///
/// # Safety
/// `addr` and `size` must describe a currently mapped range that was handed
/// out by this module and no live reference into the range may remain.
pub unsafe fn free(addr: *mut u8, size: usize) {
    let size = round_to_pages(size);
    unsafe { libc::munmap(addr as *mut libc::c_void, size) };
    TOTAL_MAPPED.fetch_sub(size, atomic::Ordering::Relaxed);
}

/// Changes the protection of a page-aligned range to either readable and
/// writable or completely inaccessible
///
/// # Safety
/// `addr` must be page-aligned and `addr`/`len` must lie inside a mapping
/// handed out by this module.
pub unsafe fn protect(addr: *mut u8, len: usize, activate: bool) {
    let prot = if activate {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_NONE
    };

    let result = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot) };
    if result != 0 {
        eprintln!("hazalloc: mprotect of {} bytes failed", len);
        std::process::abort();
    }
}
