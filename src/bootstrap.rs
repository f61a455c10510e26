//! Primitives usable before resolution completes.
//!
//! `dlsym`, `getenv` and the Rust runtime all allocate while the resolver is
//! running. Those calls come back into the interposed functions on the
//! initializing thread, where the real primitives are not known yet, and
//! are served from a [`Bootstrap`] table instead: glibc's internal
//! `__libc_*` allocator entry points (which are never interposed) and raw
//! system calls for the mapping functions.

use crate::resolver::{CallocFn, MallocFn, Mmap2Fn, MmapFn, ReallocFn};
use libc::{c_int, c_long, c_void, off_t};

/// `mremap` with its optional fifth argument always present.
///
/// The target address is ignored by the kernel unless `MREMAP_FIXED` is set.
pub type RawMremapFn =
    unsafe extern "C" fn(*mut c_void, usize, usize, c_int, *mut c_void) -> *mut c_void;

/// Fallback primitives for calls made while the resolver runs.
#[derive(Debug, Clone, Copy)]
pub struct Bootstrap {
    /// Fallback `calloc`.
    pub calloc: CallocFn,
    /// Fallback `malloc`.
    pub malloc: MallocFn,
    /// Fallback `mmap`.
    pub mmap: MmapFn,
    /// Fallback `mmap2`, where the system call exists.
    pub mmap2: Option<Mmap2Fn>,
    /// Fallback `mremap`.
    pub mremap: RawMremapFn,
    /// Fallback `realloc`.
    pub realloc: ReallocFn,
}

#[cfg(target_env = "gnu")]
unsafe extern "C" {
    #[link_name = "__libc_calloc"]
    fn libc_calloc(nmemb: usize, size: usize) -> *mut c_void;
    #[link_name = "__libc_malloc"]
    fn libc_malloc(size: usize) -> *mut c_void;
    #[link_name = "__libc_realloc"]
    fn libc_realloc(ptr: *mut c_void, size: usize) -> *mut c_void;
}

impl Bootstrap {
    /// glibc allocator internals plus raw `mmap`/`mremap` system calls.
    #[cfg(target_env = "gnu")]
    pub const fn glibc() -> Self {
        Self {
            calloc: libc_calloc,
            malloc: libc_malloc,
            mmap: kernel_mmap,
            mmap2: KERNEL_MMAP2,
            mremap: kernel_mremap,
            realloc: libc_realloc,
        }
    }
}

#[cfg(any(target_arch = "x86", target_arch = "arm"))]
const KERNEL_MMAP2: Option<Mmap2Fn> = Some(kernel_mmap2);
#[cfg(not(any(target_arch = "x86", target_arch = "arm")))]
const KERNEL_MMAP2: Option<Mmap2Fn> = None;

/// `mmap` issued directly to the kernel.
///
/// # Safety
///
/// Same contract as `mmap(2)`.
pub unsafe extern "C" fn kernel_mmap(
    addr: *mut c_void,
    length: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    // i386's old mmap takes its arguments as an array.
    #[cfg(target_arch = "x86")]
    let ret = {
        let args: [c_long; 6] = [
            addr as c_long,
            length as c_long,
            prot as c_long,
            flags as c_long,
            fd as c_long,
            offset as c_long,
        ];
        // SAFETY: forwarded from the caller.
        unsafe { libc::syscall(libc::SYS_mmap, args.as_ptr()) }
    };

    // EABI ARM only has mmap2.
    #[cfg(target_arch = "arm")]
    // SAFETY: forwarded from the caller.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_mmap2,
            addr,
            length,
            prot as c_long,
            flags as c_long,
            fd as c_long,
            (offset / 4096) as c_long,
        )
    };

    #[cfg(not(any(target_arch = "x86", target_arch = "arm")))]
    // SAFETY: forwarded from the caller.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_mmap,
            addr,
            length,
            prot as c_long,
            flags as c_long,
            fd as c_long,
            offset as c_long,
        )
    };

    ret as *mut c_void
}

/// `mmap2` issued directly to the kernel.
///
/// # Safety
///
/// Same contract as `mmap2(2)`.
#[cfg(any(target_arch = "x86", target_arch = "arm"))]
pub unsafe extern "C" fn kernel_mmap2(
    addr: *mut c_void,
    length: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    pgoffset: off_t,
) -> *mut c_void {
    // SAFETY: forwarded from the caller.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_mmap2,
            addr,
            length,
            prot as c_long,
            flags as c_long,
            fd as c_long,
            pgoffset as c_long,
        )
    };
    ret as *mut c_void
}

/// `mremap` issued directly to the kernel.
///
/// # Safety
///
/// Same contract as `mremap(2)`.
pub unsafe extern "C" fn kernel_mremap(
    old_address: *mut c_void,
    old_size: usize,
    new_size: usize,
    flags: c_int,
    new_address: *mut c_void,
) -> *mut c_void {
    // SAFETY: forwarded from the caller.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_mremap,
            old_address,
            old_size,
            new_size,
            flags as c_long,
            new_address,
        )
    };
    ret as *mut c_void
}
