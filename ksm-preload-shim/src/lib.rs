//! `LD_PRELOAD` interposer for ksm-preload.
//!
//! Exports `calloc`, `malloc`, `mmap`, `mmap2` (where the kernel has it),
//! `mremap` and `realloc`, and routes each of them through one process-wide
//! [`Interceptor`]. All logic lives in the `ksm-preload` crate.
//!
//! ```text
//! cargo build --release -p ksm-preload-shim
//! LD_PRELOAD=target/release/libksm_preload_shim.so command args...
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
compile_error!("the preload shim needs glibc's __libc_* allocator entry points");

use ksm_preload::resolver::{Resolve, ResolvedTable};
use ksm_preload::{Bootstrap, Interceptor, Madvise, MremapRequest, NextObject, Resolver};
use libc::{c_int, c_void, off_t};

/// Resolver used by the shim; optionally turns on stderr logging first.
struct Setup(Resolver<NextObject>);

impl Resolve for Setup {
    fn resolve(&self) -> ResolvedTable {
        #[cfg(feature = "debug-log")]
        ksm_preload::logging::init_stderr();
        self.0.resolve()
    }
}

static INTERCEPTOR: Interceptor<Setup, Madvise> = Interceptor::new(
    Setup(Resolver::new(NextObject)),
    Madvise,
    Bootstrap::glibc(),
);

/// Like `calloc`, then considers the block for merging.
///
/// # Safety
///
/// Same contract as `calloc(3)`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    unsafe { INTERCEPTOR.calloc(nmemb, size) }
}

/// Like `malloc`, then considers the block for merging.
///
/// # Safety
///
/// Same contract as `malloc(3)`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    unsafe { INTERCEPTOR.malloc(size) }
}

/// Like `realloc`, then considers the block for merging.
///
/// # Safety
///
/// Same contract as `realloc(3)`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    unsafe { INTERCEPTOR.realloc(ptr, size) }
}

/// Like `mmap`, then considers private anonymous mappings for merging.
///
/// # Safety
///
/// Same contract as `mmap(2)`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    length: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    unsafe { INTERCEPTOR.mmap(addr, length, prot, flags, fd, offset) }
}

/// Like `mmap2`, then considers private anonymous mappings for merging.
///
/// # Safety
///
/// Same contract as `mmap2(2)`.
#[cfg(any(target_arch = "x86", target_arch = "arm"))]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mmap2(
    addr: *mut c_void,
    length: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    pgoffset: off_t,
) -> *mut c_void {
    unsafe { INTERCEPTOR.mmap2(addr, length, prot, flags, fd, pgoffset) }
}

/// Like `mremap`, then considers the new mapping for merging.
///
/// C declares `mremap` variadic. Defining variadic functions is not
/// available on stable Rust, so the optional target address is taken as a
/// fixed fifth parameter: on the Linux ABIs a variadic pointer argument is
/// passed in the same register or stack slot as a fixed one. It is only
/// read when `MREMAP_FIXED` is set.
///
/// # Safety
///
/// Same contract as `mremap(2)`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mremap(
    old_address: *mut c_void,
    old_size: usize,
    new_size: usize,
    flags: c_int,
    new_address: *mut c_void,
) -> *mut c_void {
    let request = MremapRequest::decode(old_address, old_size, new_size, flags, new_address);
    unsafe { INTERCEPTOR.mremap(request) }
}
