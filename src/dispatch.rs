//! Per-call sequencing for the intercepted functions.
//!
//! [`Interceptor`] is what the exported `malloc`, `mmap`, ... call into. Each
//! entry point does the same four things:
//!
//! 1. make sure the real primitives are resolved ([`OnceGuard`]),
//! 2. call the real primitive with the caller's arguments, untouched,
//! 3. hand the result to the [`Advisor`](crate::advisor::Advisor),
//! 4. return the real result, with `errno` as the real primitive left it.
//!
//! Calls made by the resolver itself (reentrant calls on the initializing
//! thread) skip steps 1 and 3 and go to the [`Bootstrap`] table.

use crate::advisor::{AdviceRequest, Hint};
use crate::bootstrap::Bootstrap;
use crate::once::{Entry, InitState, OnceGuard};
use crate::resolver::{Resolve, ResolvedTable};
use libc::{c_int, c_void, off_t};

/// Arguments of an `mremap` call.
///
/// `mremap` is variadic: the target address is only passed (and only read)
/// when `MREMAP_FIXED` is part of `flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MremapRequest {
    /// Mapping to move or resize.
    pub old_address: *mut c_void,
    /// Its current size.
    pub old_size: usize,
    /// Requested size.
    pub new_size: usize,
    /// `MREMAP_*` flags.
    pub flags: c_int,
    /// Target address, present only with `MREMAP_FIXED`.
    pub new_address: Option<*mut c_void>,
}

impl MremapRequest {
    /// Decode the arguments as received by a C `mremap`.
    ///
    /// `extra` is the register or stack slot of the fifth argument; it is
    /// ignored unless `MREMAP_FIXED` is set.
    pub fn decode(
        old_address: *mut c_void,
        old_size: usize,
        new_size: usize,
        flags: c_int,
        extra: *mut c_void,
    ) -> Self {
        Self {
            old_address,
            old_size,
            new_size,
            flags,
            new_address: (flags & libc::MREMAP_FIXED != 0).then_some(extra),
        }
    }
}

/// Restores `errno` when dropped.
struct ErrnoGuard(c_int);

impl ErrnoGuard {
    fn save() -> Self {
        // SAFETY: errno is thread-local and always addressable.
        Self(unsafe { *libc::__errno_location() })
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        // SAFETY: see `save`.
        unsafe { *libc::__errno_location() = self.0 };
    }
}

/// Process-wide dispatcher for the intercepted functions.
///
/// `R` builds the table of real primitives on first use; `H` issues the
/// mergeable hints. Both are fixed at construction, which is `const` so the
/// interceptor can live in a `static`.
pub struct Interceptor<R, H> {
    guard: OnceGuard<ResolvedTable>,
    resolver: R,
    hinter: H,
    bootstrap: Bootstrap,
}

impl<R: Resolve, H: Hint> Interceptor<R, H> {
    /// Create an interceptor. Nothing is resolved until the first call.
    pub const fn new(resolver: R, hinter: H, bootstrap: Bootstrap) -> Self {
        Self {
            guard: OnceGuard::new(),
            resolver,
            hinter,
            bootstrap,
        }
    }

    /// Resolve the real primitives if needed.
    ///
    /// Returns `None` when called from inside the resolver.
    #[inline]
    pub fn ensure_initialized(&self) -> Option<&ResolvedTable> {
        match self.guard.ensure_with(|| self.resolver.resolve()) {
            Entry::Ready(table) => Some(table),
            Entry::Reentrant => None,
        }
    }

    /// The resolved table, if setup has completed.
    pub fn table(&self) -> Option<&ResolvedTable> {
        self.guard.get()
    }

    /// Current setup state.
    pub fn init_state(&self) -> InitState {
        self.guard.state()
    }

    /// The hint implementation.
    pub fn hinter(&self) -> &H {
        &self.hinter
    }

    #[inline]
    fn advise(&self, table: &ResolvedTable, request: AdviceRequest) {
        let _errno = ErrnoGuard::save();
        table.advisor().consider(&request, &self.hinter);
    }

    /// Interposed `calloc`.
    ///
    /// # Safety
    ///
    /// Same contract as `calloc(3)`.
    pub unsafe fn calloc(&self, nmemb: usize, size: usize) -> *mut c_void {
        let Some(table) = self.ensure_initialized() else {
            // SAFETY: forwarded from the caller.
            return unsafe { (self.bootstrap.calloc)(nmemb, size) };
        };
        // SAFETY: forwarded from the caller.
        let result = unsafe { (table.primitives().calloc)(nmemb, size) };
        self.advise(table, AdviceRequest::allocation(result, nmemb.saturating_mul(size)));
        result
    }

    /// Interposed `malloc`.
    ///
    /// # Safety
    ///
    /// Same contract as `malloc(3)`.
    pub unsafe fn malloc(&self, size: usize) -> *mut c_void {
        let Some(table) = self.ensure_initialized() else {
            // SAFETY: forwarded from the caller.
            return unsafe { (self.bootstrap.malloc)(size) };
        };
        // SAFETY: forwarded from the caller.
        let result = unsafe { (table.primitives().malloc)(size) };
        self.advise(table, AdviceRequest::allocation(result, size));
        result
    }

    /// Interposed `realloc`.
    ///
    /// # Safety
    ///
    /// Same contract as `realloc(3)`.
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        let Some(table) = self.ensure_initialized() else {
            // SAFETY: forwarded from the caller.
            return unsafe { (self.bootstrap.realloc)(ptr, size) };
        };
        // SAFETY: forwarded from the caller.
        let result = unsafe { (table.primitives().realloc)(ptr, size) };
        self.advise(table, AdviceRequest::allocation(result, size));
        result
    }

    /// Interposed `mmap`.
    ///
    /// # Safety
    ///
    /// Same contract as `mmap(2)`.
    pub unsafe fn mmap(
        &self,
        addr: *mut c_void,
        length: usize,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: off_t,
    ) -> *mut c_void {
        let Some(table) = self.ensure_initialized() else {
            // SAFETY: forwarded from the caller.
            return unsafe { (self.bootstrap.mmap)(addr, length, prot, flags, fd, offset) };
        };
        // SAFETY: forwarded from the caller.
        let result = unsafe { (table.primitives().mmap)(addr, length, prot, flags, fd, offset) };
        self.advise(table, AdviceRequest::mapping(result, length, flags));
        result
    }

    /// Interposed `mmap2` (offset counted in pages).
    ///
    /// Fails with `ENOSYS` where neither the table nor the bootstrap has an
    /// `mmap2`.
    ///
    /// # Safety
    ///
    /// Same contract as `mmap2(2)`.
    pub unsafe fn mmap2(
        &self,
        addr: *mut c_void,
        length: usize,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        pgoffset: off_t,
    ) -> *mut c_void {
        let Some(table) = self.ensure_initialized() else {
            return match self.bootstrap.mmap2 {
                // SAFETY: forwarded from the caller.
                Some(mmap2) => unsafe { mmap2(addr, length, prot, flags, fd, pgoffset) },
                None => unsupported(),
            };
        };
        let Some(mmap2) = table.primitives().mmap2 else {
            return unsupported();
        };
        // SAFETY: forwarded from the caller.
        let result = unsafe { mmap2(addr, length, prot, flags, fd, pgoffset) };
        self.advise(table, AdviceRequest::mapping(result, length, flags));
        result
    }

    /// Interposed `mremap`.
    ///
    /// The real `mremap` receives the target address only when the request
    /// carries one.
    ///
    /// # Safety
    ///
    /// Same contract as `mremap(2)`.
    pub unsafe fn mremap(&self, request: MremapRequest) -> *mut c_void {
        let MremapRequest {
            old_address,
            old_size,
            new_size,
            flags,
            new_address,
        } = request;

        let Some(table) = self.ensure_initialized() else {
            let target = new_address.unwrap_or(std::ptr::null_mut());
            // SAFETY: forwarded from the caller.
            return unsafe {
                (self.bootstrap.mremap)(old_address, old_size, new_size, flags, target)
            };
        };

        let real = table.primitives().mremap;
        // SAFETY: forwarded from the caller.
        let result = unsafe {
            match new_address {
                Some(target) => real(old_address, old_size, new_size, flags, target),
                None => real(old_address, old_size, new_size, flags),
            }
        };
        self.advise(table, AdviceRequest::allocation(result, new_size));
        result
    }
}

fn unsupported() -> *mut c_void {
    // SAFETY: errno is thread-local and always addressable.
    unsafe { *libc::__errno_location() = libc::ENOSYS };
    libc::MAP_FAILED
}
