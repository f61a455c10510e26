//! Resolution of the real primitives.
//!
//! The interposed `malloc` and friends must forward to whatever the process
//! would have called without us: the next definition in the symbol lookup
//! order, found with `dlsym(RTLD_NEXT, ..)`. The [`Resolver`] does that once,
//! together with the platform page size and the merge threshold, and hands
//! back a [`ResolvedTable`] that is immutable from then on.
//!
//! A mandatory symbol that cannot be found is fatal: there is nothing sane to
//! forward allocations to, so the process exits with a diagnostic.

use crate::advisor::Advisor;
use crate::config::{MERGE_THRESHOLD_ENV, MergeThreshold};
use crate::error::{Error, Result};
use crate::logging;
use libc::{c_int, c_void, off_t};
use std::ffi::CStr;
use std::ptr::NonNull;

/// `calloc(nmemb, size)`.
pub type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
/// `malloc(size)`.
pub type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
/// `mmap(addr, length, prot, flags, fd, offset)`.
pub type MmapFn =
    unsafe extern "C" fn(*mut c_void, usize, c_int, c_int, c_int, off_t) -> *mut c_void;
/// `mmap2(addr, length, prot, flags, fd, pgoffset)`, offset in pages.
pub type Mmap2Fn =
    unsafe extern "C" fn(*mut c_void, usize, c_int, c_int, c_int, off_t) -> *mut c_void;
/// `mremap(old_address, old_size, new_size, flags, ...)`.
pub type MremapFn = unsafe extern "C" fn(*mut c_void, usize, usize, c_int, ...) -> *mut c_void;
/// `realloc(ptr, size)`.
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;

/// The real implementations of the intercepted functions.
#[derive(Debug, Clone, Copy)]
pub struct Primitives {
    /// Next `calloc`.
    pub calloc: CallocFn,
    /// Next `malloc`.
    pub malloc: MallocFn,
    /// Next `mmap`.
    pub mmap: MmapFn,
    /// Next `mmap2`, only on targets that have the system call.
    pub mmap2: Option<Mmap2Fn>,
    /// Next `mremap`.
    pub mremap: MremapFn,
    /// Next `realloc`.
    pub realloc: ReallocFn,
}

/// Everything the dispatcher needs once setup is over.
///
/// Built once by a [`Resolve`] implementation and never modified afterwards.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedTable {
    primitives: Primitives,
    advisor: Advisor,
}

impl ResolvedTable {
    /// Assemble a table.
    pub const fn new(primitives: Primitives, advisor: Advisor) -> Self {
        Self {
            primitives,
            advisor,
        }
    }

    /// The real primitives.
    #[inline]
    pub const fn primitives(&self) -> &Primitives {
        &self.primitives
    }

    /// Advisor configured with the resolved page size and threshold.
    #[inline]
    pub const fn advisor(&self) -> &Advisor {
        &self.advisor
    }

    /// Platform page size.
    #[inline]
    pub const fn page_size(&self) -> usize {
        self.advisor.page_size()
    }

    /// Merge threshold.
    #[inline]
    pub const fn threshold(&self) -> MergeThreshold {
        self.advisor.threshold()
    }
}

/// Produces the [`ResolvedTable`]. Called at most once per process.
///
/// Implementations do not return errors: an unrecoverable problem ends the
/// process from inside `resolve`.
pub trait Resolve {
    /// Build the table.
    fn resolve(&self) -> ResolvedTable;
}

/// Looks up symbols by name.
pub trait SymbolSource {
    /// Address of `name`, if it exists.
    fn lookup(&self, name: &CStr) -> Option<NonNull<c_void>>;

    /// Explanation for the last failed lookup.
    fn failure_reason(&self) -> String {
        "symbol not found".to_string()
    }
}

/// The next object in the dynamic linker's search order (`RTLD_NEXT`).
#[derive(Debug, Clone, Copy, Default)]
pub struct NextObject;

impl SymbolSource for NextObject {
    fn lookup(&self, name: &CStr) -> Option<NonNull<c_void>> {
        // SAFETY: `name` is NUL-terminated; RTLD_NEXT is a valid pseudo-handle.
        NonNull::new(unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) })
    }

    fn failure_reason(&self) -> String {
        // SAFETY: dlerror returns null or a NUL-terminated string that stays
        // valid until the next dl* call on this thread.
        unsafe {
            let message = libc::dlerror();
            if message.is_null() {
                "symbol not found".to_string()
            } else {
                CStr::from_ptr(message).to_string_lossy().into_owned()
            }
        }
    }
}

/// Builds the [`ResolvedTable`] from a [`SymbolSource`] and the environment.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<S> {
    source: S,
    threshold_var: &'static str,
}

impl<S> Resolver<S> {
    /// Resolver reading the threshold from `KSMP_MERGE_THRESHOLD`.
    pub const fn new(source: S) -> Self {
        Self {
            source,
            threshold_var: MERGE_THRESHOLD_ENV,
        }
    }

    /// Resolver reading the threshold from `var` instead.
    pub const fn with_threshold_var(source: S, var: &'static str) -> Self {
        Self {
            source,
            threshold_var: var,
        }
    }
}

impl<S: SymbolSource> Resolver<S> {
    /// Resolve everything, reporting the first missing mandatory symbol.
    ///
    /// All lookups happen before anything is returned, so callers never see
    /// a mix of real and placeholder primitives.
    pub fn try_resolve(&self) -> Result<ResolvedTable> {
        let primitives = Primitives {
            calloc: self.require(c"calloc")?,
            malloc: self.require(c"malloc")?,
            mmap: self.require(c"mmap")?,
            mmap2: self.mmap2(),
            mremap: self.require(c"mremap")?,
            realloc: self.require(c"realloc")?,
        };

        let page_size = rustix::param::page_size();
        let threshold = MergeThreshold::from_env(self.threshold_var);
        logging::trace_setup_done(page_size, threshold.bytes(), primitives.mmap2.is_some());

        Ok(ResolvedTable::new(
            primitives,
            Advisor::new(page_size, threshold),
        ))
    }

    fn require<F: Copy>(&self, symbol: &'static CStr) -> Result<F> {
        match self.source.lookup(symbol) {
            // SAFETY: every caller names a function whose C prototype matches `F`.
            Some(ptr) => Ok(unsafe { cast_symbol(ptr) }),
            None => Err(Error::MissingSymbol {
                symbol: symbol.to_str().unwrap_or("<non-utf8>"),
                reason: self.source.failure_reason(),
            }),
        }
    }

    /// `dlsym` does not always find `mmap2` even where the kernel has it, so
    /// fall back to the raw system call.
    #[cfg(any(target_arch = "x86", target_arch = "arm"))]
    fn mmap2(&self) -> Option<Mmap2Fn> {
        let found = self
            .source
            .lookup(c"mmap2")
            // SAFETY: mmap2 has the `Mmap2Fn` prototype.
            .map(|ptr| unsafe { cast_symbol::<Mmap2Fn>(ptr) });
        Some(found.unwrap_or(crate::bootstrap::kernel_mmap2))
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "arm")))]
    fn mmap2(&self) -> Option<Mmap2Fn> {
        None
    }
}

impl<S: SymbolSource> Resolve for Resolver<S> {
    fn resolve(&self) -> ResolvedTable {
        self.try_resolve().unwrap_or_else(|err| fatal(&err))
    }
}

/// Report an unrecoverable setup error and exit with status 1.
pub fn fatal(err: &Error) -> ! {
    tracing::error!(target: logging::TARGET, error = %err, "setup failed");
    eprintln!("ksm_preload: {err}");
    std::process::exit(1)
}

/// # Safety
///
/// `F` must be a function pointer type matching the symbol's real prototype.
unsafe fn cast_symbol<F: Copy>(ptr: NonNull<c_void>) -> F {
    debug_assert_eq!(size_of::<F>(), size_of::<*mut c_void>());
    // SAFETY: same size, and the caller vouches for the prototype.
    unsafe { std::mem::transmute_copy(&ptr.as_ptr()) }
}
