//! # ksm-preload
//!
//! Makes the heap of unmodified programs eligible for Linux KSM (Kernel
//! Samepage Merging).
//!
//! KSM only scans memory that was explicitly marked with
//! `madvise(MADV_MERGEABLE)`, which almost no program does. This crate
//! interposes `calloc`, `malloc`, `mmap`, `mmap2`, `mremap` and `realloc`,
//! forwards every call to the real implementation, and marks the resulting
//! region mergeable when it is large enough and is private anonymous memory.
//! The caller sees exactly what the real function returned, `errno`
//! included.
//!
//! ## Layout
//!
//! - [`once`]: reentrancy-safe one-time initialization ([`OnceGuard`])
//! - [`resolver`]: finds the real primitives with `dlsym(RTLD_NEXT, ..)`
//! - [`bootstrap`]: primitives used while the resolver itself allocates
//! - [`advisor`]: page rounding, threshold and flag filtering, `madvise`
//! - [`dispatch`]: the per-call sequence ([`Interceptor`])
//! - [`config`]: the `KSMP_MERGE_THRESHOLD` setting
//!
//! The exported C symbols live in the `ksm-preload-shim` crate, which builds
//! the `LD_PRELOAD` library:
//!
//! ```text
//! LD_PRELOAD=target/release/libksm_preload_shim.so KSMP_MERGE_THRESHOLD=65536 command args...
//! ```
//!
//! ## Embedding
//!
//! ```rust,no_run
//! use ksm_preload::{Bootstrap, Interceptor, Madvise, NextObject, Resolver};
//!
//! static INTERCEPTOR: Interceptor<Resolver<NextObject>, Madvise> =
//!     Interceptor::new(Resolver::new(NextObject), Madvise, Bootstrap::glibc());
//!
//! let ptr = unsafe { INTERCEPTOR.malloc(1 << 20) };
//! assert!(!ptr.is_null());
//! unsafe { libc::free(ptr) };
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(not(target_os = "linux"))]
compile_error!("ksm-preload relies on Linux KSM and only builds for Linux targets");

pub mod advisor;
pub mod bootstrap;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod once;
pub mod resolver;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::advisor::{AdviceRequest, Advisor, Decision, Hint, Madvise};
    pub use crate::bootstrap::Bootstrap;
    pub use crate::config::MergeThreshold;
    pub use crate::dispatch::{Interceptor, MremapRequest};
    pub use crate::error::{Error, Result};
    pub use crate::once::{Entry, OnceGuard};
    pub use crate::resolver::{NextObject, Resolve, ResolvedTable, Resolver};
}

pub use advisor::Madvise;
pub use bootstrap::Bootstrap;
pub use dispatch::{Interceptor, MremapRequest};
pub use error::{Error, Result};
pub use once::OnceGuard;
pub use resolver::{NextObject, Resolver};
