//! Structured debug logging.
//!
//! Every decision the library takes is reported as a `tracing` event under
//! the [`TARGET`] target. Without a subscriber these are no-ops, which is
//! the normal situation inside a preloaded process. Enable the `debug-log`
//! feature and call [`init_stderr`] to get them on stderr.
//!
//! The helpers here run on the allocation path, so they must never allocate
//! unless an event is actually being recorded.

use crate::error::Error;

/// Target used for every event emitted by this crate.
pub const TARGET: &str = "ksm_preload";

/// Install a fmt subscriber writing DEBUG events to stderr.
///
/// Returns false if a global subscriber was already installed.
#[cfg(feature = "debug-log")]
pub fn init_stderr() -> bool {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Log a region that was advised as mergeable.
#[inline]
pub fn trace_sharing(base: usize, len: usize) {
    tracing::debug!(target: TARGET, base = base, len = len, "sharing");
}

/// Log a mapping rejected because of its flags.
#[inline]
pub fn trace_flags_filtered(address: usize, len: usize, flags: i32) {
    tracing::debug!(
        target: TARGET,
        address = address,
        len = len,
        flags = flags,
        "not sharing (flags filtered)"
    );
}

/// Log a failed mergeable hint.
#[inline]
pub fn trace_advise_failed(base: usize, len: usize, err: &Error) {
    tracing::debug!(target: TARGET, base = base, len = len, error = %err, "madvise failed");
}

/// Log a threshold setting that was replaced by the default.
pub fn trace_invalid_threshold(var: &str, err: &Error) {
    tracing::debug!(target: TARGET, var = %var, error = %err, "invalid merge threshold, using default");
}

/// Log a threshold setting that was clamped.
pub fn trace_threshold_clamped(var: &str, raw: &str, clamped: usize) {
    tracing::debug!(
        target: TARGET,
        var = %var,
        value = %raw,
        clamped = clamped,
        "merge threshold clamped"
    );
}

/// Log the end of setup.
pub fn trace_setup_done(page_size: usize, threshold: usize, has_mmap2: bool) {
    tracing::debug!(
        target: TARGET,
        page_size = page_size,
        threshold = threshold,
        mmap2 = has_mmap2,
        "setup done"
    );
}
