//! Error types for ksm-preload.

use thiserror::Error;

/// Result type alias using ksm-preload's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ksm-preload operations.
///
/// None of these ever reach the caller of an intercepted function: a missing
/// symbol terminates the process, everything else is logged and dropped.
#[derive(Error, Debug)]
pub enum Error {
    /// A mandatory primitive could not be found in the next object.
    #[error("failed to load {symbol}: {reason}")]
    MissingSymbol {
        /// Name of the symbol that was looked up.
        symbol: &'static str,
        /// Loader diagnostic (usually `dlerror()`).
        reason: String,
    },

    /// The merge threshold setting could not be used as given.
    #[error("invalid merge threshold {value:?}: {reason}")]
    InvalidThreshold {
        /// Raw value of the setting.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The kernel refused the mergeable hint.
    #[error("madvise(MADV_MERGEABLE) failed: {0}")]
    Advise(#[from] rustix::io::Errno),
}
