//! Merge threshold configuration.
//!
//! The threshold is the only tunable: regions whose page-rounded length does
//! not exceed it are never advised. It is read once, from the
//! `KSMP_MERGE_THRESHOLD` environment variable, while the resolver runs.
//!
//! Parsing follows `strtol` conventions: leading ASCII whitespace and a `+`
//! sign are accepted, anything trailing the digits is not.
//!
//! ```rust
//! use ksm_preload::config::{MergeThreshold, DEFAULT_MERGE_THRESHOLD};
//!
//! assert_eq!(MergeThreshold::parse("65536").unwrap().bytes(), 65536);
//! assert!(MergeThreshold::parse("64k").is_err());
//! assert_eq!(MergeThreshold::default().bytes(), DEFAULT_MERGE_THRESHOLD);
//! ```

use crate::error::{Error, Result};
use crate::logging;
use std::ffi::OsStr;
use std::num::IntErrorKind;

/// Environment variable holding the merge threshold in bytes.
pub const MERGE_THRESHOLD_ENV: &str = "KSMP_MERGE_THRESHOLD";

/// Threshold used when the environment does not provide a usable one.
///
/// Eight times 4086 bytes; the odd factor is the historical value and is
/// kept so existing deployments see the same behaviour.
pub const DEFAULT_MERGE_THRESHOLD: usize = 4086 * 8;

/// Largest threshold that can be configured. Larger values are clamped.
pub const MAX_MERGE_THRESHOLD: usize = i32::MAX as usize;

/// Minimum page-rounded length, exclusive, for a region to be advised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MergeThreshold(usize);

impl MergeThreshold {
    /// The default threshold.
    pub const DEFAULT: Self = Self(DEFAULT_MERGE_THRESHOLD);

    /// The largest representable threshold.
    pub const MAX: Self = Self(MAX_MERGE_THRESHOLD);

    /// Create a threshold, clamping to [`MergeThreshold::MAX`].
    pub const fn new(bytes: usize) -> Self {
        if bytes > MAX_MERGE_THRESHOLD {
            Self::MAX
        } else {
            Self(bytes)
        }
    }

    /// Threshold in bytes.
    #[inline]
    pub const fn bytes(self) -> usize {
        self.0
    }

    /// Returns true if a region of `len` bytes is large enough to advise.
    #[inline]
    pub const fn admits(self, len: usize) -> bool {
        len > self.0
    }

    /// Parse a threshold setting.
    ///
    /// Values above [`MergeThreshold::MAX`] are clamped rather than rejected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidThreshold`] for empty, non-numeric or negative
    /// input.
    pub fn parse(raw: &str) -> Result<Self> {
        parse_setting(raw).map(|parsed| parsed.threshold)
    }

    /// Read the threshold from the environment variable `var`.
    ///
    /// Never fails: an unusable value is logged and replaced by the default.
    pub fn from_env(var: &str) -> Self {
        Self::from_value(var, std::env::var_os(var).as_deref())
    }

    /// Resolve a threshold from the raw value of the setting named `var`.
    pub fn from_value(var: &str, raw: Option<&OsStr>) -> Self {
        let Some(raw) = raw else {
            return Self::DEFAULT;
        };

        let Some(text) = raw.to_str() else {
            logging::trace_invalid_threshold(
                var,
                &Error::InvalidThreshold {
                    value: raw.to_string_lossy().into_owned(),
                    reason: "not valid UTF-8",
                },
            );
            return Self::DEFAULT;
        };

        match parse_setting(text) {
            Ok(parsed) => {
                if parsed.clamped {
                    logging::trace_threshold_clamped(var, text, parsed.threshold.bytes());
                }
                parsed.threshold
            }
            Err(err) => {
                logging::trace_invalid_threshold(var, &err);
                Self::DEFAULT
            }
        }
    }
}

impl Default for MergeThreshold {
    fn default() -> Self {
        Self::DEFAULT
    }
}

struct Parsed {
    threshold: MergeThreshold,
    clamped: bool,
}

fn parse_setting(raw: &str) -> Result<Parsed> {
    let invalid = |reason| Error::InvalidThreshold {
        value: raw.to_string(),
        reason,
    };

    let digits = raw.trim_start_matches(|c: char| c.is_ascii_whitespace());
    match digits.parse::<i64>() {
        Ok(value) if value < 0 => Err(invalid("negative")),
        Ok(value) => {
            let bytes = usize::try_from(value).unwrap_or(usize::MAX);
            Ok(Parsed {
                threshold: MergeThreshold::new(bytes),
                clamped: bytes > MAX_MERGE_THRESHOLD,
            })
        }
        Err(err) => match err.kind() {
            IntErrorKind::PosOverflow => Ok(Parsed {
                threshold: MergeThreshold::MAX,
                clamped: true,
            }),
            IntErrorKind::NegOverflow => Err(invalid("negative")),
            IntErrorKind::Empty => Err(invalid("empty")),
            _ => Err(invalid("not a decimal integer")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::os::unix::ffi::OsStringExt;

    #[test]
    fn test_parse_plain_value() {
        assert_eq!(MergeThreshold::parse("32768").unwrap().bytes(), 32768);
        assert_eq!(MergeThreshold::parse("0").unwrap().bytes(), 0);
    }

    #[test]
    fn test_parse_accepts_strtol_prefixes() {
        assert_eq!(MergeThreshold::parse("  4096").unwrap().bytes(), 4096);
        assert_eq!(MergeThreshold::parse("+4096").unwrap().bytes(), 4096);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for raw in ["", "  ", "abc", "12ab", "4096 ", "0x1000", "1e6"] {
            let err = MergeThreshold::parse(raw).unwrap_err();
            assert!(matches!(err, Error::InvalidThreshold { .. }), "{raw:?}");
        }
    }

    #[test]
    fn test_parse_rejects_negative() {
        assert!(MergeThreshold::parse("-1").is_err());
        assert!(MergeThreshold::parse("-99999999999999999999999").is_err());
    }

    #[test]
    fn test_parse_clamps_large_values() {
        assert_eq!(MergeThreshold::parse("2147483647").unwrap(), MergeThreshold::MAX);
        assert_eq!(MergeThreshold::parse("2147483648").unwrap(), MergeThreshold::MAX);
        assert_eq!(
            MergeThreshold::parse("99999999999999999999999").unwrap(),
            MergeThreshold::MAX
        );
    }

    #[test]
    fn test_from_value_defaults() {
        let var = "KSMP_TEST_UNUSED";
        assert_eq!(MergeThreshold::from_value(var, None), MergeThreshold::DEFAULT);
        assert_eq!(
            MergeThreshold::from_value(var, Some(OsStr::new("nope"))),
            MergeThreshold::DEFAULT
        );
        assert_eq!(
            MergeThreshold::from_value(var, Some(OsStr::new("-5"))),
            MergeThreshold::DEFAULT
        );

        let not_utf8 = OsString::from_vec(vec![0x31, 0xff, 0x32]);
        assert_eq!(
            MergeThreshold::from_value(var, Some(&not_utf8)),
            MergeThreshold::DEFAULT
        );
    }

    #[test]
    fn test_from_value_clamps() {
        let threshold =
            MergeThreshold::from_value("KSMP_TEST_UNUSED", Some(OsStr::new("1000000000000")));
        assert_eq!(threshold, MergeThreshold::MAX);
    }

    #[test]
    fn test_from_env_reads_variable() {
        let var = "KSMP_TEST_CONFIG_FROM_ENV";
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var(var, "65536") };
        assert_eq!(MergeThreshold::from_env(var).bytes(), 65536);
        unsafe { std::env::remove_var(var) };
        assert_eq!(MergeThreshold::from_env(var), MergeThreshold::DEFAULT);
    }

    #[test]
    fn test_admits_is_strict() {
        let threshold = MergeThreshold::new(32768);
        assert!(!threshold.admits(100));
        assert!(!threshold.admits(32768));
        assert!(threshold.admits(32769));
    }

    #[test]
    fn test_new_clamps() {
        assert_eq!(MergeThreshold::new(usize::MAX), MergeThreshold::MAX);
    }
}
