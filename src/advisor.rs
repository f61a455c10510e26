//! Mergeable-region decisions.
//!
//! Given the result of an allocation or mapping, the [`Advisor`] decides
//! whether the region is worth handing to KSM and, if so, over which
//! page-aligned range. The decision ([`Advisor::plan`]) is a pure function;
//! [`Advisor::consider`] carries it out through a [`Hint`] implementation.
//!
//! # Page rounding
//!
//! `madvise` works on whole pages and requires a page-aligned start. The
//! start of the region is snapped down to its page boundary and the length
//! is extended by the same amount, so the advised range always covers the
//! whole allocation and never starts past it.
//!
//! ```rust
//! use ksm_preload::advisor::{AdviceRequest, Advisor, Decision};
//! use ksm_preload::config::MergeThreshold;
//!
//! let advisor = Advisor::new(4096, MergeThreshold::new(32768));
//! let request = AdviceRequest::new(4096 + 10, 40_000, None);
//! assert_eq!(
//!     advisor.plan(&request),
//!     Decision::Merge { base: 4096, len: 40_010 }
//! );
//! ```

use crate::config::MergeThreshold;
use crate::error::Result;
use crate::logging;
use libc::{c_int, c_void};
use std::fmt;

/// Issues the "mergeable" hint for a page-aligned range.
///
/// The production implementation is [`Madvise`]; tests substitute their own.
pub trait Hint {
    /// Mark `[base, base + len)` as mergeable.
    ///
    /// `base` is page-aligned. Failures are reported, never retried.
    fn mergeable(&self, base: usize, len: usize) -> Result<()>;
}

/// [`Hint`] backed by `madvise(MADV_MERGEABLE)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Madvise;

impl Hint for Madvise {
    fn mergeable(&self, base: usize, len: usize) -> Result<()> {
        // SAFETY: MADV_MERGEABLE does not change the contents or the
        // protection of the range; at worst the kernel rejects it.
        unsafe {
            rustix::mm::madvise(
                base as *mut c_void,
                len,
                rustix::mm::Advice::LinuxMergeable,
            )?;
        }
        Ok(())
    }
}

/// Raw `mmap` flags of a mapping request.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingFlags(c_int);

impl MappingFlags {
    /// Wrap a raw flag word.
    #[inline]
    pub const fn from_bits(bits: c_int) -> Self {
        Self(bits)
    }

    /// The raw flag word.
    #[inline]
    pub const fn bits(self) -> c_int {
        self.0
    }

    /// `MAP_PRIVATE` is set.
    #[inline]
    pub const fn is_private(self) -> bool {
        self.0 & libc::MAP_PRIVATE != 0
    }

    /// `MAP_ANONYMOUS` is set.
    #[inline]
    pub const fn is_anonymous(self) -> bool {
        self.0 & libc::MAP_ANONYMOUS != 0
    }

    /// `MAP_GROWSDOWN` is set.
    #[inline]
    pub const fn grows_down(self) -> bool {
        self.0 & libc::MAP_GROWSDOWN != 0
    }

    /// `MAP_STACK` is set.
    #[inline]
    pub const fn is_stack(self) -> bool {
        self.0 & libc::MAP_STACK != 0
    }

    /// Private anonymous memory that is not a stack.
    #[inline]
    pub const fn is_mergeable(self) -> bool {
        self.is_private() && self.is_anonymous() && !self.grows_down() && !self.is_stack()
    }
}

impl fmt::Debug for MappingFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.is_private() {
            names.push("PRIVATE");
        }
        if self.is_anonymous() {
            names.push("ANONYMOUS");
        }
        if self.grows_down() {
            names.push("GROWSDOWN");
        }
        if self.is_stack() {
            names.push("STACK");
        }
        write!(f, "MappingFlags({:#x}: {})", self.0, names.join(" | "))
    }
}

/// One completed allocation or mapping, as seen by the advisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdviceRequest {
    /// Address returned by the real primitive.
    pub address: usize,
    /// Length requested by the caller.
    pub length: usize,
    /// Mapping flags, `None` for calls that have no such concept.
    pub flags: Option<MappingFlags>,
}

impl AdviceRequest {
    /// Build a request from raw parts.
    pub const fn new(address: usize, length: usize, flags: Option<MappingFlags>) -> Self {
        Self {
            address,
            length,
            flags,
        }
    }

    /// Request for a heap allocation or a remap (no mapping flags).
    pub fn allocation(result: *mut c_void, length: usize) -> Self {
        Self::new(result as usize, length, None)
    }

    /// Request for an `mmap`-style call.
    pub fn mapping(result: *mut c_void, length: usize, flags: c_int) -> Self {
        Self::new(result as usize, length, Some(MappingFlags::from_bits(flags)))
    }

    /// The underlying call failed (null or `MAP_FAILED`).
    #[inline]
    pub fn is_failure(&self) -> bool {
        self.address == 0 || self.address == libc::MAP_FAILED as usize
    }
}

/// Why a region was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The primitive failed; there is no region.
    Failed,
    /// The page-rounded length does not exceed the threshold.
    BelowThreshold,
    /// Mapping flags make the region ineligible.
    Filtered,
    /// The page-rounded range does not fit the address space.
    Overflow,
}

/// Outcome of [`Advisor::plan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Do nothing.
    Skip(SkipReason),
    /// Advise `[base, base + len)`.
    Merge {
        /// Page-aligned start.
        base: usize,
        /// Length from `base` to the end of the region.
        len: usize,
    },
}

/// Largest multiple of `page_size` not exceeding `address`.
#[inline]
pub const fn page_base(address: usize, page_size: usize) -> usize {
    (address / page_size) * page_size
}

/// Decides and issues mergeable hints.
///
/// Holds the two platform parameters the decision depends on; both are fixed
/// once resolution completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advisor {
    page_size: usize,
    threshold: MergeThreshold,
}

impl Advisor {
    /// Create an advisor.
    ///
    /// `page_size` must be non-zero.
    pub const fn new(page_size: usize, threshold: MergeThreshold) -> Self {
        Self {
            page_size,
            threshold,
        }
    }

    /// Page size used for rounding.
    #[inline]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Merge threshold.
    #[inline]
    pub const fn threshold(&self) -> MergeThreshold {
        self.threshold
    }

    /// Decide what to do with `request`, without side effects.
    pub fn plan(&self, request: &AdviceRequest) -> Decision {
        if request.is_failure() {
            return Decision::Skip(SkipReason::Failed);
        }

        let base = page_base(request.address, self.page_size);
        debug_assert!(base <= request.address);

        let Some(len) = request.length.checked_add(request.address - base) else {
            return Decision::Skip(SkipReason::Overflow);
        };
        if base.checked_add(len).is_none() {
            return Decision::Skip(SkipReason::Overflow);
        }

        if !self.threshold.admits(len) {
            return Decision::Skip(SkipReason::BelowThreshold);
        }

        match request.flags {
            Some(flags) if !flags.is_mergeable() => Decision::Skip(SkipReason::Filtered),
            _ => Decision::Merge { base, len },
        }
    }

    /// Decide, then issue the hint through `hinter` if the region qualifies.
    ///
    /// Never fails: a rejected hint is logged and otherwise ignored.
    pub fn consider<H: Hint + ?Sized>(&self, request: &AdviceRequest, hinter: &H) -> Decision {
        let decision = self.plan(request);
        match decision {
            Decision::Merge { base, len } => match hinter.mergeable(base, len) {
                Ok(()) => logging::trace_sharing(base, len),
                Err(err) => logging::trace_advise_failed(base, len, &err),
            },
            Decision::Skip(SkipReason::Filtered) => {
                let bits = request.flags.map_or(0, MappingFlags::bits);
                logging::trace_flags_filtered(request.address, request.length, bits);
            }
            Decision::Skip(_) => {}
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::cell::RefCell;

    const PAGE: usize = 4096;
    const THRESHOLD: usize = 32768;

    fn advisor() -> Advisor {
        Advisor::new(PAGE, MergeThreshold::new(THRESHOLD))
    }

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<(usize, usize)>>,
        fail: bool,
    }

    impl Hint for Recorder {
        fn mergeable(&self, base: usize, len: usize) -> Result<()> {
            self.calls.borrow_mut().push((base, len));
            if self.fail {
                Err(Error::Advise(rustix::io::Errno::INVAL))
            } else {
                Ok(())
            }
        }
    }

    const ANON_PRIVATE: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    #[test]
    fn test_page_base_rounds_down() {
        assert_eq!(page_base(0, PAGE), 0);
        assert_eq!(page_base(PAGE - 1, PAGE), 0);
        assert_eq!(page_base(PAGE, PAGE), PAGE);
        assert_eq!(page_base(3 * PAGE + 17, PAGE), 3 * PAGE);
    }

    #[test]
    fn test_small_region_is_skipped_at_any_address() {
        for address in [PAGE, PAGE + 10, 7 * PAGE + 4000] {
            let request = AdviceRequest::new(address, 100, None);
            assert_eq!(
                advisor().plan(&request),
                Decision::Skip(SkipReason::BelowThreshold)
            );
        }
    }

    #[test]
    fn test_null_address_is_noop() {
        let recorder = Recorder::default();
        for flags in [None, Some(MappingFlags::from_bits(ANON_PRIVATE))] {
            let request = AdviceRequest::new(0, 10 * THRESHOLD, flags);
            assert_eq!(
                advisor().consider(&request, &recorder),
                Decision::Skip(SkipReason::Failed)
            );
        }
        assert!(recorder.calls.borrow().is_empty());
    }

    #[test]
    fn test_map_failed_is_noop() {
        let request = AdviceRequest::mapping(libc::MAP_FAILED, 10 * THRESHOLD, ANON_PRIVATE);
        assert_eq!(advisor().plan(&request), Decision::Skip(SkipReason::Failed));
    }

    #[test]
    fn test_page_rounding_extends_length() {
        let length = THRESHOLD + 1000;
        let request = AdviceRequest::new(PAGE + 10, length, None);
        let recorder = Recorder::default();

        let decision = advisor().consider(&request, &recorder);

        assert_eq!(
            decision,
            Decision::Merge {
                base: PAGE,
                len: length + 10
            }
        );
        assert_eq!(*recorder.calls.borrow(), vec![(PAGE, length + 10)]);
    }

    #[test]
    fn test_rounding_can_push_over_threshold() {
        // 32760 bytes alone do not qualify, the 100 bytes of leading page do.
        let request = AdviceRequest::new(2 * PAGE + 100, THRESHOLD - 8, None);
        assert_eq!(
            advisor().plan(&request),
            Decision::Merge {
                base: 2 * PAGE,
                len: THRESHOLD + 92
            }
        );
    }

    #[test]
    fn test_exact_threshold_is_skipped() {
        let request = AdviceRequest::new(PAGE, THRESHOLD, None);
        assert_eq!(
            advisor().plan(&request),
            Decision::Skip(SkipReason::BelowThreshold)
        );
    }

    #[test]
    fn test_private_anonymous_mapping_is_advised() {
        let request = AdviceRequest::new(
            PAGE,
            2 * THRESHOLD,
            Some(MappingFlags::from_bits(ANON_PRIVATE)),
        );
        assert_eq!(
            advisor().plan(&request),
            Decision::Merge {
                base: PAGE,
                len: 2 * THRESHOLD
            }
        );
    }

    #[test]
    fn test_stack_and_shared_mappings_are_filtered() {
        let recorder = Recorder::default();
        for flags in [
            ANON_PRIVATE | libc::MAP_STACK,
            ANON_PRIVATE | libc::MAP_GROWSDOWN,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            libc::MAP_PRIVATE,
        ] {
            let request = AdviceRequest::mapping(PAGE as *mut c_void, 2 * THRESHOLD, flags);
            assert_eq!(
                advisor().consider(&request, &recorder),
                Decision::Skip(SkipReason::Filtered),
                "{:?}",
                MappingFlags::from_bits(flags)
            );
        }
        assert!(recorder.calls.borrow().is_empty());
    }

    #[test]
    fn test_failed_hint_is_swallowed() {
        let recorder = Recorder {
            fail: true,
            ..Default::default()
        };
        let request = AdviceRequest::new(PAGE, 2 * THRESHOLD, None);
        let decision = advisor().consider(&request, &recorder);
        assert_eq!(
            decision,
            Decision::Merge {
                base: PAGE,
                len: 2 * THRESHOLD
            }
        );
        assert_eq!(recorder.calls.borrow().len(), 1);
    }

    #[test]
    fn test_overflowing_range_is_skipped() {
        let request = AdviceRequest::new(PAGE + 1, usize::MAX, None);
        assert_eq!(advisor().plan(&request), Decision::Skip(SkipReason::Overflow));

        let request = AdviceRequest::new(usize::MAX - PAGE, 2 * PAGE, None);
        assert_eq!(advisor().plan(&request), Decision::Skip(SkipReason::Overflow));
    }

    #[test]
    fn test_flags_debug_lists_names() {
        let flags = MappingFlags::from_bits(ANON_PRIVATE | libc::MAP_STACK);
        let text = format!("{flags:?}");
        assert!(text.contains("PRIVATE"));
        assert!(text.contains("ANONYMOUS"));
        assert!(text.contains("STACK"));
        assert!(!text.contains("GROWSDOWN"));
    }

    #[test]
    fn test_madvise_on_real_mapping() {
        let len = 16 * PAGE;
        // SAFETY: fresh private anonymous mapping, unmapped below.
        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                ANON_PRIVATE,
                -1,
                0,
            );
            assert_ne!(ptr, libc::MAP_FAILED);
            // Kernels built without CONFIG_KSM reject the hint with EINVAL.
            match Madvise.mergeable(ptr as usize, len) {
                Ok(()) | Err(Error::Advise(_)) => {}
                Err(other) => panic!("unexpected error {other}"),
            }
            libc::munmap(ptr, len);
        }
    }
}
