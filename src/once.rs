//! Reentrancy-safe one-time initialization.
//!
//! [`OnceGuard`] is a write-once cell whose initializer may call back into
//! the guard from the same thread. That happens in an allocator interposer
//! all the time: resolving the real `malloc` goes through `dlsym`, which
//! itself calls `calloc`, which lands back in the guard before the first
//! call has finished. `std::sync::OnceLock` deadlocks (or panics) in that
//! situation; this guard instead reports [`Entry::Reentrant`] so the caller
//! can fall back to something that does not need the value.
//!
//! # State machine
//!
//! ```text
//! NotStarted ──(first caller)──► InProgress { owner } ──(init returns)──► Done
//! ```
//!
//! * `Done` is also mirrored in an atomic flag read with `Acquire` on the
//!   fast path, so the steady state never takes the lock.
//! * Other threads arriving during `InProgress` sleep on a condition variable.
//! * The owner arriving during `InProgress` gets `Entry::Reentrant`.
//!
//! The mutex is released while the initializer runs, so a reentrant call can
//! take it again to inspect the state.
//!
//! # Example
//!
//! ```rust
//! use ksm_preload::once::{Entry, OnceGuard};
//!
//! static PAGE: OnceGuard<usize> = OnceGuard::new();
//!
//! let entry = PAGE.ensure_with(|| {
//!     // Re-entering from the initializing thread does not block.
//!     assert!(matches!(PAGE.ensure_with(|| unreachable!()), Entry::Reentrant));
//!     4096
//! });
//! assert_eq!(entry.ready(), Some(&4096));
//! ```

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::num::NonZeroI32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Identity of an OS thread.
///
/// Taken from `gettid`, which is a plain system call. `std::thread::current`
/// may allocate the first time it is used on a thread, and allocating from
/// inside the guard is exactly what must be avoided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadTag(NonZeroI32);

impl ThreadTag {
    /// Tag of the calling thread.
    #[inline]
    pub fn current() -> Self {
        Self(rustix::thread::gettid().as_raw_nonzero())
    }
}

/// Initialization progress of a [`OnceGuard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    /// Nobody has asked for the value yet.
    NotStarted,
    /// `owner` is running the initializer.
    InProgress {
        /// Thread running the initializer.
        owner: ThreadTag,
    },
    /// The value is published and immutable.
    Done,
}

/// Result of [`OnceGuard::ensure_with`].
#[derive(Debug)]
pub enum Entry<'a, T> {
    /// The value is initialized.
    Ready(&'a T),
    /// Called from inside the initializer; the value does not exist yet.
    Reentrant,
}

impl<'a, T> Entry<'a, T> {
    /// The value, if ready.
    #[inline]
    pub fn ready(self) -> Option<&'a T> {
        match self {
            Entry::Ready(value) => Some(value),
            Entry::Reentrant => None,
        }
    }
}

/// Write-once cell with an exactly-once, reentrancy-aware initializer.
pub struct OnceGuard<T> {
    /// Mirrors `InitState::Done`; read without the lock.
    done: AtomicBool,
    state: Mutex<InitState>,
    finished: Condvar,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: the value is written once, by one thread, before `done` is
// released; every shared access happens after observing `done` (or `Done`
// under the mutex).
unsafe impl<T: Send + Sync> Sync for OnceGuard<T> {}
unsafe impl<T: Send> Send for OnceGuard<T> {}

impl<T> OnceGuard<T> {
    /// Create an empty guard.
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            state: Mutex::new(InitState::NotStarted),
            finished: Condvar::new(),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// The value, if initialization has completed.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.done.load(Ordering::Acquire) {
            // SAFETY: `done` is only set after the value was written.
            Some(unsafe { self.value_unchecked() })
        } else {
            None
        }
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> InitState {
        *self.lock()
    }

    /// Make sure the value exists, running `init` if nobody has yet.
    ///
    /// * Returns [`Entry::Ready`] once the value is published. `init` has then
    ///   run exactly once across all threads.
    /// * Blocks while another thread is running its initializer.
    /// * Returns [`Entry::Reentrant`] immediately if the calling thread is the
    ///   one running the initializer.
    ///
    /// If `init` panics the guard goes back to `NotStarted` and waiting
    /// threads retry.
    #[inline]
    pub fn ensure_with<F>(&self, init: F) -> Entry<'_, T>
    where
        F: FnOnce() -> T,
    {
        if let Some(value) = self.get() {
            return Entry::Ready(value);
        }
        self.ensure_slow(init)
    }

    #[cold]
    fn ensure_slow<F>(&self, init: F) -> Entry<'_, T>
    where
        F: FnOnce() -> T,
    {
        let me = ThreadTag::current();
        let mut state = self.lock();

        loop {
            match *state {
                InitState::Done => {
                    // SAFETY: `Done` is set after the value was written and
                    // the mutex orders that write before this read.
                    return Entry::Ready(unsafe { self.value_unchecked() });
                }
                InitState::InProgress { owner } if owner == me => return Entry::Reentrant,
                InitState::InProgress { .. } => {
                    state = self
                        .finished
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                InitState::NotStarted => {
                    *state = InitState::InProgress { owner: me };
                    drop(state);
                    return self.run(init);
                }
            }
        }
    }

    fn run<F>(&self, init: F) -> Entry<'_, T>
    where
        F: FnOnce() -> T,
    {
        let reset = ResetOnUnwind(self);
        let value = init();
        std::mem::forget(reset);

        // SAFETY: we own `InProgress`, nobody else reads or writes the cell
        // until `done` is released below.
        unsafe { (*self.value.get()).write(value) };
        self.done.store(true, Ordering::Release);

        *self.lock() = InitState::Done;
        self.finished.notify_all();

        // SAFETY: written just above.
        Entry::Ready(unsafe { self.value_unchecked() })
    }

    fn lock(&self) -> MutexGuard<'_, InitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Safety
    ///
    /// The value must have been published.
    #[inline]
    unsafe fn value_unchecked(&self) -> &T {
        // SAFETY: guaranteed by the caller.
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T> Default for OnceGuard<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for OnceGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnceGuard")
            .field("value", &self.get())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for OnceGuard<T> {
    fn drop(&mut self) {
        if *self.done.get_mut() {
            // SAFETY: published values are initialized.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

/// Puts the guard back to `NotStarted` if the initializer unwinds.
struct ResetOnUnwind<'a, T>(&'a OnceGuard<T>);

impl<T> Drop for ResetOnUnwind<'_, T> {
    fn drop(&mut self) {
        *self.0.lock() = InitState::NotStarted;
        self.0.finished.notify_all();
    }
}
