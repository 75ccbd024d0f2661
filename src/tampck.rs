//! A mutex-locked wrapper for sharing a [`Tamp`] across threads.

use crate::Tamp;

/// Tamp lock: wrapper struct containing a mutex-locked [`Tamp`].
///
/// Every operation requires exclusive access to the whole instance, so
/// one lock around the heap is the only locking granularity on offer.
///
/// # Example
/// ```rust
/// # use tamp::*;
/// let tamp = Tamp::new(4096);
/// let tampck = tamp.lock::<spin::Mutex<()>>();
///
/// let handle = tampck.tamp().alloc(128).unwrap();
/// tampck.tamp().compact();
/// tampck.tamp().free(handle);
/// ```
#[derive(Debug)]
pub struct Tampck<R: lock_api::RawMutex>(pub lock_api::Mutex<R, Tamp>);

impl<R: lock_api::RawMutex> Tampck<R> {
    /// Lock the mutex and access the inner [`Tamp`].
    pub fn tamp(&self) -> lock_api::MutexGuard<'_, R, Tamp> {
        self.0.lock()
    }
}

impl Tamp {
    /// Wrap in [`Tampck`], a mutex-locked wrapper struct using
    /// [`lock_api`].
    pub fn lock<R: lock_api::RawMutex>(self) -> Tampck<R> {
        Tampck(lock_api::Mutex::new(self))
    }
}

/// A dummy [`RawMutex`](lock_api::RawMutex) implementation to skip
/// synchronization on single threaded systems.
///
/// # Safety
/// This is very unsafe and may cause undefined behaviour if multiple
/// threads enter a critical section synchronized by this, even without
/// explicit unsafe code.
pub struct AssumeUnlockable;

// SAFETY: nope
unsafe impl lock_api::RawMutex for AssumeUnlockable {
    const INIT: AssumeUnlockable = AssumeUnlockable;

    type GuardMarker = lock_api::GuardSend;

    fn lock(&self) {}

    fn try_lock(&self) -> bool {
        true
    }

    unsafe fn unlock(&self) {}
}
