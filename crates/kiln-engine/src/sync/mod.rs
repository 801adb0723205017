//! CPU/GPU timeline synchronization.
//!
//! The GPU timeline advances a [`Fence`] per queue; the CPU holds
//! [`CompletionToken`]s and compares them against it. Cross-queue ordering uses a
//! shared [`Semaphore`].

mod fence;
mod semaphore;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use fence::{CompletionToken, Fence, RetireStamp};
pub use semaphore::Semaphore;

// Pool state stays consistent across a panicking holder (every mutation is a
// single push/pop), so a poisoned lock is recovered instead of propagated.

#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[inline]
pub(crate) fn read_lock<T>(rw: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rw.read().unwrap_or_else(PoisonError::into_inner)
}

#[inline]
pub(crate) fn write_lock<T>(rw: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rw.write().unwrap_or_else(PoisonError::into_inner)
}
