//! Mutex and condition variable helpers shared by the primitives.
//!
//! No code in this crate panics while holding one of its locks, so a poisoned lock still guards
//! consistent state and is recovered from rather than propagated.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

/// Waits on `condvar` unless `deadline` has already passed, in which case the guard is handed
/// back as `Err` without waiting. Callers re-check their predicate after every `Ok`, so a wait
/// that ends on timeout simply yields `Err` on the next call.
pub(crate) fn wait_until<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    deadline: Instant,
) -> Result<MutexGuard<'a, T>, MutexGuard<'a, T>> {
    let now = Instant::now();
    if now >= deadline {
        return Err(guard);
    }

    let (guard, _timeout) = condvar
        .wait_timeout(guard, deadline - now)
        .unwrap_or_else(PoisonError::into_inner);
    Ok(guard)
}

/// Deadline `timeout` from now, or `None` (no deadline) when it lies beyond what `Instant` can
/// represent.
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}
