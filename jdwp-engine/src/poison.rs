// Std mutex locking for engine tables
//
// A poisoned table lock is taken over instead of propagating the panic.

use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::error;

/// Lock `mutex`, taking over the guard of a poisoned lock. `table` names
/// the lock in the diagnostic.
#[track_caller]
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, table: &'static str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
        let caller = std::panic::Location::caller();
        error!(
            table,
            at = %caller,
            "Engine lock poisoned by a panicking holder; taking over"
        );
        poisoned.into_inner()
    })
}
