pub(crate) mod pretty;

pub mod test_utils;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locking that survives a panic of another lock holder.
///
/// The guarded state is always left consistent between statements, so a
/// poisoned lock carries no broken invariant and is simply taken over.
pub(crate) trait MutexExt<T> {
    fn lock_unpoisoned(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_unpoisoned(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
