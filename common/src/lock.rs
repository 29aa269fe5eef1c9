//! Lock aliases. Every lock in the workspace goes through these so the raw
//! lock implementation can be swapped in one place.

pub use parking_lot::RawMutex;

pub type Mutex<T> = lock_api::Mutex<RawMutex, T>;
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawMutex, T>;
