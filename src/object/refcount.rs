use std::{
    any::type_name,
    cmp::Ordering as CmpOrdering,
    fmt,
    ops::Deref,
    sync::{
        atomic::{fence, AtomicI64, Ordering},
        Arc,
    },
};

use super::{destroy_then_close, Destroy};
use crate::leak::{LeakDetector, LeakHandle};

/// An object shared between owners that each hold an explicit reference.
///
/// The count starts at 1. Every [`retain`](Self::retain) must be balanced by a
/// [`release`](Self::release); the release that brings the count to 0 runs
/// [`Destroy::destroy`] once. Dropping the object before that happens is a
/// leak and is reported by its [`LeakDetector`].
///
/// Sharing is usually done through an `Arc<ReferenceCounted<T>>`: the `Arc`
/// keeps the memory reachable, the count tracks who still needs the resource.
pub struct ReferenceCounted<T> {
    ref_cnt: AtomicI64,
    idempotent: bool,
    leak: Option<Arc<LeakHandle>>,
    value: T,
}

impl<T> ReferenceCounted<T> {
    /// Track `value` with the [current](LeakDetector::current) detector.
    pub fn new(value: T) -> Self {
        Self::new_in(value, &LeakDetector::current())
    }

    pub fn new_in(value: T, detector: &Arc<LeakDetector>) -> Self {
        Self {
            ref_cnt: AtomicI64::new(1),
            idempotent: false,
            leak: detector.register(type_name::<T>()),
            value,
        }
    }

    /// Ignore releases past zero instead of panicking.
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn ref_count(&self) -> i64 {
        self.ref_cnt.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.ref_count() <= 0
    }

    pub fn is_tracked(&self) -> bool {
        self.leak.is_some()
    }

    pub fn leak_handle(&self) -> Option<&LeakHandle> {
        self.leak.as_deref()
    }

    /// Add an owner.
    ///
    /// # Panics
    ///
    /// If the object was already destroyed. The increment is undone first.
    pub fn retain(&self) -> &Self {
        let old = self.ref_cnt.fetch_add(1, Ordering::Relaxed);
        if old <= 0 {
            // not atomic with the check, but keeps the count where it was
            self.ref_cnt.fetch_sub(1, Ordering::Relaxed);
            panic!("resurrected a destroyed object{}", self.traces());
        }
        if let Some(leak) = &self.leak {
            leak.record("retain");
        }
        self
    }

    /// Record the current call site for leak reports. Only kept at DEBUG level.
    ///
    /// # Panics
    ///
    /// If the object was already destroyed. Racing releases can slip past
    /// this check; it is a debugging aid.
    pub fn trace(&self, message: impl fmt::Display) {
        assert!(
            self.ref_cnt.load(Ordering::Acquire) > 0,
            "used a destroyed object{}",
            self.traces()
        );
        if let Some(leak) = &self.leak {
            leak.record(message);
        }
    }

    fn traces(&self) -> String {
        self.leak
            .as_ref()
            .map(|leak| leak.traces_string())
            .unwrap_or_default()
    }
}

impl<T: Destroy> ReferenceCounted<T> {
    /// Drop an owner. Returns `Ok(true)` if this call destroyed the object.
    ///
    /// A destroy error is returned after the leak handle has been closed.
    ///
    /// # Panics
    ///
    /// If the object was already destroyed, unless it is
    /// [idempotent](Self::idempotent).
    pub fn release(&self) -> Result<bool, T::Error> {
        if let Some(leak) = &self.leak {
            leak.record("release");
        }
        let new = self.ref_cnt.fetch_sub(1, Ordering::Release) - 1;
        match new.cmp(&0) {
            CmpOrdering::Greater => Ok(false),
            CmpOrdering::Equal => {
                // pairs with the Release decrements of every other owner
                fence(Ordering::Acquire);
                destroy_then_close(&self.value, self.leak.as_deref()).map(|()| true)
            }
            CmpOrdering::Less if self.idempotent => Ok(false),
            CmpOrdering::Less => panic!("released a destroyed object{}", self.traces()),
        }
    }

    /// [`release`](Self::release), for callers that do not care who destroyed it.
    pub fn close(&self) -> Result<(), T::Error> {
        self.release().map(drop)
    }

    /// Retain now and release when the guard goes out of scope.
    pub fn retain_guard(&self) -> ReleaseOnDrop<'_, T>
    where
        T::Error: fmt::Debug,
    {
        ReleaseOnDrop {
            object: self.retain(),
        }
    }
}

impl<T> Deref for ReferenceCounted<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Drop for ReferenceCounted<T> {
    fn drop(&mut self) {
        if let Some(leak) = self.leak.take() {
            leak.notify_reclaimed();
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ReferenceCounted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceCounted")
            .field("ref_cnt", &self.ref_count())
            .field("idempotent", &self.idempotent)
            .field("value", &self.value)
            .finish()
    }
}

/// Scoped reference from [`ReferenceCounted::retain_guard`].
///
/// A destroy error cannot propagate out of `drop`, so it is logged.
pub struct ReleaseOnDrop<'a, T: Destroy>
where
    T::Error: fmt::Debug,
{
    object: &'a ReferenceCounted<T>,
}

impl<T: Destroy> Deref for ReleaseOnDrop<'_, T>
where
    T::Error: fmt::Debug,
{
    type Target = ReferenceCounted<T>;

    fn deref(&self) -> &Self::Target {
        self.object
    }
}

impl<T: Destroy> Drop for ReleaseOnDrop<'_, T>
where
    T::Error: fmt::Debug,
{
    fn drop(&mut self) {
        if let Err(err) = self.object.release() {
            error!(
                "destroying {} on scope exit failed: {err:?}",
                type_name::<T>()
            );
        }
    }
}
