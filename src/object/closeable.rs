use std::{
    any::type_name,
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
};

use super::{destroy_then_close, Destroy};
use crate::leak::{LeakDetector, LeakHandle};

/// A single-owner resource with leak detection but no sharing.
///
/// [`close`](Self::close) destroys the resource the first time and does
/// nothing afterwards.
pub struct Closeable<T> {
    ref_cnt: AtomicI32,
    leak: Option<Arc<LeakHandle>>,
    value: T,
}

impl<T> Closeable<T> {
    /// Track `value` with the [current](LeakDetector::current) detector.
    pub fn new(value: T) -> Self {
        Self::new_in(value, &LeakDetector::current())
    }

    pub fn new_in(value: T, detector: &Arc<LeakDetector>) -> Self {
        Self {
            ref_cnt: AtomicI32::new(1),
            leak: detector.register(type_name::<T>()),
            value,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.ref_cnt.load(Ordering::Acquire) <= 0
    }

    pub fn is_tracked(&self) -> bool {
        self.leak.is_some()
    }

    pub fn leak_handle(&self) -> Option<&LeakHandle> {
        self.leak.as_deref()
    }

    /// # Panics
    ///
    /// If the object was already closed. Best effort under concurrent close.
    pub fn assert_not_destroyed(&self) {
        assert!(!self.is_closed(), "used a destroyed object");
    }

    /// Record the current call site for leak reports. Only kept at DEBUG level.
    pub fn trace(&self, message: impl fmt::Display) {
        self.assert_not_destroyed();
        if let Some(leak) = &self.leak {
            leak.record(message);
        }
    }
}

impl<T: Destroy> Closeable<T> {
    /// Destroy the resource. Later calls are no-ops.
    ///
    /// A destroy error is returned after the leak handle has been closed.
    pub fn close(&self) -> Result<(), T::Error> {
        // the count never goes below 0, however often close is called
        let first = self
            .ref_cnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > 0).then(|| n - 1))
            .is_ok();
        if !first {
            return Ok(());
        }
        destroy_then_close(&self.value, self.leak.as_deref())
    }
}

impl<T> Deref for Closeable<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Drop for Closeable<T> {
    fn drop(&mut self) {
        if let Some(leak) = self.leak.take() {
            leak.notify_reclaimed();
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Closeable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closeable")
            .field("closed", &self.is_closed())
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leak::{HandleState, LeakConfig, Level};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Failing(AtomicUsize);

    impl Destroy for Failing {
        type Error = &'static str;

        fn destroy(&self) -> Result<(), &'static str> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err("device busy")
        }
    }

    #[test]
    fn close_is_idempotent() {
        let detector = LeakDetector::new(LeakConfig::new(Level::Full));
        let obj = Closeable::new_in(Failing::default(), &detector);
        assert!(!obj.is_closed());
        assert_eq!(obj.close(), Err("device busy"));
        assert_eq!(obj.close(), Ok(()));
        assert_eq!(obj.close(), Ok(()));
        assert!(obj.is_closed());
        assert_eq!(obj.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeated_close_leaves_count_at_zero() {
        let obj = Closeable::new_in(Failing::default(), &LeakDetector::disabled());
        for _ in 0..1000 {
            let _ = obj.close();
        }
        assert_eq!(obj.ref_cnt.load(Ordering::SeqCst), 0);
        assert_eq!(obj.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_destroy_still_closes_handle() {
        let detector = LeakDetector::new(LeakConfig::new(Level::Full));
        let obj = Closeable::new_in(Failing::default(), &detector);
        assert!(obj.close().is_err());
        assert_eq!(obj.leak_handle().unwrap().state(), HandleState::Closed);
        drop(obj);
        assert!(detector.check_all_destroyed().is_ok());
    }

    #[test]
    #[should_panic(expected = "used a destroyed object")]
    fn trace_after_close_panics() {
        let obj = Closeable::new_in(Failing::default(), &LeakDetector::disabled());
        let _ = obj.close();
        obj.trace("too late");
    }
}
