use std::{
    borrow::Cow,
    cell::RefCell,
    fmt,
    marker::PhantomData,
    mem,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use crossbeam_queue::SegQueue;
use indexmap::IndexSet;
use once_cell::sync::Lazy;
use refguard_common::{lock::Mutex, rand::sample};

use super::{
    config::{ConfigError, LeakConfig, Level, ENV_LEVEL, ENV_TRACE_COUNT},
    handle::{LeakHandle, UNLINKED},
    trace::TraceLog,
};

/// The process-wide detector, configured from the environment on first use.
static GLOBAL_DETECTOR: Lazy<Arc<LeakDetector>> = Lazy::new(|| {
    let config = LeakConfig::from_env()
        .unwrap_or_else(|err| panic!("invalid leak detector configuration: {err}"));
    LeakDetector::new(config)
});

static DISABLED_DETECTOR: Lazy<Arc<LeakDetector>> =
    Lazy::new(|| LeakDetector::new(LeakConfig::new(Level::Disabled)));

thread_local! {
    /// Detector installed by [`LeakDetector::enter`] on this thread.
    static CURRENT_DETECTOR: RefCell<Option<Arc<LeakDetector>>> = RefCell::new(None);
}

const RELEASE_RULE: &str = "Every ReferenceCounted must be released to zero, and every Closeable \
     closed, before it is dropped.";

/// A leak check found objects that were never destroyed.
#[derive(Debug, thiserror::Error)]
#[error("{} distinct leak(s) detected:\n{}", .messages.len(), .messages.join("\n\n"))]
pub struct LeakError {
    pub messages: Vec<String>,
}

/// Registry of tracked objects.
///
/// Objects register at construction and get a [`LeakHandle`] back if they were
/// sampled. A handle closed by the object's destruction is forgotten. A handle
/// whose object is dropped first is queued, and the next [`poll`](Self::poll)
/// (or registration) reports it.
pub struct LeakDetector {
    config: LeakConfig,
    suppressed: Arc<[Cow<'static, str>]>,
    live: Mutex<LiveSet>,
    reclaimed: SegQueue<Arc<LeakHandle>>,
    logged_leaks: Mutex<IndexSet<String>>,
    leaks_detected: AtomicUsize,
}

impl LeakDetector {
    /// Build a detector from `config` as is. A zero sampling interval samples
    /// everything; use [`try_new`](Self::try_new) to reject it instead.
    pub fn new(config: LeakConfig) -> Arc<Self> {
        if log_enabled!(log::Level::Debug) {
            debug!("leak detection level: {}", config.level());
            debug!("leak detection sampling interval: {}", config.sampling_interval());
            debug!("leak detection trace count: {}", config.trace_count());
        }
        Arc::new(Self {
            suppressed: config.suppressed_frames().iter().cloned().collect(),
            config,
            live: Mutex::new(LiveSet::default()),
            reclaimed: SegQueue::new(),
            logged_leaks: Mutex::new(IndexSet::new()),
            leaks_detected: AtomicUsize::new(0),
        })
    }

    /// [`new`](Self::new) after [`LeakConfig::validate`].
    pub fn try_new(config: LeakConfig) -> Result<Arc<Self>, ConfigError> {
        Ok(Self::new(config.validate()?))
    }

    /// A shared detector that never tracks anything.
    pub fn disabled() -> Arc<Self> {
        Arc::clone(&DISABLED_DETECTOR)
    }

    /// The process-wide detector configured from the environment.
    ///
    /// # Panics
    ///
    /// On first use, if the environment holds an invalid configuration.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL_DETECTOR)
    }

    /// The detector entered on this thread, or the global one.
    pub fn current() -> Arc<Self> {
        CURRENT_DETECTOR
            .with(|current| current.borrow().clone())
            .unwrap_or_else(Self::global)
    }

    /// Make `self` this thread's current detector until the guard is dropped.
    ///
    /// Only the calling thread is affected. Threads spawned inside the scope
    /// start with the global detector unless they are started through
    /// [`spawn`](Self::spawn).
    pub fn enter(self: &Arc<Self>) -> CurrentGuard {
        let previous = CURRENT_DETECTOR.with(|current| current.replace(Some(Arc::clone(self))));
        CurrentGuard {
            previous,
            _not_send: PhantomData,
        }
    }

    /// Spawn a thread whose current detector is this thread's current one.
    pub fn spawn<F, T>(f: F) -> thread::JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let detector = Self::current();
        thread::spawn(move || {
            let _current = detector.enter();
            f()
        })
    }

    pub fn config(&self) -> &LeakConfig {
        &self.config
    }

    pub fn level(&self) -> Level {
        self.config.level()
    }

    /// Start tracking an object of type `type_name`.
    ///
    /// Returns `None` when detection is disabled or the object was not
    /// sampled. Pending reclamations are polled on every call, so leak
    /// reporting keeps pace with allocation without a background thread.
    pub fn register(self: &Arc<Self>, type_name: &'static str) -> Option<Arc<LeakHandle>> {
        if self.config.level() == Level::Disabled {
            return None;
        }
        self.poll();
        if !sample(self.config.sampling_interval()) {
            return None;
        }
        let trace_count = self.config.trace_count();
        let traces = (trace_count > 0).then(|| TraceLog::new(trace_count, Arc::clone(&self.suppressed)));
        let handle = Arc::new(LeakHandle::new(type_name, traces, Arc::downgrade(self)));
        handle.record_allocation();
        self.live.lock().link(Arc::clone(&handle));
        Some(handle)
    }

    /// Report every queued handle whose object was dropped without being
    /// destroyed. Returns the number of new leaks.
    pub fn poll(&self) -> usize {
        let mut leaks = 0;
        while let Some(handle) = self.reclaimed.pop() {
            if !handle.mark_leaked() {
                // destroyed after all; the close won the race
                continue;
            }
            self.unlink(&handle);
            self.report(&handle);
            leaks += 1;
        }
        leaks
    }

    /// Force-close every object still alive, report it as leaked, and fail if
    /// any leak was ever detected by this detector.
    ///
    /// Does not depend on drop timing, which makes it the check to run at the
    /// end of a test or request scope.
    pub fn check_all_destroyed(&self) -> Result<(), LeakError> {
        self.poll();
        let forced: Vec<Arc<LeakHandle>> = {
            let mut live = self.live.lock();
            let forced: Vec<_> = live.iter().filter(|h| h.mark_leaked()).cloned().collect();
            for handle in &forced {
                live.unlink(handle);
            }
            forced
        };
        for handle in &forced {
            self.report(handle);
        }
        let logged = self.logged_leaks.lock();
        if logged.is_empty() {
            Ok(())
        } else {
            Err(LeakError {
                messages: logged.iter().cloned().collect(),
            })
        }
    }

    /// # Panics
    ///
    /// If [`check_all_destroyed`](Self::check_all_destroyed) fails.
    pub fn assert_all_destroyed(&self) {
        if let Err(err) = self.check_all_destroyed() {
            panic!("{err}");
        }
    }

    /// Distinct leak messages recorded so far, in detection order.
    pub fn leak_messages(&self) -> Vec<String> {
        self.logged_leaks.lock().iter().cloned().collect()
    }

    /// Number of leaked objects detected so far, duplicates included.
    pub fn leaks_detected(&self) -> usize {
        self.leaks_detected.load(Ordering::Relaxed)
    }

    /// Number of handles still linked into the live-set.
    pub fn live_count(&self) -> usize {
        self.live.lock().len
    }

    pub(crate) fn enqueue_reclaimed(&self, handle: Arc<LeakHandle>) {
        self.reclaimed.push(handle);
    }

    pub(crate) fn unlink(&self, handle: &LeakHandle) {
        self.live.lock().unlink(handle);
    }

    fn report(&self, handle: &LeakHandle) {
        self.leaks_detected.fetch_add(1, Ordering::Relaxed);
        let message = self.leak_message(handle);
        let mut logged = self.logged_leaks.lock();
        if !logged.contains(&message) {
            error!("{message}");
            logged.insert(message);
        }
    }

    fn leak_message(&self, handle: &LeakHandle) -> String {
        let type_name = handle.type_name();
        match self.config.level() {
            Level::Debug => {
                let hint = match self.config.trace_count() {
                    0 => format!(
                        "\n\tStack traces are not being stored. To store allocation stack traces set {ENV_TRACE_COUNT}=1 or greater."
                    ),
                    1 => format!(
                        "\n\tOnly the allocation stack trace was stored. To store additional stack traces set {ENV_TRACE_COUNT}=2 or greater."
                    ),
                    _ => "\n\tTo trace the lifetime of the object more thoroughly, call trace() on it more often."
                        .to_owned(),
                };
                format!(
                    "LEAK: {type_name} was dropped without being destroyed. {RELEASE_RULE}{}{hint}",
                    handle.traces_string()
                )
            }
            level => format!(
                "LEAK: {type_name} was dropped without being destroyed. {RELEASE_RULE} \
                 The leak detection level is {level}, which does not record stack traces. \
                 To enable debugging, set {ENV_LEVEL}=DEBUG."
            ),
        }
    }
}

impl fmt::Debug for LeakDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeakDetector")
            .field("config", &self.config)
            .field("live", &format!("[{} objects tracked]", self.live_count()))
            .field("reclaimed", &format!("[{} objects queued]", self.reclaimed.len()))
            .field("leaks_detected", &self.leaks_detected())
            .finish()
    }
}

/// Restores the previous current detector when dropped.
#[must_use = "the detector is only current while the guard is alive"]
pub struct CurrentGuard {
    previous: Option<Arc<LeakDetector>>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = CURRENT_DETECTOR.try_with(|current| *current.borrow_mut() = previous);
    }
}

/// Live handles, as a doubly linked list threaded through a slot arena. Each
/// handle remembers its slot, so unlinking never scans.
#[derive(Default)]
struct LiveSet {
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

#[derive(Default)]
struct Slot {
    handle: Option<Arc<LeakHandle>>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl LiveSet {
    fn link(&mut self, handle: Arc<LeakHandle>) {
        let index = self.free.pop().unwrap_or_else(|| {
            self.slots.push(Slot::default());
            self.slots.len() - 1
        });
        handle.set_slot(index);
        self.slots[index] = Slot {
            handle: Some(handle),
            prev: self.tail,
            next: None,
        };
        match self.tail {
            Some(tail) => self.slots[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    fn unlink(&mut self, handle: &LeakHandle) -> Option<Arc<LeakHandle>> {
        let index = handle.slot();
        let slot = self.slots.get_mut(index)?;
        match &slot.handle {
            Some(linked) if std::ptr::eq(Arc::as_ptr(linked), handle) => {}
            _ => return None,
        }
        let Slot { handle: linked, prev, next } = mem::take(slot);
        match prev {
            Some(prev) => self.slots[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slots[next].prev = prev,
            None => self.tail = prev,
        }
        handle.set_slot(UNLINKED);
        self.free.push(index);
        self.len -= 1;
        linked
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<LeakHandle>> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let slot = &self.slots[cursor?];
            cursor = slot.next;
            slot.handle.as_ref()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    fn orphan(name: &'static str) -> Arc<LeakHandle> {
        Arc::new(LeakHandle::new(name, None, Weak::new()))
    }

    fn names(live: &LiveSet) -> Vec<&'static str> {
        live.iter().map(|h| h.type_name()).collect()
    }

    #[test]
    fn live_set_links_in_order_and_unlinks_anywhere() {
        let mut live = LiveSet::default();
        let (a, b, c) = (orphan("a"), orphan("b"), orphan("c"));
        live.link(Arc::clone(&a));
        live.link(Arc::clone(&b));
        live.link(Arc::clone(&c));
        assert_eq!(names(&live), ["a", "b", "c"]);

        assert!(live.unlink(&b).is_some());
        assert_eq!(names(&live), ["a", "c"]);
        assert!(live.unlink(&b).is_none());

        assert!(live.unlink(&a).is_some());
        assert!(live.unlink(&c).is_some());
        assert_eq!(live.len, 0);
        assert!(live.iter().next().is_none());

        // freed slots are reused
        let d = orphan("d");
        live.link(Arc::clone(&d));
        assert_eq!(names(&live), ["d"]);
        assert_eq!(live.slots.len(), 3);
    }

    #[test]
    fn unlink_ignores_foreign_handles() {
        let mut live = LiveSet::default();
        let a = orphan("a");
        live.link(Arc::clone(&a));
        let stranger = orphan("stranger");
        stranger.set_slot(a.slot());
        assert!(live.unlink(&stranger).is_none());
        assert_eq!(live.len, 1);
    }

    #[test]
    fn disabled_detector_never_registers() {
        let detector = LeakDetector::disabled();
        assert!(detector.register("anything").is_none());
        assert_eq!(detector.live_count(), 0);
    }

    #[test]
    fn enter_restores_previous() {
        let outer = LeakDetector::new(LeakConfig::new(Level::Full));
        let inner = LeakDetector::new(LeakConfig::new(Level::Light));
        let outer_guard = outer.enter();
        {
            let _inner_guard = inner.enter();
            assert!(Arc::ptr_eq(&LeakDetector::current(), &inner));
        }
        assert!(Arc::ptr_eq(&LeakDetector::current(), &outer));
        drop(outer_guard);
        assert!(!Arc::ptr_eq(&LeakDetector::current(), &outer));
    }

    #[test]
    fn spawned_thread_inherits_current() {
        let detector = LeakDetector::new(LeakConfig::new(Level::Full));
        let _current = detector.enter();
        let child = LeakDetector::spawn(LeakDetector::current).join().unwrap();
        assert!(Arc::ptr_eq(&child, &detector));

        let plain = thread::spawn(LeakDetector::current).join().unwrap();
        assert!(!Arc::ptr_eq(&plain, &detector));
    }

    #[test]
    fn try_new_validates() {
        let zero = LeakConfig::new(Level::Light).with_sampling_interval(0);
        assert_eq!(
            LeakDetector::try_new(zero.clone()).unwrap_err(),
            ConfigError::ZeroSamplingInterval
        );
        let detector = LeakDetector::new(zero);
        for _ in 0..10 {
            let handle = detector.register("sampled").unwrap();
            assert!(handle.close());
        }
        assert!(LeakDetector::try_new(LeakConfig::new(Level::Light)).is_ok());
    }

    #[test]
    fn queued_handle_is_reported_once() {
        let detector = LeakDetector::new(LeakConfig::new(Level::Full));
        let handle = detector.register("queued").unwrap();
        assert_eq!(detector.live_count(), 1);
        Arc::clone(&handle).notify_reclaimed();
        Arc::clone(&handle).notify_reclaimed();
        assert_eq!(detector.poll(), 1);
        assert_eq!(detector.poll(), 0);
        assert_eq!(detector.live_count(), 0);
        assert_eq!(detector.leaks_detected(), 1);
    }

    #[test]
    fn closed_handle_is_not_queued() {
        let detector = LeakDetector::new(LeakConfig::new(Level::Full));
        let handle = detector.register("closed").unwrap();
        assert!(handle.close_exclusive());
        Arc::clone(&handle).notify_reclaimed();
        assert_eq!(detector.poll(), 0);
        assert!(detector.check_all_destroyed().is_ok());
    }
}
