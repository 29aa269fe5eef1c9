use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use refguard_common::lock::Mutex;

use super::{
    detector::LeakDetector,
    trace::{TraceLog, TraceRecord},
};

pub(crate) const UNLINKED: usize = usize::MAX;

/// Lifecycle of a [`LeakHandle`]. Both transitions out of `Active` are
/// terminal and mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandleState {
    /// The tracked object has not been destroyed yet.
    Active = 0,
    /// The tracked object was destroyed; it is never reported.
    Closed = 1,
    /// The tracked object became unreachable, or was force-closed by a leak
    /// check, while still active. Reported once.
    Leaked = 2,
}

impl HandleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => HandleState::Active,
            1 => HandleState::Closed,
            _ => HandleState::Leaked,
        }
    }
}

/// Non-owning observation of one tracked object, owned by the object and
/// linked into its detector's live-set.
pub struct LeakHandle {
    state: AtomicU8,
    /// Held by the destroying thread while it closes the handle and by the
    /// reclamation path while it decides whether to enqueue, so a closed
    /// object is never queued as leaked.
    pub(crate) exclusive: Mutex<()>,
    type_name: &'static str,
    traces: Option<Mutex<TraceLog>>,
    /// Slot in the live-set; only touched under the live-set lock.
    slot: AtomicUsize,
    detector: Weak<LeakDetector>,
}

impl LeakHandle {
    pub(crate) fn new(
        type_name: &'static str,
        traces: Option<TraceLog>,
        detector: Weak<LeakDetector>,
    ) -> Self {
        Self {
            state: AtomicU8::new(HandleState::Active as u8),
            exclusive: Mutex::new(()),
            type_name,
            traces: traces.map(Mutex::new),
            slot: AtomicUsize::new(UNLINKED),
            detector,
        }
    }

    pub fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn transition(&self, to: HandleState) -> bool {
        self.state
            .compare_exchange(
                HandleState::Active as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Mark the tracked object as properly destroyed and unlink the handle.
    /// Returns `false` if the handle had already left `Active`.
    pub fn close(&self) -> bool {
        if !self.transition(HandleState::Closed) {
            return false;
        }
        if let Some(detector) = self.detector.upgrade() {
            detector.unlink(self);
        }
        true
    }

    /// `close` under the exclusive lock, as done by the destroying thread.
    pub(crate) fn close_exclusive(&self) -> bool {
        let _exclusive = self.exclusive.lock();
        self.close()
    }

    pub(crate) fn mark_leaked(&self) -> bool {
        self.transition(HandleState::Leaked)
    }

    /// Called when the tracked object is dropped. Queues the handle for the
    /// next poll unless the object was destroyed first.
    pub(crate) fn notify_reclaimed(self: Arc<Self>) {
        let Some(detector) = self.detector.upgrade() else {
            return;
        };
        let _exclusive = self.exclusive.lock();
        if self.state() == HandleState::Active {
            detector.enqueue_reclaimed(Arc::clone(&self));
        }
    }

    pub(crate) fn record_allocation(&self) {
        if let Some(traces) = &self.traces {
            let record = TraceRecord::capture(None);
            traces.lock().record(record);
        }
    }

    /// Record a use of the tracked object. Nothing is formatted or captured
    /// unless traces are being kept.
    pub fn record(&self, message: impl fmt::Display) {
        if let Some(traces) = &self.traces {
            let record = TraceRecord::capture(Some(message.to_string()));
            traces.lock().record(record);
        }
    }

    /// Number of trace records currently retained.
    pub fn retained_traces(&self) -> usize {
        self.traces.as_ref().map_or(0, |traces| traces.lock().len())
    }

    /// Messages of the retained records, oldest first. The allocation record
    /// has no message.
    pub fn trace_messages(&self) -> Vec<Option<String>> {
        self.traces.as_ref().map_or_else(Vec::new, |traces| {
            traces
                .lock()
                .records()
                .iter()
                .map(|r| r.message().map(str::to_owned))
                .collect()
        })
    }

    /// Rendered traces, or an empty string when none are kept.
    pub fn traces_string(&self) -> String {
        self.traces
            .as_ref()
            .map(|traces| traces.lock().to_string())
            .unwrap_or_default()
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot.load(Ordering::Relaxed)
    }

    pub(crate) fn set_slot(&self, slot: usize) {
        self.slot.store(slot, Ordering::Relaxed)
    }
}

impl fmt::Debug for LeakHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeakHandle")
            .field("type_name", &self.type_name)
            .field("state", &self.state())
            .field("retained_traces", &self.retained_traces())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orphan() -> LeakHandle {
        LeakHandle::new("orphan", None, Weak::new())
    }

    #[test]
    fn close_wins_once() {
        let handle = orphan();
        assert!(handle.close());
        assert!(!handle.close());
        assert!(!handle.mark_leaked());
        assert_eq!(handle.state(), HandleState::Closed);
    }

    #[test]
    fn leak_wins_once() {
        let handle = orphan();
        assert!(handle.mark_leaked());
        assert!(!handle.close());
        assert_eq!(handle.state(), HandleState::Leaked);
    }

    #[test]
    fn untraced_handle_records_nothing() {
        let handle = orphan();
        handle.record_allocation();
        handle.record("ignored");
        assert_eq!(handle.retained_traces(), 0);
        assert_eq!(handle.traces_string(), "");
    }

    #[test]
    fn reclaim_without_detector_is_a_no_op() {
        let handle = Arc::new(orphan());
        Arc::clone(&handle).notify_reclaimed();
        assert_eq!(handle.state(), HandleState::Active);
    }
}
