//! Leak detection for reference-counted and closeable objects.
//!
//! The detector never looks inside the objects it tracks. It only needs two
//! events per object:
//! 1. the object was destroyed (its count reached zero), which closes its
//!    [`LeakHandle`];
//! 2. the object was dropped, which queues the handle if it is still active.
//!
//! A handle moves out of `Active` exactly once:
//!
//! | from | to | cause | reported |
//! | ---- | -- | ----- | -------- |
//! | Active | Closed | destroy ran | never |
//! | Active | Leaked | dropped while active, seen by `poll` | once |
//! | Active | Leaked | still alive during `check_all_destroyed` | once |
//!
//! Both transitions are compare-and-swaps on the handle state, so a close
//! racing a reclamation is harmless: whichever lands first wins. The destroying
//! thread also holds the handle's `exclusive` lock while it closes, and the
//! drop path takes the same lock before it inspects the state and enqueues.
//! Without that hand-off a released object could be queued between the count
//! reaching zero and the handle being closed.
//!
//! Reports are rendered according to the detector [`Level`]: `DEBUG` includes
//! the bounded allocation and use traces, the other levels only the type.
//! Identical reports are logged once per detector.

mod config;
mod detector;
mod handle;
mod trace;

pub use config::{
    ConfigError, LeakConfig, Level, DEFAULT_LIGHT_SAMPLING_INTERVAL, DEFAULT_TRACE_COUNT,
    ENV_LEVEL, ENV_SAMPLING_INTERVAL, ENV_TRACE_COUNT, MAX_TRACE_COUNT,
};
pub use detector::{CurrentGuard, LeakDetector, LeakError};
pub use handle::{HandleState, LeakHandle};
