//! Deterministic, exactly-once release of shared resources, with a leak
//! detector that verifies every tracked object was released before it was
//! dropped.
//!
//! ```
//! use std::{convert::Infallible, sync::Arc};
//! use refguard::{Destroy, LeakConfig, LeakDetector, Level, ReferenceCounted};
//!
//! struct Buffer;
//!
//! impl Destroy for Buffer {
//!     type Error = Infallible;
//!
//!     fn destroy(&self) -> Result<(), Infallible> {
//!         Ok(())
//!     }
//! }
//!
//! let detector = LeakDetector::new(LeakConfig::new(Level::Full));
//! let buffer = Arc::new(ReferenceCounted::new_in(Buffer, &detector));
//!
//! let shared = Arc::clone(&buffer);
//! shared.retain();
//! assert_eq!(shared.release(), Ok(false));
//! assert_eq!(buffer.release(), Ok(true));
//!
//! detector.assert_all_destroyed();
//! ```

#[macro_use]
extern crate log;

pub mod leak;
pub mod object;

pub use leak::{
    ConfigError, CurrentGuard, HandleState, LeakConfig, LeakDetector, LeakError, LeakHandle, Level,
};
pub use object::{Closeable, Destroy, ReferenceCounted, ReleaseOnDrop};

static_assertions::assert_impl_all!(LeakDetector: Send, Sync);
static_assertions::assert_impl_all!(LeakHandle: Send, Sync);
static_assertions::assert_impl_all!(ReferenceCounted<()>: Send, Sync);
static_assertions::assert_impl_all!(Closeable<()>: Send, Sync);
static_assertions::assert_not_impl_any!(CurrentGuard: Send);
