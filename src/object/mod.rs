//! Lifecycle primitives: shared, explicitly counted objects
//! ([`ReferenceCounted`]) and single-owner closeable ones ([`Closeable`]).
//! Both run their resource's [`Destroy`] exactly once and keep the leak
//! detector informed.

mod closeable;
mod refcount;

pub use closeable::Closeable;
pub use refcount::{ReferenceCounted, ReleaseOnDrop};

use crate::leak::LeakHandle;

/// Resource cleanup, run once when the owning object is destroyed.
///
/// `destroy` takes `&self` because the object may still be shared when the
/// count reaches zero; resources mutate through interior mutability.
pub trait Destroy {
    type Error;

    fn destroy(&self) -> Result<(), Self::Error>;
}

impl<T: Destroy + ?Sized> Destroy for Box<T> {
    type Error = T::Error;

    fn destroy(&self) -> Result<(), Self::Error> {
        (**self).destroy()
    }
}

/// Run `destroy`, then close the leak handle even if destroy failed or
/// panicked.
pub(crate) fn destroy_then_close<T: Destroy + ?Sized>(
    value: &T,
    leak: Option<&LeakHandle>,
) -> Result<(), T::Error> {
    let _close = CloseOnExit(leak);
    value.destroy()
}

struct CloseOnExit<'a>(Option<&'a LeakHandle>);

impl Drop for CloseOnExit<'_> {
    fn drop(&mut self) {
        if let Some(leak) = self.0 {
            leak.close_exclusive();
        }
    }
}
