use mmtk::util::{Address, ObjectReference, VMThread};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::{runtime::threads::Thread, Runtime, ThreadOf};

/// Owner value of a monitor nobody holds.
pub const NO_OWNER: u64 = u64::MAX;

/// Heavyweight monitor backing an inflated lock.
///
/// Only the parts the per-thread caches rely on live here: the back pointer to the
/// locked object and the owner. Inflation, deflation and waiting are implemented by
/// the embedding runtime.
pub struct ObjectMonitor {
    /// Backward object pointer, zero once the monitor has been deflated.
    object: AtomicUsize,
    /// Id of the owning thread, see [`Thread::id`](crate::runtime::threads::Thread::id).
    owner: AtomicU64,
}

impl ObjectMonitor {
    pub fn new(object: ObjectReference) -> Self {
        Self {
            object: AtomicUsize::new(object.to_raw_address().as_usize()),
            owner: AtomicU64::new(NO_OWNER),
        }
    }

    pub fn object(&self) -> Option<ObjectReference> {
        let raw = self.object.load(Ordering::Acquire);
        ObjectReference::from_raw_address(unsafe { Address::from_usize(raw) })
    }

    /// Updates the back pointer after the object was moved.
    pub fn set_object(&self, object: ObjectReference) {
        self.object
            .store(object.to_raw_address().as_usize(), Ordering::Release);
    }

    /// Detaches the monitor from its object. Thread-local caches holding this monitor
    /// must be cleared before it is reused or freed.
    pub fn clear_object(&self) {
        self.object.store(0, Ordering::Release);
    }

    pub fn owner(&self) -> Option<u64> {
        match self.owner.load(Ordering::Relaxed) {
            NO_OWNER => None,
            id => Some(id),
        }
    }

    pub fn set_owner(&self, owner: Option<u64>) {
        self.owner
            .store(owner.unwrap_or(NO_OWNER), Ordering::Relaxed);
    }

    pub fn is_owned_by(&self, id: u64) -> bool {
        self.owner.load(Ordering::Relaxed) == id
    }

    /// Tests if the calling runtime thread owns this monitor.
    pub fn is_owned_by_current<R: Runtime>(&self) -> bool {
        let current = R::current_thread();
        current != VMThread::UNINITIALIZED && self.is_owned_by(ThreadOf::<R>::id(current))
    }
}

impl std::fmt::Debug for ObjectMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectMonitor")
            .field("object", &self.object())
            .field("owner", &self.owner())
            .finish()
    }
}
