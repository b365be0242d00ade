use crate::{
    options::syncflags_check_lock_owner,
    sync::{lock_stack::LockStack, om_cache::OMCache},
    Runtime, ThreadOf,
};
use mmtk::{
    util::{ObjectReference, VMThread},
    vm::{slot::SimpleSlot, RootsWorkFactory, SlotVisitor},
};
use std::{
    cell::{Cell, UnsafeCell},
    marker::PhantomData,
    mem::offset_of,
    sync::atomic::{AtomicU8, Ordering},
};

pub trait Thread<R: Runtime>: 'static {
    /// Offset of [`TLSData`] inside the runtime's thread structure, if it is embedded at a
    /// fixed location. Required for the thread-relative offsets used by generated code.
    const TLS_OFFSET: Option<usize> = None;

    /// Unique thread ID.
    fn id(thread: VMThread) -> u64;
    fn tls<'a>(thread: VMThread) -> &'a TLSData;
    fn is_mutator(_thread: VMThread) -> bool {
        true
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    New = 0,
    /// Thread is running managed code and may mutate its lock-stack at any time.
    Running = 1,
    /// Thread is in privileged code that does not touch its lock bookkeeping.
    Parked = 2,
    /// Thread is running managed code but is expected to block.
    RunningToBlock = 3,
    /// Thread is blocked, e.g. stopped at a safepoint.
    BlockedInParked = 4,
    Terminated = 5,
}

impl From<u8> for ThreadState {
    fn from(value: u8) -> ThreadState {
        match value {
            0 => ThreadState::New,
            1 => ThreadState::Running,
            2 => ThreadState::Parked,
            3 => ThreadState::RunningToBlock,
            4 => ThreadState::BlockedInParked,
            5 => ThreadState::Terminated,
            _ => unreachable!(),
        }
    }
}

impl ThreadState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::RunningToBlock)
    }

}

/// Per-thread lock bookkeeping. Both structures sit at fixed offsets, see
/// [`lock_stack_top_offset`] and friends.
///
/// Only the owning thread mutates the lock-stack and the monitor cache, through a
/// [`SyncStateGuard`]. Other threads go through [`TLSData::quiesced`].
#[repr(C)]
pub struct TLSData {
    lock_stack: UnsafeCell<LockStack>,
    om_cache: UnsafeCell<OMCache>,
    state: AtomicU8,
    guard_held: Cell<bool>,
    /// Views the owner currently holds on its own bookkeeping.
    owner_views: Cell<usize>,
}

// Shared across threads only under the owner/quiescence protocol above.
unsafe impl Send for TLSData {}
unsafe impl Sync for TLSData {}

impl TLSData {
    pub const LOCK_STACK_OFFSET: usize = offset_of!(Self, lock_stack);
    pub const OM_CACHE_OFFSET: usize = offset_of!(Self, om_cache);

    pub const fn new() -> Self {
        Self {
            lock_stack: UnsafeCell::new(LockStack::new()),
            om_cache: UnsafeCell::new(OMCache::new()),
            state: AtomicU8::new(ThreadState::New as _),
            guard_held: Cell::new(false),
            owner_views: Cell::new(0),
        }
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as _, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Tests if the calling thread is the thread that owns this data.
    pub fn is_owning_thread<R: Runtime>(&self) -> bool {
        let current = R::current_thread();

        if current == VMThread::UNINITIALIZED || !ThreadOf::<R>::is_mutator(current) {
            return false;
        }

        std::ptr::eq(ThreadOf::<R>::tls(current), self)
    }

    /// Read and traverse the lock bookkeeping of another thread.
    ///
    /// # Safety
    ///
    /// The caller must hold a quiescence guarantee for the owning thread (e.g. it is stopped
    /// at a safepoint) for as long as the returned view is alive, and no other view of this
    /// thread may be alive at the same time. The owner itself may call this only when it does
    /// not hold a [`SyncStateGuard`], and cannot acquire one until the view is dropped.
    pub unsafe fn quiesced<R: Runtime>(&self) -> QuiescedSyncState<'_> {
        let owner_view = self.is_owning_thread::<R>();
        if owner_view {
            if self.guard_held.get() {
                log::error!(
                    target: "vmkit::threads",
                    "quiesced view requested while the owner holds its sync state"
                );
                panic!("lock-stack inspected while its owner holds the sync state guard");
            }
            self.owner_views.set(self.owner_views.get() + 1);
        } else if syncflags_check_lock_owner() && self.is_running() {
            log::error!(
                target: "vmkit::threads",
                "lock-stack inspected while the owner is {:?}",
                self.state()
            );
            panic!("lock-stack inspected while its owner is running");
        }

        QuiescedSyncState {
            tls: self,
            owner_view,
            marker: PhantomData,
        }
    }
}

impl Default for TLSData {
    fn default() -> Self {
        Self::new()
    }
}

fn thread_relative<R: Runtime>(offset: usize) -> Option<usize> {
    ThreadOf::<R>::TLS_OFFSET.map(|tls| tls + offset)
}

/// Offset of the lock-stack's entry count, relative to the runtime's thread structure.
pub fn lock_stack_top_offset<R: Runtime>() -> Option<usize> {
    thread_relative::<R>(TLSData::LOCK_STACK_OFFSET + LockStack::TOP_OFFSET)
}

pub fn lock_stack_base_offset<R: Runtime>() -> Option<usize> {
    thread_relative::<R>(TLSData::LOCK_STACK_OFFSET + LockStack::BASE_OFFSET)
}

pub fn om_cache_oops_offset<R: Runtime>() -> Option<usize> {
    thread_relative::<R>(TLSData::OM_CACHE_OFFSET + OMCache::OOPS_OFFSET)
}

pub fn om_cache_monitors_offset<R: Runtime>() -> Option<usize> {
    thread_relative::<R>(TLSData::OM_CACHE_OFFSET + OMCache::MONITORS_OFFSET)
}

/// Exclusive access to the current thread's lock-stack and monitor cache.
///
/// Can only be created for the calling thread and cannot leave it, which makes the
/// owner the single writer. At most one guard per thread is alive at any time.
pub struct SyncStateGuard<'a> {
    tls: &'a TLSData,
    marker: PhantomData<*const ()>,
}

impl SyncStateGuard<'static> {
    #[track_caller]
    pub fn current<R: Runtime>() -> Self {
        let thread = R::current_thread();
        if thread == VMThread::UNINITIALIZED {
            panic!("no runtime thread is attached to the calling thread");
        }

        let tls = ThreadOf::<R>::tls(thread);
        if tls.owner_views.get() != 0 {
            log::error!(
                target: "vmkit::threads",
                "sync state guard acquired while the owner inspects its own lock-stack"
            );
            panic!("sync state guard requested while inspecting its own lock-stack");
        }
        if tls.guard_held.replace(true) {
            log::error!(target: "vmkit::threads", "sync state guard acquired twice");
            panic!("sync state guard is already held by this thread");
        }

        Self {
            tls,
            marker: PhantomData,
        }
    }
}

impl<'a> SyncStateGuard<'a> {
    pub fn lock_stack(&mut self) -> &mut LockStack {
        unsafe { &mut *self.tls.lock_stack.get() }
    }

    pub fn om_cache(&mut self) -> &mut OMCache {
        unsafe { &mut *self.tls.om_cache.get() }
    }

    /// Both structures at once, for lock paths that consult the cache while updating the stack.
    pub fn split(&mut self) -> (&mut LockStack, &mut OMCache) {
        unsafe { (&mut *self.tls.lock_stack.get(), &mut *self.tls.om_cache.get()) }
    }

    pub fn tls(&self) -> &'a TLSData {
        self.tls
    }
}

impl Drop for SyncStateGuard<'_> {
    fn drop(&mut self) {
        self.tls.guard_held.set(false);
    }
}

/// View of a quiescent thread's lock bookkeeping, used by root scanning and diagnostics.
///
/// Stays on the thread that created it.
pub struct QuiescedSyncState<'a> {
    tls: &'a TLSData,
    owner_view: bool,
    marker: PhantomData<(&'a mut LockStack, *const ())>,
}

impl QuiescedSyncState<'_> {
    pub fn lock_stack(&self) -> &LockStack {
        unsafe { &*self.tls.lock_stack.get() }
    }

    /// See [`LockStack::oops_do`].
    pub fn oops_do(&mut self, visit: impl FnMut(&mut ObjectReference)) {
        unsafe { (*self.tls.lock_stack.get()).oops_do(visit) }
    }

    pub fn scan_slots<SV: SlotVisitor<SimpleSlot>>(&mut self, visitor: &mut SV) {
        unsafe { (*self.tls.lock_stack.get()).scan_slots(visitor) }
    }

    /// Hands every lock-stack entry to the collector as a root.
    pub fn scan_roots(&mut self, mut factory: impl RootsWorkFactory<SimpleSlot>) {
        let mut collector = SlotCollector(Vec::with_capacity(LockStack::CAPACITY));
        self.scan_slots(&mut collector);

        if !collector.0.is_empty() {
            factory.create_process_roots_work(collector.0);
        }
    }

    /// Drops all cached monitor associations, e.g. after objects moved or monitors were deflated.
    pub fn clear_om_cache(&mut self) {
        unsafe { (*self.tls.om_cache.get()).clear() }
    }
}

impl Drop for QuiescedSyncState<'_> {
    fn drop(&mut self) {
        if self.owner_view {
            self.tls.owner_views.set(self.tls.owner_views.get() - 1);
        }
    }
}

struct SlotCollector(Vec<SimpleSlot>);

impl SlotVisitor<SimpleSlot> for SlotCollector {
    fn visit_slot(&mut self, slot: SimpleSlot) {
        self.0.push(slot);
    }
}

thread_local! {
    static THREAD: Cell<VMThread> = const { Cell::new(VMThread::UNINITIALIZED) };
}

pub fn vmkit_current_thread() -> VMThread {
    THREAD.with(|thread| thread.get())
}

/// Registers `thread` as the runtime thread of the calling OS thread.
pub fn set_current_thread(thread: VMThread) {
    THREAD.with(|current| current.set(thread));
}
