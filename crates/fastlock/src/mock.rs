//! Simple MockVM used in tests

use std::mem::offset_of;

use mmtk::util::{Address, ObjectReference, OpaquePointer, VMThread};

use crate::{
    runtime::threads::{set_current_thread, vmkit_current_thread, TLSData, Thread, ThreadState},
    Runtime,
};

#[derive(Default)]
pub struct MockVM;

impl Runtime for MockVM {
    type Thread = MockThread;
}

pub struct MockThread {
    tls: TLSData,
}

impl Thread<MockVM> for MockThread {
    const TLS_OFFSET: Option<usize> = Some(offset_of!(Self, tls));

    fn id(thread: VMThread) -> u64 {
        thread.0.to_address().as_usize() as _
    }

    fn tls<'a>(thread: VMThread) -> &'a TLSData {
        unsafe { &thread.0.to_address().as_ref::<Self>().tls }
    }
}

impl MockThread {
    /// Creates a thread that is not attached to the caller.
    pub fn new() -> MockThreadHandle {
        let thread = VMThread(OpaquePointer::from_address(Address::from_mut_ptr(
            Box::into_raw(Box::new(Self {
                tls: TLSData::new(),
            })),
        )));
        MockThreadHandle {
            thread,
            attached: false,
        }
    }

    /// Creates a thread and registers it as the current thread of the caller.
    pub fn attach() -> MockThreadHandle {
        let mut handle = Self::new();
        set_current_thread(handle.thread);
        handle.tls().set_state(ThreadState::Running);
        handle.attached = true;
        handle
    }

    pub fn tls_of<'a>(thread: VMThread) -> &'a TLSData {
        <Self as Thread<MockVM>>::tls(thread)
    }
}

/// Owns a [`MockThread`]. Dropping it detaches the thread and frees it, also when a
/// test unwinds.
pub struct MockThreadHandle {
    thread: VMThread,
    attached: bool,
}

impl MockThreadHandle {
    pub fn thread(&self) -> VMThread {
        self.thread
    }

    pub fn tls(&self) -> &TLSData {
        MockThread::tls_of(self.thread)
    }
}

impl Drop for MockThreadHandle {
    fn drop(&mut self) {
        self.tls().set_state(ThreadState::Terminated);
        if self.attached && vmkit_current_thread() == self.thread {
            set_current_thread(VMThread::UNINITIALIZED);
        }
        unsafe {
            let _ = Box::from_raw(self.thread.0.to_address().to_mut_ptr::<MockThread>());
        }
    }
}

/// A distinct, properly aligned object reference. Never dereferenced.
pub fn mock_object(n: usize) -> ObjectReference {
    assert_ne!(n, 0, "object 0 would be the null reference");
    ObjectReference::from_raw_address(unsafe { Address::from_usize(0x10000 + n * 0x100) })
        .expect("non-null address")
}
