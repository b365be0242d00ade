//! Per-thread bookkeeping of the fast-locking protocol.
//!
//! [`LockStack`] records the objects a thread holds through fast locks and
//! [`OMCache`] remembers the monitors of inflated locks the thread used recently.
//! Both are reached through the thread's [`TLSData`](crate::runtime::threads::TLSData).

pub mod lock_stack;
pub mod object_monitor;
pub mod om_cache;

pub use lock_stack::LockStack;
pub use object_monitor::ObjectMonitor;
pub use om_cache::OMCache;
