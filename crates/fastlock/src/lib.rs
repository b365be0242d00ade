pub use mmtk;
pub mod mock;
pub mod options;
pub mod runtime;
pub mod sync;
pub mod utils;

pub type ThreadOf<R> = <R as Runtime>::Thread;

pub use runtime::{
    threads::{QuiescedSyncState, SyncStateGuard, TLSData},
    Runtime,
};
