use mmtk::util::VMThread;

pub mod threads;

/// Binding between an embedding runtime and the per-thread lock bookkeeping.
pub trait Runtime: 'static + Default + Send + Sync {
    type Thread: threads::Thread<Self>;

    /// An accessor for the current thread. The default reads the thread registered
    /// through [`threads::set_current_thread`].
    fn current_thread() -> VMThread {
        threads::vmkit_current_thread()
    }
}
