use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct Flags {
    stop: bool,
    kill: bool,
}

/// Per-run cooperative cancellation flag.
///
/// The supervisor is the only writer. Workers poll it at every step and use
/// [`StopSignal::wait`] instead of `thread::sleep` so a stop request cuts
/// retry delays short.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<Flags>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let (lock, cvar) = &*self.inner;
        lock.lock().unwrap_or_else(PoisonError::into_inner).stop = true;
        cvar.notify_all();
    }

    /// Stop and additionally tell workers not to bother with graceful cleanup.
    pub fn kill(&self) {
        let (lock, cvar) = &*self.inner;
        {
            let mut flags = lock.lock().unwrap_or_else(PoisonError::into_inner);
            flags.stop = true;
            flags.kill = true;
        }
        cvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner).stop
    }

    pub fn is_killed(&self) -> bool {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner).kill
    }

    /// Sleep for `timeout` or until stopped. Returns `true` if stopped.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |flags| !flags.stop)
            .unwrap_or_else(PoisonError::into_inner);
        guard.stop
    }
}
