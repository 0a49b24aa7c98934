//! One-shot shutdown broadcast.
//!
//! Clone a handle wherever a task needs to observe shutdown; sending is
//! idempotent and a signal sent before a receiver subscribes is still
//! observed.  Implemented on top of a zero-permit [`Semaphore`]: closing
//! the semaphore is the signal, and a failed `acquire` is its reception.

use std::sync::Arc;

use tokio::sync::Semaphore;

#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    inner: Arc<Semaphore>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self { inner: Arc::new(Semaphore::new(0)) }
    }

    /// Signal shutdown.  Safe to call any number of times.
    pub fn send(&self) {
        self.inner.close();
    }

    /// Wait until shutdown is signalled.  Returns immediately if it
    /// already was.
    pub async fn recv(&self) {
        // Acquiring from a zero-permit semaphore only ever errors, and it
        // errors exactly when the semaphore has been closed.
        let result = self.inner.acquire().await;
        debug_assert!(result.is_err());
    }

    /// Non-blocking probe.
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_closed()
    }
}
