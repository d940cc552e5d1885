//! Cooperative shutdown for background loops.
//!
//! Loops check a [`ShutdownSignal`] between cycles and sleep through it, so a
//! shutdown request cuts an idle wait short but never interrupts a cycle.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Error returned when a background task does not stop cleanly.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("{task} task panicked")]
    Panicked { task: &'static str },
    #[error("{task} task was cancelled")]
    Cancelled { task: &'static str },
    #[error("{task} task did not stop within {timeout:?}")]
    Timeout { task: &'static str, timeout: Duration },
}

/// Receiving side of a shutdown request.
///
/// Dropping every sender counts as a shutdown request.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A connected trigger/signal pair.
    pub fn channel() -> (watch::Sender<bool>, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, ShutdownSignal { rx })
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once shutdown is requested.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration` unless shutdown is requested first.
    ///
    /// Returns true if shutdown was requested.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_shutdown(),
            _ = self.wait() => true,
        }
    }
}

impl From<watch::Receiver<bool>> for ShutdownSignal {
    fn from(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }
}

/// Handle to a spawned background loop.
///
/// Dropping the handle also stops the loop after its current cycle.
#[derive(Debug)]
pub struct ProcessorHandle {
    task: &'static str,
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ProcessorHandle {
    pub(crate) fn spawn<F, Fut>(task: &'static str, run: F) -> Self
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, signal) = ShutdownSignal::channel();
        let join = tokio::spawn(run(signal));
        tracing::debug!(task, "Background task started");
        Self { task, stop, join }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Ask the loop to stop without waiting for it.
    pub fn signal(&self) {
        // Err only means the loop already exited
        let _ = self.stop.send(true);
    }

    /// Stop the loop and wait for its current cycle to finish.
    pub async fn shutdown(self) -> Result<(), ShutdownError> {
        self.signal();
        let task = self.task;
        self.join.await.map_err(|e| {
            if e.is_panic() {
                ShutdownError::Panicked { task }
            } else {
                ShutdownError::Cancelled { task }
            }
        })?;
        tracing::debug!(task, "Background task stopped");
        Ok(())
    }

    /// Like [`ProcessorHandle::shutdown`], aborting the task after `timeout`.
    pub async fn shutdown_timeout(self, timeout: Duration) -> Result<(), ShutdownError> {
        self.signal();
        let task = self.task;
        let abort = self.join.abort_handle();
        match tokio::time::timeout(timeout, self.join).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_panic() => Err(ShutdownError::Panicked { task }),
            Ok(Err(_)) => Err(ShutdownError::Cancelled { task }),
            Err(_) => {
                abort.abort();
                Err(ShutdownError::Timeout { task, timeout })
            }
        }
    }
}
