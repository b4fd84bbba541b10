use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A cancellable one-shot timer.
///
/// Runs `task` on the tokio runtime after `delay`. Dropping the handle
/// before the delay elapses prevents the task from running. Because it is driven by `tokio::time`, tests can control it with
/// a paused clock.
#[derive(Debug)]
pub struct Timer {
    handle: JoinHandle<()>,
}

impl Timer {
    pub fn schedule<F>(delay: Duration, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        Self { handle }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
