//! Fire-and-forget execution of per-machine operations.
//!
//! Each operation runs as its own task. A supervising wrapper awaits it and
//! logs its error or panic, so a failing operation can neither be silently
//! dropped nor take down the loop that dispatched it.

use std::future::Future;

use tokio_util::task::TaskTracker;
use tracing::{error, warn};

use crate::error::ManagerResult;

#[derive(Clone, Default)]
pub struct Dispatcher {
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` for `machine` in the background.
    pub fn spawn<F>(&self, operation: &'static str, machine: impl Into<String>, fut: F)
    where
        F: Future<Output = ManagerResult<()>> + Send + 'static,
    {
        let machine = machine.into();
        let inner = tokio::spawn(fut);
        self.tracker.spawn(async move {
            match inner.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(operation, %machine, error = %e, "operation failed"),
                Err(e) if e.is_panic() => error!(operation, %machine, "operation panicked"),
                Err(_) => warn!(operation, %machine, "operation cancelled"),
            }
        });
    }

    /// Operations dispatched and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every operation dispatched so far has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::error::ManagerError;

    #[tokio::test]
    async fn runs_and_waits() {
        let dispatcher = Dispatcher::new();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let done = done.clone();
            dispatcher.spawn("test", "vm", async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        dispatcher.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn failures_and_panics_are_contained() {
        let dispatcher = Dispatcher::new();
        dispatcher.spawn("fail", "vm-1", async {
            Err(ManagerError::InvalidDiskSize("x".into()))
        });
        dispatcher.spawn("panic", "vm-2", async {
            let items: Vec<u32> = Vec::new();
            assert!(!items.is_empty(), "boom");
            Ok(())
        });
        dispatcher.wait_idle().await;

        // Still usable after failures.
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        dispatcher.spawn("ok", "vm-3", async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        dispatcher.wait_idle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
