//! Background dispatch loop.

use super::core::ManagerInner;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub(crate) fn spawn(inner: &Arc<ManagerInner>) -> JoinHandle<()> {
    let poll = Duration::from_millis(inner.config.scheduler_poll_interval_ms.max(1));
    inner
        .runtime
        .spawn(run(Arc::downgrade(inner), inner.cancel.clone(), poll))
}

/// Drain the queue into concurrent dispatch tasks, then sleep until woken or `poll` elapses.
///
/// Holds only a weak reference between rounds, so dropping every manager handle ends the loop.
async fn run(inner: Weak<ManagerInner>, cancel: CancellationToken, poll: Duration) {
    info!(poll_ms = poll.as_millis() as u64, "batch scheduler started");
    loop {
        let Some(manager) = inner.upgrade() else {
            debug!("batch manager dropped, scheduler exiting");
            break;
        };
        if cancel.is_cancelled() {
            break;
        }

        let mut dispatched = 0usize;
        while let Some(entry) = manager.queue.dequeue() {
            let task = manager.clone();
            manager.runtime.spawn(task.dispatch(entry));
            dispatched += 1;
        }
        if dispatched > 0 {
            debug!(dispatched, "scheduler dispatched batches");
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = manager.wake.notified() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
    info!("batch scheduler stopped");
}
