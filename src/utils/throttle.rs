//! Schedule-once-within-window throttle
//!
//! Batches bursts of invocations: the first `fire()` inside an idle window
//! schedules the callback after the window elapses; further `fire()` calls
//! inside the same window coalesce into that single invocation. Used for
//! adjacency advertisement, prefix publication and flood-buffer draining.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A throttled callback: at least one invocation per burst, at most one
/// per window
pub struct Throttle {
    window: Duration,
    pending: Arc<Mutex<bool>>,
    wakeup_tx: mpsc::UnboundedSender<()>,
}

impl Throttle {
    /// Create a throttle that invokes `callback` at most once per `window`
    ///
    /// The callback runs on a dedicated task; `fire()` never blocks.
    pub fn new<F, Fut>(window: Duration, mut callback: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let pending = Arc::new(Mutex::new(false));
        let (wakeup_tx, mut wakeup_rx) = mpsc::unbounded_channel::<()>();

        let pending_task = Arc::clone(&pending);
        tokio::spawn(async move {
            while wakeup_rx.recv().await.is_some() {
                tokio::time::sleep(window).await;
                // requests during the sleep were suppressed by the flag;
                // one wakeup drives exactly one invocation
                *pending_task.lock() = false;
                callback().await;
            }
        });

        Self {
            window,
            pending,
            wakeup_tx,
        }
    }

    /// Request an invocation; coalesces with any already-pending request
    pub fn fire(&self) {
        let mut pending = self.pending.lock();
        if *pending {
            return;
        }
        *pending = true;
        // receiver only goes away at shutdown; nothing to do then
        let _ = self.wakeup_tx.send(());
    }

    /// The batching window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Is an invocation currently scheduled?
    pub fn is_pending(&self) -> bool {
        *self.pending.lock()
    }
}
