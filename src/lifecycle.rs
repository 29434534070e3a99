//! Graceful shutdown: stop accepting, signal every open session to quit,
//! then wait for the accept loop's executor task to actually finish.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::info;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::acceptor::SessionRegistry;

/// Returned by `Server::spawn`. Dropping it leaves the server running;
/// call `shutdown` explicitly to drain it.
pub struct ServerHandle {
    pub(crate) local_addr: std::net::SocketAddr,
    pub(crate) registry: SessionRegistry,
    pub(crate) shutting_down: Arc<std::sync::atomic::AtomicBool>,
    pub(crate) shutdown_notify: Arc<Notify>,
    pub(crate) task_tracker: TaskTracker,
    pub(crate) accept_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Drains the server: no new connections are accepted, every open
    /// session is asked to quit at its next command boundary, and this
    /// call does not return until the accept loop's task has actually
    /// terminated. There is no bounded timeout here — a caller that wants
    /// one wraps this in `tokio::time::timeout` itself.
    pub async fn shutdown(self) {
        info!("server shutdown requested");

        // 1. Stop accepting new connections. The flag covers the case
        // where the loop is between iterations; the notification covers
        // the case where it's blocked in `accept()` or waiting on a
        // semaphore permit.
        self.shutting_down.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_waiters();

        // 2. Signal every registered session to quit. The registry only
        // holds cheap `SessionHandle`s, so this never blocks on a
        // session's own I/O.
        let handles: Vec<_> = {
            let guard = self.registry.lock().unwrap();
            guard.values().cloned().collect()
        };
        for handle in &handles {
            handle.quit();
        }

        // 3. Await the accept loop's termination, then the executor
        // draining every session task it spawned. The accept loop closes
        // the tracker on every exit path before returning, so `wait()`
        // below only blocks on sessions already in flight — it does not
        // race a session spawned after the tracker closed.
        if let Err(e) = self.accept_task.await {
            if e.is_panic() {
                log::error!("accept loop task panicked during shutdown: {}", e);
            }
        }
        self.task_tracker.wait().await;

        info!("server shutdown complete");
    }
}
