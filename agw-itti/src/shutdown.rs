//! Shutdown coordination
//!
//! Shutdown is requested through a [`ShutdownSignal`], a cancellation token
//! any number of parties can trigger or wait on. OS signals only trigger
//! it. The [`ShutdownCoordinator`] waits for the token, broadcasts
//! TERMINATE, gives the tasks a grace period and then waits, up to a bounded
//! deadline, for every task thread to report Ended.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};

use crate::bus::Bus;
use crate::error::BusError;
use crate::registry::{current_task, TaskId};
use crate::task::TaskState;

/// Cloneable shutdown request token.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// Creates an untriggered signal.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests shutdown. Idempotent.
    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            tracing::info!("shutdown requested");
        }
    }

    /// Returns true once shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until shutdown is requested.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Receiver for use in `tokio::select!` loops.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Triggers `signal` on SIGINT or SIGTERM.
///
/// Must be called from within a tokio runtime.
pub fn install_signal_handler(signal: ShutdownSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_os_signal().await;
        signal.trigger();
    })
}

#[cfg(unix)]
async fn wait_for_os_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("cannot listen for SIGTERM: {e}");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("cannot listen for SIGINT: {e}");
            }
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => tracing::info!("received SIGINT"),
            Err(e) => tracing::error!("cannot listen for SIGINT: {e}"),
        },
        _ = terminate.recv() => tracing::info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_os_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received Ctrl+C"),
        Err(e) => tracing::error!("cannot listen for Ctrl+C: {e}"),
    }
}

/// Outcome of [`ShutdownCoordinator::wait_tasks_end`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks whose thread ended and was joined
    pub ended: Vec<String>,
    /// Tasks still running when the deadline passed
    pub forced: Vec<String>,
}

impl ShutdownReport {
    /// Returns true if no task had to be abandoned.
    pub fn is_clean(&self) -> bool {
        self.forced.is_empty()
    }
}

impl fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task(s) ended", self.ended.len())?;
        if !self.forced.is_empty() {
            write!(f, ", forced exit of {}", self.forced.join(", "))?;
        }
        Ok(())
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Terminates the tasks of a bus once shutdown is requested.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    bus: Bus,
}

impl ShutdownCoordinator {
    pub(crate) fn new(bus: Bus) -> Self {
        Self { bus }
    }

    /// Waits for the shutdown signal, then terminates and joins the tasks.
    ///
    /// Only one caller may wait at a time; a concurrent call returns
    /// [`BusError::CoordinatorBusy`].
    pub async fn wait_tasks_end(&self) -> Result<ShutdownReport, BusError> {
        let busy = self.bus.coordinator_busy();
        if busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BusError::CoordinatorBusy);
        }
        let _busy = BusyGuard(busy);

        self.bus.shutdown_signal().wait().await;
        Ok(self.terminate_tasks().await)
    }

    async fn terminate_tasks(&self) -> ShutdownReport {
        let config = self.bus.config().shutdown;
        let registry = self.bus.registry();

        let notified = self.bus.send_terminate(TaskId::UNKNOWN);
        let deadline = Instant::now() + Duration::from_millis(config.budget_ms());
        tracing::info!(notified, "TERMINATE broadcast, waiting for tasks to end");
        sleep(Duration::from_millis(config.grace_ms)).await;

        // The caller's own thread, if it is a task thread, cannot be joined
        // from here.
        let caller = current_task(self.bus.instance());
        let own_thread = (!caller.is_unknown()).then(|| registry.thread_of(caller));

        let mut report = ShutdownReport::default();
        for (thread_id, handle) in self.bus.take_thread_handles() {
            if Some(thread_id) == own_thread {
                continue;
            }
            let owner = registry.owner_of(thread_id);
            let name = registry.name_of(owner).to_string();

            let mut state = self.bus.states().subscribe(thread_id);
            let ended = timeout_at(deadline, state.wait_for(|s| *s == TaskState::Ended))
                .await
                .map(|result| result.is_ok())
                .unwrap_or(false);

            if ended {
                match tokio::task::spawn_blocking(move || handle.join()).await {
                    Ok(Ok(())) => tracing::debug!(task = %name, "task thread joined"),
                    Ok(Err(_)) => tracing::warn!(task = %name, "task thread panicked"),
                    Err(e) => tracing::warn!(task = %name, "cannot join task thread: {e}"),
                }
                report.ended.push(name);
            } else {
                let state = self.bus.states().get(thread_id);
                tracing::warn!(task = %name, %state, "task still running, forcing exit");
                drop(handle);
                report.forced.push(name);
            }
        }

        tracing::info!("{report}");
        tracing::info!("Message pool statistics:\n{}", self.bus.pool_statistics());
        report
    }
}
