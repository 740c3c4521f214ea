//! Bus facade
//!
//! A [`Bus`] is one independent instance of the message bus: task registry,
//! message catalog, pool, mailboxes, router, timers and shutdown signal,
//! all built from a single [`BusConfig`]. It is a cheap `Clone` handle;
//! task threads hold clones of it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use agw_common::config::BusConfig;
use bytes::Bytes;

use crate::error::{BusError, TimerError};
use crate::mailbox::{MailboxStats, MailboxTable};
use crate::message::{Envelope, EnvelopeAllocator, MessageCatalog, MessageKind};
use crate::pool::{MessagePool, PoolStatistics};
use crate::registry::{TaskId, TaskRegistry, ThreadId};
use crate::router::{Delivery, Router, RouterStats};
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};
use crate::task::{spawn_task_thread, Task, TaskState, TaskStates};
use crate::timer::{TimerId, TimerKind, TimerService};
use crate::trace::TraceEntry;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

struct BusInner {
    instance: u64,
    config: BusConfig,
    registry: Arc<TaskRegistry>,
    states: Arc<TaskStates>,
    router: Arc<Router>,
    timers: TimerService,
    threads: Mutex<HashMap<ThreadId, JoinHandle<()>>>,
    shutdown: ShutdownSignal,
    coordinator_busy: AtomicBool,
}

/// Handle to a message bus instance.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Builds a bus from a configuration.
    pub fn new(config: BusConfig) -> Result<Self, BusError> {
        config.validate()?;

        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::new(TaskRegistry::from_config(&config.tasks)?);
        let catalog = Arc::new(MessageCatalog::from_config(&config.messages)?);
        let pool = Arc::new(MessagePool::new(&config.pools));
        let allocator = Arc::new(EnvelopeAllocator::new(instance, catalog, pool));
        let states = Arc::new(TaskStates::new(registry.thread_count()));
        let mailboxes = Arc::new(MailboxTable::new(&registry, config.overflow_policy));
        let router = Arc::new(Router::new(
            instance,
            Arc::clone(&registry),
            allocator,
            Arc::clone(&states),
            mailboxes,
            config.trace_depth,
        ));
        let timers = TimerService::new(Arc::clone(&router))?;

        tracing::info!(
            instance,
            tasks = registry.len(),
            threads = registry.thread_count(),
            messages = router.allocator().catalog().len(),
            "message bus created"
        );
        tracing::debug!("Message pool layout:\n{}", router.allocator().pool().statistics());

        Ok(Self {
            inner: Arc::new(BusInner {
                instance,
                config,
                registry,
                states,
                router,
                timers,
                threads: Mutex::new(HashMap::new()),
                shutdown: ShutdownSignal::new(),
                coordinator_busy: AtomicBool::new(false),
            }),
        })
    }

    // ========================================================================
    // Envelopes
    // ========================================================================

    /// Allocates an envelope of `kind` sized from the message catalog.
    ///
    /// # Panics
    ///
    /// Panics if `kind` is out of range or the pool is exhausted.
    pub fn allocate(&self, origin: TaskId, kind: MessageKind) -> Envelope {
        self.inner.router.allocator().allocate(origin, kind)
    }

    /// Allocates an envelope with an explicit payload size.
    pub fn allocate_sized(&self, origin: TaskId, kind: MessageKind, size: usize) -> Envelope {
        self.inner.router.allocator().allocate_sized(origin, kind, size)
    }

    /// Releases an envelope.
    pub fn free(&self, envelope: Envelope) {
        self.inner.router.allocator().free(envelope);
    }

    /// Message catalog.
    pub fn catalog(&self) -> &MessageCatalog {
        self.inner.router.allocator().catalog()
    }

    /// Looks a message kind up by name.
    pub fn message_kind(&self, name: &str) -> Option<MessageKind> {
        self.catalog().lookup(name)
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Sends an envelope to a task. Never blocks.
    ///
    /// # Panics
    ///
    /// Panics if `destination` is out of range.
    pub fn send_to(&self, destination: TaskId, envelope: Envelope) -> Delivery {
        self.inner.router.send_to(destination, envelope)
    }

    /// Sends a copy to the owning task of every other Ready thread and
    /// returns the number of copies queued.
    pub fn broadcast(&self, envelope: Envelope) -> usize {
        self.inner.router.broadcast(envelope)
    }

    /// Broadcasts TERMINATE from `origin`.
    pub fn send_terminate(&self, origin: TaskId) -> usize {
        let envelope = self.allocate(origin, MessageKind::TERMINATE);
        self.broadcast(envelope)
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Arms a timer whose expiry is routed to `owner`.
    pub fn timer_setup(
        &self,
        interval_sec: u64,
        interval_usec: u64,
        owner: TaskId,
        kind: TimerKind,
        arg: Bytes,
    ) -> Result<TimerId, TimerError> {
        self.inner
            .timers
            .setup(interval_sec, interval_usec, owner, kind, arg)
    }

    /// Cancels a timer and returns its argument.
    pub fn timer_remove(&self, timer_id: TimerId) -> Result<Bytes, TimerError> {
        self.inner.timers.remove(timer_id)
    }

    /// Acknowledges a timer expiry.
    pub fn timer_handle_expired(&self, timer_id: TimerId) -> bool {
        self.inner.timers.handle_expired(timer_id)
    }

    /// Timer service.
    pub fn timers(&self) -> &TimerService {
        &self.inner.timers
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawns the thread of a top-level task and waits until the task is
    /// Ready.
    ///
    /// # Panics
    ///
    /// Panics if `task_id` is out of range, names a sub-task, or was
    /// already created.
    pub async fn create_task<T: Task>(&self, task_id: TaskId, task: T) -> Result<(), BusError> {
        let info = self.inner.registry.info(task_id);
        if !info.is_top_level() {
            tracing::error!(task = %info.name, "sub-tasks run on their parent's thread");
            panic!("task {} is a sub-task and cannot be created", info.name);
        }

        let thread_id = info.thread_id;
        let states = &self.inner.states;
        if !states.transition(thread_id, TaskState::NotConfigured, TaskState::Starting) {
            let state = states.get(thread_id);
            tracing::error!(task = %info.name, %state, "task created twice");
            panic!("task {} cannot be created from state {state}", info.name);
        }
        let mut state_rx = states.subscribe(thread_id);

        let handle = match spawn_task_thread(self, task_id, task) {
            Ok(handle) => handle,
            Err(e) => {
                states.set(thread_id, TaskState::Ended);
                return Err(e.into());
            }
        };
        self.threads().insert(thread_id, handle);
        tracing::debug!(task = %info.name, "task thread spawned");

        let timeout_ms = self.inner.config.ready_timeout_ms;
        let outcome = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            state_rx.wait_for(|state| *state != TaskState::Starting),
        )
        .await;

        match outcome {
            Ok(Ok(state)) if *state == TaskState::Ready => Ok(()),
            Ok(_) => Err(BusError::ExitedBeforeReady {
                task: info.name.clone(),
            }),
            Err(_) => Err(BusError::ReadyTimeout {
                task: info.name.clone(),
                timeout_ms,
            }),
        }
    }

    /// Lifecycle state of a task (that of its thread for sub-tasks).
    pub fn task_state(&self, task_id: TaskId) -> TaskState {
        self.inner
            .states
            .get(self.inner.registry.thread_of(task_id))
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Token requesting shutdown of this bus.
    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.inner.shutdown
    }

    /// Coordinator joining the task threads after shutdown is requested.
    pub fn coordinator(&self) -> ShutdownCoordinator {
        ShutdownCoordinator::new(self.clone())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Task registry.
    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    /// Configuration the bus was built from.
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Recently routed envelopes, oldest first.
    pub fn trace_snapshot(&self) -> Vec<TraceEntry> {
        self.inner.router.trace_snapshot()
    }

    /// Router counters.
    pub fn router_stats(&self) -> RouterStats {
        self.inner.router.stats()
    }

    /// Per-task mailbox usage.
    pub fn mailbox_stats(&self) -> Vec<MailboxStats> {
        self.inner
            .router
            .mailboxes()
            .stats(&self.inner.registry)
    }

    /// Per-class pool usage.
    pub fn pool_statistics(&self) -> PoolStatistics {
        self.pool().statistics()
    }

    /// Message pool.
    pub fn pool(&self) -> &MessagePool {
        self.inner.router.allocator().pool()
    }

    pub(crate) fn instance(&self) -> u64 {
        self.inner.instance
    }

    pub(crate) fn states(&self) -> &TaskStates {
        &self.inner.states
    }

    pub(crate) fn router(&self) -> &Router {
        &self.inner.router
    }

    pub(crate) fn coordinator_busy(&self) -> &AtomicBool {
        &self.inner.coordinator_busy
    }

    fn threads(&self) -> std::sync::MutexGuard<'_, HashMap<ThreadId, JoinHandle<()>>> {
        self.inner
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Join handles of the spawned task threads, in thread order.
    pub(crate) fn take_thread_handles(&self) -> Vec<(ThreadId, JoinHandle<()>)> {
        let mut handles: Vec<_> = self.threads().drain().collect();
        handles.sort_by_key(|(thread_id, _)| *thread_id);
        handles
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("instance", &self.inner.instance)
            .field("tasks", &self.inner.registry.len())
            .field("timers", &self.inner.timers)
            .finish()
    }
}
