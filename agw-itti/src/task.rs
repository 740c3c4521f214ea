//! Task runtime
//!
//! Every top-level task runs on its own OS thread, named `itti-<task>`,
//! which drives a private current-thread tokio runtime. That runtime is the
//! task's event loop: waiting on the mailbox is an `.await`, and a task can
//! combine it with sockets or `tokio::time` through `tokio::select!`.
//! Sub-tasks share the thread of their parent; the parent's [`TaskContext`]
//! services their mailboxes round-robin together with its own.
//!
//! # Task Lifecycle
//!
//! Lifecycle state is tracked per thread:
//! 1. **NotConfigured**: declared but not created
//! 2. **Starting**: thread spawned, mailbox not yet wired
//! 3. **Ready**: the task called [`TaskContext::mark_ready`]
//! 4. **Ended**: the thread returned (or unwound)
//!
//! No other transition is legal.

use std::collections::HashMap;
use std::fmt;
use std::future::{poll_fn, Future};
use std::marker::PhantomData;
use std::rc::Rc;
use std::task::Poll;
use std::thread;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::bus::Bus;
use crate::mailbox::{MailboxReceiver, MailboxSender};
use crate::message::{Envelope, MessageKind};
use crate::registry::{bind_current_thread, unbind_current_thread, TaskId, ThreadId};
use crate::router::Delivery;

// ============================================================================
// Task Lifecycle State
// ============================================================================

/// Lifecycle state of a task thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskState {
    /// Declared in the registry, not created yet
    #[default]
    NotConfigured,
    /// Thread spawned, waiting for the task to mark itself ready
    Starting,
    /// Eligible to receive messages
    Ready,
    /// Thread has exited
    Ended,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::NotConfigured => write!(f, "NotConfigured"),
            TaskState::Starting => write!(f, "Starting"),
            TaskState::Ready => write!(f, "Ready"),
            TaskState::Ended => write!(f, "Ended"),
        }
    }
}

/// State of every task thread, published through watch channels so that
/// waiters never poll.
#[derive(Debug)]
pub(crate) struct TaskStates {
    threads: Vec<watch::Sender<TaskState>>,
}

impl TaskStates {
    pub(crate) fn new(thread_count: usize) -> Self {
        Self {
            threads: (0..thread_count)
                .map(|_| watch::channel(TaskState::NotConfigured).0)
                .collect(),
        }
    }

    fn slot(&self, thread_id: ThreadId) -> &watch::Sender<TaskState> {
        match self.threads.get(thread_id.index()) {
            Some(slot) => slot,
            None => panic!("{thread_id} is out of range ({})", self.threads.len()),
        }
    }

    pub(crate) fn get(&self, thread_id: ThreadId) -> TaskState {
        *self.slot(thread_id).borrow()
    }

    /// Unconditionally stores `state`, returning the previous one.
    pub(crate) fn set(&self, thread_id: ThreadId, state: TaskState) -> TaskState {
        self.slot(thread_id).send_replace(state)
    }

    /// Moves from `from` to `to`; false if the current state is not `from`.
    pub(crate) fn transition(&self, thread_id: ThreadId, from: TaskState, to: TaskState) -> bool {
        self.slot(thread_id).send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn subscribe(&self, thread_id: ThreadId) -> watch::Receiver<TaskState> {
        self.slot(thread_id).subscribe()
    }
}

// ============================================================================
// Task Trait
// ============================================================================

/// Entry point of a task.
///
/// `run` executes on the task's own thread. It must wire its mailbox with
/// [`TaskContext::init`], call [`TaskContext::mark_ready`], loop until it
/// observes TERMINATE and finally call [`TaskContext::destroy`].
///
/// # Example
///
/// ```no_run
/// use agw_itti::{LoopControl, Task, TaskContext};
///
/// struct Echo;
///
/// #[async_trait::async_trait(?Send)]
/// impl Task for Echo {
///     async fn run(&mut self, mut ctx: TaskContext) {
///         ctx.init(&[], true);
///         ctx.mark_ready();
///         ctx.run_event_loop(|ctx, envelope| {
///             tracing::info!(task = ctx.name(), kind = %envelope.kind(), "received");
///             LoopControl::Continue
///         })
///         .await;
///         ctx.destroy();
///     }
/// }
/// ```
#[async_trait(?Send)]
pub trait Task: Send + 'static {
    /// Runs the task until it exits.
    async fn run(&mut self, ctx: TaskContext);
}

/// Task built from an async closure, see [`task_fn`].
pub struct FnTask<F>(Option<F>);

/// Wraps an async closure as a [`Task`].
pub fn task_fn<F, Fut>(f: F) -> FnTask<F>
where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + 'static,
{
    FnTask(Some(f))
}

#[async_trait(?Send)]
impl<F, Fut> Task for FnTask<F>
where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + 'static,
{
    async fn run(&mut self, ctx: TaskContext) {
        if let Some(f) = self.0.take() {
            f(ctx).await;
        }
    }
}

// ============================================================================
// Task Context
// ============================================================================

/// What [`TaskContext::run_event_loop`] does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    /// Keep receiving
    Continue,
    /// Leave the loop
    Exit,
}

/// Per-thread view of the bus handed to [`Task::run`].
///
/// The context owns the inbound endpoints of every task serviced by the
/// thread and the outbound endpoints opened for the task's peers. It is
/// bound to its thread and is neither `Send` nor `Sync`.
pub struct TaskContext {
    bus: Bus,
    task_id: TaskId,
    thread_id: ThreadId,
    peers: HashMap<TaskId, MailboxSender>,
    inboxes: Vec<MailboxReceiver>,
    next_inbox: usize,
    destroyed: bool,
    _thread_bound: PhantomData<Rc<()>>,
}

impl TaskContext {
    fn new(bus: Bus, task_id: TaskId) -> Self {
        let thread_id = bus.registry().thread_of(task_id);
        Self {
            bus,
            task_id,
            thread_id,
            peers: HashMap::new(),
            inboxes: Vec::new(),
            next_inbox: 0,
            destroyed: false,
            _thread_bound: PhantomData,
        }
    }

    /// Task owning this context.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Name of the task owning this context.
    pub fn name(&self) -> &str {
        self.bus.registry().name_of(self.task_id)
    }

    /// The bus the task runs on.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Opens one outbound endpoint per peer and, if `inbound` is set, takes
    /// the inbound endpoints of the task and of its sub-tasks.
    ///
    /// # Panics
    ///
    /// Panics if a peer id is out of range.
    pub fn init(&mut self, peers: &[TaskId], inbound: bool) {
        let registry = self.bus.registry();
        for peer in peers {
            registry.info(*peer);
            self.peers
                .insert(*peer, self.bus.router().mailboxes().sender(*peer).clone());
        }

        if inbound {
            for task_id in registry.tasks_on_thread(self.thread_id) {
                match self.bus.router().mailboxes().take_receiver(task_id) {
                    Some(receiver) => self.inboxes.push(receiver),
                    None => tracing::debug!(
                        task = registry.name_of(task_id),
                        "inbound endpoint already open"
                    ),
                }
            }
        }

        tracing::debug!(
            task = self.name(),
            peers = self.peers.len(),
            inboxes = self.inboxes.len(),
            "task context initialised"
        );
    }

    /// Moves the thread from Starting to Ready.
    ///
    /// # Panics
    ///
    /// Panics if the thread is not Starting.
    pub fn mark_ready(&self) {
        let states = self.bus.states();
        if !states.transition(self.thread_id, TaskState::Starting, TaskState::Ready) {
            let state = states.get(self.thread_id);
            tracing::error!(task = self.name(), %state, "illegal transition to Ready");
            panic!("task {} cannot become ready from state {state}", self.name());
        }
        tracing::info!(task = self.name(), "task ready");
    }

    /// Waits for the next envelope addressed to any task of this thread.
    ///
    /// Returns `None` if the context has no inbound endpoint.
    pub async fn receive(&mut self) -> Option<Envelope> {
        poll_fn(|cx| {
            let count = self.inboxes.len();
            let mut closed = 0;
            for offset in 0..count {
                let index = (self.next_inbox + offset) % count;
                match self.inboxes[index].poll_recv(cx) {
                    Poll::Ready(Some(envelope)) => {
                        self.next_inbox = (index + 1) % count;
                        return Poll::Ready(Some(envelope));
                    }
                    Poll::Ready(None) => closed += 1,
                    Poll::Pending => {}
                }
            }
            if closed == count {
                Poll::Ready(None)
            } else {
                Poll::Pending
            }
        })
        .await
    }

    /// Returns the next envelope if one is queued.
    pub fn try_receive(&mut self) -> Option<Envelope> {
        let count = self.inboxes.len();
        for offset in 0..count {
            let index = (self.next_inbox + offset) % count;
            if let Some(envelope) = self.inboxes[index].try_recv() {
                self.next_inbox = (index + 1) % count;
                return Some(envelope);
            }
        }
        None
    }

    /// Allocates an envelope originating from this task.
    pub fn allocate(&self, kind: MessageKind) -> Envelope {
        self.bus.allocate(self.task_id, kind)
    }

    /// Sends an envelope, through the peer endpoint if one was opened.
    pub fn send_to(&self, destination: TaskId, envelope: Envelope) -> Delivery {
        match self.peers.get(&destination) {
            Some(endpoint) => self.bus.router().send_via(destination, envelope, endpoint),
            None => self.bus.send_to(destination, envelope),
        }
    }

    /// Receives and dispatches envelopes to `handler` until it returns
    /// [`LoopControl::Exit`], a TERMINATE has been handled, or the inbound
    /// endpoints are gone.
    pub async fn run_event_loop<F>(&mut self, mut handler: F)
    where
        F: FnMut(&mut TaskContext, Envelope) -> LoopControl,
    {
        while let Some(envelope) = self.receive().await {
            let terminate = envelope.is_terminate();
            if handler(self, envelope) == LoopControl::Exit || terminate {
                break;
            }
        }
        tracing::debug!(task = self.name(), "event loop finished");
    }

    /// Releases every endpoint of the context.
    pub fn destroy(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.destroyed = true;
        self.peers.clear();
        let registry = self.bus.registry();
        for mut inbox in self.inboxes.drain(..) {
            let pending = std::iter::from_fn(|| inbox.try_recv()).count();
            if pending > 0 {
                tracing::debug!(
                    task = registry.name_of(inbox.task_id()),
                    pending,
                    "discarding queued messages"
                );
            }
        }
        tracing::debug!(task = self.name(), "task context destroyed");
    }
}

impl Drop for TaskContext {
    fn drop(&mut self) {
        if !self.destroyed {
            tracing::warn!(task = self.name(), "task context dropped without destroy");
            self.release();
        }
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task", &self.task_id)
            .field("thread", &self.thread_id)
            .field("peers", &self.peers.len())
            .field("inboxes", &self.inboxes.len())
            .finish()
    }
}

// ============================================================================
// Task Threads
// ============================================================================

/// Marks the thread Ended when the task returns or unwinds.
struct ThreadGuard {
    bus: Bus,
    thread_id: ThreadId,
    task: String,
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        let previous = self.bus.states().set(self.thread_id, TaskState::Ended);
        unbind_current_thread();
        if thread::panicking() {
            tracing::error!(task = %self.task, %previous, "task thread panicked");
        } else {
            tracing::info!(task = %self.task, %previous, "task ended");
        }
    }
}

/// Spawns the OS thread of a top-level task.
pub(crate) fn spawn_task_thread<T: Task>(
    bus: &Bus,
    task_id: TaskId,
    mut task: T,
) -> std::io::Result<thread::JoinHandle<()>> {
    let info = bus.registry().info(task_id);
    let thread_id = info.thread_id;
    let name = info.name.clone();
    let bus = bus.clone();

    thread::Builder::new()
        .name(format!("itti-{name}"))
        .spawn(move || {
            let guard = ThreadGuard {
                bus: bus.clone(),
                thread_id,
                task: name,
            };
            bind_current_thread(bus.instance(), task_id);

            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!(task = %guard.task, "failed to build task runtime: {e}");
                    return;
                }
            };

            let ctx = TaskContext::new(bus, task_id);
            runtime.block_on(task.run(ctx));
            drop(task);
            drop(runtime);
            drop(guard);
        })
}
