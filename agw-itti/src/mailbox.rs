//! Per-task mailboxes
//!
//! A mailbox is an unbounded tokio mpsc channel plus a depth counter, so
//! enqueueing never blocks the producer while the configured
//! `queue_capacity` is still enforced. The receiving half is handed out
//! once, to the context of the thread servicing the task.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use agw_common::config::OverflowPolicy;
use tokio::sync::mpsc;

use crate::message::Envelope;
use crate::registry::{TaskId, TaskRegistry};

#[derive(Debug, Default)]
struct Counters {
    depth: AtomicUsize,
    high_water: AtomicUsize,
    dropped: AtomicU64,
}

/// Why an envelope could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushError {
    /// Queue capacity reached under [`OverflowPolicy::DropNewest`]
    Full,
    /// The receiving half is gone
    Closed,
}

/// Producer side of a mailbox.
#[derive(Debug, Clone)]
pub(crate) struct MailboxSender {
    task_id: TaskId,
    tx: mpsc::UnboundedSender<Envelope>,
    counters: Arc<Counters>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl MailboxSender {
    /// Queues an envelope without blocking.
    ///
    /// On failure the envelope is released.
    ///
    /// # Panics
    ///
    /// Panics when the mailbox is full and the policy is
    /// [`OverflowPolicy::Abort`].
    pub(crate) fn push(&self, envelope: Envelope) -> Result<(), PushError> {
        let reserved = self
            .counters
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                (self.capacity == 0 || depth < self.capacity).then_some(depth + 1)
            });

        let depth = match reserved {
            Ok(previous) => previous + 1,
            Err(depth) => {
                return match self.policy {
                    OverflowPolicy::Abort => {
                        tracing::error!(task = %self.task_id, depth, "mailbox full");
                        panic!(
                            "mailbox of task {} is full ({} envelopes)",
                            self.task_id, self.capacity
                        );
                    }
                    OverflowPolicy::DropNewest => {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        Err(PushError::Full)
                    }
                };
            }
        };

        if self.tx.send(envelope).is_err() {
            self.counters.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(PushError::Closed);
        }
        self.counters.high_water.fetch_max(depth, Ordering::Relaxed);
        Ok(())
    }
}

/// Consumer side of a mailbox.
#[derive(Debug)]
pub(crate) struct MailboxReceiver {
    task_id: TaskId,
    rx: mpsc::UnboundedReceiver<Envelope>,
    counters: Arc<Counters>,
}

impl MailboxReceiver {
    pub(crate) fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub(crate) fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Envelope>> {
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(Some(_)) = &polled {
            self.counters.depth.fetch_sub(1, Ordering::AcqRel);
        }
        polled
    }

    pub(crate) fn try_recv(&mut self) -> Option<Envelope> {
        let envelope = self.rx.try_recv().ok()?;
        self.counters.depth.fetch_sub(1, Ordering::AcqRel);
        Some(envelope)
    }
}

struct Mailbox {
    sender: MailboxSender,
    receiver: Mutex<Option<MailboxReceiver>>,
}

/// Mailboxes of every task of a bus, indexed by task id.
pub(crate) struct MailboxTable {
    mailboxes: Vec<Mailbox>,
}

impl MailboxTable {
    pub(crate) fn new(registry: &TaskRegistry, policy: OverflowPolicy) -> Self {
        let mailboxes = registry
            .tasks()
            .map(|info| {
                let (tx, rx) = mpsc::unbounded_channel();
                let counters = Arc::new(Counters::default());
                Mailbox {
                    sender: MailboxSender {
                        task_id: info.id,
                        tx,
                        counters: Arc::clone(&counters),
                        capacity: info.queue_capacity,
                        policy,
                    },
                    receiver: Mutex::new(Some(MailboxReceiver {
                        task_id: info.id,
                        rx,
                        counters,
                    })),
                }
            })
            .collect();
        Self { mailboxes }
    }

    fn mailbox(&self, task_id: TaskId) -> &Mailbox {
        match self.mailboxes.get(task_id.index()) {
            Some(mailbox) => mailbox,
            None => panic!("no mailbox for task {task_id}"),
        }
    }

    pub(crate) fn sender(&self, task_id: TaskId) -> &MailboxSender {
        &self.mailbox(task_id).sender
    }

    /// Hands out the receiving half; `None` once it has been taken.
    pub(crate) fn take_receiver(&self, task_id: TaskId) -> Option<MailboxReceiver> {
        self.mailbox(task_id)
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn stats(&self, registry: &TaskRegistry) -> Vec<MailboxStats> {
        self.mailboxes
            .iter()
            .map(|mailbox| {
                let sender = &mailbox.sender;
                MailboxStats {
                    task_id: sender.task_id,
                    name: registry.name_of(sender.task_id).to_string(),
                    capacity: sender.capacity,
                    depth: sender.counters.depth.load(Ordering::Acquire),
                    high_water: sender.counters.high_water.load(Ordering::Relaxed),
                    dropped: sender.counters.dropped.load(Ordering::Relaxed),
                }
            })
            .collect()
    }
}

/// Snapshot of one mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxStats {
    /// Owning task
    pub task_id: TaskId,
    /// Task name
    pub name: String,
    /// Configured capacity, 0 for unbounded
    pub capacity: usize,
    /// Envelopes currently queued
    pub depth: usize,
    /// Largest depth observed
    pub high_water: usize,
    /// Envelopes dropped because the mailbox was full
    pub dropped: u64,
}
