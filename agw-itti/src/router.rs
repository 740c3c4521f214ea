//! Message router
//!
//! Point-to-point delivery and broadcast over the task mailboxes. Delivery
//! is fire-and-forget: an envelope that cannot be queued is logged and
//! released, and the sender only gets a [`Delivery`] status back.
//!
//! Envelopes from one sender to one receiver are queued in send order; there
//! is no ordering between distinct senders.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use agw_common::logging::HexDump;

use crate::mailbox::{MailboxSender, MailboxTable, PushError};
use crate::message::{Envelope, EnvelopeAllocator};
use crate::registry::{current_task, TaskId, TaskRegistry};
use crate::task::{TaskState, TaskStates};
use crate::trace::{MessageTrace, TraceEntry};

/// Why an envelope was released instead of queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Destination is [`TaskId::UNKNOWN`]
    UnknownDestination,
    /// Destination thread is not Ready
    NotReady(TaskState),
    /// Destination mailbox has been torn down
    MailboxClosed,
    /// Destination mailbox is at capacity
    MailboxFull,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::UnknownDestination => write!(f, "unknown destination"),
            DropReason::NotReady(state) => write!(f, "destination is {state}"),
            DropReason::MailboxClosed => write!(f, "mailbox closed"),
            DropReason::MailboxFull => write!(f, "mailbox full"),
        }
    }
}

/// Outcome of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The envelope is in the destination mailbox
    Queued,
    /// The envelope was released
    Dropped(DropReason),
}

impl Delivery {
    /// Returns true if the envelope was queued.
    pub fn is_queued(&self) -> bool {
        matches!(self, Delivery::Queued)
    }
}

/// Router counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Envelopes queued
    pub queued: u64,
    /// Envelopes released without delivery
    pub dropped: u64,
    /// Broadcasts performed
    pub broadcasts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    dropped: AtomicU64,
    broadcasts: AtomicU64,
}

pub(crate) struct Router {
    instance: u64,
    registry: Arc<TaskRegistry>,
    allocator: Arc<EnvelopeAllocator>,
    states: Arc<TaskStates>,
    mailboxes: Arc<MailboxTable>,
    trace: MessageTrace,
    message_number: AtomicU64,
    counters: Counters,
}

impl Router {
    pub(crate) fn new(
        instance: u64,
        registry: Arc<TaskRegistry>,
        allocator: Arc<EnvelopeAllocator>,
        states: Arc<TaskStates>,
        mailboxes: Arc<MailboxTable>,
        trace_depth: usize,
    ) -> Self {
        Self {
            instance,
            registry,
            allocator,
            states,
            mailboxes,
            trace: MessageTrace::new(trace_depth),
            message_number: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub(crate) fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub(crate) fn allocator(&self) -> &EnvelopeAllocator {
        &self.allocator
    }

    pub(crate) fn mailboxes(&self) -> &MailboxTable {
        &self.mailboxes
    }

    /// Routes an envelope to `destination` through its mailbox.
    pub(crate) fn send_to(&self, destination: TaskId, envelope: Envelope) -> Delivery {
        self.route(destination, envelope, None)
    }

    /// Routes through an endpoint the caller opened earlier.
    pub(crate) fn send_via(
        &self,
        destination: TaskId,
        envelope: Envelope,
        endpoint: &MailboxSender,
    ) -> Delivery {
        self.route(destination, envelope, Some(endpoint))
    }

    fn route(
        &self,
        destination: TaskId,
        mut envelope: Envelope,
        endpoint: Option<&MailboxSender>,
    ) -> Delivery {
        let number = self.message_number.fetch_add(1, Ordering::Relaxed) + 1;
        envelope.stamp(destination, number);
        let header = *envelope.header();
        let catalog = self.allocator.catalog();

        let delivery = if destination.is_unknown() {
            tracing::debug!(
                kind = catalog.name_of(header.kind),
                number,
                origin = self.registry.name_of(header.origin),
                "released message sent to unknown task"
            );
            Delivery::Dropped(DropReason::UnknownDestination)
        } else {
            let thread = self.registry.thread_of(destination);
            match self.states.get(thread) {
                TaskState::Ready => {
                    let sender = endpoint.unwrap_or_else(|| self.mailboxes.sender(destination));
                    tracing::trace!(
                        kind = catalog.name_of(header.kind),
                        number,
                        priority = catalog.info(header.kind).priority,
                        origin = self.registry.name_of(header.origin),
                        destination = self.registry.name_of(destination),
                        payload = %HexDump(envelope.payload()),
                        "queueing message"
                    );
                    match sender.push(envelope) {
                        Ok(()) => Delivery::Queued,
                        Err(PushError::Full) => {
                            tracing::warn!(
                                kind = catalog.name_of(header.kind),
                                number,
                                destination = self.registry.name_of(destination),
                                "mailbox full, message dropped"
                            );
                            Delivery::Dropped(DropReason::MailboxFull)
                        }
                        Err(PushError::Closed) => {
                            tracing::debug!(
                                kind = catalog.name_of(header.kind),
                                number,
                                destination = self.registry.name_of(destination),
                                "mailbox closed, message dropped"
                            );
                            Delivery::Dropped(DropReason::MailboxClosed)
                        }
                    }
                }
                TaskState::Ended => {
                    tracing::debug!(
                        kind = catalog.name_of(header.kind),
                        number,
                        origin = self.registry.name_of(header.origin),
                        destination = self.registry.name_of(destination),
                        "destination task ended, message dropped"
                    );
                    Delivery::Dropped(DropReason::NotReady(TaskState::Ended))
                }
                state => {
                    tracing::warn!(
                        kind = catalog.name_of(header.kind),
                        number,
                        origin = self.registry.name_of(header.origin),
                        destination = self.registry.name_of(destination),
                        %state,
                        "destination task not ready, message dropped"
                    );
                    Delivery::Dropped(DropReason::NotReady(state))
                }
            }
        };

        match delivery {
            Delivery::Queued => self.counters.queued.fetch_add(1, Ordering::Relaxed),
            Delivery::Dropped(_) => self.counters.dropped.fetch_add(1, Ordering::Relaxed),
        };
        self.trace.record(&header, delivery);
        delivery
    }

    /// Sends a copy of `envelope` to the owning task of every other Ready
    /// thread and releases the original. Returns the number of copies queued.
    pub(crate) fn broadcast(&self, envelope: Envelope) -> usize {
        let origin = if envelope.origin().is_unknown() {
            current_task(self.instance)
        } else {
            envelope.origin()
        };
        let origin_thread = (!origin.is_unknown()).then(|| self.registry.thread_of(origin));

        self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            kind = self.allocator.catalog().name_of(envelope.kind()),
            origin = self.registry.name_of(origin),
            "broadcasting message"
        );

        let mut queued = 0;
        for owner in self.registry.thread_owners() {
            let thread = self.registry.thread_of(owner);
            if Some(thread) == origin_thread || self.states.get(thread) != TaskState::Ready {
                continue;
            }
            let copy = self.allocator.duplicate(&envelope);
            if self.send_to(owner, copy).is_queued() {
                queued += 1;
            }
        }
        queued
    }

    pub(crate) fn stats(&self) -> RouterStats {
        RouterStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            broadcasts: self.counters.broadcasts.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn trace_snapshot(&self) -> Vec<TraceEntry> {
        self.trace.snapshot()
    }
}
