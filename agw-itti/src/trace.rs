//! Message trace
//!
//! Bounded ring of the most recently routed envelope headers and their
//! delivery outcome. A depth of 0 disables recording.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crate::message::{EnvelopeHeader, MessageKind};
use crate::registry::TaskId;
use crate::router::Delivery;

/// One routed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    /// Sequence number stamped by the router
    pub message_number: u64,
    /// Message kind
    pub kind: MessageKind,
    /// Sending task
    pub origin: TaskId,
    /// Receiving task
    pub destination: TaskId,
    /// Payload size in bytes
    pub payload_size: usize,
    /// Associated subscriber
    pub imsi: Option<u64>,
    /// When the envelope was routed
    pub routed_at: Instant,
    /// What happened to it
    pub delivery: Delivery,
}

#[derive(Debug)]
pub(crate) struct MessageTrace {
    depth: usize,
    entries: Mutex<VecDeque<TraceEntry>>,
}

impl MessageTrace {
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            depth,
            entries: Mutex::new(VecDeque::with_capacity(depth)),
        }
    }

    pub(crate) fn record(&self, header: &EnvelopeHeader, delivery: Delivery) {
        if self.depth == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == self.depth {
            entries.pop_front();
        }
        entries.push_back(TraceEntry {
            message_number: header.message_number,
            kind: header.kind,
            origin: header.origin,
            destination: header.destination,
            payload_size: header.payload_size,
            imsi: header.imsi,
            routed_at: Instant::now(),
            delivery,
        });
    }

    /// Entries oldest first.
    pub(crate) fn snapshot(&self) -> Vec<TraceEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}
