//! Message kinds, envelopes and the envelope allocator
//!
//! An [`Envelope`] is a fixed header plus an opaque payload leased from the
//! [`MessagePool`]. The payload size of each kind comes from the
//! [`MessageCatalog`]; protocol tasks encode and decode the payload
//! themselves.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use agw_common::config::MessageConfig;
use agw_common::logging::{format_hex_dump, HexDump};
use agw_common::{Error, RESERVED_MESSAGE_NAMES};

use crate::pool::{MessagePool, PooledBuffer};
use crate::registry::{current_task, TaskId};

/// Identity of a message kind, its index in the message catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKind(u16);

impl MessageKind {
    /// Asks every task to release its resources and exit.
    pub const TERMINATE: MessageKind = MessageKind(0);
    /// Carries the expiry of an armed timer to its owner.
    pub const TIMER_HAS_EXPIRED: MessageKind = MessageKind(1);

    /// Creates a kind from a catalog index.
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    /// Returns the catalog index.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Catalog entry for a message kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    /// Kind identifier
    pub kind: MessageKind,
    /// Default payload size in bytes
    pub payload_size: usize,
    /// Priority carried in traces
    pub priority: u8,
    /// Message name
    pub name: String,
}

/// Immutable table of message kinds.
#[derive(Debug)]
pub struct MessageCatalog {
    messages: Vec<MessageInfo>,
    by_name: HashMap<String, MessageKind>,
}

impl MessageCatalog {
    /// Builds the catalog: the built-in kinds followed by `messages`.
    pub fn from_config(messages: &[MessageConfig]) -> Result<Self, Error> {
        let builtin = RESERVED_MESSAGE_NAMES
            .iter()
            .map(|name| MessageConfig::new(*name, 0));
        let all: Vec<MessageConfig> = builtin.chain(messages.iter().cloned()).collect();

        let mut infos = Vec::with_capacity(all.len());
        let mut by_name = HashMap::with_capacity(all.len());
        for (index, message) in all.into_iter().enumerate() {
            let kind = u16::try_from(index)
                .map(MessageKind)
                .map_err(|_| Error::Config("message catalog too large".into()))?;
            if by_name.insert(message.name.clone(), kind).is_some() {
                return Err(Error::Config(format!(
                    "duplicate or reserved message name {}",
                    message.name
                )));
            }
            infos.push(MessageInfo {
                kind,
                payload_size: message.payload_size,
                priority: message.priority,
                name: message.name,
            });
        }

        Ok(Self {
            messages: infos,
            by_name,
        })
    }

    /// Returns the catalog entry of a kind.
    ///
    /// # Panics
    ///
    /// Panics if `kind` is out of range.
    pub fn info(&self, kind: MessageKind) -> &MessageInfo {
        match self.messages.get(kind.index()) {
            Some(info) => info,
            None => {
                tracing::error!(%kind, max = self.messages.len(), "message kind out of range");
                panic!("message kind {kind} is out of range ({})", self.messages.len());
            }
        }
    }

    /// Returns the name of a kind.
    pub fn name_of(&self, kind: MessageKind) -> &str {
        &self.info(kind).name
    }

    /// Looks a kind up by name.
    pub fn lookup(&self, name: &str) -> Option<MessageKind> {
        self.by_name.get(name).copied()
    }

    /// Number of kinds, built-in kinds included.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Always false: the built-in kinds are always present.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Fixed envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Message kind
    pub kind: MessageKind,
    /// Sending task
    pub origin: TaskId,
    /// Receiving task, set when the envelope is routed
    pub destination: TaskId,
    /// Payload size in bytes
    pub payload_size: usize,
    /// Allocation time
    pub timestamp: Instant,
    /// Process-wide sequence number, set when the envelope is routed
    pub message_number: u64,
    /// Subscriber the message relates to, if any
    pub imsi: Option<u64>,
}

/// Typed, size-tagged message exchanged between tasks.
///
/// An envelope has a single owner at any time: the sender until it is
/// routed, then the receiving task. Dropping it returns the payload to the
/// pool.
pub struct Envelope {
    header: EnvelopeHeader,
    payload: PooledBuffer,
}

impl Envelope {
    /// Header fields.
    pub fn header(&self) -> &EnvelopeHeader {
        &self.header
    }

    /// Message kind.
    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    /// Sending task.
    pub fn origin(&self) -> TaskId {
        self.header.origin
    }

    /// Receiving task, [`TaskId::UNKNOWN`] until routed.
    pub fn destination(&self) -> TaskId {
        self.header.destination
    }

    /// Payload size in bytes.
    pub fn payload_size(&self) -> usize {
        self.header.payload_size
    }

    /// Allocation time.
    pub fn timestamp(&self) -> Instant {
        self.header.timestamp
    }

    /// Sequence number stamped by the router, 0 until routed.
    pub fn message_number(&self) -> u64 {
        self.header.message_number
    }

    /// Associated subscriber.
    pub fn imsi(&self) -> Option<u64> {
        self.header.imsi
    }

    /// Associates the message with a subscriber.
    pub fn set_imsi(&mut self, imsi: u64) {
        self.header.imsi = Some(imsi);
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }

    /// Mutable payload bytes.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.payload.as_mut_slice()
    }

    /// Returns true for TERMINATE envelopes.
    pub fn is_terminate(&self) -> bool {
        self.header.kind == MessageKind::TERMINATE
    }

    pub(crate) fn stamp(&mut self, destination: TaskId, message_number: u64) {
        self.header.destination = destination;
        self.header.message_number = message_number;
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pretty = f.alternate();
        let mut out = f.debug_struct("Envelope");
        out.field("kind", &self.header.kind)
            .field("origin", &self.header.origin)
            .field("destination", &self.header.destination)
            .field("message_number", &self.header.message_number);
        // `{:#?}` gets the offset/ASCII dump, one row per 16 bytes.
        if pretty {
            let dump = format_hex_dump(self.payload());
            out.field("payload", &format_args!("\n{dump}"));
        } else {
            out.field("payload", &HexDump(self.payload()));
        }
        out.finish()
    }
}

/// Builds envelopes from the catalog and the pool.
#[derive(Debug)]
pub struct EnvelopeAllocator {
    instance: u64,
    catalog: Arc<MessageCatalog>,
    pool: Arc<MessagePool>,
}

impl EnvelopeAllocator {
    pub(crate) fn new(instance: u64, catalog: Arc<MessageCatalog>, pool: Arc<MessagePool>) -> Self {
        Self {
            instance,
            catalog,
            pool,
        }
    }

    /// Allocates an envelope of `kind` with the catalog payload size.
    ///
    /// An `origin` of [`TaskId::UNKNOWN`] is resolved to the task owning the
    /// calling thread, if any.
    ///
    /// # Panics
    ///
    /// Panics if `kind` is out of range or the pool is exhausted.
    pub fn allocate(&self, origin: TaskId, kind: MessageKind) -> Envelope {
        let size = self.catalog.info(kind).payload_size;
        self.allocate_sized(origin, kind, size)
    }

    /// Allocates an envelope of `kind` with an explicit payload size.
    pub fn allocate_sized(&self, origin: TaskId, kind: MessageKind, size: usize) -> Envelope {
        // Range check before touching the pool.
        self.catalog.info(kind);

        let origin = if origin.is_unknown() {
            current_task(self.instance)
        } else {
            origin
        };

        Envelope {
            header: EnvelopeHeader {
                kind,
                origin,
                destination: TaskId::UNKNOWN,
                payload_size: size,
                timestamp: Instant::now(),
                message_number: 0,
                imsi: None,
            },
            payload: self.pool.acquire(size),
        }
    }

    /// Copies an envelope into a fresh pool item, header included.
    pub fn duplicate(&self, envelope: &Envelope) -> Envelope {
        let mut payload = self.pool.acquire(envelope.payload_size());
        payload.as_mut_slice().copy_from_slice(envelope.payload());
        Envelope {
            header: envelope.header,
            payload,
        }
    }

    /// Releases an envelope and its pool item.
    pub fn free(&self, envelope: Envelope) {
        drop(envelope);
    }

    /// Catalog used for sizing.
    pub fn catalog(&self) -> &MessageCatalog {
        &self.catalog
    }

    /// Pool backing the payloads.
    pub fn pool(&self) -> &MessagePool {
        &self.pool
    }
}
