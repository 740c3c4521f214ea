//! Message pool
//!
//! Envelope payloads are served from a fixed set of size classes. Each class
//! has an item size and a maximum number of items in use at once; buffers
//! returned by dropped envelopes are kept and reused by the same class.
//!
//! Allocation picks the smallest class that fits the requested size and
//! still has a free item, falling through to larger classes. When no class
//! can serve the request the pool is exhausted, which is fatal: the caller
//! panics after logging the pool statistics.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use agw_common::config::PoolConfig;

struct SizeClass {
    item_size: usize,
    items: usize,
    in_use: AtomicUsize,
    min_free: AtomicUsize,
    recycled: Mutex<Vec<Vec<u8>>>,
}

impl SizeClass {
    fn try_reserve(&self) -> bool {
        let reserved = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_use| {
                (in_use < self.items).then_some(in_use + 1)
            });
        match reserved {
            Ok(previous) => {
                self.min_free
                    .fetch_min(self.items - previous - 1, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    fn take_buffer(&self) -> Vec<u8> {
        self.recycled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.item_size))
    }

    fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        self.recycled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(buffer);
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Payload storage leased from a [`MessagePool`] size class.
///
/// The lease ends when the buffer is dropped; the item becomes available
/// again and its memory is kept for the next allocation.
pub struct PooledBuffer {
    data: Vec<u8>,
    class: Arc<SizeClass>,
}

impl PooledBuffer {
    /// Payload bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable payload bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true for a zero-length payload.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Item size of the class the buffer was leased from.
    pub fn item_size(&self) -> usize {
        self.class.item_size
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.class.release(std::mem::take(&mut self.data));
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .field("item_size", &self.class.item_size)
            .finish()
    }
}

/// Allocator for envelope payloads.
pub struct MessagePool {
    classes: Vec<Arc<SizeClass>>,
}

impl MessagePool {
    /// Creates a pool from the configured size classes.
    pub fn new(pools: &[PoolConfig]) -> Self {
        let mut pools = pools.to_vec();
        pools.sort_by_key(|p| p.item_size);

        let classes = pools
            .into_iter()
            .map(|p| {
                Arc::new(SizeClass {
                    item_size: p.item_size,
                    items: p.items,
                    in_use: AtomicUsize::new(0),
                    min_free: AtomicUsize::new(p.items),
                    recycled: Mutex::new(Vec::new()),
                })
            })
            .collect();

        Self { classes }
    }

    /// Leases a zero-filled buffer of `size` bytes, or `None` if no size
    /// class can serve it.
    pub fn try_acquire(&self, size: usize) -> Option<PooledBuffer> {
        let class = self
            .classes
            .iter()
            .filter(|class| class.item_size >= size)
            .find(|class| class.try_reserve())?;

        let mut data = class.take_buffer();
        data.resize(size, 0);
        Some(PooledBuffer {
            data,
            class: Arc::clone(class),
        })
    }

    /// Leases a zero-filled buffer of `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics when the pool is exhausted for this size. A bus that cannot
    /// allocate messages cannot keep its protocol tasks consistent, so this
    /// is treated as a fatal sizing error.
    pub fn acquire(&self, size: usize) -> PooledBuffer {
        match self.try_acquire(size) {
            Some(buffer) => buffer,
            None => {
                let statistics = self.statistics();
                tracing::error!("Message pool statistics:\n{}", statistics);
                panic!("message pool exhausted: no free item for {size} bytes");
            }
        }
    }

    /// Number of items currently leased across all classes.
    pub fn in_use(&self) -> usize {
        self.classes
            .iter()
            .map(|class| class.in_use.load(Ordering::Acquire))
            .sum()
    }

    /// Largest payload the pool can serve.
    pub fn max_item_size(&self) -> usize {
        self.classes.last().map_or(0, |class| class.item_size)
    }

    /// Snapshot of per-class usage.
    pub fn statistics(&self) -> PoolStatistics {
        PoolStatistics {
            classes: self
                .classes
                .iter()
                .map(|class| {
                    let in_use = class.in_use.load(Ordering::Acquire);
                    PoolClassStatistics {
                        item_size: class.item_size,
                        items: class.items,
                        in_use,
                        free: class.items - in_use,
                        minimum_free: class.min_free.load(Ordering::Relaxed),
                    }
                })
                .collect(),
        }
    }
}

impl fmt::Debug for MessagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePool")
            .field("classes", &self.classes.len())
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// Usage of one size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolClassStatistics {
    /// Item size in bytes
    pub item_size: usize,
    /// Number of items in the class
    pub items: usize,
    /// Items currently leased
    pub in_use: usize,
    /// Items currently free
    pub free: usize,
    /// Lowest number of free items observed
    pub minimum_free: usize,
}

/// Usage of the whole pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatistics {
    /// Per-class usage, smallest class first
    pub classes: Vec<PoolClassStatistics>,
}

impl PoolStatistics {
    /// Items currently leased across all classes.
    pub fn in_use(&self) -> usize {
        self.classes.iter().map(|c| c.in_use).sum()
    }
}

impl fmt::Display for PoolStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pool:   size, number, minimum,   free, in use")?;
        for (index, class) in self.classes.iter().enumerate() {
            writeln!(
                f,
                "  {:2}: {:6}, {:6},  {:6}, {:6}, {:6}",
                index, class.item_size, class.items, class.minimum_free, class.free, class.in_use
            )?;
        }
        write!(f, "Items in use: {}", self.in_use())
    }
}
