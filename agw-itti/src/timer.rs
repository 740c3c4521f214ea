//! Timer service
//!
//! Armed timers run on a dedicated one-worker tokio runtime. On expiry a
//! timer does not call back into its owner: it allocates a
//! `TIMER_HAS_EXPIRED` envelope carrying the timer id and the opaque
//! argument and routes it to the owning task, so expiry handling happens on
//! the owner's thread like any other message.
//!
//! A timer checks that its entry is still registered, under the registry
//! lock, before sending. Once [`TimerService::remove`] has returned, the
//! timer can no longer fire.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes};
use tokio::runtime::{Handle, Runtime};
use tokio::task::AbortHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

use crate::error::TimerError;
use crate::message::{Envelope, MessageKind};
use crate::registry::TaskId;
use crate::router::Router;

const TIMER_ID_LEN: usize = 8;

/// Identity of an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    /// Creates a timer id from its raw value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw value.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Firing behaviour of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires once and stays registered until acknowledged or removed
    OneShot,
    /// Fires every interval until removed
    Periodic,
}

/// Decoded payload of a `TIMER_HAS_EXPIRED` envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerExpired {
    /// Timer that fired
    pub timer_id: TimerId,
    /// Argument given at setup
    pub arg: Bytes,
}

impl TimerExpired {
    /// Decodes an expiry envelope; `None` for any other kind.
    pub fn decode(envelope: &Envelope) -> Option<Self> {
        if envelope.kind() != MessageKind::TIMER_HAS_EXPIRED {
            return None;
        }
        let mut payload = envelope.payload();
        if payload.len() < TIMER_ID_LEN {
            return None;
        }
        let timer_id = TimerId(payload.get_u64());
        Some(Self {
            timer_id,
            arg: Bytes::copy_from_slice(payload),
        })
    }

    fn encode_into(timer_id: TimerId, arg: &[u8], mut payload: &mut [u8]) {
        payload.put_u64(timer_id.0);
        payload.put_slice(arg);
    }
}

#[derive(Debug)]
struct TimerEntry {
    owner: TaskId,
    kind: TimerKind,
    interval: Duration,
    arg: Bytes,
    abort: AbortHandle,
}

struct Shared {
    router: Arc<Router>,
    timers: Mutex<HashMap<TimerId, TimerEntry>>,
}

impl Shared {
    fn timers(&self) -> MutexGuard<'_, HashMap<TimerId, TimerEntry>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Routes one expiry. Returns false once the timer is gone.
    fn fire(&self, timer_id: TimerId) -> bool {
        let (owner, kind, arg) = match self.timers().get(&timer_id) {
            Some(entry) => (entry.owner, entry.kind, entry.arg.clone()),
            None => return false,
        };

        let mut envelope = self.router.allocator().allocate_sized(
            TaskId::UNKNOWN,
            MessageKind::TIMER_HAS_EXPIRED,
            TIMER_ID_LEN + arg.len(),
        );
        TimerExpired::encode_into(timer_id, &arg, envelope.payload_mut());

        // Removed while the envelope was built: the envelope goes back to the pool.
        if !self.timers().contains_key(&timer_id) {
            return false;
        }
        tracing::trace!(
            timer = %timer_id,
            owner = self.router.registry().name_of(owner),
            ?kind,
            "timer expired"
        );
        self.router.send_to(owner, envelope);
        true
    }
}

/// Registry of armed timers.
pub struct TimerService {
    handle: Handle,
    runtime: Option<Runtime>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

impl TimerService {
    pub(crate) fn new(router: Arc<Router>) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("itti-timer")
            .enable_time()
            .build()?;

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            shared: Arc::new(Shared {
                router,
                timers: Mutex::new(HashMap::new()),
            }),
            next_id: AtomicU64::new(1),
        })
    }

    /// Arms a timer for `owner`.
    ///
    /// # Panics
    ///
    /// Panics if `owner` is out of range.
    pub fn setup(
        &self,
        interval_sec: u64,
        interval_usec: u64,
        owner: TaskId,
        kind: TimerKind,
        arg: Bytes,
    ) -> Result<TimerId, TimerError> {
        let interval = Duration::from_secs(interval_sec) + Duration::from_micros(interval_usec);
        if interval.is_zero() {
            return Err(TimerError::InvalidInterval);
        }
        let len = TIMER_ID_LEN + arg.len();
        let max = self.shared.router.allocator().pool().max_item_size();
        if len > max {
            tracing::warn!(len, max, "timer argument too large for the message pool");
            return Err(TimerError::ArgTooLarge { len, max });
        }
        let owner_name = self.shared.router.registry().name_of(owner);

        let timer_id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::clone(&self.shared);

        // Held across the spawn so the timer cannot look itself up before it
        // is registered.
        let mut timers = self.shared.timers();
        let task = self.handle.spawn(async move {
            match kind {
                TimerKind::OneShot => {
                    sleep(interval).await;
                    shared.fire(timer_id);
                }
                TimerKind::Periodic => {
                    let mut ticker = interval_at(Instant::now() + interval, interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        if !shared.fire(timer_id) {
                            break;
                        }
                    }
                }
            }
        });
        timers.insert(
            timer_id,
            TimerEntry {
                owner,
                kind,
                interval,
                arg,
                abort: task.abort_handle(),
            },
        );
        drop(timers);

        tracing::debug!(timer = %timer_id, owner = owner_name, ?kind, ?interval, "timer armed");
        Ok(timer_id)
    }

    /// Cancels a timer and hands its argument back.
    pub fn remove(&self, timer_id: TimerId) -> Result<Bytes, TimerError> {
        match self.shared.timers().remove(&timer_id) {
            Some(entry) => {
                entry.abort.abort();
                tracing::debug!(timer = %timer_id, "timer removed");
                Ok(entry.arg)
            }
            None => {
                tracing::warn!(timer = %timer_id, "cannot remove timer: not found");
                Err(TimerError::NotFound(timer_id))
            }
        }
    }

    /// Acknowledges an expiry. One-shot timers are unregistered and `true`
    /// is returned; periodic and unknown timers are left alone.
    pub fn handle_expired(&self, timer_id: TimerId) -> bool {
        let mut timers = self.shared.timers();
        match timers.get(&timer_id) {
            Some(entry) if entry.kind == TimerKind::OneShot => {
                timers.remove(&timer_id);
                true
            }
            Some(_) => false,
            None => {
                tracing::debug!(timer = %timer_id, "acknowledged timer already gone");
                false
            }
        }
    }

    /// Number of registered timers.
    pub fn armed(&self) -> usize {
        self.shared.timers().len()
    }

    /// Interval of a registered timer.
    pub fn interval_of(&self, timer_id: TimerId) -> Option<Duration> {
        self.shared.timers().get(&timer_id).map(|entry| entry.interval)
    }
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerService")
            .field("armed", &self.armed())
            .finish()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        for (_, entry) in self.shared.timers().drain() {
            entry.abort.abort();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
