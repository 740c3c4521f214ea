//! agw-itti - inter-task message bus for the access gateway
//!
//! Every protocol stack of the gateway runs as a task with its own mailbox,
//! and the bus is the only channel between tasks. This crate provides:
//!
//! - Envelopes sized from a message catalog and backed by a pooled allocator
//! - A read-only task registry mapping task ids to threads and metadata
//! - One OS thread per top-level task, each driving a private event loop
//! - Point-to-point send, broadcast and blocking/polling receive
//! - Timers whose expiry is delivered as an ordinary message
//! - A shutdown coordinator broadcasting TERMINATE and joining task threads
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────┐ send_to / broadcast ┌──────────┐  mailbox  ┌──────────────┐
//!   │  sender  │ ──────────────────▶ │  Router  │ ────────▶ │ task thread  │
//!   └──────────┘                     └────┬─────┘           │ (event loop) │
//!                                         ▲                 └──────────────┘
//!                          TIMER_HAS_EXPIRED
//!                                   ┌─────┴────────┐
//!                                   │ TimerService │
//!                                   └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use agw_common::{BusConfig, MessageConfig, TaskConfig};
//! use agw_itti::{task_fn, Bus, LoopControl, TaskContext, TaskId};
//!
//! # async fn example() -> Result<(), agw_itti::BusError> {
//! let config = BusConfig::new(
//!     vec![TaskConfig::new("MAIN"), TaskConfig::new("S1AP")],
//!     vec![MessageConfig::new("TEST", 16)],
//! );
//! let bus = Bus::new(config)?;
//! let s1ap = bus.registry().lookup("S1AP").unwrap();
//!
//! bus.create_task(s1ap, task_fn(|mut ctx: TaskContext| async move {
//!     ctx.init(&[], true);
//!     ctx.mark_ready();
//!     ctx.run_event_loop(|_, _| LoopControl::Continue).await;
//!     ctx.destroy();
//! }))
//! .await?;
//!
//! let kind = bus.message_kind("TEST").unwrap();
//! bus.send_to(s1ap, bus.allocate(TaskId::UNKNOWN, kind));
//!
//! bus.shutdown_signal().trigger();
//! let report = bus.coordinator().wait_tasks_end().await?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod error;
mod mailbox;
pub mod message;
pub mod pool;
pub mod registry;
pub mod router;
pub mod shutdown;
pub mod task;
pub mod timer;
mod trace;

pub use bus::Bus;
pub use error::{BusError, TimerError};
pub use mailbox::MailboxStats;
pub use message::{Envelope, EnvelopeAllocator, EnvelopeHeader, MessageCatalog, MessageInfo, MessageKind};
pub use pool::{MessagePool, PoolClassStatistics, PoolStatistics, PooledBuffer};
pub use registry::{TaskId, TaskInfo, TaskRegistry, ThreadId};
pub use router::{Delivery, DropReason, RouterStats};
pub use shutdown::{install_signal_handler, ShutdownCoordinator, ShutdownReport, ShutdownSignal};
pub use task::{task_fn, FnTask, LoopControl, Task, TaskContext, TaskState};
pub use timer::{TimerExpired, TimerId, TimerKind, TimerService};
pub use trace::TraceEntry;
