//! Integration test framework for the gateway message bus
//!
//! This crate provides test utilities and fixture tasks for exercising a
//! complete bus: real task threads, real timers and the shutdown
//! coordinator.
//!
//! # Components
//!
//! - [`test_fixtures`] - Bus configurations and reusable tasks
//! - [`test_utils`] - Logging setup and polling helpers
//!
//! # Test Categories
//!
//! 1. **Message Ordering** - per sender/receiver FIFO delivery
//! 2. **Task Lifecycle** - creation rendezvous, readiness, sub-tasks
//! 3. **Shutdown** - TERMINATE broadcast and bounded joins
//! 4. **Timers** - periodic and one-shot expiry, cancellation
//! 5. **Allocator** - pool usage across allocate/free and routing
//! 6. **Routing** - broadcast, drops and overflow policies


pub use test_fixtures::{
    next_received, test_config, CollectingTask, IdleTask, Received, TEST_MESSAGE,
};
pub use test_utils::{
    init_test_logging, wait_for_condition, TestResult, DEFAULT_POLL_INTERVAL,
    DEFAULT_TEST_TIMEOUT,
};
