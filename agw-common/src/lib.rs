//! Common types and utilities for the agw message bus
//!
//! This crate provides the configuration structures, logging setup and
//! error type shared by the bus library, its binary and the integration tests.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    BusConfig, MessageConfig, OverflowPolicy, PoolConfig, ShutdownConfig, TaskConfig,
    RESERVED_MESSAGE_NAMES,
};
pub use error::Error;
pub use logging::{format_hex_dump, init_logging, init_logging_with_filter, HexDump, LogLevel};
