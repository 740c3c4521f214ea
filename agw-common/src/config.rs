//! Bus configuration
//!
//! The task table, the message catalog and the allocator layout are
//! described by a [`BusConfig`] built once at start-up and handed to the bus
//! constructor. Several independent buses can coexist in one process, which
//! is what the unit and integration tests rely on.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Names of the message kinds every bus defines on its own.
pub const RESERVED_MESSAGE_NAMES: [&str; 2] = ["TERMINATE", "TIMER_HAS_EXPIRED"];

/// One entry of the task table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Unique task name, used in logs and thread names
    pub name: String,
    /// Parent task for sub-tasks sharing the parent's thread
    #[serde(default)]
    pub parent: Option<String>,
    /// Scheduling priority hint (informational)
    #[serde(default)]
    pub priority: u8,
    /// Maximum number of queued envelopes, 0 for unbounded
    #[serde(default)]
    pub queue_capacity: usize,
}

impl TaskConfig {
    /// Creates a top-level task entry with default priority and an unbounded queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            priority: 0,
            queue_capacity: 0,
        }
    }

    /// Creates a sub-task entry serviced by `parent`'s thread.
    pub fn sub_task(name: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            parent: Some(parent.into()),
            ..Self::new(name)
        }
    }

    /// Sets the queue capacity.
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Sets the priority hint.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// One entry of the message catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageConfig {
    /// Unique message name
    pub name: String,
    /// Payload size in bytes used by default allocations of this kind
    pub payload_size: usize,
    /// Priority carried in traces and logs
    #[serde(default)]
    pub priority: u8,
}

impl MessageConfig {
    /// Creates a catalog entry.
    pub fn new(name: impl Into<String>, payload_size: usize) -> Self {
        Self {
            name: name.into(),
            payload_size,
            priority: 0,
        }
    }
}

/// One size class of the message allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Largest payload an item of this class can hold
    pub item_size: usize,
    /// Number of items that can be allocated at the same time
    pub items: usize,
}

impl PoolConfig {
    /// Creates a size class.
    pub fn new(item_size: usize, items: usize) -> Self {
        Self { item_size, items }
    }
}

fn default_pools() -> Vec<PoolConfig> {
    vec![
        PoolConfig::new(50, 11_000),
        PoolConfig::new(100, 12_000),
        PoolConfig::new(1_000, 10_000),
        PoolConfig::new(20_050, 400),
        PoolConfig::new(30_050, 100),
    ]
}

/// Parameters of the shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Time given to tasks after TERMINATE before joins are attempted
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    /// Number of join rounds after the grace period
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Length of one join round
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_grace_ms() -> u64 {
    1000
}

fn default_retries() -> u32 {
    10
}

fn default_retry_interval_ms() -> u64 {
    100
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
            retries: default_retries(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl ShutdownConfig {
    /// Upper bound of the whole shutdown sequence after TERMINATE is sent.
    pub fn budget_ms(&self) -> u64 {
        self.grace_ms + u64::from(self.retries) * self.retry_interval_ms
    }
}

/// What a mailbox does when a send would exceed its capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Treat a saturated mailbox as a fatal sizing error
    #[default]
    Abort,
    /// Drop the new envelope and count it
    DropNewest,
}

/// Complete bus configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Task table; the position of an entry is its task id
    pub tasks: Vec<TaskConfig>,
    /// Application message kinds, numbered after the built-in kinds
    #[serde(default)]
    pub messages: Vec<MessageConfig>,
    /// Allocator size classes
    #[serde(default = "default_pools")]
    pub pools: Vec<PoolConfig>,
    /// Shutdown sequence parameters
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    /// How long `create_task` waits for the new task to become ready
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// Behaviour of full mailboxes
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// Number of routed envelopes remembered by the message trace
    #[serde(default)]
    pub trace_depth: usize,
}

fn default_ready_timeout_ms() -> u64 {
    5000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            messages: Vec::new(),
            pools: default_pools(),
            shutdown: ShutdownConfig::default(),
            ready_timeout_ms: default_ready_timeout_ms(),
            overflow_policy: OverflowPolicy::default(),
            trace_depth: 0,
        }
    }
}

impl BusConfig {
    /// Creates a configuration with the given tasks and messages and default
    /// pools and timings.
    pub fn new(tasks: Vec<TaskConfig>, messages: Vec<MessageConfig>) -> Self {
        Self {
            tasks,
            messages,
            ..Default::default()
        }
    }

    /// Parses a configuration from YAML.
    ///
    /// # Example
    ///
    /// ```
    /// use agw_common::config::BusConfig;
    ///
    /// let yaml = r#"
    /// tasks:
    ///   - name: MAIN
    ///   - name: S1AP
    ///     queue_capacity: 1024
    /// messages:
    ///   - name: TEST
    ///     payload_size: 16
    /// "#;
    /// let config = BusConfig::from_yaml(yaml).unwrap();
    /// assert_eq!(config.tasks.len(), 2);
    /// assert_eq!(config.shutdown.retries, 10);
    /// ```
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Loads a configuration from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Serializes the configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, Error> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Loads and validates a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let config = Self::from_yaml_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the structural rules the bus relies on.
    pub fn validate(&self) -> Result<(), Error> {
        if self.tasks.is_empty() {
            return Err(Error::Config("at least one task must be declared".into()));
        }
        if self.tasks.len() >= usize::from(u16::MAX) {
            return Err(Error::Config(format!("too many tasks ({})", self.tasks.len())));
        }

        let mut top_level: HashSet<&str> = HashSet::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for task in &self.tasks {
            if task.name.is_empty() {
                return Err(Error::Config("task names must not be empty".into()));
            }
            if !seen.insert(task.name.as_str()) {
                return Err(Error::Config(format!("duplicate task name {}", task.name)));
            }
            match &task.parent {
                None => {
                    top_level.insert(task.name.as_str());
                }
                Some(parent) if top_level.contains(parent.as_str()) => {}
                Some(parent) => {
                    return Err(Error::Config(format!(
                        "task {} names parent {parent}, which is not a previously declared top-level task",
                        task.name
                    )));
                }
            }
        }

        let mut messages: HashSet<&str> = RESERVED_MESSAGE_NAMES.into_iter().collect();
        for message in &self.messages {
            if !messages.insert(message.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate or reserved message name {}",
                    message.name
                )));
            }
        }
        if RESERVED_MESSAGE_NAMES.len() + self.messages.len() > usize::from(u16::MAX) {
            return Err(Error::Config("too many message kinds".into()));
        }

        if self.pools.is_empty() {
            return Err(Error::Config("at least one pool size class is required".into()));
        }
        if let Some(pool) = self.pools.iter().find(|p| p.items == 0) {
            return Err(Error::Config(format!(
                "pool class of {} bytes has no items",
                pool.item_size
            )));
        }
        let max = self.max_item_size();
        if let Some(message) = self.messages.iter().find(|m| m.payload_size > max) {
            return Err(Error::Config(format!(
                "message {} needs {} bytes, larger than the largest pool class ({max})",
                message.name, message.payload_size
            )));
        }

        if self.shutdown.retry_interval_ms == 0 {
            return Err(Error::Config("shutdown.retry_interval_ms must be positive".into()));
        }

        Ok(())
    }

    /// Largest payload the allocator can serve.
    pub fn max_item_size(&self) -> usize {
        self.pools.iter().map(|p| p.item_size).max().unwrap_or(0)
    }
}
