//! Task registry
//!
//! Read-only catalog mapping each [`TaskId`] to its owning thread, parent,
//! priority, queue capacity and name. The registry is built once from the
//! bus configuration and shared behind an `Arc`; lookups are plain slice
//! indexing and never lock.
//!
//! Top-level tasks own one thread each, numbered in declaration order.
//! Sub-tasks inherit the thread of their parent and are serviced by the
//! parent's event loop.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;

use agw_common::config::TaskConfig;
use agw_common::Error;

/// Identity of a task, its index in the task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u16);

impl TaskId {
    /// Origin or destination that is not a registered task.
    ///
    /// Envelopes allocated outside any task thread carry this origin, and
    /// envelopes sent to it are released without being queued.
    pub const UNKNOWN: TaskId = TaskId(u16::MAX);

    /// Creates a task id from a table index.
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    /// Returns the table index.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Returns true for [`TaskId::UNKNOWN`].
    pub fn is_unknown(self) -> bool {
        self == Self::UNKNOWN
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            f.write_str("UNKNOWN")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Identity of a task thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u16);

impl ThreadId {
    /// Returns the thread index.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread {}", self.0)
    }
}

/// Static description of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    /// Task identifier
    pub id: TaskId,
    /// Thread servicing the task
    pub thread_id: ThreadId,
    /// Parent task for sub-tasks
    pub parent_task: Option<TaskId>,
    /// Scheduling priority hint
    pub priority: u8,
    /// Mailbox capacity, 0 for unbounded
    pub queue_capacity: usize,
    /// Task name
    pub name: String,
}

impl TaskInfo {
    /// Returns true if the task owns its thread.
    pub fn is_top_level(&self) -> bool {
        self.parent_task.is_none()
    }
}

/// Immutable task table.
#[derive(Debug)]
pub struct TaskRegistry {
    tasks: Vec<TaskInfo>,
    thread_owners: Vec<TaskId>,
    by_name: HashMap<String, TaskId>,
}

impl TaskRegistry {
    /// Builds the registry from the configured task table.
    ///
    /// The configuration is expected to have passed
    /// [`BusConfig::validate`](agw_common::BusConfig::validate); structural
    /// problems are still reported rather than assumed away.
    pub fn from_config(tasks: &[TaskConfig]) -> Result<Self, Error> {
        let mut infos: Vec<TaskInfo> = Vec::with_capacity(tasks.len());
        let mut thread_owners = Vec::new();
        let mut by_name = HashMap::with_capacity(tasks.len());

        for (index, task) in tasks.iter().enumerate() {
            let index = u16::try_from(index)
                .ok()
                .filter(|i| *i != u16::MAX)
                .ok_or_else(|| Error::Config("task table too large".into()))?;
            let id = TaskId(index);

            let (thread_id, parent_task) = match &task.parent {
                None => {
                    let thread = u16::try_from(thread_owners.len())
                        .map_err(|_| Error::Config("too many task threads".into()))?;
                    thread_owners.push(id);
                    (ThreadId(thread), None)
                }
                Some(parent) => {
                    let parent_id = *by_name.get(parent).ok_or_else(|| {
                        Error::Config(format!("unknown parent {parent} for task {}", task.name))
                    })?;
                    let parent_info: &TaskInfo = &infos[TaskId::index(parent_id)];
                    if !parent_info.is_top_level() {
                        return Err(Error::Config(format!(
                            "parent {parent} of task {} is itself a sub-task",
                            task.name
                        )));
                    }
                    (parent_info.thread_id, Some(parent_id))
                }
            };

            if by_name.insert(task.name.clone(), id).is_some() {
                return Err(Error::Config(format!("duplicate task name {}", task.name)));
            }
            infos.push(TaskInfo {
                id,
                thread_id,
                parent_task,
                priority: task.priority,
                queue_capacity: task.queue_capacity,
                name: task.name.clone(),
            });
        }

        Ok(Self {
            tasks: infos,
            thread_owners,
            by_name,
        })
    }

    /// Returns the description of a task.
    ///
    /// # Panics
    ///
    /// Panics if `task_id` is out of range; ids come from this registry, so
    /// an out-of-range id is a caller bug.
    pub fn info(&self, task_id: TaskId) -> &TaskInfo {
        match self.tasks.get(task_id.index()) {
            Some(info) => info,
            None => {
                tracing::error!(%task_id, max = self.tasks.len(), "task id out of range");
                panic!("task id {task_id} is out of range ({})", self.tasks.len());
            }
        }
    }

    /// Returns the task name.
    pub fn name_of(&self, task_id: TaskId) -> &str {
        if task_id.is_unknown() {
            return "UNKNOWN";
        }
        &self.info(task_id).name
    }

    /// Returns the thread servicing the task.
    pub fn thread_of(&self, task_id: TaskId) -> ThreadId {
        self.info(task_id).thread_id
    }

    /// Returns the top-level task owning a thread.
    pub fn owner_of(&self, thread_id: ThreadId) -> TaskId {
        match self.thread_owners.get(thread_id.index()) {
            Some(owner) => *owner,
            None => panic!(
                "thread id {} is out of range ({})",
                thread_id.index(),
                self.thread_owners.len()
            ),
        }
    }

    /// Looks a task up by name.
    pub fn lookup(&self, name: &str) -> Option<TaskId> {
        self.by_name.get(name).copied()
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if the registry has no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of task threads.
    pub fn thread_count(&self) -> usize {
        self.thread_owners.len()
    }

    /// Iterates over all tasks in id order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskInfo> {
        self.tasks.iter()
    }

    /// Iterates over the owning task of every thread, in thread order.
    pub fn thread_owners(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.thread_owners.iter().copied()
    }

    /// Iterates over the tasks serviced by `thread_id`, owner first.
    pub fn tasks_on_thread(&self, thread_id: ThreadId) -> impl Iterator<Item = TaskId> + '_ {
        self.tasks
            .iter()
            .filter(move |info| info.thread_id == thread_id)
            .map(|info| info.id)
    }
}

thread_local! {
    static CURRENT_TASK: Cell<Option<(u64, TaskId)>> = const { Cell::new(None) };
}

/// Records the task serviced by the calling thread for bus `instance`.
pub(crate) fn bind_current_thread(instance: u64, task_id: TaskId) {
    CURRENT_TASK.with(|current| current.set(Some((instance, task_id))));
}

/// Forgets the binding made by [`bind_current_thread`].
pub(crate) fn unbind_current_thread() {
    CURRENT_TASK.with(|current| current.set(None));
}

/// Resolves the task owning the calling thread on bus `instance`.
///
/// Returns [`TaskId::UNKNOWN`] on threads that are not task threads of that bus.
pub(crate) fn current_task(instance: u64) -> TaskId {
    CURRENT_TASK.with(|current| match current.get() {
        Some((bound, task_id)) if bound == instance => task_id,
        _ => TaskId::UNKNOWN,
    })
}
