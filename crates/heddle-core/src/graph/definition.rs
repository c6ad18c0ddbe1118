//! Task definitions: the nodes of a graph.

use std::time::Duration;

use serde_json::Value;

use super::mapper::{InputMapper, MapperContext};
use crate::domain::{QueueName, TaskName};
use crate::error::TaskError;
use crate::policy::RetryPolicy;

/// Start-to-close timeout when none is given.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// One node of a task graph.
///
/// ```ignore
/// let react = TaskDefinition::new("react", "react-queue")
///     .depends_on(["greet"])
///     .with_timeout(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    name: TaskName,
    queue: QueueName,
    depends_on: Vec<TaskName>,
    input_mapper: InputMapper,
    retry_policy: RetryPolicy,
    timeout: Duration,
}

impl TaskDefinition {
    pub fn new(name: impl Into<TaskName>, queue: impl Into<QueueName>) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            depends_on: Vec::new(),
            input_mapper: InputMapper::default(),
            retry_policy: RetryPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Adds upstream tasks. Repeats are dropped; first occurrence keeps its position.
    pub fn depends_on<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskName>,
    {
        for task in tasks {
            let task = task.into();
            if !self.depends_on.contains(&task) {
                self.depends_on.push(task);
            }
        }
        self
    }

    pub fn with_input_mapper(mut self, mapper: InputMapper) -> Self {
        self.input_mapper = mapper;
        self
    }

    pub fn map_input<F>(self, f: F) -> Self
    where
        F: Fn(&MapperContext<'_>) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        self.with_input_mapper(InputMapper::from_fn(f))
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &TaskName {
        &self.name
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn dependencies(&self) -> &[TaskName] {
        &self.depends_on
    }

    pub fn input_mapper(&self) -> &InputMapper {
        &self.input_mapper
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
