//! Error types.
//!
//! - `TaskError`: 1 attempt の失敗。worker → orchestrator の境界を越えるので serde 対応。
//! - `RunError`: Failed になった run の結果。
//! - それ以外は構築時・起動時のエラー。

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::builder::BuildError;
use crate::domain::{RunId, TaskName, WorkerId};

/// Operational classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Worth retrying (network blip, flaky dependency).
    Transient,
    /// Did not finish within its start-to-close timeout.
    Timeout,
    /// Retrying cannot help (bad input, handler bug).
    Permanent,
    /// No handler for the task on the worker that took it. A wiring bug.
    Routing,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Routing => "routing",
        };
        f.write_str(s)
    }
}

/// Failure of a single task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    #[error("{message}")]
    Transient { message: String },

    #[error("attempt timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    #[error("{message}")]
    Permanent { message: String },

    #[error("worker {worker} has no handler for task `{task}`")]
    Routing { task: TaskName, worker: WorkerId },
}

impl TaskError {
    pub fn transient(message: impl Into<String>) -> Self {
        TaskError::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        TaskError::Permanent {
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        TaskError::Timeout { after }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Transient { .. } => ErrorKind::Transient,
            TaskError::Timeout { .. } => ErrorKind::Timeout,
            TaskError::Permanent { .. } => ErrorKind::Permanent,
            TaskError::Routing { .. } => ErrorKind::Routing,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Why a run ended Failed: the first terminal task failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    /// `None` when the output mapper failed rather than a task.
    pub task: Option<TaskName>,
    pub kind: ErrorKind,
    pub attempts: u32,
    pub message: String,
}

impl RunError {
    pub fn new(task: Option<TaskName>, error: &TaskError, attempts: u32) -> Self {
        Self {
            task,
            kind: error.kind(),
            attempts,
            message: error.to_string(),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.task {
            Some(task) => write!(
                f,
                "task `{task}` failed ({}) after {} attempt(s): {}",
                self.kind, self.attempts, self.message
            ),
            None => write!(f, "output mapping failed ({}): {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for RunError {}

/// Graph construction errors. Fatal: the graph never runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("graph `{0}` has no tasks")]
    Empty(String),

    #[error("task `{0}` is declared more than once")]
    DuplicateTask(TaskName),

    #[error("task `{0}` has a retry policy with max_attempts = 0")]
    InvalidRetryPolicy(TaskName),

    #[error("task `{task}` depends on unknown task `{dependency}`")]
    UnknownDependency { task: TaskName, dependency: TaskName },

    #[error("dependency cycle: {}", render_path(.path))]
    Cycle { path: Vec<TaskName> },
}

fn render_path(path: &[TaskName]) -> String {
    path.iter()
        .map(TaskName::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue registry is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a handler is already registered for task `{0}`")]
    AlreadyRegistered(TaskName),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to launch worker {worker}: {source}")]
    Launch {
        worker: WorkerId,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level error of the public API.
#[derive(Debug, Error)]
pub enum HeddleError {
    #[error("unknown workflow `{0}`")]
    UnknownWorkflow(String),

    #[error("workflow `{0}` is already registered")]
    DuplicateWorkflow(String),

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// The coordinator went away before the run reached a terminal state.
    #[error("run {0} was abandoned before finishing")]
    RunAbandoned(RunId),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}
