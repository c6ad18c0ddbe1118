//! Names and the payloads that travel between orchestrator and workers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::fmt;
use std::time::Duration;

use super::RunId;
use crate::error::TaskError;

macro_rules! name_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

name_type!(
    /// Name of a task in a graph. Also the key a worker's handler table is looked up by.
    TaskName
);

name_type!(
    /// Name of a queue. Tasks are routed to exactly one queue; workers subscribe to several.
    QueueName
);

name_type!(
    /// Stable worker identity. Survives restarts: a replacement gets the same id.
    WorkerId
);

/// Worker identity plus the queues it consumes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: WorkerId,
    pub queues: Vec<QueueName>,
}

impl WorkerSpec {
    pub fn new<I, Q>(id: impl Into<WorkerId>, queues: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<QueueName>,
    {
        Self {
            id: id.into(),
            queues: queues.into_iter().map(Into::into).collect(),
        }
    }

    pub fn subscribes_to(&self, queue: &QueueName) -> bool {
        self.queues.contains(queue)
    }
}

/// One attempt of one task, as placed on a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInvocation {
    pub run_id: RunId,
    pub task: TaskName,
    pub queue: QueueName,
    /// 1-indexed.
    pub attempt: u32,
    pub input: Value,
    /// Start-to-close limit the worker enforces.
    pub timeout: Duration,
}

/// What a worker reports about an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseEvent {
    Started,
    Finished(Result<Value, TaskError>),
}

/// Worker → orchestrator message, keyed by (run, task, attempt).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub run_id: RunId,
    pub task: TaskName,
    pub attempt: u32,
    pub worker_id: WorkerId,
    pub event: ResponseEvent,
}

impl TaskResponse {
    pub fn started(invocation: &TaskInvocation, worker_id: &WorkerId) -> Self {
        Self::for_invocation(invocation, worker_id, ResponseEvent::Started)
    }

    pub fn finished(
        invocation: &TaskInvocation,
        worker_id: &WorkerId,
        result: Result<Value, TaskError>,
    ) -> Self {
        Self::for_invocation(invocation, worker_id, ResponseEvent::Finished(result))
    }

    fn for_invocation(invocation: &TaskInvocation, worker_id: &WorkerId, event: ResponseEvent) -> Self {
        Self {
            run_id: invocation.run_id,
            task: invocation.task.clone(),
            attempt: invocation.attempt,
            worker_id: worker_id.clone(),
            event,
        }
    }
}
