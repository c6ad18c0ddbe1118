//! heddle-core
//!
//! Task graph orchestration: a workflow is a DAG of named tasks, each routed to a
//! named queue and executed by whichever worker subscribes to it. The orchestrator
//! owns retries, timeouts and joins; workers stay stateless.
//!
//! # モジュール構成
//! - **domain**: ids, names, run / task state
//! - **graph**: TaskDefinition, InputMapper / OutputMapper, TaskGraph（DAG 検証）
//! - **policy**: RetryPolicy, Backoff, attempt 実行（timeout + panic 捕捉）
//! - **ports**: TaskQueue, ResultSink
//! - **impls**: InMemoryQueueRegistry, ResultRouter
//! - **typed**: Activity trait, HandlerTable
//! - **app**: Orchestrator, Worker, Supervisor, HeddleBuilder
//! - **config** / **error** / **observability**

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod graph;
pub mod impls;
pub mod observability;
pub mod policy;
pub mod ports;
pub mod typed;

pub use app::{App, HeddleBuilder, Orchestrator, PoolHandle, Supervisor, Worker};
pub use config::{FailurePolicy, HeddleConfig};
pub use domain::{QueueName, RunId, RunReport, RunStatus, TaskName, TaskStatus, WorkerId, WorkerSpec};
pub use error::{ErrorKind, HeddleError, RunError, TaskError};
pub use graph::{GraphBuilder, InputMapper, OutputMapper, TaskDefinition, TaskGraph};
pub use policy::{Backoff, RetryPolicy};
pub use typed::{Activity, HandlerTable};
