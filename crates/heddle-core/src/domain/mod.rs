//! Domain model (ids, names, payloads, run state).

pub mod ids;
pub mod run;
pub mod state;
pub mod task;

pub use ids::RunId;
pub use run::{RunReport, RunState, TaskInstance, TaskReport};
pub use state::{RunStatus, TaskStatus};
pub use task::{
    QueueName, ResponseEvent, TaskInvocation, TaskName, TaskResponse, WorkerId, WorkerSpec,
};
