//! Run record and per-task instances.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::RunId;
use super::state::{RunStatus, TaskStatus};
use super::task::{TaskName, WorkerId};
use crate::error::{RunError, TaskError};

/// Execution state of one task within one run.
///
/// Transition methods refuse invalid moves: they leave the instance untouched and
/// return `false`.
#[derive(Debug, Clone)]
pub struct TaskInstance {
    pub status: TaskStatus,

    /// Number of attempts dispatched so far (including the current one while Dispatched).
    pub attempt: u32,

    /// Present iff Succeeded.
    pub result: Option<Value>,

    /// Present iff Failed.
    pub error: Option<TaskError>,

    /// Error of the previous attempt while a retry is pending.
    pub last_error: Option<TaskError>,

    /// Worker that reported Started for the current attempt.
    pub started_by: Option<WorkerId>,

    pub updated_at: Instant,
}

impl Default for TaskInstance {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskInstance {
    pub fn new() -> Self {
        Self {
            status: TaskStatus::Blocked,
            attempt: 0,
            result: None,
            error: None,
            last_error: None,
            started_by: None,
            updated_at: Instant::now(),
        }
    }

    pub fn mark_ready(&mut self) -> bool {
        self.transition(TaskStatus::Blocked, TaskStatus::Ready)
    }

    /// Ready -> Dispatched, starting a new attempt.
    pub fn mark_dispatched(&mut self) -> bool {
        if !self.transition(TaskStatus::Ready, TaskStatus::Dispatched) {
            return false;
        }
        self.attempt += 1;
        self.started_by = None;
        true
    }

    /// Records the worker of the current attempt. Status stays Dispatched.
    pub fn mark_started(&mut self, worker: WorkerId) -> bool {
        if self.status != TaskStatus::Dispatched {
            return false;
        }
        self.started_by = Some(worker);
        self.updated_at = Instant::now();
        true
    }

    pub fn mark_succeeded(&mut self, value: Value) -> bool {
        if !self.transition(TaskStatus::Dispatched, TaskStatus::Succeeded) {
            return false;
        }
        self.result = Some(value);
        self.last_error = None;
        true
    }

    /// Dispatched -> Ready; the next `mark_dispatched` starts attempt + 1.
    pub fn schedule_retry(&mut self, error: TaskError) -> bool {
        if !self.transition(TaskStatus::Dispatched, TaskStatus::Ready) {
            return false;
        }
        self.last_error = Some(error);
        self.started_by = None;
        true
    }

    pub fn mark_failed(&mut self, error: TaskError) -> bool {
        if !matches!(self.status, TaskStatus::Ready | TaskStatus::Dispatched) {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.last_error = None;
        self.updated_at = Instant::now();
        true
    }

    pub fn is_in_flight(&self) -> bool {
        self.status == TaskStatus::Dispatched
    }

    fn transition(&mut self, from: TaskStatus, to: TaskStatus) -> bool {
        if self.status != from {
            return false;
        }
        self.status = to;
        self.updated_at = Instant::now();
        true
    }
}

/// Everything known about one run. Owned by the run's coordinator.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: RunId,
    pub workflow: String,
    pub input: Value,
    pub status: RunStatus,

    /// Present iff Completed.
    pub result: Option<Value>,

    /// First terminal error. Present iff Failed.
    pub error: Option<RunError>,

    order: Vec<TaskName>,
    tasks: HashMap<TaskName, TaskInstance>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// Every task starts Blocked; `tasks` fixes the declaration order.
    pub fn new<I>(run_id: RunId, workflow: impl Into<String>, input: Value, tasks: I) -> Self
    where
        I: IntoIterator<Item = TaskName>,
    {
        let order: Vec<TaskName> = tasks.into_iter().collect();
        let tasks = order
            .iter()
            .map(|name| (name.clone(), TaskInstance::new()))
            .collect();
        let now = Utc::now();
        Self {
            run_id,
            workflow: workflow.into(),
            input,
            status: RunStatus::Pending,
            result: None,
            error: None,
            order,
            tasks,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn task(&self, name: &str) -> Option<&TaskInstance> {
        self.tasks.get(name)
    }

    pub fn task_mut(&mut self, name: &str) -> Option<&mut TaskInstance> {
        self.updated_at = Utc::now();
        self.tasks.get_mut(name)
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = (&TaskName, &TaskInstance)> {
        self.order
            .iter()
            .filter_map(|name| self.tasks.get(name).map(|task| (name, task)))
    }

    pub fn status_of(&self, name: &str) -> Option<TaskStatus> {
        self.task(name).map(|task| task.status)
    }

    pub fn result_of(&self, name: &str) -> Option<&Value> {
        self.task(name).and_then(|task| task.result.as_ref())
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.values().filter(|task| task.is_in_flight()).count()
    }

    /// Tasks waiting out a retry backoff.
    pub fn pending_retries(&self) -> usize {
        self.tasks
            .values()
            .filter(|task| task.status == TaskStatus::Ready && task.attempt > 0)
            .count()
    }

    /// Fails every task waiting out a retry backoff with the error of its last
    /// attempt. Returns the tasks it failed.
    pub fn fail_pending_retries(&mut self) -> Vec<TaskName> {
        let mut failed = Vec::new();
        for (name, task) in &mut self.tasks {
            if task.status != TaskStatus::Ready || task.attempt == 0 {
                continue;
            }
            let error = task
                .last_error
                .clone()
                .unwrap_or_else(|| TaskError::permanent("run ended before retry"));
            if task.mark_failed(error) {
                failed.push(name.clone());
            }
        }
        if !failed.is_empty() {
            self.updated_at = Utc::now();
        }
        failed
    }

    pub fn all_succeeded(&self) -> bool {
        self.tasks
            .values()
            .all(|task| task.status == TaskStatus::Succeeded)
    }

    pub fn mark_running(&mut self) -> bool {
        self.finish_if(RunStatus::Pending, RunStatus::Running)
    }

    pub fn mark_completed(&mut self, result: Value) -> bool {
        if !self.finish_if(RunStatus::Running, RunStatus::Completed) {
            return false;
        }
        self.result = Some(result);
        true
    }

    /// Only the first failure sticks.
    pub fn mark_failed(&mut self, error: RunError) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = RunStatus::Failed;
        self.error = Some(error);
        self.updated_at = Utc::now();
        true
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            run_id: self.run_id,
            workflow: self.workflow.clone(),
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
            tasks: self
                .tasks()
                .map(|(name, task)| TaskReport {
                    name: name.clone(),
                    status: task.status,
                    attempt: task.attempt,
                    started_by: task.started_by.clone(),
                    error: task.error.clone().or_else(|| task.last_error.clone()),
                })
                .collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn finish_if(&mut self, from: RunStatus, to: RunStatus) -> bool {
        if self.status != from {
            return false;
        }
        self.status = to;
        self.updated_at = Utc::now();
        true
    }
}

/// Read-only snapshot of a run, as handed out by `Orchestrator::run_report`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub workflow: String,
    pub status: RunStatus,
    pub result: Option<Value>,
    pub error: Option<RunError>,
    pub tasks: Vec<TaskReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunReport {
    pub fn task(&self, name: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|task| task.name.as_str() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub name: TaskName,
    pub status: TaskStatus,
    pub attempt: u32,
    pub started_by: Option<WorkerId>,
    pub error: Option<TaskError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn run_state() -> RunState {
        RunState::new(
            RunId::generate(),
            "hello",
            json!("World-42"),
            ["greet", "react"].map(TaskName::new),
        )
    }

    #[test]
    fn new_task_is_blocked_with_no_attempts() {
        let task = TaskInstance::new();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.attempt, 0);
    }

    #[test]
    fn dispatch_increments_attempt() {
        let mut task = TaskInstance::new();

        assert!(task.mark_ready());
        assert!(task.mark_dispatched());
        assert_eq!(task.attempt, 1);
        assert!(task.is_in_flight());

        assert!(task.schedule_retry(TaskError::transient("flaky")));
        assert_eq!(task.status, TaskStatus::Ready);
        assert!(task.last_error.is_some());

        assert!(task.mark_dispatched());
        assert_eq!(task.attempt, 2);
    }

    #[test]
    fn invalid_transitions_are_refused() {
        let mut task = TaskInstance::new();

        assert!(!task.mark_dispatched());
        assert!(!task.mark_succeeded(json!(1)));
        assert!(!task.mark_started(WorkerId::new("w")));
        assert!(!task.mark_failed(TaskError::permanent("x")));
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.attempt, 0);

        task.mark_ready();
        task.mark_dispatched();
        assert!(task.mark_succeeded(json!("ok")));
        assert!(!task.mark_succeeded(json!("again")));
        assert!(!task.schedule_retry(TaskError::transient("late")));
        assert_eq!(task.result, Some(json!("ok")));
    }

    #[test]
    fn result_and_error_are_exclusive() {
        let mut task = TaskInstance::new();
        task.mark_ready();
        task.mark_dispatched();
        task.mark_failed(TaskError::permanent("bad input"));

        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.result.is_none());
        assert_eq!(task.error.as_ref().map(TaskError::kind), Some(ErrorKind::Permanent));
    }

    #[test]
    fn run_keeps_declaration_order() {
        let run = run_state();
        let names: Vec<_> = run.tasks().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["greet", "react"]);
    }

    #[test]
    fn run_completes_once() {
        let mut run = run_state();

        assert!(!run.mark_completed(json!("early")));
        assert!(run.mark_running());
        assert!(run.mark_completed(json!("done")));
        assert!(!run.mark_failed(RunError::new(
            Some(TaskName::new("greet")),
            &TaskError::permanent("late"),
            1
        )));

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.result, Some(json!("done")));
        assert!(run.error.is_none());
    }

    #[test]
    fn first_failure_wins() {
        let mut run = run_state();
        run.mark_running();

        let first = RunError::new(Some(TaskName::new("greet")), &TaskError::permanent("one"), 1);
        let second = RunError::new(Some(TaskName::new("react")), &TaskError::permanent("two"), 1);
        assert!(run.mark_failed(first.clone()));
        assert!(!run.mark_failed(second));

        assert_eq!(run.error, Some(first));
    }

    #[test]
    fn report_mirrors_task_state() {
        let mut run = run_state();
        run.mark_running();
        {
            let greet = run.task_mut("greet").unwrap();
            greet.mark_ready();
            greet.mark_dispatched();
            greet.mark_started(WorkerId::new("worker-1"));
        }

        let report = run.report();
        assert_eq!(report.status, RunStatus::Running);

        let greet = report.task("greet").unwrap();
        assert_eq!(greet.status, TaskStatus::Dispatched);
        assert_eq!(greet.attempt, 1);
        assert_eq!(greet.started_by, Some(WorkerId::new("worker-1")));
        assert_eq!(report.task("react").unwrap().status, TaskStatus::Blocked);
        assert_eq!(run.in_flight(), 1);
    }

    #[test]
    fn pending_retries_fail_with_their_last_error() {
        let mut state = run_state();
        let greet = state.task_mut("greet").unwrap();
        greet.mark_ready();
        greet.mark_dispatched();
        greet.schedule_retry(TaskError::transient("connection reset"));
        state.task_mut("react").unwrap().mark_ready();
        assert_eq!(state.pending_retries(), 1);

        assert_eq!(state.fail_pending_retries(), vec![TaskName::new("greet")]);

        let greet = state.task("greet").unwrap();
        assert_eq!(greet.status, TaskStatus::Failed);
        assert_eq!(greet.error.as_ref().map(TaskError::kind), Some(ErrorKind::Transient));
        assert!(greet.last_error.is_none());
        // never dispatched, so not a retry
        assert_eq!(state.status_of("react"), Some(TaskStatus::Ready));
        assert_eq!(state.pending_retries(), 0);
    }
}
