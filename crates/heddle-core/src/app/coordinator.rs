//! Per-run coordinator: the single owner of a run's `RunState`.
//!
//! Event loop over two sources:
//! - worker responses routed to this run
//! - timers it armed itself (retry backoff, lost-attempt deadlines)
//!
//! Every state change is published as a `RunReport` on a watch channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{FailurePolicy, OrchestratorConfig};
use crate::domain::{
    ResponseEvent, RunReport, RunState, TaskInvocation, TaskName, TaskResponse, TaskStatus,
};
use crate::error::{RunError, TaskError};
use crate::graph::TaskGraph;
use crate::policy::Decision;
use crate::ports::TaskQueue;

#[derive(Debug)]
enum Timer {
    /// Backoff elapsed; dispatch `attempt`.
    RetryDue { task: TaskName, attempt: u32 },
    /// `attempt` was started but never finished in time.
    Deadline { task: TaskName, attempt: u32 },
}

pub(crate) struct Coordinator {
    graph: Arc<TaskGraph>,
    state: RunState,
    queue: Arc<dyn TaskQueue>,
    responses: mpsc::UnboundedReceiver<TaskResponse>,
    timers: JoinSet<Timer>,
    reports: watch::Sender<RunReport>,
    config: OrchestratorConfig,
    /// FailLate only: first terminal error, applied once nothing is in flight.
    first_failure: Option<RunError>,
}

impl Coordinator {
    pub(crate) fn new(
        graph: Arc<TaskGraph>,
        state: RunState,
        queue: Arc<dyn TaskQueue>,
        responses: mpsc::UnboundedReceiver<TaskResponse>,
        reports: watch::Sender<RunReport>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            graph,
            state,
            queue,
            responses,
            timers: JoinSet::new(),
            reports,
            config,
            first_failure: None,
        }
    }

    pub(crate) async fn run(mut self) {
        self.state.mark_running();
        info!(tasks = self.graph.len(), "run started");

        self.dispatch_ready().await;
        self.check_completion();
        self.publish();

        while !self.is_drained() {
            tokio::select! {
                response = self.responses.recv() => match response {
                    Some(response) => self.on_response(response).await,
                    None => break,
                },
                Some(joined) = self.timers.join_next(), if !self.timers.is_empty() => {
                    if let Ok(timer) = joined {
                        self.on_timer(timer).await;
                    }
                }
            }
            self.check_completion();
            self.publish();
        }
        debug!(status = %self.state.status, "coordinator exiting");
    }

    /// Terminal, and no started attempt is still owed a response.
    ///
    /// Invocations still sitting in a queue are not waited for; their responses are
    /// dropped by the router once this run is gone.
    fn is_drained(&self) -> bool {
        self.state.status.is_terminal()
            && !self
                .state
                .tasks()
                .any(|(_, task)| task.is_in_flight() && task.started_by.is_some())
    }

    fn may_dispatch(&self) -> bool {
        !self.state.status.is_terminal()
    }

    fn publish(&self) {
        self.reports.send_replace(self.state.report());
    }

    fn arm(&mut self, after: Duration, timer: Timer) {
        self.timers.spawn(async move {
            tokio::time::sleep(after).await;
            timer
        });
    }

    async fn dispatch_ready(&mut self) {
        let graph = Arc::clone(&self.graph);
        for task in graph.ready_nodes(&self.state) {
            if !self.may_dispatch() {
                break;
            }
            if let Some(instance) = self.state.task_mut(task.as_str()) {
                instance.mark_ready();
            }
            self.dispatch(task).await;
        }
    }

    /// Ready -> Dispatched: map the input, start a new attempt, enqueue.
    async fn dispatch(&mut self, task: &TaskName) {
        let graph = Arc::clone(&self.graph);
        let Some(def) = graph.task(task.as_str()) else {
            return;
        };

        let input = match graph.map_input(task.as_str(), &self.state) {
            Ok(input) => input,
            Err(err) => {
                error!(task = %task, error = %err, "input mapping failed");
                self.fail_task(task, err);
                return;
            }
        };

        let Some(instance) = self.state.task_mut(task.as_str()) else {
            return;
        };
        if !instance.mark_dispatched() {
            return;
        }
        let attempt = instance.attempt;

        let invocation = TaskInvocation {
            run_id: self.state.run_id,
            task: task.clone(),
            queue: def.queue().clone(),
            attempt,
            input,
            timeout: def.timeout(),
        };
        if let Err(err) = self.queue.enqueue(invocation).await {
            error!(task = %task, error = %err, "enqueue failed");
            self.fail_task(task, TaskError::permanent(format!("enqueue failed: {err}")));
            return;
        }
        debug!(task = %task, queue = %def.queue(), attempt, "dispatched");
    }

    async fn on_response(&mut self, response: TaskResponse) {
        let TaskResponse {
            task,
            attempt,
            worker_id,
            event,
            ..
        } = response;

        let Some(instance) = self.state.task(task.as_str()) else {
            debug!(task = %task, "response for unknown task");
            return;
        };
        if instance.attempt != attempt || !instance.is_in_flight() {
            debug!(
                task = %task,
                attempt,
                current = instance.attempt,
                status = %instance.status,
                "ignoring stale response"
            );
            return;
        }

        match event {
            ResponseEvent::Started => {
                if let Some(instance) = self.state.task_mut(task.as_str()) {
                    instance.mark_started(worker_id.clone());
                }
                let Some(timeout) = self.graph.task(task.as_str()).map(|def| def.timeout()) else {
                    return;
                };
                debug!(task = %task, attempt, worker = %worker_id, "started");
                self.arm(
                    timeout + self.config.response_grace,
                    Timer::Deadline { task, attempt },
                );
            }
            ResponseEvent::Finished(Ok(value)) => {
                if let Some(instance) = self.state.task_mut(task.as_str()) {
                    instance.mark_succeeded(value);
                }
                info!(task = %task, attempt, worker = %worker_id, "task succeeded");
                if self.may_dispatch() {
                    self.dispatch_ready().await;
                }
            }
            ResponseEvent::Finished(Err(err)) => self.on_failure(&task, attempt, err),
        }
    }

    async fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::RetryDue { task, attempt } => {
                let waiting = self.state.task(task.as_str()).is_some_and(|instance| {
                    instance.status == TaskStatus::Ready && instance.attempt + 1 == attempt
                });
                if waiting && self.may_dispatch() {
                    self.dispatch(&task).await;
                }
            }
            Timer::Deadline { task, attempt } => {
                let lost = self.state.task(task.as_str()).is_some_and(|instance| {
                    instance.is_in_flight() && instance.attempt == attempt
                });
                if !lost {
                    return;
                }
                let Some(timeout) = self.graph.task(task.as_str()).map(|def| def.timeout()) else {
                    return;
                };
                warn!(task = %task, attempt, "no response from worker, presuming attempt lost");
                self.on_failure(&task, attempt, TaskError::timeout(timeout));
            }
        }
    }

    fn on_failure(&mut self, task: &TaskName, attempt: u32, err: TaskError) {
        let Some(policy) = self.graph.task(task.as_str()).map(|def| *def.retry_policy()) else {
            return;
        };

        match policy.decide(attempt, &err) {
            Decision::Retry {
                next_attempt,
                delay,
            } if self.may_dispatch() => {
                warn!(
                    task = %task,
                    attempt,
                    next_attempt,
                    ?delay,
                    kind = %err.kind(),
                    error = %err,
                    "attempt failed, retry scheduled"
                );
                if let Some(instance) = self.state.task_mut(task.as_str()) {
                    instance.schedule_retry(err);
                }
                self.arm(
                    delay,
                    Timer::RetryDue {
                        task: task.clone(),
                        attempt: next_attempt,
                    },
                );
            }
            Decision::Retry { .. } => self.fail_task(task, err),
            Decision::Fail { reason } => {
                error!(task = %task, attempt, kind = %err.kind(), error = %err, %reason, "task failed");
                self.fail_task(task, err);
            }
        }
    }

    fn fail_task(&mut self, task: &TaskName, err: TaskError) {
        let Some(instance) = self.state.task_mut(task.as_str()) else {
            return;
        };
        let attempts = instance.attempt;
        instance.mark_failed(err.clone());
        let run_error = RunError::new(Some(task.clone()), &err, attempts);

        match self.config.failure_policy {
            FailurePolicy::FailFast => {
                if self.state.mark_failed(run_error) {
                    error!(task = %task, "run failed");
                    for abandoned in self.state.fail_pending_retries() {
                        warn!(task = %abandoned, "retry abandoned, run already failed");
                    }
                }
            }
            FailurePolicy::FailLate => {
                if self.first_failure.is_none() {
                    self.first_failure = Some(run_error);
                }
            }
        }
    }

    fn check_completion(&mut self) {
        if self.state.status.is_terminal() {
            return;
        }

        if self.state.all_succeeded() {
            match self.graph.map_output(&self.state) {
                Ok(result) => {
                    self.state.mark_completed(result);
                    info!("run completed");
                }
                Err(err) => {
                    error!(error = %err, "output mapping failed");
                    self.state.mark_failed(RunError::new(None, &err, 0));
                }
            }
            return;
        }

        // FailLate: fail once no branch can make progress.
        if let Some(run_error) = &self.first_failure
            && self.state.in_flight() == 0
            && self.state.pending_retries() == 0
        {
            let run_error = run_error.clone();
            if self.state.mark_failed(run_error) {
                error!("run failed after remaining branches settled");
            }
        }
    }
}
