//! Orchestrator - run の投入・待機・参照
//!
//! run ごとに coordinator タスクを 1 つ spawn し、RunState はそのタスクだけが持ちます。
//! 外からは watch チャネル経由の `RunReport` スナップショットだけが見えます。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{Instrument, debug, info, info_span};

use super::coordinator::Coordinator;
use crate::config::OrchestratorConfig;
use crate::domain::{RunId, RunReport, RunState, RunStatus};
use crate::error::HeddleError;
use crate::graph::TaskGraph;
use crate::impls::ResultRouter;
use crate::ports::TaskQueue;

pub struct Orchestrator {
    queue: Arc<dyn TaskQueue>,
    router: Arc<ResultRouter>,
    config: OrchestratorConfig,
    workflows: RwLock<HashMap<String, Arc<TaskGraph>>>,
    runs: Arc<RwLock<RunTable>>,
}

/// Report channels of live runs plus the most recent finished ones.
#[derive(Default)]
struct RunTable {
    reports: HashMap<RunId, watch::Receiver<RunReport>>,
    finished: VecDeque<RunId>,
}

impl RunTable {
    /// Records `run_id` as finished and forgets the oldest finished runs beyond `retain`.
    fn finish(&mut self, run_id: RunId, retain: usize) {
        self.finished.push_back(run_id);
        while self.finished.len() > retain {
            if let Some(evicted) = self.finished.pop_front() {
                self.reports.remove(&evicted);
                debug!(run_id = %evicted, "finished run evicted");
            }
        }
    }
}

impl Orchestrator {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        router: Arc<ResultRouter>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            queue,
            router,
            config,
            workflows: RwLock::new(HashMap::new()),
            runs: Arc::new(RwLock::new(RunTable::default())),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Makes `graph` submittable by name.
    pub fn register_workflow(&self, graph: TaskGraph) -> Result<Arc<TaskGraph>, HeddleError> {
        self.register_shared(Arc::new(graph))
    }

    pub fn register_shared(&self, graph: Arc<TaskGraph>) -> Result<Arc<TaskGraph>, HeddleError> {
        let mut workflows = self.workflows.write().unwrap();
        if workflows.contains_key(graph.name()) {
            return Err(HeddleError::DuplicateWorkflow(graph.name().to_string()));
        }
        workflows.insert(graph.name().to_string(), Arc::clone(&graph));
        Ok(graph)
    }

    pub fn workflow(&self, name: &str) -> Option<Arc<TaskGraph>> {
        self.workflows.read().unwrap().get(name).cloned()
    }

    /// Registered workflow names, sorted.
    pub fn workflow_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.workflows.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Starts a run of a registered workflow.
    pub fn submit(&self, workflow: &str, input: Value) -> Result<RunId, HeddleError> {
        let graph = self
            .workflow(workflow)
            .ok_or_else(|| HeddleError::UnknownWorkflow(workflow.to_string()))?;
        Ok(self.start_run(graph, input))
    }

    /// Starts a run of `graph` and returns at once. Needs a tokio runtime.
    pub fn start_run(&self, graph: Arc<TaskGraph>, input: Value) -> RunId {
        let run_id = RunId::generate();
        let state = RunState::new(run_id, graph.name(), input, graph.task_names().cloned());

        // Register before anything is dispatched so no response can miss the run.
        let responses = self.router.register(run_id);
        let (reports, report_rx) = watch::channel(state.report());
        self.runs.write().unwrap().reports.insert(run_id, report_rx);

        let span = info_span!("run", run_id = %run_id, workflow = %graph.name());
        let coordinator = Coordinator::new(
            graph,
            state,
            Arc::clone(&self.queue),
            responses,
            reports,
            self.config.clone(),
        );
        let router = Arc::clone(&self.router);
        let runs = Arc::clone(&self.runs);
        let retain = self.config.retain_finished;
        tokio::spawn(
            async move {
                coordinator.run().await;
                router.unregister(&run_id);
                runs.write().unwrap().finish(run_id, retain);
            }
            .instrument(span),
        );

        info!(run_id = %run_id, "run submitted");
        run_id
    }

    /// Waits for the run to finish. A failed run is `HeddleError::Run`.
    pub async fn await_run(&self, run_id: RunId) -> Result<Value, HeddleError> {
        let mut rx = self.receiver(run_id)?;
        let report = rx
            .wait_for(|report| report.status.is_terminal())
            .await
            .map_err(|_| HeddleError::RunAbandoned(run_id))?
            .clone();

        match report.status {
            RunStatus::Completed => report.result.ok_or(HeddleError::RunAbandoned(run_id)),
            _ => Err(report
                .error
                .map(HeddleError::Run)
                .unwrap_or(HeddleError::RunAbandoned(run_id))),
        }
    }

    /// Non-blocking snapshot. Finished runs stay visible until `retain_finished`
    /// newer runs have finished.
    pub fn run_report(&self, run_id: RunId) -> Result<RunReport, HeddleError> {
        Ok(self.receiver(run_id)?.borrow().clone())
    }

    /// Change notifications for one run.
    pub fn watch_run(&self, run_id: RunId) -> Result<watch::Receiver<RunReport>, HeddleError> {
        self.receiver(run_id)
    }

    /// `submit` + `await_run`.
    pub async fn execute(&self, workflow: &str, input: Value) -> Result<Value, HeddleError> {
        let run_id = self.submit(workflow, input)?;
        self.await_run(run_id).await
    }

    fn receiver(&self, run_id: RunId) -> Result<watch::Receiver<RunReport>, HeddleError> {
        self.runs
            .read()
            .unwrap()
            .reports
            .get(&run_id)
            .cloned()
            .ok_or(HeddleError::RunNotFound(run_id))
    }
}
