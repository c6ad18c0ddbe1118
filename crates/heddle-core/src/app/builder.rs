//! HeddleBuilder - 構築とワイヤリング
//!
//! # 起動時検証（Fail-fast）
//! build() の時点で、各 workflow の全 task について
//! - task の queue を購読している worker がいるか
//! - その queue を購読している全 worker が task の handler を持っているか
//!
//! を確認します。満たさない構成は実行前に `BuildError` になります。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use thiserror::Error;

use super::launcher::InProcessLauncher;
use super::orchestrator::Orchestrator;
use super::supervisor::{PoolHandle, Supervisor};
use crate::config::HeddleConfig;
use crate::domain::{QueueName, TaskName, WorkerId, WorkerSpec};
use crate::error::{GraphError, HeddleError, SupervisorError};
use crate::graph::{GraphBuilder, TaskGraph};
use crate::impls::{InMemoryQueueRegistry, ResultRouter};
use crate::observability::QueueStats;
use crate::typed::HandlerTable;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("workflow `{workflow}`: no worker subscribes to queues {queues:?}")]
    UnsubscribedQueues {
        workflow: String,
        queues: Vec<QueueName>,
    },

    #[error("workflow `{workflow}`: some subscribed worker has no handler for tasks {tasks:?}")]
    UnhandledTasks {
        workflow: String,
        tasks: Vec<TaskName>,
    },

    #[error("workflow `{0}` is defined twice")]
    DuplicateWorkflow(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("registering workflow: {0}")]
    Register(#[source] Box<HeddleError>),
}

/// Wires queue registry, result router, orchestrator and worker launcher together.
///
/// ```ignore
/// let app = HeddleBuilder::new(config)
///     .workflow(hello_graph)
///     .handlers(table)
///     .build()?;
/// let pool = app.start_pool().await?;
/// let out = app.orchestrator().execute("hello", json!("World-42")).await?;
/// ```
pub struct HeddleBuilder {
    config: HeddleConfig,
    workflows: Vec<Result<TaskGraph, GraphError>>,
    handlers: HandlerTable,
    overrides: HashMap<WorkerId, HandlerTable>,
}

impl HeddleBuilder {
    pub fn new(config: HeddleConfig) -> Self {
        Self {
            config,
            workflows: Vec::new(),
            handlers: HandlerTable::new(),
            overrides: HashMap::new(),
        }
    }

    pub fn workflow(mut self, graph: TaskGraph) -> Self {
        self.workflows.push(Ok(graph));
        self
    }

    /// Like `workflow`, deferring graph validation errors to `build`.
    pub fn workflow_from(mut self, graph: GraphBuilder) -> Self {
        self.workflows.push(graph.build());
        self
    }

    /// Appends worker specs to the ones from the config.
    pub fn workers<I>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = WorkerSpec>,
    {
        self.config.workers.extend(specs);
        self
    }

    /// Handler table used by every worker without its own.
    pub fn handlers(mut self, table: HandlerTable) -> Self {
        self.handlers = table;
        self
    }

    pub fn handlers_for(mut self, worker: impl Into<WorkerId>, table: HandlerTable) -> Self {
        self.overrides.insert(worker.into(), table);
        self
    }

    pub fn build(mut self) -> Result<App, BuildError> {
        let graphs = std::mem::take(&mut self.workflows)
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        for graph in &graphs {
            self.check_routing(graph)?;
        }

        let queue = Arc::new(InMemoryQueueRegistry::with_capacity(self.config.queues.capacity));
        let router = Arc::new(ResultRouter::new());
        let orchestrator = Arc::new(Orchestrator::new(
            queue.clone(),
            router.clone(),
            self.config.orchestrator.clone(),
        ));
        for graph in graphs {
            orchestrator
                .register_workflow(graph)
                .map_err(|err| match err {
                    HeddleError::DuplicateWorkflow(name) => BuildError::DuplicateWorkflow(name),
                    other => BuildError::Register(Box::new(other)),
                })?;
        }

        let launcher = self.overrides.into_iter().fold(
            InProcessLauncher::new(queue.clone(), router.clone(), Arc::new(self.handlers)),
            |launcher, (worker, table)| launcher.with_handlers_for(worker, Arc::new(table)),
        );

        Ok(App {
            config: self.config,
            queue,
            router,
            orchestrator,
            launcher: Arc::new(launcher),
        })
    }

    fn handlers_of(&self, worker: &WorkerId) -> &HandlerTable {
        self.overrides.get(worker).unwrap_or(&self.handlers)
    }

    fn check_routing(&self, graph: &TaskGraph) -> Result<(), BuildError> {
        let unsubscribed: BTreeSet<QueueName> = graph
            .queues()
            .into_iter()
            .filter(|queue| !self.config.workers.iter().any(|w| w.subscribes_to(queue)))
            .cloned()
            .collect();
        if !unsubscribed.is_empty() {
            return Err(BuildError::UnsubscribedQueues {
                workflow: graph.name().to_string(),
                queues: unsubscribed.into_iter().collect(),
            });
        }

        let unhandled: Vec<TaskName> = graph
            .tasks()
            .iter()
            .filter(|def| {
                self.config
                    .workers
                    .iter()
                    .filter(|w| w.subscribes_to(def.queue()))
                    .any(|w| !self.handlers_of(&w.id).contains(def.name().as_str()))
            })
            .map(|def| def.name().clone())
            .collect();
        if !unhandled.is_empty() {
            return Err(BuildError::UnhandledTasks {
                workflow: graph.name().to_string(),
                tasks: unhandled,
            });
        }
        Ok(())
    }
}

/// A wired, validated instance. Workers are not running until `start_pool`.
pub struct App {
    config: HeddleConfig,
    queue: Arc<InMemoryQueueRegistry>,
    router: Arc<ResultRouter>,
    orchestrator: Arc<Orchestrator>,
    launcher: Arc<InProcessLauncher>,
}

impl App {
    pub fn config(&self) -> &HeddleConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn queue(&self) -> &Arc<InMemoryQueueRegistry> {
        &self.queue
    }

    pub fn router(&self) -> &Arc<ResultRouter> {
        &self.router
    }

    pub fn launcher(&self) -> &Arc<InProcessLauncher> {
        &self.launcher
    }

    /// Starts the configured workers in-process under a supervisor.
    pub async fn start_pool(&self) -> Result<PoolHandle, SupervisorError> {
        Supervisor::new(self.config.pool.clone())
            .start(self.config.workers.clone(), self.launcher.clone())
            .await
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    /// Closes the queues; idle workers return from `dequeue`.
    pub async fn close(&self) {
        self.queue.close().await;
    }
}
