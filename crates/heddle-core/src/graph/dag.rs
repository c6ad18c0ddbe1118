//! Validated task graph.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges are kept in sync
//! - Cycle detection is Kahn's algorithm (O(V + E)); the leftover nodes give the cycle.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;

use super::definition::TaskDefinition;
use super::mapper::{MapperContext, OutputMapper};
use crate::domain::{QueueName, RunState, TaskName, TaskStatus};
use crate::error::{GraphError, TaskError};

/// Index-based edge store. Node `i` is the i-th declared task.
#[derive(Debug, Clone, Default)]
struct DependencyGraph {
    /// Forward edges: task -> tasks it depends on (waits for)
    edges: Vec<Vec<usize>>,

    /// Reverse edges: task -> tasks that depend on it
    reverse_edges: Vec<Vec<usize>>,
}

impl DependencyGraph {
    fn with_nodes(n: usize) -> Self {
        Self {
            edges: vec![Vec::new(); n],
            reverse_edges: vec![Vec::new(); n],
        }
    }

    /// `task` waits for `depends_on`.
    fn add_dependency(&mut self, task: usize, depends_on: usize) {
        if self.edges[task].contains(&depends_on) {
            return;
        }
        self.edges[task].push(depends_on);
        self.reverse_edges[depends_on].push(task);
    }

    fn waiting_tasks(&self, task: usize) -> &[usize] {
        &self.reverse_edges[task]
    }

    /// Kahn's algorithm. Sources are taken in declaration order.
    ///
    /// `Err` carries the nodes that never reached in-degree 0: each sits on a cycle
    /// or downstream of one.
    fn topological_order(&self) -> Result<Vec<usize>, Vec<usize>> {
        let n = self.edges.len();
        let mut in_degree: Vec<usize> = self.edges.iter().map(Vec::len).collect();
        let mut ready: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(node) = ready.pop_front() {
            order.push(node);
            for &waiting in self.waiting_tasks(node) {
                in_degree[waiting] -= 1;
                if in_degree[waiting] == 0 {
                    ready.push_back(waiting);
                }
            }
        }

        if order.len() == n {
            Ok(order)
        } else {
            Err((0..n).filter(|&i| in_degree[i] > 0).collect())
        }
    }

    /// Extracts one cycle from Kahn's leftovers.
    ///
    /// Every leftover node still has a leftover dependency, so following those
    /// edges must revisit a node. The path is returned closed: `[a, b, a]` reads
    /// "a waits for b waits for a".
    fn find_cycle(&self, leftovers: &[usize]) -> Vec<usize> {
        let Some(&start) = leftovers.first() else {
            return Vec::new();
        };
        let mut path = vec![start];
        let mut position = HashMap::from([(start, 0)]);
        let mut current = start;

        loop {
            let Some(&next) = self.edges[current]
                .iter()
                .find(|&&dep| leftovers.contains(&dep))
            else {
                return Vec::new();
            };
            if let Some(&at) = position.get(&next) {
                let mut cycle = path.split_off(at);
                cycle.push(next);
                return cycle;
            }
            position.insert(next, path.len());
            path.push(next);
            current = next;
        }
    }
}

/// An immutable, validated DAG of task definitions.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    name: String,
    tasks: Vec<TaskDefinition>,
    index: HashMap<TaskName, usize>,
    deps: DependencyGraph,
    order: Vec<usize>,
    output: Option<OutputMapper>,
}

impl TaskGraph {
    pub fn builder(name: impl Into<String>) -> GraphBuilder {
        GraphBuilder::new(name)
    }

    /// Validates `tasks` and builds the graph. Checks, in order:
    /// non-empty, unique names, retry policies, known dependencies, acyclicity.
    pub fn build(
        name: impl Into<String>,
        tasks: Vec<TaskDefinition>,
        output: Option<OutputMapper>,
    ) -> Result<Self, GraphError> {
        let name = name.into();
        if tasks.is_empty() {
            return Err(GraphError::Empty(name));
        }

        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.name().clone(), i).is_some() {
                return Err(GraphError::DuplicateTask(task.name().clone()));
            }
        }

        if let Some(task) = tasks.iter().find(|t| t.retry_policy().max_attempts == 0) {
            return Err(GraphError::InvalidRetryPolicy(task.name().clone()));
        }

        let mut deps = DependencyGraph::with_nodes(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            for dependency in task.dependencies() {
                let Some(&j) = index.get(dependency) else {
                    return Err(GraphError::UnknownDependency {
                        task: task.name().clone(),
                        dependency: dependency.clone(),
                    });
                };
                deps.add_dependency(i, j);
            }
        }

        let order = deps.topological_order().map_err(|leftovers| GraphError::Cycle {
            path: deps
                .find_cycle(&leftovers)
                .into_iter()
                .map(|i| tasks[i].name().clone())
                .collect(),
        })?;

        Ok(Self {
            name,
            tasks,
            index,
            deps,
            order,
            output,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Definitions in declaration order.
    pub fn tasks(&self) -> &[TaskDefinition] {
        &self.tasks
    }

    pub fn task(&self, name: &str) -> Option<&TaskDefinition> {
        self.index.get(name).map(|&i| &self.tasks[i])
    }

    pub fn task_names(&self) -> impl Iterator<Item = &TaskName> {
        self.tasks.iter().map(TaskDefinition::name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks that list `name` as a dependency, in declaration order.
    pub fn dependents(&self, name: &str) -> Vec<&TaskName> {
        let Some(&i) = self.index.get(name) else {
            return Vec::new();
        };
        let mut waiting = self.deps.waiting_tasks(i).to_vec();
        waiting.sort_unstable();
        waiting.into_iter().map(|j| self.tasks[j].name()).collect()
    }

    /// Tasks nothing depends on.
    pub fn sinks(&self) -> Vec<&TaskName> {
        (0..self.tasks.len())
            .filter(|&i| self.deps.waiting_tasks(i).is_empty())
            .map(|i| self.tasks[i].name())
            .collect()
    }

    pub fn topological_order(&self) -> Vec<&TaskName> {
        self.order.iter().map(|&i| self.tasks[i].name()).collect()
    }

    /// Every queue the graph routes to, first use first.
    pub fn queues(&self) -> Vec<&QueueName> {
        let mut queues: Vec<&QueueName> = Vec::new();
        for task in &self.tasks {
            if !queues.contains(&task.queue()) {
                queues.push(task.queue());
            }
        }
        queues
    }

    /// Blocked tasks whose dependencies have all Succeeded, in declaration order.
    pub fn ready_nodes(&self, state: &RunState) -> Vec<&TaskName> {
        self.tasks
            .iter()
            .filter(|task| state.status_of(task.name().as_str()) == Some(TaskStatus::Blocked))
            .filter(|task| {
                task.dependencies()
                    .iter()
                    .all(|dep| state.status_of(dep.as_str()) == Some(TaskStatus::Succeeded))
            })
            .map(TaskDefinition::name)
            .collect()
    }

    /// Runs the task's input mapper over the run input and its dependencies' results.
    pub fn map_input(&self, task: &str, state: &RunState) -> Result<Value, TaskError> {
        let def = self
            .task(task)
            .ok_or_else(|| TaskError::permanent(format!("unknown task `{task}`")))?;
        let upstream = def
            .dependencies()
            .iter()
            .map(|dep| {
                state
                    .result_of(dep.as_str())
                    .map(|value| (dep, value))
                    .ok_or_else(|| TaskError::permanent(format!("no result from `{dep}`")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        def.input_mapper()
            .map(&MapperContext::new(&state.input, upstream))
    }

    /// Run result. Without an output mapper: the result of the last-declared sink.
    pub fn map_output(&self, state: &RunState) -> Result<Value, TaskError> {
        let upstream: Vec<_> = self
            .task_names()
            .filter_map(|name| state.result_of(name.as_str()).map(|value| (name, value)))
            .collect();
        let ctx = MapperContext::new(&state.input, upstream);
        match &self.output {
            Some(mapper) => mapper.map(&ctx),
            None => {
                let sinks = self.sinks();
                let last = sinks
                    .last()
                    .ok_or_else(|| TaskError::permanent("graph has no sink task"))?;
                ctx.require(last.as_str()).cloned()
            }
        }
    }
}

/// `GraphBuilder::new(name).task(..).task(..).build()`
#[derive(Debug)]
pub struct GraphBuilder {
    name: String,
    tasks: Vec<TaskDefinition>,
    output: Option<OutputMapper>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
            output: None,
        }
    }

    pub fn task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn output(mut self, mapper: OutputMapper) -> Self {
        self.output = Some(mapper);
        self
    }

    pub fn map_output<F>(self, f: F) -> Self
    where
        F: Fn(&MapperContext<'_>) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        self.output(OutputMapper::from_fn(f))
    }

    pub fn build(self) -> Result<TaskGraph, GraphError> {
        TaskGraph::build(self.name, self.tasks, self.output)
    }

    /// Shorthand for `Arc::new(builder.build()?)`.
    pub fn build_shared(self) -> Result<Arc<TaskGraph>, GraphError> {
        self.build().map(Arc::new)
    }
}
