//! Demo workflows, handler table and worker layout.

use heddle_core::domain::QueueName;
use heddle_core::error::RegistryError;
use heddle_core::graph::MapperContext;
use heddle_core::{
    GraphBuilder, HandlerTable, InputMapper, RetryPolicy, TaskDefinition, TaskError, TaskGraph,
    WorkerSpec,
};
use serde_json::{Value, json};

use crate::activities::{Describe, RenderJoin, SayHello, SayHi};

pub const GREET_QUEUE: &str = "greet-queue";
pub const REACT_QUEUE: &str = "react-queue";
pub const PRODUCE_QUEUE: &str = "produce-queue";
pub const JOIN_QUEUE: &str = "join-queue";

pub const ALL_QUEUES: [&str; 4] = [GREET_QUEUE, REACT_QUEUE, PRODUCE_QUEUE, JOIN_QUEUE];

pub const HELLO: &str = "hello";
pub const FAN_IN: &str = "fan-in";

const SOURCES: [&str; 3] = ["A", "B", "C"];

/// `greet` → `react`; result is `"{greeting} {reaction}"`.
pub fn hello_workflow() -> Result<TaskGraph, heddle_core::error::GraphError> {
    GraphBuilder::new(HELLO)
        .task(TaskDefinition::new("greet", GREET_QUEUE).with_retry_policy(RetryPolicy::default()))
        .task(TaskDefinition::new("react", REACT_QUEUE).depends_on(["greet"]))
        .map_output(|ctx| {
            let greeting = ctx.require_str("greet")?;
            let reaction = ctx.require_str("react")?;
            Ok(json!(format!("{greeting} {reaction}")))
        })
        .build()
}

/// `A`, `B`, `C` → `D`.
///
/// Run input: `{"A": "...", "B": "...", "C": "...", "delays": {"A": ms, ...}}`.
pub fn fan_in_workflow() -> Result<TaskGraph, heddle_core::error::GraphError> {
    let mut builder = GraphBuilder::new(FAN_IN);
    for source in SOURCES {
        builder = builder.task(
            TaskDefinition::new(source, PRODUCE_QUEUE).map_input(move |ctx| describe_input(ctx, source)),
        );
    }
    builder
        .task(
            TaskDefinition::new("D", JOIN_QUEUE)
                .depends_on(SOURCES)
                .with_input_mapper(InputMapper::collect()),
        )
        .build()
}

fn describe_input(ctx: &MapperContext<'_>, source: &str) -> Result<Value, TaskError> {
    let input = ctx.input();
    let value = input
        .get(source)
        .and_then(Value::as_str)
        .ok_or_else(|| TaskError::permanent(format!("run input has no string for {source}")))?;
    let delay_ms = input
        .get("delays")
        .and_then(|d| d.get(source))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Ok(json!({ "source": source, "value": value, "delay_ms": delay_ms }))
}

pub fn workflows() -> Result<Vec<TaskGraph>, heddle_core::error::GraphError> {
    Ok(vec![hello_workflow()?, fan_in_workflow()?])
}

pub fn demo_handlers() -> Result<HandlerTable, RegistryError> {
    let mut table = HandlerTable::new();
    table.register_activity("greet", SayHello)?;
    table.register_activity("react", SayHi)?;
    for source in SOURCES {
        table.register_activity(source, Describe)?;
    }
    table.register_activity("D", RenderJoin)?;
    Ok(table)
}

/// Three workers: one per stage pair, plus a generalist.
pub fn demo_workers() -> Vec<WorkerSpec> {
    vec![
        WorkerSpec::new("worker-1", [GREET_QUEUE, REACT_QUEUE]),
        WorkerSpec::new("worker-2", [PRODUCE_QUEUE, JOIN_QUEUE]),
        WorkerSpec::new("worker-3", ALL_QUEUES),
    ]
}

/// Whether `spec` alone can run every task of `graph`.
pub fn covers(spec: &WorkerSpec, graph: &TaskGraph) -> bool {
    graph.queues().into_iter().all(|q| spec.subscribes_to(q))
}

pub fn all_queues() -> Vec<QueueName> {
    ALL_QUEUES.into_iter().map(QueueName::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use heddle_core::{HeddleBuilder, HeddleConfig, HeddleError};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn demo_app() -> (heddle_core::App, heddle_core::PoolHandle) {
        let mut builder = HeddleBuilder::new(HeddleConfig::default())
            .workers(demo_workers())
            .handlers(demo_handlers().unwrap());
        for graph in workflows().unwrap() {
            builder = builder.workflow(graph);
        }
        let app = builder.build().unwrap();
        let pool = app.start_pool().await.unwrap();
        (app, pool)
    }

    async fn execute(app: &heddle_core::App, workflow: &str, input: Value) -> Result<Value, HeddleError> {
        timeout(Duration::from_secs(5), app.orchestrator().execute(workflow, input))
            .await
            .expect("run did not finish in time")
    }

    #[tokio::test]
    async fn hello_even_reacts_with_hi() {
        let (app, pool) = demo_app().await;
        let out = execute(&app, HELLO, json!("World-42")).await.unwrap();
        assert_eq!(out, json!("Hello, World-42! hi"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn hello_odd_reacts_with_whats_up() {
        let (app, pool) = demo_app().await;
        let out = execute(&app, HELLO, json!("World-7")).await.unwrap();
        assert_eq!(out, json!("Hello, World-7! what's up"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn hello_without_digits_fails_permanently() {
        let (app, pool) = demo_app().await;
        let err = execute(&app, HELLO, json!("World")).await.unwrap_err();
        let HeddleError::Run(run_error) = err else {
            panic!("expected run error, got {err:?}");
        };
        assert_eq!(run_error.task, Some("react".into()));
        assert_eq!(run_error.attempts, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn fan_in_renders_in_declaration_order() {
        let (app, pool) = demo_app().await;
        // C finishes first, A last.
        let input = json!({
            "A": "apples",
            "B": "bananas",
            "C": "cherries",
            "delays": { "A": 60, "B": 30 }
        });
        let out = execute(&app, FAN_IN, input).await.unwrap();
        assert_eq!(
            out,
            json!("D received: apples from A, bananas from B, cherries from C")
        );
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_runs_do_not_interfere() {
        let (app, pool) = demo_app().await;
        let orchestrator = app.orchestrator();
        let runs: Vec<_> = (1..=6)
            .map(|i| orchestrator.submit(HELLO, json!(format!("World-{i}"))).unwrap())
            .collect();

        for (i, run_id) in runs.into_iter().enumerate() {
            let n = i + 1;
            let out = timeout(Duration::from_secs(5), orchestrator.await_run(run_id))
                .await
                .unwrap()
                .unwrap();
            let reaction = if n % 2 == 0 { "hi" } else { "what's up" };
            assert_eq!(out, json!(format!("Hello, World-{n}! {reaction}")));
        }
        pool.shutdown().await;
    }

    #[test]
    fn worker_coverage() {
        let hello = hello_workflow().unwrap();
        let workers = demo_workers();
        assert!(covers(&workers[0], &hello));
        assert!(!covers(&workers[1], &hello));
        assert!(covers(&workers[2], &fan_in_workflow().unwrap()));
    }
}
