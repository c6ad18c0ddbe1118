use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{TaskInvocation, TaskResponse, WorkerId, WorkerSpec};
use crate::error::TaskError;
use crate::policy::execute_attempt;
use crate::ports::{ResultSink, TaskQueue};
use crate::typed::HandlerTable;

/// A stateless executor bound to a fixed set of queues and handlers.
///
/// - retry の判断はしない（orchestrator の仕事）
/// - shutdown 後は新しい invocation を取らない。実行中の handler は完了かタイムアウトまで走る
pub struct Worker {
    spec: WorkerSpec,
    handlers: Arc<HandlerTable>,
    queue: Arc<dyn TaskQueue>,
    results: Arc<dyn ResultSink>,
}

impl Worker {
    pub fn new(
        spec: WorkerSpec,
        handlers: Arc<HandlerTable>,
        queue: Arc<dyn TaskQueue>,
        results: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            spec,
            handlers,
            queue,
            results,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.spec.id
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    /// Dequeue → execute → report, until `shutdown` fires or the queue closes.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker = %self.spec.id, queues = ?self.spec.queues, "worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let Some(invocation) = self.queue.dequeue(&self.spec.queues, &shutdown).await else {
                break;
            };
            self.process(invocation).await;
        }
        info!(worker = %self.spec.id, "worker stopped");
    }

    async fn process(&self, invocation: TaskInvocation) {
        // No await before this point: Started must follow the dequeue immediately.
        self.results
            .post(TaskResponse::started(&invocation, &self.spec.id));
        debug!(
            worker = %self.spec.id,
            run_id = %invocation.run_id,
            task = %invocation.task,
            attempt = invocation.attempt,
            "dequeued"
        );

        let result = match self.handlers.get(invocation.task.as_str()) {
            Some(handler) => {
                execute_attempt(handler.as_ref(), invocation.input.clone(), invocation.timeout).await
            }
            None => {
                error!(
                    worker = %self.spec.id,
                    task = %invocation.task,
                    queue = %invocation.queue,
                    "no handler registered for task on this worker"
                );
                Err(TaskError::Routing {
                    task: invocation.task.clone(),
                    worker: self.spec.id.clone(),
                })
            }
        };

        match &result {
            Ok(_) => info!(
                worker = %self.spec.id,
                run_id = %invocation.run_id,
                task = %invocation.task,
                attempt = invocation.attempt,
                "task completed"
            ),
            Err(err) => warn!(
                worker = %self.spec.id,
                run_id = %invocation.run_id,
                task = %invocation.task,
                attempt = invocation.attempt,
                kind = %err.kind(),
                error = %err,
                "task failed"
            ),
        }

        self.results
            .post(TaskResponse::finished(&invocation, &self.spec.id, result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{QueueName, ResponseEvent, RunId, TaskName};
    use crate::impls::InMemoryQueueRegistry;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        responses: Mutex<Vec<TaskResponse>>,
    }

    impl ResultSink for Recorder {
        fn post(&self, response: TaskResponse) {
            self.responses.lock().unwrap().push(response);
        }
    }

    impl Recorder {
        fn events(&self) -> Vec<ResponseEvent> {
            self.responses
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.event.clone())
                .collect()
        }
    }

    fn invocation(task: &str, queue: &str, input: Value) -> TaskInvocation {
        TaskInvocation {
            run_id: RunId::generate(),
            task: TaskName::new(task),
            queue: QueueName::new(queue),
            attempt: 1,
            input,
            timeout: Duration::from_secs(1),
        }
    }

    async fn wait_for_events(recorder: &Recorder, n: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while recorder.events().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn setup(handlers: HandlerTable) -> (Worker, Arc<InMemoryQueueRegistry>, Arc<Recorder>) {
        let queue = Arc::new(InMemoryQueueRegistry::new());
        let recorder = Arc::new(Recorder::default());
        let worker = Worker::new(
            WorkerSpec::new("worker-1", ["greet-queue"]),
            Arc::new(handlers),
            queue.clone(),
            recorder.clone(),
        );
        (worker, queue, recorder)
    }

    #[tokio::test]
    async fn posts_started_then_finished() {
        let mut handlers = HandlerTable::new();
        handlers
            .register_fn("greet", |input| async move {
                Ok::<_, TaskError>(json!(format!("Hello, {}!", input.as_str().unwrap_or_default())))
            })
            .unwrap();
        let (worker, queue, recorder) = setup(handlers);

        queue
            .enqueue(invocation("greet", "greet-queue", json!("World-42")))
            .await
            .unwrap();
        let shutdown = CancellationToken::new();
        let join = tokio::spawn(worker.run(shutdown.clone()));

        wait_for_events(&recorder, 2).await;
        shutdown.cancel();
        join.await.unwrap();

        assert_eq!(
            recorder.events(),
            vec![
                ResponseEvent::Started,
                ResponseEvent::Finished(Ok(json!("Hello, World-42!")))
            ]
        );
        let responses = recorder.responses.lock().unwrap();
        assert!(responses.iter().all(|r| r.worker_id.as_str() == "worker-1"));
    }

    #[tokio::test]
    async fn missing_handler_is_a_routing_error() {
        let (worker, queue, recorder) = setup(HandlerTable::new());

        queue
            .enqueue(invocation("react", "greet-queue", json!("x")))
            .await
            .unwrap();
        let shutdown = CancellationToken::new();
        let join = tokio::spawn(worker.run(shutdown.clone()));

        wait_for_events(&recorder, 2).await;
        shutdown.cancel();
        join.await.unwrap();

        let events = recorder.events();
        let ResponseEvent::Finished(Err(err)) = &events[1] else {
            panic!("expected failure, got {events:?}");
        };
        assert_eq!(
            err,
            &TaskError::Routing {
                task: TaskName::new("react"),
                worker: WorkerId::new("worker-1"),
            }
        );
    }

    #[tokio::test]
    async fn shutdown_stops_an_idle_worker() {
        let (worker, _queue, recorder) = setup(HandlerTable::new());
        let shutdown = CancellationToken::new();
        let join = tokio::spawn(worker.run(shutdown.clone()));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), join)
            .await
            .unwrap()
            .unwrap();
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn ignores_queues_it_does_not_subscribe_to() {
        let (worker, queue, recorder) = setup(HandlerTable::new());
        queue
            .enqueue(invocation("D", "join-queue", json!([])))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let join = tokio::spawn(worker.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        join.await.unwrap();

        assert!(recorder.events().is_empty());
        assert_eq!(queue.depth(&QueueName::new("join-queue")).await, 1);
    }
}
