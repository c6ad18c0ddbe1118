//! InMemoryQueueRegistry - プロセス内の名前付きキュー群
//!
//! # 実装詳細
//! - HashMap<QueueName, VecDeque<TaskInvocation>> を tokio Mutex で保護
//! - Notify で待機中の consumer を起こす（複数キュー購読のため notify_waiters）
//! - 容量付きキューは Semaphore で backpressure をかける

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{QueueName, TaskInvocation};
use crate::error::QueueError;
use crate::observability::QueueStats;
use crate::ports::TaskQueue;

struct NamedQueue {
    items: VecDeque<TaskInvocation>,
    /// Free slots. `None` = unbounded.
    space: Option<Arc<Semaphore>>,
}

impl NamedQueue {
    fn new(capacity: Option<usize>) -> Self {
        Self {
            items: VecDeque::new(),
            space: capacity.map(|n| Arc::new(Semaphore::new(n))),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    queues: HashMap<QueueName, NamedQueue>,
    closed: bool,
    /// Rotates the first queue a multi-queue dequeue looks at.
    cursor: usize,
}

impl RegistryState {
    fn queue_mut(&mut self, name: &QueueName, capacity: Option<usize>) -> &mut NamedQueue {
        self.queues
            .entry(name.clone())
            .or_insert_with(|| NamedQueue::new(capacity))
    }

    fn take(&mut self, queues: &[QueueName]) -> Option<TaskInvocation> {
        if queues.is_empty() {
            return None;
        }
        let start = self.cursor % queues.len();
        self.cursor = self.cursor.wrapping_add(1);
        for i in 0..queues.len() {
            let name = &queues[(start + i) % queues.len()];
            if let Some(queue) = self.queues.get_mut(name)
                && let Some(invocation) = queue.items.pop_front()
            {
                if let Some(space) = &queue.space {
                    space.add_permits(1);
                }
                return Some(invocation);
            }
        }
        None
    }
}

/// Named FIFO queues, created on first use.
///
/// ```ignore
/// let registry = InMemoryQueueRegistry::new();
/// registry.enqueue(invocation).await?;
/// let next = registry.dequeue(&[QueueName::new("greet-queue")], &cancel).await;
/// ```
pub struct InMemoryQueueRegistry {
    state: Mutex<RegistryState>,
    notify: Notify,
    capacity: Option<usize>,
}

impl Default for InMemoryQueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueueRegistry {
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// `Some(n)`: every queue holds at most `n` invocations; `enqueue` waits beyond that.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Wakes every waiting consumer with `None` and fails later enqueues.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            state.closed = true;
            for queue in state.queues.values() {
                if let Some(space) = &queue.space {
                    space.close();
                }
            }
        }
        self.notify.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            depths: state
                .queues
                .iter()
                .map(|(name, queue)| (name.clone(), queue.items.len()))
                .collect::<BTreeMap<_, _>>(),
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueueRegistry {
    async fn enqueue(&self, invocation: TaskInvocation) -> Result<(), QueueError> {
        let space = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(QueueError::Closed);
            }
            state
                .queue_mut(&invocation.queue, self.capacity)
                .space
                .clone()
        };

        // Backpressure: wait for a free slot outside the lock.
        if let Some(space) = space {
            let permit = space.acquire().await.map_err(|_| QueueError::Closed)?;
            permit.forget();
        }

        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(QueueError::Closed);
            }
            debug!(
                queue = %invocation.queue,
                run_id = %invocation.run_id,
                task = %invocation.task,
                attempt = invocation.attempt,
                "enqueued"
            );
            state
                .queue_mut(&invocation.queue, self.capacity)
                .items
                .push_back(invocation);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(
        &self,
        queues: &[QueueName],
        cancel: &CancellationToken,
    ) -> Option<TaskInvocation> {
        loop {
            // Register interest before checking, so a push in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if let Some(invocation) = state.take(queues) {
                    return Some(invocation);
                }
                if state.closed {
                    return None;
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    async fn try_dequeue(&self, queue: &QueueName) -> Option<TaskInvocation> {
        self.state
            .lock()
            .await
            .take(std::slice::from_ref(queue))
    }

    async fn depth(&self, queue: &QueueName) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |q| q.items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunId, TaskName};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn invocation(queue: &str, task: &str) -> TaskInvocation {
        TaskInvocation {
            run_id: RunId::generate(),
            task: TaskName::new(task),
            queue: QueueName::new(queue),
            attempt: 1,
            input: json!(null),
            timeout: Duration::from_secs(10),
        }
    }

    fn q(name: &str) -> QueueName {
        QueueName::new(name)
    }

    #[tokio::test]
    async fn fifo_per_queue() {
        let registry = InMemoryQueueRegistry::new();
        registry.enqueue(invocation("a", "first")).await.unwrap();
        registry.enqueue(invocation("a", "second")).await.unwrap();

        let cancel = CancellationToken::new();
        let first = registry.dequeue(&[q("a")], &cancel).await.unwrap();
        let second = registry.dequeue(&[q("a")], &cancel).await.unwrap();

        assert_eq!(first.task.as_str(), "first");
        assert_eq!(second.task.as_str(), "second");
        assert_eq!(registry.depth(&q("a")).await, 0);
    }

    #[tokio::test]
    async fn consumers_only_see_subscribed_queues() {
        let registry = InMemoryQueueRegistry::new();
        registry.enqueue(invocation("other", "x")).await.unwrap();

        assert!(registry.try_dequeue(&q("mine")).await.is_none());
        assert_eq!(registry.depth(&q("other")).await, 1);
    }

    #[tokio::test]
    async fn enqueue_wakes_waiting_consumer() {
        let registry = Arc::new(InMemoryQueueRegistry::new());
        let cancel = CancellationToken::new();

        let waiter = tokio::spawn({
            let registry = registry.clone();
            let cancel = cancel.clone();
            async move { registry.dequeue(&[q("greet-queue")], &cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.enqueue(invocation("greet-queue", "greet")).await.unwrap();

        let got = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(got.unwrap().task.as_str(), "greet");
    }

    #[tokio::test]
    async fn multi_queue_consumer_is_woken_by_any_queue() {
        let registry = Arc::new(InMemoryQueueRegistry::new());
        let cancel = CancellationToken::new();

        let waiter = tokio::spawn({
            let registry = registry.clone();
            let cancel = cancel.clone();
            async move { registry.dequeue(&[q("a"), q("b")], &cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.enqueue(invocation("b", "from-b")).await.unwrap();

        let got = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(got.unwrap().task.as_str(), "from-b");
    }

    #[tokio::test]
    async fn rotation_alternates_between_queues() {
        let registry = InMemoryQueueRegistry::new();
        for i in 0..2 {
            registry.enqueue(invocation("a", &format!("a{i}"))).await.unwrap();
            registry.enqueue(invocation("b", &format!("b{i}"))).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let queues = [q("a"), q("b")];
        let mut seen = Vec::new();
        for _ in 0..4 {
            let inv = registry.dequeue(&queues, &cancel).await.unwrap();
            seen.push(inv.queue.to_string());
        }

        assert_eq!(seen, vec!["a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn cancel_releases_waiter() {
        let registry = InMemoryQueueRegistry::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(registry.dequeue(&[q("a")], &cancel).await.is_none());
    }

    #[tokio::test]
    async fn close_wakes_waiters_and_rejects_enqueue() {
        let registry = Arc::new(InMemoryQueueRegistry::new());
        let cancel = CancellationToken::new();

        let waiter = tokio::spawn({
            let registry = registry.clone();
            let cancel = cancel.clone();
            async move { registry.dequeue(&[q("a")], &cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.close().await;

        let got = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(got.is_none());
        assert_eq!(
            registry.enqueue(invocation("a", "late")).await,
            Err(QueueError::Closed)
        );
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure() {
        let registry = Arc::new(InMemoryQueueRegistry::with_capacity(Some(1)));
        registry.enqueue(invocation("a", "one")).await.unwrap();

        let blocked = tokio::spawn({
            let registry = registry.clone();
            async move { registry.enqueue(invocation("a", "two")).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocked.is_finished());
        assert_eq!(registry.depth(&q("a")).await, 1);

        let first = registry.try_dequeue(&q("a")).await.unwrap();
        assert_eq!(first.task.as_str(), "one");

        timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(registry.depth(&q("a")).await, 1);
    }

    #[tokio::test]
    async fn stats_list_every_known_queue() {
        let registry = InMemoryQueueRegistry::new();
        registry.enqueue(invocation("a", "x")).await.unwrap();
        registry.enqueue(invocation("a", "y")).await.unwrap();
        registry.enqueue(invocation("b", "z")).await.unwrap();
        registry.try_dequeue(&q("b")).await;

        let stats = registry.stats().await;
        assert_eq!(stats.depths.get(&q("a")), Some(&2));
        assert_eq!(stats.depths.get(&q("b")), Some(&0));
        assert_eq!(stats.total(), 2);
    }
}
