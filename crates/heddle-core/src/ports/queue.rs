//! TaskQueue port - 名前付きキューへの配送
//!
//! # 設計原則
//! - キューは最初に使われたときに暗黙に作成される
//! - at-least-once: 取り出した invocation は購読中のいずれか 1 つの worker に届く
//! - ルーティングは静的（task 定義の queue だけで決まる）

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{QueueName, TaskInvocation};
use crate::error::QueueError;

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Appends to `invocation.queue`. Waits for space when the queue is bounded and full.
    async fn enqueue(&self, invocation: TaskInvocation) -> Result<(), QueueError>;

    /// Next invocation from any of `queues`. `None` once `cancel` fires or the queue
    /// is closed.
    async fn dequeue(
        &self,
        queues: &[QueueName],
        cancel: &CancellationToken,
    ) -> Option<TaskInvocation>;

    /// Non-blocking variant of `dequeue` for a single queue.
    async fn try_dequeue(&self, queue: &QueueName) -> Option<TaskInvocation>;

    async fn depth(&self, queue: &QueueName) -> usize;
}
