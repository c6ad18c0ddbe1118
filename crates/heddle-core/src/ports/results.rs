//! ResultSink port - worker → orchestrator の応答経路

use crate::domain::TaskResponse;

/// Where workers post `Started` / `Finished`.
///
/// `post` never blocks: a worker must be able to report `Started` right after
/// dequeue, with no suspension point in between.
pub trait ResultSink: Send + Sync {
    fn post(&self, response: TaskResponse);
}
