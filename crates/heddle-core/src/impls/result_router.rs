//! ResultRouter - run ごとの応答チャネル
//!
//! Worker は `ResultSink::post` で応答を投げ、router が run_id を見て
//! その run の coordinator に転送します。終わった run 宛ての応答は捨てます。

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::{RunId, TaskResponse};
use crate::ports::ResultSink;

#[derive(Default)]
pub struct ResultRouter {
    runs: RwLock<HashMap<RunId, mpsc::UnboundedSender<TaskResponse>>>,
}

impl ResultRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the response channel for a run. Re-registering replaces the old channel.
    pub fn register(&self, run_id: RunId) -> mpsc::UnboundedReceiver<TaskResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.runs.write().unwrap().insert(run_id, tx);
        rx
    }

    pub fn unregister(&self, run_id: &RunId) {
        self.runs.write().unwrap().remove(run_id);
    }

    pub fn active_runs(&self) -> usize {
        self.runs.read().unwrap().len()
    }
}

impl ResultSink for ResultRouter {
    fn post(&self, response: TaskResponse) {
        let runs = self.runs.read().unwrap();
        match runs.get(&response.run_id) {
            Some(tx) => {
                if let Err(mpsc::error::SendError(response)) = tx.send(response) {
                    debug!(run_id = %response.run_id, task = %response.task, "run no longer listening");
                }
            }
            None => {
                debug!(
                    run_id = %response.run_id,
                    task = %response.task,
                    attempt = response.attempt,
                    "dropping response for unknown run"
                );
            }
        }
    }
}
