//! Read-only status views.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{QueueName, WorkerId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub depths: BTreeMap<QueueName, usize>,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.depths.values().sum()
    }
}

/// One supervisor slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub alive: bool,
    pub restarts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub workers: Vec<WorkerStatus>,
}

impl PoolStatus {
    pub fn live_count(&self) -> usize {
        self.workers.iter().filter(|w| w.alive).count()
    }

    pub fn desired_count(&self) -> usize {
        self.workers.len()
    }

    pub fn restarts(&self) -> u32 {
        self.workers.iter().map(|w| w.restarts).sum()
    }

    pub fn worker(&self, id: &str) -> Option<&WorkerStatus> {
        self.workers.iter().find(|w| w.id.as_str() == id)
    }
}
