//! HandlerTable - task 名 → handler の対応表
//!
//! Worker ごとに明示的に構築します（グローバルな登録はしません）。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use super::activity::Activity;
use super::handler::{DynHandler, TypedHandler, handler_fn};
use crate::domain::TaskName;
use crate::error::{RegistryError, TaskError};

#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<TaskName, Arc<dyn DynHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        task: impl Into<TaskName>,
        handler: Arc<dyn DynHandler>,
    ) -> Result<(), RegistryError> {
        let task = task.into();
        if self.handlers.contains_key(&task) {
            return Err(RegistryError::AlreadyRegistered(task));
        }
        self.handlers.insert(task, handler);
        Ok(())
    }

    pub fn register_activity<A: Activity>(
        &mut self,
        task: impl Into<TaskName>,
        activity: A,
    ) -> Result<(), RegistryError> {
        self.register(task, Arc::new(TypedHandler::new(activity)))
    }

    pub fn register_fn<F, Fut>(&mut self, task: impl Into<TaskName>, f: F) -> Result<(), RegistryError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.register(task, Arc::new(handler_fn(f)))
    }

    pub fn get(&self, task: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(task).cloned()
    }

    pub fn contains(&self, task: &str) -> bool {
        self.handlers.contains_key(task)
    }

    /// Sorted, for stable logs and error messages.
    pub fn task_names(&self) -> Vec<TaskName> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("tasks", &self.task_names())
            .finish()
    }
}
