//! Launchers - worker をどう起動・停止するか
//!
//! Supervisor は `WorkerLauncher` / `WorkerProcess` しか知りません。
//! - **InProcessLauncher**: tokio タスクとして `Worker` を動かす（停止 = cancel token、kill = abort）
//! - **CommandLauncher**: OS プロセスを起動する（停止 = stdin を閉じる、kill = SIGKILL）

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use super::worker::Worker;
use crate::domain::{WorkerId, WorkerSpec};
use crate::error::SupervisorError;
use crate::ports::{ResultSink, TaskQueue};
use crate::typed::HandlerTable;

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stopped on its own with success.
    Clean,
    /// Crashed, panicked or exited with failure.
    Crashed(String),
    /// Force-killed.
    Killed,
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Clean => f.write_str("clean exit"),
            WorkerExit::Crashed(detail) => write!(f, "crashed: {detail}"),
            WorkerExit::Killed => f.write_str("killed"),
        }
    }
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerProcess>, SupervisorError>;
}

/// Handle to one launched worker. Owned by the supervisor's monitor task.
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS pid, if the worker is a process.
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check.
    fn try_exit(&mut self) -> Option<WorkerExit>;

    /// Ask the worker to stop taking work and exit.
    fn request_stop(&mut self);

    async fn wait(&mut self) -> WorkerExit;

    async fn kill(&mut self) -> WorkerExit;
}

// ---------------------------------------------------------------------------
// In-process

/// Runs workers as tokio tasks sharing this process's queue and result router.
pub struct InProcessLauncher {
    queue: Arc<dyn TaskQueue>,
    results: Arc<dyn ResultSink>,
    handlers: Arc<HandlerTable>,
    overrides: HashMap<WorkerId, Arc<HandlerTable>>,
}

impl InProcessLauncher {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        results: Arc<dyn ResultSink>,
        handlers: Arc<HandlerTable>,
    ) -> Self {
        Self {
            queue,
            results,
            handlers,
            overrides: HashMap::new(),
        }
    }

    /// Gives one worker its own handler table instead of the shared one.
    pub fn with_handlers_for(mut self, worker: impl Into<WorkerId>, handlers: Arc<HandlerTable>) -> Self {
        self.overrides.insert(worker.into(), handlers);
        self
    }

    pub fn handlers_for(&self, worker: &WorkerId) -> &Arc<HandlerTable> {
        self.overrides.get(worker).unwrap_or(&self.handlers)
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerProcess>, SupervisorError> {
        let worker = Worker::new(
            spec.clone(),
            Arc::clone(self.handlers_for(&spec.id)),
            Arc::clone(&self.queue),
            Arc::clone(&self.results),
        );
        let stop = CancellationToken::new();
        let handle = tokio::spawn(worker.run(stop.clone()));
        Ok(Box::new(TaskWorker {
            handle,
            stop,
            exit: None,
        }))
    }
}

struct TaskWorker {
    handle: JoinHandle<()>,
    stop: CancellationToken,
    exit: Option<WorkerExit>,
}

fn join_exit(result: Result<(), JoinError>) -> WorkerExit {
    match result {
        Ok(()) => WorkerExit::Clean,
        Err(err) if err.is_cancelled() => WorkerExit::Killed,
        Err(err) => WorkerExit::Crashed(err.to_string()),
    }
}

#[async_trait]
impl WorkerProcess for TaskWorker {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn try_exit(&mut self) -> Option<WorkerExit> {
        if self.exit.is_none() && self.handle.is_finished() {
            // A JoinHandle must not be polled again once it has completed.
            self.exit = (&mut self.handle).now_or_never().map(join_exit);
        }
        self.exit.clone()
    }

    fn request_stop(&mut self) {
        self.stop.cancel();
    }

    async fn wait(&mut self) -> WorkerExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let exit = join_exit((&mut self.handle).await);
        self.exit = Some(exit.clone());
        exit
    }

    async fn kill(&mut self) -> WorkerExit {
        self.handle.abort();
        self.wait().await
    }
}

// ---------------------------------------------------------------------------
// OS process

/// Spawns `program args... <worker id> <queue>...` per worker.
///
/// The child's stdin is a pipe; closing it is the graceful stop request.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: OsString,
    args: Vec<OsString>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerProcess>, SupervisorError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(spec.id.as_str())
            .args(spec.queues.iter().map(|q| q.as_str()))
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Launch {
                worker: spec.id.clone(),
                source,
            })?;
        let stdin = child.stdin.take();
        Ok(Box::new(ChildWorker {
            child,
            stdin,
            exit: None,
        }))
    }
}

struct ChildWorker {
    child: Child,
    stdin: Option<ChildStdin>,
    exit: Option<WorkerExit>,
}

fn status_exit(status: ExitStatus) -> WorkerExit {
    if status.success() {
        WorkerExit::Clean
    } else {
        WorkerExit::Crashed(status.to_string())
    }
}

#[async_trait]
impl WorkerProcess for ChildWorker {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit(&mut self) -> Option<WorkerExit> {
        if self.exit.is_none() {
            self.exit = match self.child.try_wait() {
                Ok(Some(status)) => Some(status_exit(status)),
                Ok(None) => None,
                Err(err) => Some(WorkerExit::Crashed(err.to_string())),
            };
        }
        self.exit.clone()
    }

    fn request_stop(&mut self) {
        self.stdin.take();
    }

    async fn wait(&mut self) -> WorkerExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let exit = match self.child.wait().await {
            Ok(status) => status_exit(status),
            Err(err) => WorkerExit::Crashed(err.to_string()),
        };
        self.exit = Some(exit.clone());
        exit
    }

    async fn kill(&mut self) -> WorkerExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let exit = match self.child.kill().await {
            Ok(()) => WorkerExit::Killed,
            Err(err) => WorkerExit::Crashed(err.to_string()),
        };
        self.exit = Some(exit.clone());
        exit
    }
}
