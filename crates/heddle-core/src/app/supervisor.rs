//! Worker pool supervisor.
//!
//! A single monitor task owns every worker handle (the process table). It:
//! - polls each handle every `poll_interval`
//! - relaunches a worker that exited, after `restart_backoff`, with the same spec
//!   (the backoff grows with consecutive short-lived runs and resets once a
//!   worker has stayed up for `stable_after`)
//! - serves `kill` / `shutdown` requests from the [`PoolHandle`]
//!
//! The orchestrator never hears about crashes from here. A task lost with its
//! worker is recovered by the orchestrator's own response deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use super::launcher::{WorkerLauncher, WorkerProcess};
use crate::config::PoolConfig;
use crate::domain::{WorkerId, WorkerSpec};
use crate::error::SupervisorError;
use crate::observability::{PoolStatus, WorkerStatus};
use crate::policy::Backoff;

/// Outcome of [`PoolHandle::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Exited within the grace period.
    pub graceful: usize,
    /// Force-killed after the grace period.
    pub killed: usize,
}

pub struct Supervisor {
    config: PoolConfig,
}

impl Supervisor {
    pub fn new(config: PoolConfig) -> Self {
        Self { config }
    }

    /// Launches one worker per spec and starts monitoring them.
    ///
    /// If any initial launch fails, the workers already started are killed.
    pub async fn start(
        &self,
        specs: Vec<WorkerSpec>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<PoolHandle, SupervisorError> {
        let mut slots = Vec::with_capacity(specs.len());
        for spec in specs {
            match launcher.launch(&spec).await {
                Ok(process) => {
                    info!(worker = %spec.id, pid = ?process.pid(), "worker launched");
                    slots.push(Slot::running(spec, process));
                }
                Err(err) => {
                    error!(worker = %spec.id, error = %err, "initial launch failed");
                    for slot in &mut slots {
                        if let Some(process) = slot.process.as_mut() {
                            process.kill().await;
                        }
                    }
                    return Err(err);
                }
            }
        }

        let (commands, command_rx) = mpsc::channel(16);
        let (status_tx, status) = watch::channel(snapshot(&slots));
        let monitor = Monitor {
            slots,
            launcher,
            config: self.config.clone(),
            commands: command_rx,
            status: status_tx,
        };
        let task = tokio::spawn(monitor.run());

        Ok(PoolHandle {
            commands,
            status,
            task,
        })
    }
}

enum Command {
    Kill {
        worker: WorkerId,
        ack: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<ShutdownReport>,
    },
}

/// Control surface of a running pool. Dropping it shuts the pool down.
pub struct PoolHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<PoolStatus>,
    task: JoinHandle<()>,
}

impl PoolHandle {
    pub fn status(&self) -> PoolStatus {
        self.status.borrow().clone()
    }

    pub fn live_count(&self) -> usize {
        self.status.borrow().live_count()
    }

    pub fn desired_count(&self) -> usize {
        self.status.borrow().desired_count()
    }

    /// Change notifications for the process table.
    pub fn watch(&self) -> watch::Receiver<PoolStatus> {
        self.status.clone()
    }

    /// Force-kills one worker. The monitor restarts it like any other crash.
    ///
    /// `false` if no such worker is currently running.
    pub async fn kill(&self, worker: &WorkerId) -> bool {
        let (ack, rx) = oneshot::channel();
        let command = Command::Kill {
            worker: worker.clone(),
            ack,
        };
        if self.commands.send(command).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Graceful stop for all, then kill whatever is left after `grace`.
    pub async fn shutdown(self) -> ShutdownReport {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_err() {
            return ShutdownReport::default();
        }
        let report = rx.await.unwrap_or_default();
        if let Err(err) = self.task.await {
            error!(error = %err, "pool monitor ended abnormally");
        }
        report
    }
}

/// One supervised worker. The slot outlives its processes; a relaunch swaps the
/// handle in place.
struct Slot {
    spec: WorkerSpec,
    process: Option<Box<dyn WorkerProcess>>,
    /// Lifetime relaunch count, as reported in `PoolStatus`.
    restarts: u32,
    /// Exits since the last run that lasted `stable_after`. Drives the backoff.
    crash_streak: u32,
    launched_at: Instant,
    /// Set while the slot is empty and waiting to be relaunched.
    restart_at: Option<Instant>,
}

impl Slot {
    fn running(spec: WorkerSpec, process: Box<dyn WorkerProcess>) -> Self {
        Self {
            spec,
            process: Some(process),
            restarts: 0,
            crash_streak: 0,
            launched_at: Instant::now(),
            restart_at: None,
        }
    }

    /// The process is gone. A run that lasted `stable_after` clears the streak.
    fn exited(&mut self, stable_after: Duration) {
        self.process = None;
        if self.launched_at.elapsed() >= stable_after {
            self.crash_streak = 0;
        }
    }
}

fn snapshot(slots: &[Slot]) -> PoolStatus {
    PoolStatus {
        workers: slots
            .iter()
            .map(|slot| WorkerStatus {
                id: slot.spec.id.clone(),
                pid: slot.process.as_ref().and_then(|p| p.pid()),
                alive: slot.process.is_some(),
                restarts: slot.restarts,
            })
            .collect(),
    }
}

fn schedule_restart(backoff: &Backoff, slot: &mut Slot) {
    slot.crash_streak = slot.crash_streak.saturating_add(1);
    slot.restart_at = Some(Instant::now() + backoff.delay(slot.crash_streak));
}

struct Monitor {
    slots: Vec<Slot>,
    launcher: Arc<dyn WorkerLauncher>,
    config: PoolConfig,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<PoolStatus>,
}

impl Monitor {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll().await,
                command = self.commands.recv() => match command {
                    Some(Command::Kill { worker, ack }) => {
                        let killed = self.kill(&worker).await;
                        self.publish();
                        let _ = ack.send(killed);
                    }
                    Some(Command::Shutdown { reply }) => {
                        let report = self.shutdown().await;
                        let _ = reply.send(report);
                        return;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
            }
            self.publish();
        }
    }

    fn publish(&self) {
        self.status.send_replace(snapshot(&self.slots));
    }

    async fn poll(&mut self) {
        for slot in &mut self.slots {
            if let Some(process) = slot.process.as_mut()
                && let Some(exit) = process.try_exit()
            {
                warn!(
                    worker = %slot.spec.id,
                    %exit,
                    uptime = ?slot.launched_at.elapsed(),
                    restarts = slot.restarts,
                    "worker exited unexpectedly"
                );
                slot.exited(self.config.stable_after);
                schedule_restart(&self.config.restart_backoff, slot);
            }

            let due = slot.restart_at.is_some_and(|at| at <= Instant::now());
            if slot.process.is_none() && due {
                match self.launcher.launch(&slot.spec).await {
                    Ok(process) => {
                        slot.restarts += 1;
                        slot.launched_at = Instant::now();
                        slot.restart_at = None;
                        info!(
                            worker = %slot.spec.id,
                            pid = ?process.pid(),
                            restarts = slot.restarts,
                            "worker restarted"
                        );
                        slot.process = Some(process);
                    }
                    Err(err) => {
                        error!(worker = %slot.spec.id, error = %err, "restart failed");
                        schedule_restart(&self.config.restart_backoff, slot);
                    }
                }
            }
        }
    }

    async fn kill(&mut self, worker: &WorkerId) -> bool {
        let Some(slot) = self
            .slots
            .iter_mut()
            .find(|slot| &slot.spec.id == worker && slot.process.is_some())
        else {
            return false;
        };

        if let Some(mut process) = slot.process.take() {
            let exit = process.kill().await;
            warn!(worker = %worker, %exit, "worker killed on request");
        }
        slot.exited(self.config.stable_after);
        schedule_restart(&self.config.restart_backoff, slot);
        true
    }

    async fn shutdown(&mut self) -> ShutdownReport {
        info!(workers = self.slots.len(), "shutting down worker pool");
        let deadline = Instant::now() + self.config.grace;
        let mut report = ShutdownReport::default();

        for slot in &mut self.slots {
            slot.restart_at = None;
            if let Some(process) = slot.process.as_mut() {
                process.request_stop();
            }
        }

        for slot in &mut self.slots {
            let Some(mut process) = slot.process.take() else {
                continue;
            };
            match tokio::time::timeout_at(deadline, process.wait()).await {
                Ok(exit) => {
                    info!(worker = %slot.spec.id, %exit, "worker stopped");
                    report.graceful += 1;
                }
                Err(_) => {
                    let exit = process.kill().await;
                    warn!(worker = %slot.spec.id, %exit, "worker did not stop in time, killed");
                    report.killed += 1;
                }
            }
        }

        self.publish();
        info!(graceful = report.graceful, killed = report.killed, "worker pool stopped");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::launcher::InProcessLauncher;
    use crate::impls::{InMemoryQueueRegistry, ResultRouter};
    use crate::typed::HandlerTable;
    use std::time::Duration;
    use tokio::time::timeout;

    fn fast_pool() -> PoolConfig {
        PoolConfig {
            poll_interval: Duration::from_millis(10),
            grace: Duration::from_millis(200),
            restart_backoff: Backoff::fixed(Duration::from_millis(20)),
            stable_after: Duration::from_secs(30),
        }
    }

    fn specs(n: usize) -> Vec<WorkerSpec> {
        (1..=n)
            .map(|i| WorkerSpec::new(format!("worker-{i}"), ["q"]))
            .collect()
    }

    fn in_process() -> Arc<dyn WorkerLauncher> {
        Arc::new(InProcessLauncher::new(
            Arc::new(InMemoryQueueRegistry::new()),
            Arc::new(ResultRouter::new()),
            Arc::new(HandlerTable::new()),
        ))
    }

    async fn wait_until(pool: &PoolHandle, pred: impl Fn(&PoolStatus) -> bool) {
        let mut rx = pool.watch();
        timeout(Duration::from_secs(5), rx.wait_for(|s| pred(s)))
            .await
            .expect("pool did not reach the expected state")
            .unwrap();
    }

    fn idle_slot(crash_streak: u32, uptime: Duration) -> Slot {
        Slot {
            spec: WorkerSpec::new("worker-1", ["q"]),
            process: None,
            restarts: 7,
            crash_streak,
            launched_at: Instant::now() - uptime,
            restart_at: None,
        }
    }

    #[test]
    fn restart_backoff_grows_with_crash_streak() {
        let backoff = Backoff::exponential(Duration::from_millis(100), 2.0, Duration::from_secs(10));
        let mut slot = idle_slot(2, Duration::from_millis(50));

        slot.exited(Duration::from_secs(30));
        let before = Instant::now();
        schedule_restart(&backoff, &mut slot);

        assert_eq!(slot.crash_streak, 3);
        assert!(slot.restart_at.unwrap() >= before + Duration::from_millis(400));
        assert_eq!(slot.restarts, 7);
    }

    #[test]
    fn stable_uptime_resets_restart_backoff() {
        let backoff = Backoff::exponential(Duration::from_millis(100), 2.0, Duration::from_secs(10));
        let mut slot = idle_slot(5, Duration::from_secs(60));

        slot.exited(Duration::from_secs(30));
        let before = Instant::now();
        schedule_restart(&backoff, &mut slot);

        assert_eq!(slot.crash_streak, 1);
        let at = slot.restart_at.unwrap();
        assert!(at >= before + Duration::from_millis(100));
        assert!(at < before + Duration::from_millis(400));
        // lifetime count is untouched
        assert_eq!(slot.restarts, 7);
    }

    #[tokio::test]
    async fn starts_one_worker_per_spec() {
        let pool = Supervisor::new(fast_pool())
            .start(specs(3), in_process())
            .await
            .unwrap();

        assert_eq!(pool.desired_count(), 3);
        assert_eq!(pool.live_count(), 3);
        assert_eq!(pool.status().restarts(), 0);

        let report = pool.shutdown().await;
        assert_eq!(report, ShutdownReport { graceful: 3, killed: 0 });
    }

    #[tokio::test]
    async fn killed_worker_is_replaced_once() {
        let pool = Supervisor::new(fast_pool())
            .start(specs(2), in_process())
            .await
            .unwrap();

        assert!(pool.kill(&"worker-1".into()).await);
        let status = pool.status();
        assert!(!status.worker("worker-1").unwrap().alive);

        wait_until(&pool, |s| s.live_count() == 2 && s.restarts() == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = pool.status();
        assert_eq!(status.live_count(), 2);
        assert_eq!(status.worker("worker-1").unwrap().restarts, 1);
        assert_eq!(status.worker("worker-2").unwrap().restarts, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn kill_of_unknown_worker_is_refused() {
        let pool = Supervisor::new(fast_pool())
            .start(specs(1), in_process())
            .await
            .unwrap();

        assert!(!pool.kill(&"worker-9".into()).await);
        assert_eq!(pool.live_count(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn failed_initial_launch_is_reported() {
        let launcher = Arc::new(crate::app::launcher::CommandLauncher::new(
            "/nonexistent/heddle-worker",
        ));
        let err = Supervisor::new(fast_pool())
            .start(specs(1), launcher)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SupervisorError::Launch { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crashing_process_is_restarted() {
        use crate::app::launcher::CommandLauncher;

        let launcher = Arc::new(CommandLauncher::new("sh").args(["-c", "sleep 0.05; exit 3"]));
        let pool = Supervisor::new(fast_pool())
            .start(specs(1), launcher)
            .await
            .unwrap();
        assert!(pool.status().workers[0].pid.is_some());

        wait_until(&pool, |s| s.restarts() >= 1).await;
        pool.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_kills_workers_that_ignore_stop() {
        use crate::app::launcher::CommandLauncher;

        let graceful = Arc::new(CommandLauncher::new("sh").args(["-c", "cat >/dev/null"]));
        let pool = Supervisor::new(fast_pool())
            .start(specs(2), graceful)
            .await
            .unwrap();
        assert_eq!(pool.shutdown().await, ShutdownReport { graceful: 2, killed: 0 });

        let stubborn = Arc::new(CommandLauncher::new("sh").args(["-c", "sleep 30"]));
        let pool = Supervisor::new(fast_pool())
            .start(specs(2), stubborn)
            .await
            .unwrap();
        let report = timeout(Duration::from_secs(5), pool.shutdown()).await.unwrap();
        assert_eq!(report, ShutdownReport { graceful: 0, killed: 2 });
    }
}
