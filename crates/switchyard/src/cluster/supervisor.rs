//! `ClusterSupervisor` - keeps a fixed pool of worker processes alive.
//!
//! - Spawns one worker per slot through a [`WorkerSpawner`]
//! - Replaces a worker that exits outside shutdown with exactly one new
//!   process in the same slot
//! - On shutdown, sends the sentinel to every live worker and completes once
//!   all of them have exited
//!
//! Workers that ignore the sentinel are never killed here. The supervisor
//! keeps logging a warning each grace period and leaves force-kill to the
//! host's process manager.
//!
//! Exit events carry the spawn generation of their slot, so an exit that
//! arrives after the slot was already respawned is ignored.

use super::process::{SpawnedWorker, WorkerControl, WorkerExit, WorkerSpawner};
use crate::errors::SwitchyardError;
use crate::observability::metrics;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the supervisor mailbox.
const SUPERVISOR_CHANNEL_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, still inside the startup window.
    Starting,
    /// Survived the startup window.
    Running,
    /// Shutdown sentinel sent.
    Exiting,
}

/// Public view of one live worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub id: usize,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub restart_count: u32,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub worker_count: usize,
    /// Interval between warnings about workers that ignore the sentinel.
    pub shutdown_grace: Duration,
    /// Delay before retrying a slot whose spawn failed.
    pub respawn_delay: Duration,
    /// How long a new worker stays `Starting`.
    pub startup_grace: Duration,
}

impl SupervisorConfig {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            shutdown_grace: Duration::from_secs(30),
            respawn_delay: Duration::from_secs(1),
            startup_grace: Duration::from_secs(1),
        }
    }
}

/// One worker exit, as seen by the exit observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExitEvent {
    pub worker_id: usize,
    pub pid: Option<u32>,
    pub exit: WorkerExit,
    /// True if the exit was expected because shutdown was in progress.
    pub during_shutdown: bool,
}

/// Observer invoked for every worker exit.
pub type ExitObserver = Arc<dyn Fn(&WorkerExitEvent) + Send + Sync>;

/// Returned when the supervisor completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    /// Replacement workers spawned over the supervisor's lifetime.
    pub restarts: u32,
    /// Workers that exited after shutdown started.
    pub shutdown_exits: usize,
    /// Of those, how many exited with code 0.
    pub graceful_exits: usize,
}

enum SupervisorMessage {
    Exited {
        slot: usize,
        generation: u64,
        exit: WorkerExit,
    },
    Promote {
        slot: usize,
        generation: u64,
    },
    Respawn {
        slot: usize,
    },
    Shutdown {
        respond_to: oneshot::Sender<bool>,
    },
    Workers {
        respond_to: oneshot::Sender<Vec<WorkerInfo>>,
    },
}

/// Handle to a running `ClusterSupervisor`.
#[derive(Clone, Debug)]
pub struct SupervisorHandle {
    sender: mpsc::Sender<SupervisorMessage>,
}

impl fmt::Debug for SupervisorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorMessage::Exited { slot, exit, .. } => {
                write!(f, "Exited({slot}, {:?})", exit.code)
            }
            SupervisorMessage::Promote { slot, .. } => write!(f, "Promote({slot})"),
            SupervisorMessage::Respawn { slot } => write!(f, "Respawn({slot})"),
            SupervisorMessage::Shutdown { .. } => f.write_str("Shutdown"),
            SupervisorMessage::Workers { .. } => f.write_str("Workers"),
        }
    }
}

impl SupervisorHandle {
    /// Start shutdown. Returns false if shutdown was already in progress.
    pub async fn shutdown(&self) -> Result<bool, SwitchyardError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|e| SwitchyardError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SwitchyardError::Internal(format!("response receive failed: {e}")))
    }

    /// Live workers, by slot.
    pub async fn workers(&self) -> Result<Vec<WorkerInfo>, SwitchyardError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorMessage::Workers { respond_to: tx })
            .await
            .map_err(|e| SwitchyardError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SwitchyardError::Internal(format!("response receive failed: {e}")))
    }
}

struct LiveWorker {
    pid: Option<u32>,
    state: WorkerState,
    control: Box<dyn WorkerControl>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    restart_count: u32,
    worker: Option<LiveWorker>,
}

/// The `ClusterSupervisor` implementation.
pub struct ClusterSupervisor {
    config: SupervisorConfig,
    spawner: Arc<dyn WorkerSpawner>,
    on_exit: Option<ExitObserver>,
    receiver: mpsc::Receiver<SupervisorMessage>,
    sender: mpsc::Sender<SupervisorMessage>,
    slots: BTreeMap<usize, Slot>,
    shutting_down: bool,
    report: SupervisorReport,
}

impl ClusterSupervisor {
    /// Spawn `config.worker_count` workers and supervise them.
    ///
    /// The returned task completes with a report once shutdown has finished
    /// and every worker has exited.
    pub fn start(
        config: SupervisorConfig,
        spawner: Arc<dyn WorkerSpawner>,
        on_exit: Option<ExitObserver>,
    ) -> (SupervisorHandle, JoinHandle<SupervisorReport>) {
        let (sender, receiver) = mpsc::channel(SUPERVISOR_CHANNEL_BUFFER);

        let supervisor = Self {
            config,
            spawner,
            on_exit,
            receiver,
            sender: sender.clone(),
            slots: BTreeMap::new(),
            shutting_down: false,
            report: SupervisorReport::default(),
        };

        let task = tokio::spawn(supervisor.run());
        (SupervisorHandle { sender }, task)
    }

    #[instrument(
        skip_all,
        name = "sy.cluster.supervisor",
        fields(workers = self.config.worker_count)
    )]
    async fn run(mut self) -> SupervisorReport {
        info!(
            target: "sy.cluster",
            workers = self.config.worker_count,
            "ClusterSupervisor started"
        );

        for slot in 0..self.config.worker_count {
            self.spawn_slot(slot);
        }

        let mut grace_deadline: Option<Instant> = None;

        loop {
            if self.shutting_down && self.live_count() == 0 {
                break;
            }

            let grace = async move {
                match grace_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                msg = self.receiver.recv() => {
                    // The supervisor holds a sender itself, so the channel never closes.
                    let Some(message) = msg else { break };
                    let started_shutdown = self.handle_message(message).await;
                    if started_shutdown {
                        grace_deadline = Some(Instant::now() + self.config.shutdown_grace);
                    }
                }

                () = grace => {
                    self.warn_stragglers();
                    grace_deadline = Some(Instant::now() + self.config.shutdown_grace);
                }
            }
        }

        metrics::set_workers_live(0);
        info!(
            target: "sy.cluster",
            restarts = self.report.restarts,
            shutdown_exits = self.report.shutdown_exits,
            graceful_exits = self.report.graceful_exits,
            "ClusterSupervisor stopped"
        );
        self.report
    }

    /// Handle a single message. Returns true if it started shutdown.
    async fn handle_message(&mut self, message: SupervisorMessage) -> bool {
        match message {
            SupervisorMessage::Exited {
                slot,
                generation,
                exit,
            } => {
                self.on_worker_exit(slot, generation, exit);
                false
            }

            SupervisorMessage::Promote { slot, generation } => {
                if let Some(worker) = self.current_worker(slot, generation) {
                    if worker.state == WorkerState::Starting {
                        worker.state = WorkerState::Running;
                        debug!(target: "sy.cluster", worker_id = slot, "Worker running");
                    }
                }
                false
            }

            SupervisorMessage::Respawn { slot } => {
                let vacant = self
                    .slots
                    .get(&slot)
                    .is_some_and(|entry| entry.worker.is_none());
                if !self.shutting_down && vacant {
                    self.spawn_slot(slot);
                }
                false
            }

            SupervisorMessage::Shutdown { respond_to } => {
                let started = self.begin_shutdown().await;
                let _ = respond_to.send(started);
                started
            }

            SupervisorMessage::Workers { respond_to } => {
                let _ = respond_to.send(self.workers());
                false
            }
        }
    }

    fn spawn_slot(&mut self, slot: usize) {
        let entry = self.slots.entry(slot).or_default();
        entry.generation += 1;
        let generation = entry.generation;

        match self.spawner.spawn(slot) {
            Ok(SpawnedWorker {
                pid,
                control,
                exited,
            }) => {
                entry.worker = Some(LiveWorker {
                    pid,
                    state: WorkerState::Starting,
                    control,
                });
                info!(
                    target: "sy.cluster",
                    worker_id = slot,
                    pid,
                    restart_count = entry.restart_count,
                    "Worker spawned"
                );

                let sender = self.sender.clone();
                tokio::spawn(async move {
                    let exit = exited.await;
                    let _ = sender
                        .send(SupervisorMessage::Exited {
                            slot,
                            generation,
                            exit,
                        })
                        .await;
                });

                let sender = self.sender.clone();
                let startup_grace = self.config.startup_grace;
                tokio::spawn(async move {
                    tokio::time::sleep(startup_grace).await;
                    let _ = sender
                        .send(SupervisorMessage::Promote { slot, generation })
                        .await;
                });
            }
            Err(e) => {
                entry.worker = None;
                error!(
                    target: "sy.cluster",
                    worker_id = slot,
                    error = %e,
                    retry_in = ?self.config.respawn_delay,
                    "Worker spawn failed"
                );

                let sender = self.sender.clone();
                let delay = self.config.respawn_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = sender.send(SupervisorMessage::Respawn { slot }).await;
                });
            }
        }

        metrics::set_workers_live(self.live_count());
    }

    fn on_worker_exit(&mut self, slot: usize, generation: u64, exit: WorkerExit) {
        let Some(entry) = self.slots.get_mut(&slot) else {
            return;
        };
        if entry.generation != generation {
            debug!(target: "sy.cluster", worker_id = slot, "Stale exit event ignored");
            return;
        }
        let Some(worker) = entry.worker.take() else {
            return;
        };

        metrics::record_worker_exit(exit.is_graceful());
        metrics::set_workers_live(self.live_count());

        let event = WorkerExitEvent {
            worker_id: slot,
            pid: worker.pid,
            exit,
            during_shutdown: self.shutting_down,
        };
        if let Some(observer) = &self.on_exit {
            observer(&event);
        }

        if self.shutting_down {
            self.report.shutdown_exits += 1;
            if exit.is_graceful() {
                self.report.graceful_exits += 1;
            }
            info!(
                target: "sy.cluster",
                worker_id = slot,
                pid = worker.pid,
                code = exit.code,
                remaining = self.live_count(),
                "Worker exited during shutdown"
            );
            return;
        }

        if exit.is_graceful() {
            warn!(
                target: "sy.cluster",
                worker_id = slot,
                pid = worker.pid,
                "Worker exited outside shutdown, replacing"
            );
        } else {
            let crash = SwitchyardError::WorkerCrash {
                worker_id: slot,
                code: exit.code,
            };
            error!(
                target: "sy.cluster",
                pid = worker.pid,
                error = %crash,
                "Replacing crashed worker"
            );
        }

        if let Some(entry) = self.slots.get_mut(&slot) {
            entry.restart_count += 1;
        }
        self.report.restarts += 1;
        metrics::record_worker_restart();
        self.spawn_slot(slot);
    }

    /// Returns false if shutdown had already started.
    async fn begin_shutdown(&mut self) -> bool {
        if self.shutting_down {
            debug!(target: "sy.cluster", "Shutdown already in progress");
            return false;
        }
        self.shutting_down = true;
        info!(
            target: "sy.cluster",
            live = self.live_count(),
            "Shutting down workers"
        );

        for (slot, entry) in &mut self.slots {
            let Some(worker) = entry.worker.as_mut() else {
                continue;
            };
            worker.state = WorkerState::Exiting;
            if let Err(e) = worker.control.send_shutdown().await {
                // The process is probably gone already; its exit event follows.
                warn!(
                    target: "sy.cluster",
                    worker_id = *slot,
                    error = %e,
                    "Failed to signal worker"
                );
            }
        }
        true
    }

    fn warn_stragglers(&self) {
        let pending: Vec<WorkerInfo> = self.workers();
        warn!(
            target: "sy.cluster",
            remaining = pending.len(),
            pids = ?pending.iter().map(|w| w.pid).collect::<Vec<_>>(),
            grace = ?self.config.shutdown_grace,
            "Workers still running after shutdown grace period"
        );
    }

    fn current_worker(&mut self, slot: usize, generation: u64) -> Option<&mut LiveWorker> {
        self.slots
            .get_mut(&slot)
            .filter(|entry| entry.generation == generation)
            .and_then(|entry| entry.worker.as_mut())
    }

    fn live_count(&self) -> usize {
        self.slots
            .values()
            .filter(|entry| entry.worker.is_some())
            .count()
    }

    fn workers(&self) -> Vec<WorkerInfo> {
        self.slots
            .iter()
            .filter_map(|(slot, entry)| {
                entry.worker.as_ref().map(|worker| WorkerInfo {
                    id: *slot,
                    pid: worker.pid,
                    state: worker.state,
                    restart_count: entry.restart_count,
                })
            })
            .collect()
    }
}
