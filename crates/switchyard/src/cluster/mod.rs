//! Process cluster: the primary's supervisor and the worker control channel.

mod process;
mod supervisor;

pub use process::{
    watch_for_shutdown_sentinel, ControlSignal, ProcessSpawner, SpawnedWorker, WorkerControl,
    WorkerExit, WorkerSpawner, SHUTDOWN_SENTINEL, WORKER_ID_ENV,
};
pub use supervisor::{
    ClusterSupervisor, ExitObserver, SupervisorConfig, SupervisorHandle, SupervisorReport,
    WorkerExitEvent, WorkerInfo, WorkerState,
};
