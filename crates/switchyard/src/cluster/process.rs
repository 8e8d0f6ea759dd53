//! Worker processes and the primary/worker control channel.
//!
//! The primary re-executes its own binary once per worker slot. The child
//! learns its slot from `SWITCHYARD_WORKER_ID` and listens on stdin for the
//! shutdown sentinel. It reports back only through its exit code: `0` for a
//! graceful shutdown, anything else is a crash.

use crate::errors::SwitchyardError;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tracing::{debug, warn};

/// Line written to a worker's stdin to request a graceful shutdown.
pub const SHUTDOWN_SENTINEL: &str = "shutdown";

/// Environment variable carrying the worker slot to the child process.
pub const WORKER_ID_ENV: &str = "SWITCHYARD_WORKER_ID";

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// `None` when the process was killed by a signal or could not be waited on.
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn is_graceful(self) -> bool {
        self.code == Some(0)
    }
}

/// Sends control messages to one running worker.
#[async_trait]
pub trait WorkerControl: Send {
    /// Deliver the shutdown sentinel.
    async fn send_shutdown(&mut self) -> Result<(), SwitchyardError>;
}

/// A freshly spawned worker.
pub struct SpawnedWorker {
    pub pid: Option<u32>,
    pub control: Box<dyn WorkerControl>,
    /// Resolves once the process has exited.
    pub exited: BoxFuture<'static, WorkerExit>,
}

/// Starts worker processes for the supervisor.
pub trait WorkerSpawner: Send + Sync {
    /// Start the worker for `slot`.
    ///
    /// # Errors
    ///
    /// `Spawn` if the process could not be started.
    fn spawn(&self, slot: usize) -> Result<SpawnedWorker, SwitchyardError>;
}

/// Spawns workers as child OS processes.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-execute the running binary, forwarding its arguments.
    ///
    /// # Errors
    ///
    /// `Spawn` if the path of the running binary is unavailable.
    pub fn current_exe() -> Result<Self, SwitchyardError> {
        let program = std::env::current_exe()
            .map_err(|e| SwitchyardError::Spawn(format!("cannot locate current executable: {e}")))?;
        Ok(Self::new(program).args(std::env::args_os().skip(1)))
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, slot: usize) -> Result<SpawnedWorker, SwitchyardError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(WORKER_ID_ENV, slot.to_string())
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| {
                SwitchyardError::Spawn(format!(
                    "failed to spawn worker {slot} ({}): {e}",
                    self.program.display()
                ))
            })?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SwitchyardError::Spawn("worker stdin was not piped".to_string()))?;
        debug!(target: "sy.cluster", worker_id = slot, pid, "Worker process spawned");

        let exited = async move {
            match child.wait().await {
                Ok(status) => WorkerExit {
                    code: status.code(),
                },
                Err(e) => {
                    warn!(
                        target: "sy.cluster",
                        worker_id = slot,
                        error = %e,
                        "Waiting on worker failed"
                    );
                    WorkerExit { code: None }
                }
            }
        }
        .boxed();

        Ok(SpawnedWorker {
            pid,
            control: Box::new(StdinControl { stdin: Some(stdin) }),
            exited,
        })
    }
}

/// Writes the sentinel to the child's stdin, then closes it.
struct StdinControl {
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl WorkerControl for StdinControl {
    async fn send_shutdown(&mut self) -> Result<(), SwitchyardError> {
        let mut stdin = self
            .stdin
            .take()
            .ok_or_else(|| SwitchyardError::Spawn("shutdown already sent".to_string()))?;
        let line = format!("{SHUTDOWN_SENTINEL}\n");
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SwitchyardError::Spawn(format!("failed to signal worker: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| SwitchyardError::Spawn(format!("failed to signal worker: {e}")))?;
        Ok(())
    }
}

/// What ended a worker's wait on its control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// The primary sent the shutdown sentinel.
    Shutdown,
    /// The control channel closed without a sentinel.
    ParentGone,
}

/// Worker side: wait for the sentinel line on `reader` (stdin).
///
/// Other lines are ignored.
pub async fn watch_for_shutdown_sentinel<R>(reader: R) -> ControlSignal
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim() == SHUTDOWN_SENTINEL => return ControlSignal::Shutdown,
            Ok(Some(line)) => {
                debug!(target: "sy.cluster", line = %line.trim(), "Ignoring control line");
            }
            Ok(None) => return ControlSignal::ParentGone,
            Err(e) => {
                warn!(target: "sy.cluster", error = %e, "Control channel read failed");
                return ControlSignal::ParentGone;
            }
        }
    }
}
