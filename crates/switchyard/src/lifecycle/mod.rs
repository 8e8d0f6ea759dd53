//! Worker lifecycle phases and hooks.
//!
//! Phases only move forward:
//!
//! ```text
//! CREATED -> INITIALIZING -> STARTING -> RUNNING -> STOPPING -> STOPPED
//! ```
//!
//! `initialize`, `start` and `ready` each advance exactly one phase and run
//! that phase's hooks in registration order. `shutdown` may be called from any
//! phase and is idempotent. It runs, under one deadline:
//!
//! 1. before-shutdown hooks, in registration order
//! 2. cancellation of the coordinator token and abort of tracked tasks
//! 3. disposal of tracked resources, most recent first
//! 4. shutdown hooks, most recent first
//!
//! If the deadline passes, remaining work is abandoned in place and the
//! phase still becomes STOPPED.

mod hooks;

pub use hooks::{Disposable, HookHandle, HookKind};

use crate::observability::metrics;
use futures::FutureExt;
use hooks::{HookFn, HookTable};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecyclePhase {
    Created,
    Initializing,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl LifecyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecyclePhase::Created => "CREATED",
            LifecyclePhase::Initializing => "INITIALIZING",
            LifecyclePhase::Starting => "STARTING",
            LifecyclePhase::Running => "RUNNING",
            LifecyclePhase::Stopping => "STOPPING",
            LifecyclePhase::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        from: LifecyclePhase,
        to: LifecyclePhase,
    },

    #[error("{kind} hook #{index} failed: {message}")]
    HookFailed {
        kind: HookKind,
        index: usize,
        message: String,
    },

    #[error("disposing {name} failed: {message}")]
    DisposeFailed { name: String, message: String },

    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Outcome of one startup phase.
#[derive(Debug)]
pub struct PhaseReport {
    pub phase: LifecyclePhase,
    pub hooks_run: usize,
    pub errors: Vec<LifecycleError>,
}

impl PhaseReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Outcome of [`LifecycleCoordinator::shutdown`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub errors: Vec<LifecycleError>,
    pub timed_out: bool,
    pub elapsed: Duration,
    /// Another call already ran (or is running) the shutdown sequence.
    pub already_stopping: bool,
}

struct Inner {
    phase: watch::Sender<LifecyclePhase>,
    hooks: Mutex<HookTable>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    disposables: Mutex<Vec<Arc<dyn Disposable>>>,
    cancel_token: CancellationToken,
    shutdown_timeout: Duration,
}

/// Phase state machine with ordered hooks. Clone to share.
#[derive(Clone)]
pub struct LifecycleCoordinator {
    inner: Arc<Inner>,
}

impl LifecycleCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (phase, _) = watch::channel(LifecyclePhase::Created);
        Self {
            inner: Arc::new(Inner {
                phase,
                hooks: Mutex::new(HookTable::default()),
                tasks: Mutex::new(Vec::new()),
                disposables: Mutex::new(Vec::new()),
                cancel_token: CancellationToken::new(),
                shutdown_timeout,
            }),
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        *self.inner.phase.borrow()
    }

    /// Watch phase changes.
    pub fn subscribe(&self) -> watch::Receiver<LifecyclePhase> {
        self.inner.phase.subscribe()
    }

    /// Token cancelled when shutdown begins.
    pub fn child_token(&self) -> CancellationToken {
        self.inner.cancel_token.child_token()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.inner.shutdown_timeout
    }

    // -------------------------------------------------------------------------
    // Hook registration
    // -------------------------------------------------------------------------

    pub fn on_init<F, Fut>(&self, hook: F) -> HookHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(HookKind::Init, hook)
    }

    pub fn on_start<F, Fut>(&self, hook: F) -> HookHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(HookKind::Start, hook)
    }

    pub fn on_ready<F, Fut>(&self, hook: F) -> HookHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(HookKind::Ready, hook)
    }

    pub fn on_before_shutdown<F, Fut>(&self, hook: F) -> HookHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(HookKind::BeforeShutdown, hook)
    }

    pub fn on_shutdown<F, Fut>(&self, hook: F) -> HookHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(HookKind::Shutdown, hook)
    }

    fn register<F, Fut>(&self, kind: HookKind, hook: F) -> HookHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let hook: HookFn = Arc::new(move || hook().boxed());
        let id = self.lock_hooks().insert(kind, hook);
        HookHandle::new(id, kind, Arc::downgrade(&self.inner))
    }

    /// Abort `task` during shutdown.
    pub fn track_task(&self, task: JoinHandle<()>) {
        lock(&self.inner.tasks).push(task);
    }

    /// Dispose `resource` during shutdown.
    pub fn track_disposable(&self, resource: Arc<dyn Disposable>) {
        lock(&self.inner.disposables).push(resource);
    }

    // -------------------------------------------------------------------------
    // Phases
    // -------------------------------------------------------------------------

    /// CREATED -> INITIALIZING, then init hooks.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` when called out of order.
    pub async fn initialize(&self) -> Result<PhaseReport, LifecycleError> {
        self.advance(LifecyclePhase::Created, LifecyclePhase::Initializing, HookKind::Init)
            .await
    }

    /// INITIALIZING -> STARTING, then start hooks.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` when called out of order.
    pub async fn start(&self) -> Result<PhaseReport, LifecycleError> {
        self.advance(LifecyclePhase::Initializing, LifecyclePhase::Starting, HookKind::Start)
            .await
    }

    /// STARTING -> RUNNING, then ready hooks.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` when called out of order.
    pub async fn ready(&self) -> Result<PhaseReport, LifecycleError> {
        self.advance(LifecyclePhase::Starting, LifecyclePhase::Running, HookKind::Ready)
            .await
    }

    async fn advance(
        &self,
        from: LifecyclePhase,
        to: LifecyclePhase,
        kind: HookKind,
    ) -> Result<PhaseReport, LifecycleError> {
        self.transition(from, to)?;
        info!(target: "sy.lifecycle", phase = %to, "Lifecycle phase entered");

        let hooks = self.lock_hooks().snapshot(kind);
        let mut errors = Vec::new();
        run_hooks(kind, hooks.iter(), &mut errors).await;

        Ok(PhaseReport {
            phase: to,
            hooks_run: hooks.len(),
            errors,
        })
    }

    fn transition(&self, from: LifecyclePhase, to: LifecyclePhase) -> Result<(), LifecycleError> {
        let mut result = Ok(());
        self.inner.phase.send_if_modified(|current| {
            if *current == from {
                *current = to;
                true
            } else {
                result = Err(LifecycleError::InvalidTransition { from: *current, to });
                false
            }
        });
        result
    }

    /// Run the shutdown sequence under the configured deadline.
    ///
    /// Only the first call does any work; later calls return a report with
    /// `already_stopping` set.
    #[instrument(skip_all, name = "lifecycle_shutdown")]
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut previous = None;
        self.inner.phase.send_if_modified(|current| {
            if *current >= LifecyclePhase::Stopping {
                false
            } else {
                previous = Some(*current);
                *current = LifecyclePhase::Stopping;
                true
            }
        });
        let Some(previous) = previous else {
            debug!(target: "sy.lifecycle", "Shutdown already in progress");
            return ShutdownReport {
                already_stopping: true,
                ..ShutdownReport::default()
            };
        };

        info!(target: "sy.lifecycle", from = %previous, "Shutdown started");
        let started = Instant::now();
        let timeout = self.inner.shutdown_timeout;
        let mut errors = Vec::new();

        let timed_out = tokio::time::timeout(timeout, self.run_shutdown_sequence(&mut errors))
            .await
            .is_err();
        if timed_out {
            warn!(target: "sy.lifecycle", timeout_ms = timeout.as_millis(), "Shutdown timed out");
            errors.push(LifecycleError::ShutdownTimeout(timeout));
        }

        self.inner.phase.send_replace(LifecyclePhase::Stopped);
        let elapsed = started.elapsed();
        metrics::record_lifecycle_shutdown(elapsed, timed_out);
        info!(
            target: "sy.lifecycle",
            elapsed_ms = elapsed.as_millis(),
            errors = errors.len(),
            timed_out,
            "Lifecycle stopped"
        );

        ShutdownReport {
            errors,
            timed_out,
            elapsed,
            already_stopping: false,
        }
    }

    async fn run_shutdown_sequence(&self, errors: &mut Vec<LifecycleError>) {
        let before = self.lock_hooks().snapshot(HookKind::BeforeShutdown);
        run_hooks(HookKind::BeforeShutdown, before.iter(), errors).await;

        self.inner.cancel_token.cancel();
        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        for task in &tasks {
            task.abort();
        }
        debug!(target: "sy.lifecycle", tasks = tasks.len(), "Tracked tasks aborted");

        let disposables = std::mem::take(&mut *lock(&self.inner.disposables));
        for resource in disposables.iter().rev() {
            if let Err(e) = resource.dispose().await {
                warn!(
                    target: "sy.lifecycle",
                    resource = resource.name(),
                    error = %e,
                    "Dispose failed"
                );
                errors.push(LifecycleError::DisposeFailed {
                    name: resource.name().to_string(),
                    message: e.to_string(),
                });
            }
        }

        let shutdown = self.lock_hooks().snapshot(HookKind::Shutdown);
        run_hooks(HookKind::Shutdown, shutdown.iter().rev(), errors).await;
    }

    fn lock_hooks(&self) -> std::sync::MutexGuard<'_, HookTable> {
        lock(&self.inner.hooks)
    }
}

impl fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("phase", &self.phase())
            .field("shutdown_timeout", &self.inner.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run `hooks` in iteration order, collecting failures. `index` in errors is
/// the registration position.
async fn run_hooks<'a, I>(kind: HookKind, hooks: I, errors: &mut Vec<LifecycleError>)
where
    I: Iterator<Item = &'a (usize, HookFn)>,
{
    for (index, hook) in hooks {
        if let Err(e) = hook().await {
            warn!(target: "sy.lifecycle", hook = %kind, index, error = %e, "Lifecycle hook failed");
            errors.push(LifecycleError::HookFailed {
                kind,
                index: *index,
                message: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, entry: &str) -> impl Fn() -> futures::future::Ready<anyhow::Result<()>> {
        let log = Arc::clone(log);
        let entry = entry.to_string();
        move || {
            log.lock().unwrap().push(entry.clone());
            futures::future::ready(Ok(()))
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    async fn boot(lifecycle: &LifecycleCoordinator) {
        lifecycle.initialize().await.unwrap();
        lifecycle.start().await.unwrap();
        lifecycle.ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_phases_advance_in_order() {
        let lifecycle = LifecycleCoordinator::new(Duration::from_secs(1));
        let log: Log = Arc::default();
        lifecycle.on_ready(recorder(&log, "ready"));
        lifecycle.on_start(recorder(&log, "start"));
        lifecycle.on_init(recorder(&log, "init"));

        assert_eq!(lifecycle.phase(), LifecyclePhase::Created);
        boot(&lifecycle).await;

        assert_eq!(lifecycle.phase(), LifecyclePhase::Running);
        assert_eq!(entries(&log), vec!["init", "start", "ready"]);
    }

    #[tokio::test]
    async fn test_out_of_order_transition_is_rejected() {
        let lifecycle = LifecycleCoordinator::new(Duration::from_secs(1));

        let err = lifecycle.start().await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition {
                from: LifecyclePhase::Created,
                to: LifecyclePhase::Starting
            }
        ));

        lifecycle.initialize().await.unwrap();
        assert!(lifecycle.initialize().await.is_err());
        assert_eq!(lifecycle.phase(), LifecyclePhase::Initializing);
    }

    #[tokio::test]
    async fn test_hook_errors_are_collected() {
        let lifecycle = LifecycleCoordinator::new(Duration::from_secs(1));
        let log: Log = Arc::default();
        lifecycle.on_init(|| async { Err(anyhow::anyhow!("database unreachable")) });
        lifecycle.on_init(recorder(&log, "second"));

        let report = lifecycle.initialize().await.unwrap();

        assert_eq!(report.hooks_run, 2);
        assert!(!report.is_clean());
        assert!(matches!(
            report.errors.first(),
            Some(LifecycleError::HookFailed {
                kind: HookKind::Init,
                index: 0,
                message,
            }) if message == "database unreachable"
        ));
        assert_eq!(entries(&log), vec!["second"]);
    }

    #[tokio::test]
    async fn test_shutdown_order() {
        let lifecycle = LifecycleCoordinator::new(Duration::from_secs(1));
        let log: Log = Arc::default();
        lifecycle.on_before_shutdown(recorder(&log, "before-1"));
        lifecycle.on_before_shutdown(recorder(&log, "before-2"));
        lifecycle.on_shutdown(recorder(&log, "shutdown-1"));
        lifecycle.on_shutdown(recorder(&log, "shutdown-2"));
        boot(&lifecycle).await;

        let report = lifecycle.shutdown().await;

        assert!(!report.timed_out);
        assert!(report.errors.is_empty());
        assert_eq!(lifecycle.phase(), LifecyclePhase::Stopped);
        assert_eq!(
            entries(&log),
            vec!["before-1", "before-2", "shutdown-2", "shutdown-1"]
        );
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let lifecycle = LifecycleCoordinator::new(Duration::from_secs(1));
        let log: Log = Arc::default();
        lifecycle.on_shutdown(recorder(&log, "shutdown"));

        let (first, second) = tokio::join!(lifecycle.shutdown(), lifecycle.shutdown());
        let third = lifecycle.shutdown().await;

        assert!(first.already_stopping != second.already_stopping);
        assert!(third.already_stopping);
        assert_eq!(entries(&log), vec!["shutdown"]);
    }

    #[tokio::test]
    async fn test_shutdown_from_created_phase() {
        let lifecycle = LifecycleCoordinator::new(Duration::from_secs(1));
        let report = lifecycle.shutdown().await;

        assert!(!report.already_stopping);
        assert_eq!(lifecycle.phase(), LifecyclePhase::Stopped);
        assert!(lifecycle.initialize().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout_abandons_slow_hook() {
        let lifecycle = LifecycleCoordinator::new(Duration::from_millis(50));
        lifecycle.on_shutdown(|| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        });
        boot(&lifecycle).await;

        let started = Instant::now();
        let report = lifecycle.shutdown().await;
        let elapsed = started.elapsed();

        assert!(report.timed_out);
        assert!(matches!(
            report.errors.last(),
            Some(LifecycleError::ShutdownTimeout(d)) if *d == Duration::from_millis(50)
        ));
        assert_eq!(lifecycle.phase(), LifecyclePhase::Stopped);
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_unregistered_hook_does_not_run() {
        let lifecycle = LifecycleCoordinator::new(Duration::from_secs(1));
        let log: Log = Arc::default();
        let handle = lifecycle.on_init(recorder(&log, "removed"));
        lifecycle.on_init(recorder(&log, "kept"));

        assert!(handle.unregister());
        lifecycle.initialize().await.unwrap();

        assert_eq!(entries(&log), vec!["kept"]);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_token_and_aborts_tasks() {
        let lifecycle = LifecycleCoordinator::new(Duration::from_secs(1));
        let token = lifecycle.child_token();
        let (alive_tx, alive_rx) = tokio::sync::oneshot::channel::<()>();
        lifecycle.track_task(tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await;
        }));

        lifecycle.shutdown().await;

        assert!(token.is_cancelled());
        // The sender is dropped only when the aborted task is torn down.
        assert!(alive_rx.await.is_err());
    }

    struct Resource {
        name: &'static str,
        log: Log,
        fail: bool,
    }

    #[async_trait]
    impl Disposable for Resource {
        fn name(&self) -> &str {
            self.name
        }

        async fn dispose(&self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("dispose-{}", self.name));
            if self.fail {
                anyhow::bail!("flush failed");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_disposables_run_latest_first_before_shutdown_hooks() {
        let lifecycle = LifecycleCoordinator::new(Duration::from_secs(1));
        let log: Log = Arc::default();
        lifecycle.on_shutdown(recorder(&log, "shutdown"));
        lifecycle.track_disposable(Arc::new(Resource {
            name: "bus",
            log: Arc::clone(&log),
            fail: false,
        }));
        lifecycle.track_disposable(Arc::new(Resource {
            name: "hub",
            log: Arc::clone(&log),
            fail: true,
        }));

        let report = lifecycle.shutdown().await;

        assert_eq!(entries(&log), vec!["dispose-hub", "dispose-bus", "shutdown"]);
        assert!(matches!(
            report.errors.first(),
            Some(LifecycleError::DisposeFailed { name, .. }) if name == "hub"
        ));
    }
}
