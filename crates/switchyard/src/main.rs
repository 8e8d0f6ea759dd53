//! Switchyard
//!
//! One binary, two roles:
//!
//! - **Primary** (no `SWITCHYARD_WORKER_ID`): supervises
//!   `SWITCHYARD_WORKER_COUNT` worker processes, each a re-execution of this
//!   binary, and forwards shutdown to them on SIGINT/SIGTERM
//! - **Worker** (`SWITCHYARD_WORKER_ID` set by the primary): serves
//!   WebSockets on the shared bind address until the primary writes the
//!   shutdown sentinel to its stdin (or a signal arrives)
//!
//! # Startup Flow (worker)
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Boot the lifecycle: bus, hub, HTTP server
//! 4. Wait for the sentinel or a signal, then shut down and exit 0

#![warn(clippy::pedantic)]

use std::process::ExitCode;
use std::sync::Arc;

use switchyard::cluster::{
    watch_for_shutdown_sentinel, ClusterSupervisor, ControlSignal, ProcessSpawner,
    SupervisorConfig,
};
use switchyard::config::{Config, NODE_ID_ENV, SUPERVISED_ENV};
use switchyard::observability::metrics::init_metrics_recorder;
use switchyard::worker::WorkerBuilder;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = Config::from_env();
    init_tracing(config.as_ref().is_ok_and(|c| c.log_json));

    // Load configuration
    let config = config.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    if config.is_worker() {
        run_worker(config).await
    } else {
        run_primary(config).await
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "switchyard=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run_primary(config: Config) -> Result<ExitCode, Box<dyn std::error::Error>> {
    info!(
        node_id = %config.node_id,
        workers = config.worker_count,
        bind_address = %config.bind_address,
        "Starting Switchyard primary"
    );

    let spawner = ProcessSpawner::current_exe()?
        .env(NODE_ID_ENV, &config.node_id)
        .env(SUPERVISED_ENV, "true");
    let supervisor_config = SupervisorConfig {
        shutdown_grace: config.worker_shutdown_grace,
        ..SupervisorConfig::new(config.worker_count)
    };
    let (supervisor, mut supervisor_task) =
        ClusterSupervisor::start(supervisor_config, Arc::new(spawner), None);

    tokio::select! {
        () = shutdown_signal() => {}
        result = &mut supervisor_task => {
            // The supervisor only finishes on its own after shutdown.
            error!(?result, "Supervisor stopped unexpectedly");
            return Ok(ExitCode::FAILURE);
        }
    }

    info!("Shutdown signal received, stopping workers...");
    supervisor.shutdown().await?;

    let report = supervisor_task.await?;
    info!(
        restarts = report.restarts,
        graceful_exits = report.graceful_exits,
        shutdown_exits = report.shutdown_exits,
        "Switchyard primary shutdown complete"
    );
    Ok(ExitCode::SUCCESS)
}

async fn run_worker(config: Config) -> Result<ExitCode, Box<dyn std::error::Error>> {
    info!(
        worker_id = %config.worker_label(),
        bind_address = %config.bind_address,
        redis = config.redis_url.is_some(),
        auth_enabled = config.auth_enabled,
        "Starting Switchyard worker"
    );

    // This must happen before any metrics are recorded
    let prometheus = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let supervised = config.supervised;
    let report = WorkerBuilder::new(config)
        .metrics(prometheus)
        .run(worker_shutdown(supervised))
        .await?;

    if report.timed_out {
        warn!(
            elapsed_ms = report.elapsed.as_millis(),
            "Worker shutdown deadline passed, remaining work abandoned"
        );
    }
    info!(errors = report.errors.len(), "Switchyard worker shutdown complete");
    Ok(ExitCode::SUCCESS)
}

/// Wait for the primary's sentinel on stdin, or a signal.
///
/// A supervised worker ignores SIGINT: a terminal Ctrl-C reaches the whole
/// process group, and the primary answers it with the sentinel.
async fn worker_shutdown(supervised: bool) {
    let signal = async {
        if supervised {
            terminate_ignoring_interrupts().await;
        } else {
            shutdown_signal().await;
        }
    };

    tokio::select! {
        control = watch_for_shutdown_sentinel(tokio::io::stdin()) => match control {
            ControlSignal::Shutdown => info!("Shutdown sentinel received"),
            ControlSignal::ParentGone => warn!("Control channel closed, shutting down"),
        },
        () = signal => {}
    }
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    tokio::select! {
        () = interrupt() => {}
        () = terminate() => {}
    }
}

/// Wait for SIGTERM. SIGINT is caught (so it does not kill the process) and
/// logged.
async fn terminate_ignoring_interrupts() {
    let terminate = terminate();
    tokio::pin!(terminate);
    loop {
        tokio::select! {
            () = &mut terminate => return,
            result = signal::ctrl_c() => match result {
                Ok(()) => info!("Received SIGINT, waiting for the primary's shutdown sentinel"),
                Err(e) => {
                    error!("Failed to listen for SIGINT: {}", e);
                    terminate.await;
                    return;
                }
            },
        }
    }
}

async fn interrupt() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
        Err(e) => {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
            info!("Received SIGTERM, starting graceful shutdown...");
        }
        Err(e) => {
            error!("Failed to listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
