//! Worker runtime.
//!
//! Boots one worker process:
//!
//! 1. `initialize` - init hooks
//! 2. bus connection (Redis when `REDIS_URL` is set, in-memory otherwise),
//!    router, hub
//! 3. `start` - start hooks, then the HTTP listener
//! 4. `ready` - phase becomes RUNNING and `/ready` turns green
//!
//! Shutdown is driven by the [`LifecycleCoordinator`]: open connections are
//! closed with `1001` before the hub and the server are torn down.

use crate::actors::{HubConfig, HubTask, WorkerHub, WorkerHubHandle};
use crate::auth::AuthGate;
use crate::config::Config;
use crate::errors::SwitchyardError;
use crate::lifecycle::{LifecycleCoordinator, LifecycleError, PhaseReport, ShutdownReport};
use crate::observability::HealthState;
use crate::registry::{Connection, CLOSE_GOING_AWAY};
use crate::relay::{BusReceiver, CustomScopes, MemoryBroker, MessageBus, RedisBus};
use crate::routing::{
    builtin_validation, register_builtin_routes, LoggingMiddleware, MessageRouter,
    RateLimitMiddleware, RecoveryMiddleware, RetryMiddleware, RouterBuilder, ValidationMiddleware,
    WireMessage, MAX_DISPATCH_ATTEMPTS,
};
use crate::server::{app_router, bind_shared_listener, AppState};
use common::secret::ExposeSecret;
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Close reason sent to clients when the worker stops.
pub const SHUTDOWN_CLOSE_REASON: &str = "server shutting down";

type RouteRegistrar = Box<dyn FnOnce(RouterBuilder) -> RouterBuilder + Send>;

/// Assembles a worker.
pub struct WorkerBuilder {
    config: Config,
    lifecycle: LifecycleCoordinator,
    registrars: Vec<RouteRegistrar>,
    custom_scopes: CustomScopes,
    bus: Option<(Arc<dyn MessageBus>, BusReceiver)>,
    listener: Option<TcpListener>,
    prometheus: Option<PrometheusHandle>,
}

impl WorkerBuilder {
    pub fn new(config: Config) -> Self {
        let lifecycle = LifecycleCoordinator::new(config.shutdown_timeout);
        Self {
            config,
            lifecycle,
            registrars: Vec::new(),
            custom_scopes: CustomScopes::new(),
            bus: None,
            listener: None,
            prometheus: None,
        }
    }

    /// The worker's lifecycle; register hooks here before starting.
    pub fn lifecycle(&self) -> &LifecycleCoordinator {
        &self.lifecycle
    }

    /// Add application routes. Built-in routes are registered first.
    #[must_use]
    pub fn routes<F>(mut self, register: F) -> Self
    where
        F: FnOnce(RouterBuilder) -> RouterBuilder + Send + 'static,
    {
        self.registrars.push(Box::new(register));
        self
    }

    /// Add a named custom broadcast scope.
    #[must_use]
    pub fn custom_scope<F>(mut self, name: impl Into<String>, filter: F) -> Self
    where
        F: Fn(&Connection, &WireMessage) -> bool + Send + Sync + 'static,
    {
        self.custom_scopes.insert(name, filter);
        self
    }

    /// Use `bus` instead of connecting one from the configuration.
    #[must_use]
    pub fn bus(mut self, bus: Arc<dyn MessageBus>, receiver: BusReceiver) -> Self {
        self.bus = Some((bus, receiver));
        self
    }

    /// Serve on `listener` instead of binding `bind_address`.
    #[must_use]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Mount `/metrics` rendered from `handle`.
    #[must_use]
    pub fn metrics(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// Boot the worker up to RUNNING.
    ///
    /// # Errors
    ///
    /// Failing init or start hooks, bus connection failures and bind
    /// failures. The lifecycle is shut down before the error is returned.
    pub async fn start(self) -> Result<RunningWorker, SwitchyardError> {
        let lifecycle = self.lifecycle.clone();
        match self.boot().await {
            Ok(worker) => Ok(worker),
            Err(e) => {
                error!(target: "sy.worker", error = %e, "Worker startup failed");
                lifecycle.shutdown().await;
                Err(e)
            }
        }
    }

    /// Start, wait for `shutdown`, then run the shutdown sequence.
    ///
    /// # Errors
    ///
    /// Startup failures; see [`WorkerBuilder::start`].
    pub async fn run<F>(self, shutdown: F) -> Result<ShutdownReport, SwitchyardError>
    where
        F: Future<Output = ()>,
    {
        let worker = self.start().await?;
        shutdown.await;
        info!(target: "sy.worker", worker_id = %worker.worker_id(), "Shutdown requested");
        Ok(worker.shutdown().await)
    }

    async fn boot(self) -> Result<RunningWorker, SwitchyardError> {
        let Self {
            config,
            lifecycle,
            registrars,
            custom_scopes,
            bus,
            listener,
            prometheus,
        } = self;
        let worker_id = config.worker_label();

        check_phase(lifecycle.initialize().await)?;

        let (bus, bus_receiver) = match bus {
            Some(bus) => bus,
            None => connect_bus(&config, &lifecycle).await?,
        };

        let mut builder = MessageRouter::builder()
            .middleware(RateLimitMiddleware::new(
                config.rate_limit_max_messages,
                config.rate_limit_window,
            ))
            .middleware(builtin_validation(ValidationMiddleware::new()))
            .middleware(LoggingMiddleware::new())
            .middleware(RetryMiddleware::new(MAX_DISPATCH_ATTEMPTS))
            .middleware(RecoveryMiddleware);
        builder = register_builtin_routes(builder);
        for register in registrars {
            builder = register(builder);
        }
        let router = builder.build();

        let hub_config = HubConfig {
            channel_prefix: config.channel_prefix.clone(),
            idle_timeout: config.idle_timeout,
            idle_sweep_interval: config.idle_sweep_interval,
            ..HubConfig::new(worker_id.clone())
        };
        let (hub, hub_task) = WorkerHub::spawn(
            hub_config,
            router,
            Arc::clone(&bus),
            bus_receiver,
            custom_scopes,
            lifecycle.child_token(),
        );
        lifecycle.track_disposable(Arc::new(HubTask::new(hub.clone(), hub_task)));

        let draining_hub = hub.clone();
        lifecycle.on_before_shutdown(move || {
            let hub = draining_hub.clone();
            async move {
                let closed = hub.close_all(CLOSE_GOING_AWAY, SHUTDOWN_CLOSE_REASON).await?;
                info!(target: "sy.worker", closed, "Connections closed for shutdown");
                Ok(())
            }
        });

        let health_state = Arc::new(HealthState::new(lifecycle.subscribe()));
        let bus_probe = Arc::clone(&bus);
        health_state.add_check("bus", true, move || bus_probe.is_healthy());
        let hub_probe = hub.clone();
        health_state.add_check("hub", true, move || hub_probe.is_running());

        check_phase(lifecycle.start().await)?;

        let listener = match listener {
            Some(listener) => listener,
            None => bind_shared_listener(config.bind_address).map_err(|e| {
                SwitchyardError::Config(format!(
                    "failed to bind {}: {e}",
                    config.bind_address
                ))
            })?,
        };
        let local_addr = listener
            .local_addr()
            .map_err(|e| SwitchyardError::Internal(format!("listener address: {e}")))?;

        let state = AppState {
            hub: hub.clone(),
            auth: Arc::new(auth_gate(&config)?),
            send_queue_capacity: config.send_queue_capacity,
        };
        let app = app_router(state, Arc::clone(&health_state), prometheus);

        let server_token = lifecycle.child_token();
        let server = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(server_token.cancelled_owned())
                .await;
            if let Err(e) = served {
                error!(target: "sy.server", error = %e, "Server failed");
            }
        });
        lifecycle.track_task(server);

        check_phase(lifecycle.ready().await)?;
        info!(
            target: "sy.worker",
            worker_id = %worker_id,
            addr = %local_addr,
            "Worker running"
        );

        Ok(RunningWorker {
            worker_id,
            lifecycle,
            hub,
            health_state,
            local_addr,
        })
    }
}

/// A worker in the RUNNING phase.
pub struct RunningWorker {
    worker_id: String,
    lifecycle: LifecycleCoordinator,
    hub: WorkerHubHandle,
    health_state: Arc<HealthState>,
    local_addr: SocketAddr,
}

impl RunningWorker {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn hub(&self) -> &WorkerHubHandle {
        &self.hub
    }

    pub fn lifecycle(&self) -> &LifecycleCoordinator {
        &self.lifecycle
    }

    pub fn health(&self) -> &Arc<HealthState> {
        &self.health_state
    }

    /// Address the HTTP server accepted on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) -> ShutdownReport {
        let report = self.lifecycle.shutdown().await;
        for e in &report.errors {
            warn!(target: "sy.worker", error = %e, "Shutdown error");
        }
        report
    }
}

async fn connect_bus(
    config: &Config,
    lifecycle: &LifecycleCoordinator,
) -> Result<(Arc<dyn MessageBus>, BusReceiver), SwitchyardError> {
    match &config.redis_url {
        Some(url) => {
            let (bus, receiver) =
                RedisBus::connect(url.expose_secret(), lifecycle.child_token()).await?;
            Ok((Arc::new(bus), receiver))
        }
        None => {
            info!(target: "sy.worker", "No REDIS_URL set, using in-process bus");
            let (bus, receiver) = MemoryBroker::new().connect();
            Ok((Arc::new(bus), receiver))
        }
    }
}

fn auth_gate(config: &Config) -> Result<AuthGate, SwitchyardError> {
    if !config.auth_enabled {
        warn!(target: "sy.worker", "Authentication disabled, all connections are anonymous");
        return Ok(AuthGate::disabled());
    }
    let secret = config
        .jwt_secret
        .clone()
        .ok_or_else(|| SwitchyardError::Config("SWITCHYARD_JWT_SECRET is not set".to_string()))?;
    Ok(AuthGate::new(
        secret,
        config.token_query_param.clone(),
        config.clock_skew,
        config.allow_anonymous,
    ))
}

/// Startup hooks that fail abort the worker.
fn check_phase(result: Result<PhaseReport, LifecycleError>) -> Result<(), SwitchyardError> {
    let report = result.map_err(|e| SwitchyardError::Internal(e.to_string()))?;
    match report.errors.first() {
        None => Ok(()),
        Some(first) => {
            for e in &report.errors {
                error!(
                    target: "sy.worker",
                    phase = %report.phase,
                    error = %e,
                    "Startup hook failed"
                );
            }
            Err(SwitchyardError::Internal(format!(
                "{} phase failed: {first}",
                report.phase
            )))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecyclePhase;
    use std::collections::HashMap;

    fn test_config() -> Config {
        let vars = HashMap::from([
            ("SWITCHYARD_AUTH_ENABLED".to_string(), "false".to_string()),
            ("SWITCHYARD_WORKER_COUNT".to_string(), "1".to_string()),
            ("SWITCHYARD_WORKER_ID".to_string(), "0".to_string()),
            ("SWITCHYARD_NODE_ID".to_string(), "test".to_string()),
            ("SWITCHYARD_SHUTDOWN_TIMEOUT_MS".to_string(), "2000".to_string()),
        ]);
        Config::from_vars(&vars).unwrap()
    }

    async fn local_listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn test_worker_reaches_running_and_stops() {
        let worker = WorkerBuilder::new(test_config())
            .listener(local_listener().await)
            .start()
            .await
            .unwrap();

        assert_eq!(worker.worker_id(), "test-w0");
        assert_eq!(worker.lifecycle().phase(), LifecyclePhase::Running);
        assert!(worker.health().readiness().ready);

        let lifecycle = worker.lifecycle().clone();
        let report = worker.shutdown().await;
        assert!(!report.timed_out);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(lifecycle.phase(), LifecyclePhase::Stopped);
    }

    #[tokio::test]
    async fn test_failing_init_hook_aborts_startup() {
        let builder = WorkerBuilder::new(test_config()).listener(local_listener().await);
        builder
            .lifecycle()
            .on_init(|| async { Err(anyhow::anyhow!("database unreachable")) });
        let lifecycle = builder.lifecycle().clone();

        let err = builder.start().await.err().expect("startup should fail");
        assert!(matches!(err, SwitchyardError::Internal(_)));
        assert_eq!(lifecycle.phase(), LifecyclePhase::Stopped);
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown_future() {
        let report = WorkerBuilder::new(test_config())
            .listener(local_listener().await)
            .run(async {})
            .await
            .unwrap();
        assert!(!report.already_stopping);
        assert!(!report.timed_out);
    }

    #[test]
    fn test_auth_gate_follows_config() {
        let config = test_config();
        assert!(!auth_gate(&config).unwrap().is_enabled());

        let mut enabled = config;
        enabled.auth_enabled = true;
        enabled.jwt_secret = None;
        assert!(matches!(auth_gate(&enabled), Err(SwitchyardError::Config(_))));
    }
}
