//! Health endpoints for Switchyard workers.
//!
//! Provides Kubernetes-compatible health endpoints:
//! - `GET /health` - Liveness probe (`{live, phase}`)
//! - `GET /ready` - Readiness probe (`{ready, phase, checks}`)
//!
//! # Health State
//!
//! Liveness and readiness are derived from the lifecycle phase:
//! - `live`: every phase except STOPPED
//! - `ready`: phase is RUNNING and every required check passes
//!
//! Checks are cheap synchronous probes (bus connected, hub running).
//! Optional checks are reported but do not affect readiness.

use crate::lifecycle::LifecyclePhase;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;

type Probe = Arc<dyn Fn() -> bool + Send + Sync>;

struct ReadinessCheck {
    name: String,
    required: bool,
    probe: Probe,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LivenessReport {
    pub live: bool,
    pub phase: LifecyclePhase,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CheckStatus {
    pub name: String,
    pub ready: bool,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReadinessReport {
    pub ready: bool,
    pub phase: LifecyclePhase,
    pub checks: Vec<CheckStatus>,
}

pub struct HealthState {
    phase: watch::Receiver<LifecyclePhase>,
    checks: RwLock<Vec<ReadinessCheck>>,
}

impl HealthState {
    /// Track the phase published by a lifecycle coordinator.
    pub fn new(phase: watch::Receiver<LifecyclePhase>) -> Self {
        Self {
            phase,
            checks: RwLock::new(Vec::new()),
        }
    }

    /// Register a readiness probe.
    pub fn add_check<F>(&self, name: impl Into<String>, required: bool, probe: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.checks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ReadinessCheck {
                name: name.into(),
                required,
                probe: Arc::new(probe),
            });
    }

    pub fn phase(&self) -> LifecyclePhase {
        *self.phase.borrow()
    }

    pub fn liveness(&self) -> LivenessReport {
        let phase = self.phase();
        LivenessReport {
            live: phase != LifecyclePhase::Stopped,
            phase,
        }
    }

    pub fn readiness(&self) -> ReadinessReport {
        let phase = self.phase();
        let checks: Vec<CheckStatus> = self
            .checks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|check| CheckStatus {
                name: check.name.clone(),
                ready: (check.probe)(),
                required: check.required,
            })
            .collect();

        let ready = phase == LifecyclePhase::Running
            && checks.iter().all(|check| check.ready || !check.required);

        ReadinessReport {
            ready,
            phase,
            checks,
        }
    }
}

impl fmt::Debug for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthState")
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// Create the health router with liveness and readiness endpoints.
///
/// # Endpoints
///
/// - `GET /health` - 200 while live, 503 once stopped
/// - `GET /ready` - 200 if ready to serve traffic, 503 otherwise
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<LivenessReport>) {
    let report = state.liveness();
    let status = if report.live {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn readiness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<ReadinessReport>) {
    let report = state.readiness();
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}
