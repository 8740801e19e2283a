//! Process lifecycle: startup, readiness, graceful drain.
//!
//! ```text
//! Starting → Ready → ShuttingDown → Stopped
//! ```
//!
//! On shutdown the listener stops accepting, in-flight connections drain
//! against a bounded deadline (tracked by [`ConnGuard`]s), and the shared
//! cancellation token fans out to endpoint probes and upgrade relays.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cluster::ClusterRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Ready,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Outcome of the drain phase.
#[derive(Debug, PartialEq, Eq)]
pub enum DrainResult {
    Completed,
    TimedOut { remaining: usize },
}

pub struct LifecycleManager {
    state: ArcSwap<LifecycleState>,
    active: AtomicUsize,
    shutdown: CancellationToken,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(LifecycleState::Starting),
            active: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    pub fn mark_ready(&self) {
        self.state.store(Arc::new(LifecycleState::Ready));
        info!("gateway ready");
    }

    /// Stop accepting and cancel background work.
    pub fn begin_shutdown(&self) {
        self.state.store(Arc::new(LifecycleState::ShuttingDown));
        self.shutdown.cancel();
        info!(active = self.active_connections(), "shutdown started");
    }

    pub fn mark_stopped(&self) {
        self.state.store(Arc::new(LifecycleState::Stopped));
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::ShuttingDown | LifecycleState::Stopped
        )
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Track one accepted connection until its guard drops.
    pub fn conn_opened(self: &Arc<Self>) -> ConnGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        ConnGuard {
            manager: Arc::clone(self),
        }
    }

    /// Wait for in-flight connections, bounded by `timeout`.
    pub async fn drain(&self, timeout: Duration) -> DrainResult {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = self.active_connections();
            if remaining == 0 {
                return DrainResult::Completed;
            }
            if Instant::now() >= deadline {
                return DrainResult::TimedOut { remaining };
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Decrements the active-connection gauge on drop.
pub struct ConnGuard {
    manager: Arc<LifecycleManager>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.manager.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Clone)]
struct HealthState {
    lifecycle: Arc<LifecycleManager>,
    registry: Arc<ClusterRegistry>,
}

/// `/healthz` + `/readyz` router served on the insecure health port.
pub fn health_router(lifecycle: Arc<LifecycleManager>, registry: Arc<ClusterRegistry>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(HealthState {
            lifecycle,
            registry,
        })
}

async fn healthz(State(state): State<HealthState>) -> Response {
    match state.lifecycle.state() {
        LifecycleState::Stopped => (StatusCode::SERVICE_UNAVAILABLE, "stopped").into_response(),
        _ => (StatusCode::OK, "ok").into_response(),
    }
}

async fn readyz(State(state): State<HealthState>) -> Response {
    let lifecycle_state = state.lifecycle.state();
    let mut ready_endpoints = 0usize;
    let mut clusters = 0usize;
    state.registry.range(|_, cluster| {
        clusters += 1;
        ready_endpoints += cluster.ready_endpoints().len();
    });
    let body = Json(serde_json::json!({
        "state": lifecycle_state.to_string(),
        "clusters": clusters,
        "readyEndpoints": ready_endpoints,
    }));
    let status = if lifecycle_state == LifecycleState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, body).into_response()
}
