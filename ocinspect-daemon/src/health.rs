//! Aggregated health reporting.
//!
//! The overall daemon status is the worst status among its components.
//!
//! - All Healthy -> Healthy
//! - Any Degraded, none Unhealthy -> Degraded(reasons)
//! - Any Unhealthy -> Unhealthy(reasons)

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use ocinspect_core::pipeline::HealthStatus;

/// Aggregated health report for the daemon.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonHealth {
    /// Worst status among all components.
    pub status: HealthStatus,
    /// Seconds since the orchestrator was built.
    pub uptime_secs: u64,
    /// Per-component reports.
    pub components: Vec<ComponentHealth>,
}

/// Health of a single component (e.g. "inspection-stage", "engine").
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
}

impl ComponentHealth {
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
        }
    }
}

/// Aggregate component statuses into a single status.
///
/// Reasons of every non-healthy component that contributes to the
/// final level are joined with `"; "`.
pub fn aggregate_status(components: &[ComponentHealth]) -> HealthStatus {
    let unhealthy: Vec<String> = components
        .iter()
        .filter_map(|c| match &c.status {
            HealthStatus::Unhealthy(reason) => Some(format!("{}: {}", c.name, reason)),
            _ => None,
        })
        .collect();
    if !unhealthy.is_empty() {
        return HealthStatus::Unhealthy(unhealthy.join("; "));
    }

    let degraded: Vec<String> = components
        .iter()
        .filter_map(|c| match &c.status {
            HealthStatus::Degraded(reason) => Some(format!("{}: {}", c.name, reason)),
            _ => None,
        })
        .collect();
    if !degraded.is_empty() {
        return HealthStatus::Degraded(degraded.join("; "));
    }

    HealthStatus::Healthy
}

/// Spawn a task that logs every engine health transition.
///
/// An `Unhealthy` engine is the process-level signal raised after a failed
/// re-initialization, so it is logged at error level. The task ends when
/// the supervisor is dropped.
pub fn spawn_health_watcher(mut health_rx: watch::Receiver<HealthStatus>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while health_rx.changed().await.is_ok() {
            let status = health_rx.borrow_and_update().clone();
            match &status {
                HealthStatus::Healthy => tracing::info!(%status, "engine health changed"),
                HealthStatus::Degraded(_) => tracing::warn!(%status, "engine health changed"),
                HealthStatus::Unhealthy(_) => tracing::error!(%status, "engine health changed"),
            }
        }
        tracing::debug!("engine health watcher stopped");
    })
}
