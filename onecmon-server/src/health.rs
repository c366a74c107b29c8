//! Aggregated health reporting.
//!
//! The overall server status is the worst status among enabled modules.
//!
//! # Aggregation Rule
//!
//! - All Healthy -> Healthy
//! - Any Degraded, none Unhealthy -> Degraded(reason)
//! - Any Unhealthy -> Unhealthy(reason)

use serde::Serialize;

use onecmon_core::pipeline::HealthStatus;

/// Aggregated health report for the server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerHealth {
    /// Worst status of all modules.
    pub status: HealthStatus,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// Agents with a live session.
    pub connected_agents: usize,
    /// Per-module health reports.
    pub modules: Vec<ModuleHealth>,
}

/// Health status for a single module.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleHealth {
    /// Module name (e.g. "ingestion-pipeline", "listener").
    pub name: String,
    /// Whether the module is enabled in configuration.
    pub enabled: bool,
    pub status: HealthStatus,
}

/// Aggregate module statuses into one, ignoring disabled modules.
///
/// Returns the worst status found: Unhealthy > Degraded > Healthy. Reasons of every
/// non-healthy module at the worst level and above are joined with `; `.
pub fn aggregate_status(modules: &[ModuleHealth]) -> HealthStatus {
    let mut worst = HealthStatus::Healthy;
    let mut reasons = Vec::new();

    for module in modules.iter().filter(|m| m.enabled) {
        match &module.status {
            HealthStatus::Healthy => {}
            HealthStatus::Degraded(reason) => {
                if !worst.is_unhealthy() {
                    reasons.push(format!("{}: {}", module.name, reason));
                    worst = HealthStatus::Degraded(String::new());
                }
            }
            HealthStatus::Unhealthy(reason) => {
                reasons.push(format!("{}: {}", module.name, reason));
                worst = HealthStatus::Unhealthy(String::new());
            }
        }
    }

    match worst {
        HealthStatus::Healthy => HealthStatus::Healthy,
        HealthStatus::Degraded(_) => HealthStatus::Degraded(reasons.join("; ")),
        HealthStatus::Unhealthy(_) => HealthStatus::Unhealthy(reasons.join("; ")),
    }
}
