//! Component health for the `/health` and `/readyz` endpoints.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

/// Component names tracked by the ingestion engine.
pub const KAFKA: &str = "kafka";
pub const CLICKHOUSE: &str = "clickhouse";
pub const BUFFER: &str = "buffer";

/// Health status of a component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Healthy,
    /// Component is degraded but operational
    Degraded(String),
    /// Component is unhealthy
    Unhealthy(String),
    /// Component status is unknown
    Unknown,
}

/// Overall system health status.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All components healthy
    Healthy,
    /// Some components degraded
    Degraded,
    /// System is unhealthy
    Unhealthy,
}

/// Serializable view of the whole health state.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub running: bool,
    pub uptime_seconds: u64,
    pub components: BTreeMap<String, ComponentStatus>,
}

/// Health check manager for tracking component health.
#[derive(Debug)]
pub struct HealthCheck {
    components: RwLock<BTreeMap<String, ComponentStatus>>,
    started_at: Instant,
    running: RwLock<bool>,
}

impl HealthCheck {
    pub fn new() -> Self {
        Self {
            components: RwLock::new(BTreeMap::new()),
            started_at: Instant::now(),
            running: RwLock::new(false),
        }
    }

    /// Health check with the engine's components registered as unknown.
    pub fn for_pipeline() -> Self {
        let health = Self::new();
        for name in [KAFKA, CLICKHOUSE, BUFFER] {
            health.register_component(name);
        }
        health
    }

    /// Register a component to track.
    pub fn register_component(&self, name: &str) {
        self.components
            .write()
            .insert(name.to_string(), ComponentStatus::Unknown);
    }

    pub fn mark_healthy(&self, name: &str) {
        self.components
            .write()
            .insert(name.to_string(), ComponentStatus::Healthy);
    }

    pub fn mark_degraded(&self, name: &str, reason: &str) {
        self.components.write().insert(
            name.to_string(),
            ComponentStatus::Degraded(reason.to_string()),
        );
    }

    pub fn mark_unhealthy(&self, name: &str, reason: &str) {
        self.components.write().insert(
            name.to_string(),
            ComponentStatus::Unhealthy(reason.to_string()),
        );
    }

    pub fn get_component_status(&self, name: &str) -> Option<ComponentStatus> {
        self.components.read().get(name).cloned()
    }

    /// Worst status across components.
    pub fn overall_status(&self) -> HealthStatus {
        let components = self.components.read();

        let mut has_degraded = false;
        for status in components.values() {
            match status {
                ComponentStatus::Unhealthy(_) => return HealthStatus::Unhealthy,
                ComponentStatus::Degraded(_) => has_degraded = true,
                _ => {}
            }
        }

        if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Check if the system is operational (healthy or degraded).
    pub fn is_operational(&self) -> bool {
        matches!(
            self.overall_status(),
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }

    /// Ready means the steady-state loop is running and nothing is down.
    pub fn is_ready(&self) -> bool {
        self.is_running() && self.is_operational()
    }

    pub fn pipeline_started(&self) {
        *self.running.write() = true;
    }

    pub fn pipeline_stopped(&self) {
        *self.running.write() = false;
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            status: self.overall_status(),
            running: self.is_running(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            components: self.components.read().clone(),
        }
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}
