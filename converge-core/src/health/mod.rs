//! Health check system for production readiness

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> u16 {
        match self {
            HealthStatus::Healthy => 200,
            HealthStatus::Degraded => 200,
            HealthStatus::Unhealthy => 503,
        }
    }
}

/// Component health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub last_check: SystemTime,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
            last_check: SystemTime::now(),
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            last_check: SystemTime::now(),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            last_check: SystemTime::now(),
        }
    }
}

/// Aggregated health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub timestamp: SystemTime,
    pub components: Vec<ComponentHealth>,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Health checker service
pub struct HealthChecker {
    start_time: SystemTime,
    version: String,
    components: Arc<RwLock<Vec<ComponentHealth>>>,
}

impl HealthChecker {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            start_time: SystemTime::now(),
            version: version.into(),
            components: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a component for health checking
    pub async fn register_component(&self, name: impl Into<String>) {
        let mut components = self.components.write().await;
        components.push(ComponentHealth::healthy(name));
    }

    /// Replace a component's health entry
    pub async fn set_component(&self, health: ComponentHealth) {
        let mut components = self.components.write().await;
        match components.iter_mut().find(|c| c.name == health.name) {
            Some(existing) => *existing = health,
            None => components.push(health),
        }
    }

    /// Get current health status; overall status is the worst component.
    pub async fn check_health(&self) -> HealthCheck {
        let components = self.components.read().await.clone();

        let status = if components.iter().any(|c| c.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if components.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let uptime = self
            .start_time
            .elapsed()
            .unwrap_or(Duration::from_secs(0))
            .as_secs();

        HealthCheck {
            status,
            timestamp: SystemTime::now(),
            components,
            version: self.version.clone(),
            uptime_seconds: uptime,
        }
    }

    /// Readiness check (can accept traffic)
    pub async fn readiness_check(&self) -> bool {
        let health = self.check_health().await;
        health.status != HealthStatus::Unhealthy
    }
}

/// Built-in health checks for the sync components
pub mod checks {
    use super::*;
    use crate::core_log::ChangeLogStats;
    use crate::core_queue::QueueStats;

    /// Queue health from its stats; backlog pressure degrades it.
    pub fn check_queue(stats: &QueueStats, max_backlog: usize) -> ComponentHealth {
        if stats.queued > max_backlog {
            ComponentHealth::degraded(
                "event_queue",
                format!("{} events queued (threshold: {})", stats.queued, max_backlog),
            )
        } else {
            ComponentHealth::healthy("event_queue")
        }
    }

    /// Change log health from its stats.
    pub fn check_change_log(stats: &ChangeLogStats) -> ComponentHealth {
        let failed = stats.by_status.get("failed").copied().unwrap_or(0);
        if stats.total_changes > 0 && failed * 2 > stats.total_changes {
            ComponentHealth::degraded(
                "change_log",
                format!("{} of {} records failed", failed, stats.total_changes),
            )
        } else {
            ComponentHealth::healthy("change_log")
        }
    }

    /// Worker pool health.
    pub fn check_workers(total: usize, alive: usize) -> ComponentHealth {
        if alive == 0 && total > 0 {
            ComponentHealth::unhealthy("workers", "No workers running")
        } else if alive < total {
            ComponentHealth::degraded("workers", format!("{} of {} workers alive", alive, total))
        } else {
            ComponentHealth::healthy("workers")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_checker_aggregates() {
        let checker = HealthChecker::new("1.0.0");
        checker.register_component("event_queue").await;

        let health = checker.check_health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.components.len(), 1);
    }

    #[tokio::test]
    async fn test_worst_component_wins() {
        let checker = HealthChecker::new("1.0.0");
        checker.register_component("a").await;
        checker.set_component(ComponentHealth::degraded("b", "slow")).await;

        assert_eq!(checker.check_health().await.status, HealthStatus::Degraded);

        checker.set_component(ComponentHealth::unhealthy("c", "down")).await;
        assert_eq!(checker.check_health().await.status, HealthStatus::Unhealthy);
        assert!(!checker.readiness_check().await);
    }

    #[tokio::test]
    async fn test_set_component_replaces() {
        let checker = HealthChecker::new("1.0.0");
        checker.set_component(ComponentHealth::unhealthy("q", "down")).await;
        checker.set_component(ComponentHealth::healthy("q")).await;

        let health = checker.check_health().await;
        assert_eq!(health.components.len(), 1);
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(HealthStatus::Healthy.to_http_status(), 200);
        assert_eq!(HealthStatus::Unhealthy.to_http_status(), 503);
    }

    #[test]
    fn test_worker_checks() {
        use checks::check_workers;
        assert_eq!(check_workers(4, 4).status, HealthStatus::Healthy);
        assert_eq!(check_workers(4, 2).status, HealthStatus::Degraded);
        assert_eq!(check_workers(4, 0).status, HealthStatus::Unhealthy);
    }
}
