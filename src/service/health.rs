//! Health check endpoints and monitoring
//!
//! This module provides health check functionality for the campus-match
//! live match service, including readiness and liveness probes.

use crate::pool::CandidatePool;
use crate::service::app::AppState;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Health check status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "✅ healthy"),
            HealthStatus::Degraded => write!(f, "⚠️  degraded"),
            HealthStatus::Unhealthy => write!(f, "❌ unhealthy"),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Overall service status
    pub status: HealthStatus,
    /// Service name
    pub service: String,
    /// Service version
    pub version: String,
    /// Current timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Detailed component checks
    pub checks: Vec<ComponentCheck>,
    /// Service statistics
    pub stats: ServiceStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    /// Component name
    pub name: String,
    /// Component status
    pub status: HealthStatus,
    /// Optional error message if unhealthy
    pub message: Option<String>,
    /// Check duration in milliseconds
    pub duration_ms: u64,
}

/// Service statistics for health reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Users currently waiting in the candidate pool
    pub candidates_searching: usize,
    /// Matched pairs with open message channels
    pub open_channels: usize,
    /// Total matches made since service start
    pub matches_made: u64,
    /// Total messages relayed since service start
    pub messages_relayed: u64,
    /// Service uptime information
    pub uptime_info: String,
}

impl HealthCheck {
    /// Perform a comprehensive health check of the service
    pub async fn check(app_state: Arc<AppState>) -> Result<Self> {
        let mut checks = Vec::new();
        let mut overall_status = HealthStatus::Healthy;

        let service_check = Self::check_service_running(&app_state).await;
        if service_check.status != HealthStatus::Healthy {
            overall_status = HealthStatus::Unhealthy;
        }
        checks.push(service_check);

        let pool_check = Self::check_candidate_pool(&app_state).await;
        if pool_check.status == HealthStatus::Unhealthy {
            overall_status = HealthStatus::Unhealthy;
        } else if pool_check.status == HealthStatus::Degraded
            && overall_status == HealthStatus::Healthy
        {
            overall_status = HealthStatus::Degraded;
        }
        checks.push(pool_check);

        let router_check = Self::check_message_router(&app_state).await;
        if router_check.status == HealthStatus::Unhealthy {
            overall_status = HealthStatus::Unhealthy;
        } else if router_check.status == HealthStatus::Degraded
            && overall_status == HealthStatus::Healthy
        {
            overall_status = HealthStatus::Degraded;
        }
        checks.push(router_check);

        let stats = Self::gather_service_stats(&app_state).await;

        Ok(HealthCheck {
            status: overall_status,
            service: app_state.config().service.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now(),
            checks,
            stats,
        })
    }

    /// Simple liveness check - just verify service is running
    pub async fn liveness_check(app_state: Arc<AppState>) -> Result<HealthStatus> {
        if app_state.is_running().await {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy)
        }
    }

    /// Readiness check - verify service can handle requests
    pub async fn readiness_check(app_state: Arc<AppState>) -> Result<HealthStatus> {
        if !app_state.is_running().await {
            return Ok(HealthStatus::Unhealthy);
        }

        match Self::check_candidate_pool(&app_state).await.status {
            HealthStatus::Healthy => Ok(HealthStatus::Healthy),
            HealthStatus::Degraded => Ok(HealthStatus::Degraded),
            HealthStatus::Unhealthy => Ok(HealthStatus::Unhealthy),
        }
    }

    /// Check if service is running
    async fn check_service_running(app_state: &AppState) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) = if app_state.is_running().await {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some("Service is not running".to_string()),
            )
        };

        ComponentCheck {
            name: "service_running".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Check candidate pool health by taking a count
    async fn check_candidate_pool(app_state: &AppState) -> ComponentCheck {
        let start = std::time::Instant::now();

        let _searching = app_state.pool().searching_count().await;

        ComponentCheck {
            name: "candidate_pool".to_string(),
            status: HealthStatus::Healthy,
            message: None,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Check message router health by counting open pairs
    async fn check_message_router(app_state: &AppState) -> ComponentCheck {
        let start = std::time::Instant::now();

        let _open = app_state.channel_router().open_pairs();

        ComponentCheck {
            name: "message_router".to_string(),
            status: HealthStatus::Healthy,
            message: None,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Gather current service statistics
    async fn gather_service_stats(app_state: &AppState) -> ServiceStats {
        let metrics = app_state.metrics();
        let messages_relayed = metrics.message().messages_sent_total.get()
            + metrics.message().messages_received_total.get();

        ServiceStats {
            candidates_searching: app_state.pool().searching_count().await,
            open_channels: app_state.channel_router().open_pairs(),
            matches_made: metrics.session().matches_made_total.get(),
            messages_relayed,
            uptime_info: format!(
                "Uptime: {}s, sessions: {}",
                metrics.service().uptime_seconds.get(),
                app_state.session_count().await
            ),
        }
    }
}

impl HealthCheck {
    /// Convert health check to JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}
