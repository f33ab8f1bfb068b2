//! Main application state and service coordination
//!
//! This module contains the production AppState that coordinates the
//! candidate pool, the message router, session managers, and background
//! maintenance tasks.

use crate::channel::InProcessChannelRouter;
use crate::config::AppConfig;
use crate::events::{LoggingEventSink, SessionEventSink};
use crate::metrics::health::HealthServerConfig;
use crate::metrics::{HealthServer, MetricsCollector};
use crate::pool::{CandidatePool, InMemoryCandidatePool};
use crate::session::MatchSessionManager;
use crate::types::{StudentProfile, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// Main application state containing all service components
pub struct AppState {
    /// Application configuration
    config: AppConfig,

    /// Shared candidate pool all sessions register with
    pool: Arc<InMemoryCandidatePool>,

    /// In-process message router linking matched pairs
    channel: Arc<InProcessChannelRouter>,

    /// Event sink handed to every session manager
    events: Arc<dyn SessionEventSink>,

    /// Metrics collector for monitoring and health checks
    metrics_collector: Arc<MetricsCollector>,

    /// Health server, created on start once an Arc to self exists
    health_server: Mutex<Option<Arc<HealthServer>>>,

    /// Active session managers keyed by user
    sessions: RwLock<HashMap<UserId, Arc<MatchSessionManager>>>,

    /// Background task handles
    background_tasks: Mutex<Vec<JoinHandle<()>>>,

    /// Service status
    is_running: Arc<RwLock<bool>>,
}

impl AppState {
    /// Initialize the application with all dependencies
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        info!("Initializing campus-match live match service");
        info!(
            "Configuration: service={}, metrics_port={}",
            config.service.name, config.service.metrics_port
        );

        let metrics_collector =
            Arc::new(
                MetricsCollector::new().map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to create metrics collector: {}", e),
                })?,
            );

        Ok(Self {
            config,
            pool: Arc::new(InMemoryCandidatePool::new()),
            channel: Arc::new(InProcessChannelRouter::new()),
            events: Arc::new(LoggingEventSink::new()),
            metrics_collector,
            health_server: Mutex::new(None),
            sessions: RwLock::new(HashMap::new()),
            background_tasks: Mutex::new(Vec::new()),
            is_running: Arc::new(RwLock::new(false)),
        })
    }

    /// Start the health server and background maintenance tasks
    pub async fn start(self: &Arc<Self>) -> Result<(), ServiceError> {
        info!("Starting campus-match service");

        *self.is_running.write().await = true;

        self.start_health_server().await?;
        self.start_background_tasks().await;

        info!("✅ Campus-match service started successfully");
        Ok(())
    }

    /// Perform graceful shutdown
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of campus-match service");

        *self.is_running.write().await = false;

        // End every live session so partners get notified
        let sessions: Vec<Arc<MatchSessionManager>> =
            self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            if let Err(e) = session.end().await {
                debug!("Session already terminal during shutdown: {}", e);
            }
        }

        self.stop_background_tasks().await;

        if let Some(health_server) = self.health_server.lock().await.take() {
            if let Err(e) = health_server.stop().await {
                warn!("Failed to stop health server: {}", e);
            } else {
                info!("✅ Health server stopped");
            }
        }

        info!("✅ Campus-match service shutdown completed");
        Ok(())
    }

    /// Create and register a session manager for one user
    ///
    /// Re-creating a session for a user replaces the previous registration;
    /// the old manager keeps working for anyone still holding it.
    pub async fn create_session(
        &self,
        user_id: impl Into<UserId>,
        profile: StudentProfile,
    ) -> Arc<MatchSessionManager> {
        let user_id = user_id.into();

        let manager = MatchSessionManager::new(
            user_id.clone(),
            profile,
            self.pool.clone(),
            self.channel.clone(),
            self.events.clone(),
            Some(self.metrics_collector.clone()),
            self.config.search_timeout(),
        );

        self.sessions
            .write()
            .await
            .insert(user_id.clone(), manager.clone());

        info!(user_id = %user_id, "Session manager created");
        manager
    }

    /// Get service configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Check if service is running
    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// Get the shared candidate pool
    pub fn pool(&self) -> Arc<InMemoryCandidatePool> {
        self.pool.clone()
    }

    /// Get the message router
    pub fn channel_router(&self) -> Arc<InProcessChannelRouter> {
        self.channel.clone()
    }

    /// Get the metrics collector
    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics_collector.clone()
    }

    /// Number of registered session managers
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Start the health and metrics HTTP server
    async fn start_health_server(self: &Arc<Self>) -> Result<(), ServiceError> {
        info!(
            "Starting health endpoints on port {}",
            self.config.service.metrics_port
        );

        let health_config = HealthServerConfig {
            port: self.config.service.metrics_port,
            host: "0.0.0.0".to_string(),
        };

        let health_server = Arc::new(
            HealthServer::new(health_config, self.metrics_collector.clone())
                .with_app_state(self.clone()),
        );
        *self.health_server.lock().await = Some(health_server.clone());

        let handle = tokio::spawn(async move {
            if let Err(e) = health_server.start().await {
                error!("Health server failed: {}", e);
            }
        });
        self.background_tasks.lock().await.push(handle);

        // Give the server a moment to bind
        tokio::time::sleep(Duration::from_millis(100)).await;

        Ok(())
    }

    /// Start background maintenance tasks
    async fn start_background_tasks(&self) {
        info!("Starting background maintenance tasks...");

        // Pool sweep task: drop candidates whose signal queue is gone and
        // keep the searching gauge current
        let sweep_task = {
            let pool = self.pool.clone();
            let metrics_collector = self.metrics_collector.clone();
            let sweep_interval = self.config.sweep_interval();
            let is_running = self.is_running.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(sweep_interval);
                info!(
                    "Pool sweep task started ({}s interval)",
                    sweep_interval.as_secs()
                );

                while *is_running.read().await {
                    interval.tick().await;

                    let pruned = pool.prune_disconnected();
                    if pruned > 0 {
                        info!("Pruned {} disconnected candidates", pruned);
                        metrics_collector.record_candidates_pruned(pruned);
                    } else {
                        debug!("Sweep completed - no disconnected candidates");
                    }

                    metrics_collector.update_searching_count(pool.searching_count().await);
                }

                info!("Pool sweep task stopped");
            })
        };

        // Service health metrics task
        let health_metrics_task = {
            let metrics_collector = self.metrics_collector.clone();
            let is_running = self.is_running.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                let start_time = tokio::time::Instant::now();
                info!("Health metrics task started (60s interval)");

                while *is_running.read().await {
                    interval.tick().await;

                    let uptime_seconds = start_time.elapsed().as_secs() as i64;
                    metrics_collector
                        .service()
                        .uptime_seconds
                        .set(uptime_seconds);
                    metrics_collector.update_health_status(2); // 2 = healthy

                    debug!("Updated service health metrics - uptime: {}s", uptime_seconds);
                }

                info!("Health metrics task stopped");
            })
        };

        let mut tasks = self.background_tasks.lock().await;
        tasks.push(sweep_task);
        tasks.push(health_metrics_task);

        info!("Background maintenance tasks started successfully");
    }

    /// Stop all background tasks
    async fn stop_background_tasks(&self) {
        let mut tasks = self.background_tasks.lock().await;
        let task_count = tasks.len();
        if task_count == 0 {
            info!("No background tasks to stop");
            return;
        }

        info!("Stopping {} background tasks...", task_count);

        for task in tasks.drain(..) {
            task.abort();
        }

        // Give tasks time to observe the abort
        tokio::time::sleep(Duration::from_millis(200)).await;

        info!("✅ All {} background tasks stopped", task_count);
    }
}
