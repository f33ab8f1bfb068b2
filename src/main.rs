//! Main entry point for the Campus Match live match service
//!
//! This is the production entry point that initializes and runs the
//! complete live match service with proper error handling, logging,
//! and graceful shutdown.

use anyhow::Result;
use campus_match::config::{validate_config, AppConfig};
use campus_match::service::{AppState, HealthCheck, HealthStatus};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Campus Match Live Match Service - Random Student Pairing and Chat
#[derive(Parser)]
#[command(
    name = "campus-match",
    version,
    about = "A live match service that pairs students at random for ephemeral one-on-one chats",
    long_about = "Campus Match is a Rust-based session service that registers students in a \
                 candidate pool, pairs them uniformly at random, relays chat messages between \
                 matched pairs, and manages the full session lifecycle from search to ending."
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Path to configuration file (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Perform health check and exit
    #[arg(long, help = "Perform a health check and exit with status code")]
    health_check: bool,

    /// Log level override
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Override log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    /// Metrics port override
    #[arg(long, value_name = "PORT", help = "Override metrics server port")]
    metrics_port: Option<u16>,

    /// Search timeout override
    #[arg(
        long,
        value_name = "SECONDS",
        help = "Override search timeout in seconds (0 = search forever)"
    )]
    search_timeout: Option<u64>,

    /// Enable debug mode
    #[arg(short, long, help = "Enable debug mode with verbose logging")]
    debug: bool,

    /// Dry run mode (validate config and exit)
    #[arg(
        long,
        help = "Validate configuration and exit without starting service"
    )]
    dry_run: bool,
}

/// Initialize structured logging with the configured level
fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Perform health check and return appropriate exit code
async fn perform_health_check(config: AppConfig) -> Result<()> {
    info!("Performing health check...");

    let app_state = Arc::new(AppState::new(config).await?);

    match HealthCheck::check(app_state).await {
        Ok(health) => {
            println!("Health Check: {}", health.status);
            println!("  Candidates Searching: {}", health.stats.candidates_searching);
            println!("  Open Channels: {}", health.stats.open_channels);
            println!("  Matches Made: {}", health.stats.matches_made);
            println!("  Messages Relayed: {}", health.stats.messages_relayed);
            println!("  Uptime: {}", health.stats.uptime_info);

            if health.status == HealthStatus::Healthy {
                std::process::exit(0);
            } else {
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("Health check failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Wait for shutdown signals (SIGINT, SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C) signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

/// Run periodic health checks
async fn health_check_task(app_state: Arc<AppState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));

    while app_state.is_running().await {
        interval.tick().await;

        match HealthCheck::check(app_state.clone()).await {
            Ok(health) => {
                info!(
                    "Health check: {} - {} searching, {} open channels",
                    health.status, health.stats.candidates_searching, health.stats.open_channels
                );
            }
            Err(e) => {
                warn!("Health check failed: {}", e);
            }
        }
    }
}

/// Display startup banner with service information
fn display_startup_banner(config: &AppConfig) {
    info!("🚀 Campus Match Live Match Service");
    info!("   Service: {}", config.service.name);
    info!("   Log level: {}", config.service.log_level);
    info!("   Metrics port: {}", config.service.metrics_port);
    match config.search_timeout() {
        Some(timeout) => info!("   Search timeout: {}s", timeout.as_secs()),
        None => info!("   Search timeout: unbounded"),
    }
    info!(
        "   Pool sweep interval: {}s",
        config.sweep_interval().as_secs()
    );
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}

/// Load and merge configuration from environment and CLI arguments
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = if let Some(config_path) = &args.config {
        AppConfig::from_file(config_path)?
    } else {
        AppConfig::from_env()?
    };

    // Apply CLI overrides
    if let Some(log_level) = &args.log_level {
        config.service.log_level = log_level.clone();
    }

    if args.debug {
        config.service.log_level = "debug".to_string();
    }

    if let Some(metrics_port) = args.metrics_port {
        config.service.metrics_port = metrics_port;
    }

    if let Some(search_timeout) = args.search_timeout {
        config.matching.search_timeout_seconds = search_timeout;
    }

    validate_config(&config)?;

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args).unwrap_or_else(|e| {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    });

    if let Err(e) = init_logging(&config.service.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    if args.health_check {
        return perform_health_check(config).await;
    }

    if args.dry_run {
        info!("Configuration validation successful");
        display_startup_banner(&config);
        info!("Dry run completed - exiting without starting service");
        return Ok(());
    }

    display_startup_banner(&config);

    info!("Initializing service components...");
    let app_state = match AppState::new(config.clone()).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting service...");
    if let Err(e) = app_state.start().await {
        error!("Failed to start service: {}", e);
        std::process::exit(1);
    }

    // Start health check monitoring
    let health_task = {
        let app_state = app_state.clone();
        tokio::spawn(async move {
            health_check_task(app_state).await;
        })
    };

    info!("✅ Campus Match Live Match Service is running");
    info!("Press Ctrl+C to shutdown gracefully...");

    wait_for_shutdown_signal().await;

    info!("🛑 Shutdown signal received, beginning graceful shutdown...");

    health_task.abort();

    let shutdown_timeout = config.shutdown_timeout();
    match tokio::time::timeout(shutdown_timeout, app_state.shutdown()).await {
        Ok(Ok(())) => {
            info!("✅ Graceful shutdown completed successfully");
        }
        Ok(Err(e)) => {
            warn!("Shutdown finished with errors: {}", e);
        }
        Err(_) => {
            warn!("⚠️  Shutdown timeout exceeded, forcing exit");
        }
    }

    info!("🛑 Campus Match Live Match Service stopped");
    Ok(())
}
