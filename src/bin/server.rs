// Instance Runtime - Main Server
// Long-running host process for the instance runtime
// Run with: cargo run --bin server

//! # Instance Runtime Server Binary
//!
//! This is the main executable that hosts an [`InstanceManagerApi`] with all
//! of its background loops running. It shows how an application wires the
//! runtime together: load configuration, install logging, register
//! factories, start, and shut down cleanly on Ctrl-C.
//!
//! ## What This Server Provides
//!
//! - **Layered Configuration**: defaults, an optional file, then
//!   `INSTANCE_RUNTIME__*` environment variables
//! - **Demo Factory**: a `session` instance type with a health probe and a
//!   cleanup hook
//! - **Health Reports**: the component health rollup logged on an interval
//!
//! ## Architecture Demonstration
//!
//! ```text
//! main() function
//!   ↓ loads
//! RuntimeConfig (config + dotenv)
//!   ↓ builds
//! InstanceManagerApi
//!   ↓ starts
//! Expiry, sweep, quota and monitoring loops
//!   ↓ until
//! Ctrl-C → shutdown()
//! ```
//!
//! ## Rust Learning Notes:
//!
//! This file demonstrates several important Rust concepts:
//! - Binary crate vs library crate organization
//! - Async main functions with tokio
//! - `tokio::select!` to race a signal against a timer
//! - Error handling with `anyhow` at the application edge

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::Parser;
use dotenv::dotenv;
use instance_runtime::{
    Cleanup, FactoryRequest, HealthCheckable, InstanceManagerApi, InstanceRequest,
    ManagedInstance, RuntimeConfig,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "instance-runtime-server")]
#[command(about = "Hosts the multi-tenant instance runtime")]
#[command(version = "0.1")]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(long, env = "INSTANCE_RUNTIME_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Seconds between health reports
    #[arg(long, default_value_t = 60)]
    report_interval: u64,
}

/// Demo instance type served under the `session` name
struct DemoSession {
    instance_key: String,
    created_at: DateTime<Utc>,
    closed: AtomicBool,
}

#[async_trait]
impl HealthCheckable for DemoSession {
    async fn health_check(&self) -> instance_runtime::Result<bool> {
        Ok(!self.closed.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl Cleanup for DemoSession {
    async fn cleanup(&self) -> instance_runtime::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        info!(
            "Session {} closed after {}s",
            self.instance_key,
            (Utc::now() - self.created_at).num_seconds()
        );
        Ok(())
    }
}

impl ManagedInstance for DemoSession {
    fn type_label(&self) -> &'static str {
        "session"
    }

    fn as_health_check(&self) -> Option<&dyn HealthCheckable> {
        Some(self)
    }

    fn as_cleanup(&self) -> Option<&dyn Cleanup> {
        Some(self)
    }
}

/// Main entry point for the instance runtime server
///
/// ## Rust Learning Notes:
///
/// ### Async Main Function
/// `#[tokio::main]` transforms the async main function into a synchronous
/// main that sets up the tokio runtime, so `.await` can be used here.
///
/// ### Error Handling with anyhow
/// `anyhow::Result` can hold any error type implementing `std::error::Error`,
/// so the library's `RuntimeError` converts with a plain `?`.
#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; variables can come from the environment
    let dotenv_loaded = dotenv().is_ok();

    let cli = Cli::parse();

    // RUST_LOG wins over the --verbose switch
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚀 Starting Instance Runtime Server...");
    info!("=====================================");
    if !dotenv_loaded {
        info!("No .env file found, using process environment only");
    }

    let config = RuntimeConfig::load(cli.config.as_deref())?;
    info!(
        "Lifecycle: health checks every {}ms, sweep every {}s",
        config.lifecycle.defaults.health_check_interval_ms, config.lifecycle.sweep_interval_secs
    );
    info!(
        "Monitoring: cycle every {}ms, auto-recovery {}",
        config.monitoring.monitoring_interval_ms, config.monitoring.auto_recovery
    );

    let api = InstanceManagerApi::new(config);
    api.global_manager()
        .register_typed_factory("session", |request: FactoryRequest| async move {
            Ok::<_, instance_runtime::RuntimeError>(DemoSession {
                instance_key: request.context.instance_key(&request.instance_type),
                created_at: Utc::now(),
                closed: AtomicBool::new(false),
            })
        })
        .await;
    api.start().await;

    // Keep one demo session alive so the reports have something to show
    let demo = api
        .get_instance(&InstanceRequest::new("session", "demo-tenant", "demo-agent"))
        .await;
    match &demo {
        Some(_) => info!("✅ Demo session ready"),
        None => warn!("Demo session could not be created"),
    }

    let mut reports = tokio::time::interval(Duration::from_secs(cli.report_interval.max(1)));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
            _ = reports.tick() => {
                let report = api.health_check().await;
                info!("Health: {}", report.overall_status);
                match serde_json::to_string(&report.components) {
                    Ok(components) => info!("Components: {}", components),
                    Err(e) => error!("Failed to serialize health report: {}", e),
                }
            }
        }
    }

    info!("🛑 Shutting down...");
    api.shutdown().await;
    drop(demo);
    info!("Instance runtime server stopped");
    Ok(())
}
