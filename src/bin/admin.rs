//! Instance Runtime Admin CLI
//!
//! Administrative CLI tool for inspecting runtime configuration and for
//! exercising an in-process runtime with synthetic tenants.

use anyhow::Result;
use clap::{Parser, Subcommand};
use instance_runtime::{
    FactoryRequest, InstanceManagerApi, InstanceRequest, ManagedInstance, QuotaSpec, QuotaType,
    ResourceType, RuntimeConfig, RuntimeError,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "instance-runtime-admin")]
#[command(about = "Instance Runtime Admin CLI - Inspect configuration and simulate tenant load")]
#[command(version = "0.1")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML or JSON)
    #[arg(long, env = "INSTANCE_RUNTIME_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as JSON
    Config,

    /// Run a synthetic workload and print the resulting reports
    Simulate {
        /// Number of tenants
        #[arg(long, default_value_t = 2)]
        tenants: usize,

        /// Agents per tenant
        #[arg(long, default_value_t = 2)]
        agents: usize,

        /// Chat streams per agent
        #[arg(long, default_value_t = 1)]
        chats: usize,

        /// Instance quota applied to every tenant
        #[arg(long, default_value_t = 50.0)]
        instance_limit: f64,
    },
}

/// Placeholder instance created by the simulation
struct SimulatedSession;

impl ManagedInstance for SimulatedSession {
    fn type_label(&self) -> &'static str {
        "session"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // Logs go to stderr so the JSON on stdout stays parseable
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = RuntimeConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Simulate {
            tenants,
            agents,
            chats,
            instance_limit,
        } => {
            simulate(config, tenants, agents, chats, instance_limit).await?;
        }
    }

    Ok(())
}

async fn simulate(
    config: RuntimeConfig,
    tenants: usize,
    agents: usize,
    chats: usize,
    instance_limit: f64,
) -> Result<()> {
    info!(
        "🧪 Simulating {} tenants x {} agents x {} chats",
        tenants, agents, chats
    );

    let api = InstanceManagerApi::new(config);
    api.global_manager()
        .register_typed_factory("session", |_request: FactoryRequest| async {
            Ok::<_, RuntimeError>(SimulatedSession)
        })
        .await;

    let tenant_ids: Vec<String> = (0..tenants).map(|t| format!("tenant-{}", t)).collect();
    let mut held: Vec<Arc<dyn ManagedInstance>> = Vec::new();
    let mut refused = 0usize;

    for tenant_id in &tenant_ids {
        let quotas = HashMap::from([
            (
                ResourceType::Instances.as_str().to_string(),
                QuotaSpec::new(QuotaType::HardLimit, instance_limit),
            ),
            (
                ResourceType::Requests.as_str().to_string(),
                QuotaSpec::new(QuotaType::SoftLimit, 1000.0),
            ),
        ]);
        if !api.setup_tenant_quotas(tenant_id, quotas).await {
            warn!("Some quotas for {} were rejected", tenant_id);
        }

        for a in 0..agents {
            let agent_id = format!("agent-{}", a);
            let mut requests = vec![InstanceRequest::new("session", tenant_id, &agent_id)];
            for c in 0..chats {
                requests.push(
                    InstanceRequest::new("session", tenant_id, &agent_id)
                        .chat_stream(&format!("chat-{}", c)),
                );
            }

            for request in requests {
                match api.get_instance(&request).await {
                    Some(instance) => held.push(instance),
                    None => refused += 1,
                }
                api.resource_manager()
                    .record_usage(tenant_id, ResourceType::Requests, 1.0, None)
                    .await;
            }
        }
    }

    // one monitoring pass so health figures are populated
    api.monitoring().run_monitoring_cycle().await;

    let mut summaries = Vec::with_capacity(tenant_ids.len());
    for tenant_id in &tenant_ids {
        summaries.push(api.get_tenant_summary(tenant_id).await);
    }

    let output = json!({
        "created": held.len(),
        "refused": refused,
        "tenants": summaries,
        "system": api.get_system_stats().await,
        "health": api.health_check().await,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    api.shutdown().await;
    drop(held);
    Ok(())
}
