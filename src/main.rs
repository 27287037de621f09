//! MQTT Authorization CLI
//!
//! Evaluates single requests against a policy, or runs the refresh loop.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sentinel_mqtt_authz::{AuthzConfig, MqttAuthzAgent, Operation, RawContext};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// MQTT authorization engine for Sentinel
#[derive(Parser, Debug)]
#[command(name = "sentinel-authz")]
#[command(author = "Sentinel Contributors")]
#[command(version)]
#[command(about = "MQTT topic authorization engine for Sentinel", long_about = None)]
struct Args {
    /// Configuration file path (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Policy file path (JSON), overrides the configured source
    #[arg(short, long)]
    policy: Option<PathBuf>,

    /// Policy URL (HTTP JSON), overrides the configured source
    #[arg(long, conflicts_with = "policy")]
    policy_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate one request and print the verdict as JSON
    Check {
        #[arg(long)]
        client_id: String,

        #[arg(long)]
        username: Option<String>,

        #[arg(long)]
        password: Option<String>,

        /// Role supplied by the broker (repeatable)
        #[arg(long = "role")]
        roles: Vec<String>,

        #[arg(long)]
        ip: Option<String>,

        #[arg(long)]
        cert_subject: Option<String>,

        /// connect, publish or subscribe
        #[arg(long)]
        operation: Operation,

        /// Topic, topic filter or client ID
        #[arg(long)]
        resource: String,
    },

    /// Load the policy and keep refreshing it until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        info!(path = %config_path.display(), "Loading configuration from file");
        AuthzConfig::from_file(config_path)?
    } else {
        AuthzConfig::default()
    };
    if let Some(policy) = args.policy {
        config.policy.file = Some(policy);
        config.policy.url = None;
    }
    if let Some(url) = args.policy_url {
        config.policy.file = None;
        config.policy.url = Some(url);
    }

    let agent = MqttAuthzAgent::with_config(config)?;

    match args.command {
        Command::Check {
            client_id,
            username,
            password,
            roles,
            ip,
            cert_subject,
            operation,
            resource,
        } => {
            agent.refresh().await.context("failed to load policy")?;

            let mut raw = RawContext::new(client_id);
            raw.username = username;
            raw.password = password.map(String::into_bytes);
            raw.client_ip = ip;
            raw.certificate_subject = cert_subject;
            raw.roles = roles;

            let verdict = agent.engine().authorize(&raw, operation, &resource);
            println!("{}", serde_json::to_string_pretty(&verdict)?);
        }
        Command::Watch => {
            info!(version = env!("CARGO_PKG_VERSION"), "Starting MQTT authorization engine");
            let _ = agent.start().await;

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;

            info!(stats = %serde_json::to_string(&agent.stats())?, "Shutting down");
            agent.shutdown().await;
        }
    }

    Ok(())
}
