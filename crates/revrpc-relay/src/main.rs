//! revrpc-relay: relay server binary.

use anyhow::Context;
use clap::Parser;
use revrpc_core::{log, Ed25519Identity, IdentityProvider};
use revrpc_relay::{DuplicatePolicy, Overrides, Relay, RelayConfig, RelayServer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// revrpc-relay: routes commands from users to reverse-connected resources
#[derive(Parser, Debug)]
#[command(name = "revrpc-relay", version, about = "revrpc relay server")]
struct Cli {
    /// Config file path (default: ~/.revrpc/relay.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// User port
    #[arg(short, long)]
    port: Option<u16>,

    /// Resource port (default: port + 1)
    #[arg(long)]
    resource_port: Option<u16>,

    /// Largest SEND payload forwarded to any resource
    #[arg(long)]
    command_data_limit: Option<u32>,

    /// What to do when a resource registers a name already in use
    #[arg(long, value_enum)]
    duplicate_policy: Option<DuplicatePolicy>,

    /// Let users stop the relay with STOP_SERVER
    #[arg(long)]
    allow_remote_stop: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let overrides = Overrides {
        host: cli.host,
        port: cli.port,
        resource_port: cli.resource_port,
        command_data_limit: cli.command_data_limit,
        duplicate_policy: cli.duplicate_policy,
        allow_remote_stop: cli.allow_remote_stop,
    };
    let config_path = cli.config.unwrap_or_else(RelayConfig::default_path);
    let config = RelayConfig::load(Some(config_path.as_path()), &overrides)
        .context("failed to load config")?;

    let identity = match &config.key_path {
        Some(path) => Ed25519Identity::load_or_generate(path)
            .with_context(|| format!("failed to load relay key {}", path.display()))?,
        None => Ed25519Identity::generate(),
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        resource_port = config.resource_port,
        fingerprint = %identity.fingerprint(),
        require_signature = config.require_signature,
        authorized_keys = config.authorized_keys.len(),
        "starting revrpc-relay"
    );

    let transport_log = match &config.transport_log_file {
        Some(path) => log::to_file(path)
            .with_context(|| format!("failed to open transport log {}", path.display()))?,
        None => log::from_flag(config.transport_log),
    };
    let verifier: Arc<dyn IdentityProvider> = Arc::new(identity);
    let relay = Relay::new(config.clone(), verifier, transport_log);
    let server = RelayServer::bind(relay)
        .await
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;

    server
        .run_until(shutdown_signal())
        .await
        .context("relay error")?;

    info!("revrpc-relay stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
