//! revrpc: command-line client for a revrpc relay.
//!
//! Lists and looks up resources, forwards payloads to them, and can serve
//! as a resource itself (echo, or backed by a shell command).

mod commands;

use clap::{Parser, Subcommand};
use revrpc_client::EndpointConfig;
use std::path::PathBuf;
use tracing::error;

/// revrpc: reverse-RPC client
#[derive(Parser)]
#[command(name = "revrpc", version, about = "Call resources through a revrpc relay, or serve as one")]
struct Cli {
    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Relay host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Relay user port (resources use port + 1 unless configured)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Connection attempts before giving up
    #[arg(long, global = true)]
    retries: Option<u32>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List live resources
    List {
        /// Only names starting with this prefix
        #[arg(default_value = "")]
        prefix: String,
        /// Print as a JSON array
        #[arg(long)]
        json: bool,
    },

    /// Print the resource ID for a name (0 if absent)
    Present {
        name: String,
    },

    /// Send DATA to a resource by ID
    Send {
        id: u64,
        /// Text, hex with --hex, or @file
        data: String,
        /// DATA is hex and the reply is printed as hex
        #[arg(long)]
        hex: bool,
    },

    /// Send DATA to a resource by name
    SendTo {
        name: String,
        /// Text, hex with --hex, or @file
        data: String,
        /// DATA is hex and the reply is printed as hex
        #[arg(long)]
        hex: bool,
    },

    /// List the command codes the relay answers
    Commands,

    /// Ask the relay to shut down
    Stop,

    /// Register as a resource and serve until interrupted
    Serve {
        /// Resource name (default: [endpoint] name)
        #[arg(long)]
        name: Option<String>,
        /// Resource description
        #[arg(long)]
        description: Option<String>,
        /// Pipe each payload to this shell command and reply with its stdout
        #[arg(long)]
        exec: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let fallback = match (&cli.log_level, cli.verbose) {
        (Some(level), _) => level.clone(),
        (None, true) => "revrpc=debug,revrpc_client=debug,revrpc_core=debug".to_string(),
        (None, false) => "revrpc=warn,revrpc_client=warn".to_string(),
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(cli.verbose)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(EndpointConfig::default_path);
    let mut cfg = match EndpointConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("revrpc: {e}");
            std::process::exit(1);
        }
    };
    if let Some(host) = cli.host {
        cfg.host = host;
    }
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(retries) = cli.retries {
        cfg.retry_count = retries;
    }

    let result = match cli.command {
        Command::List { prefix, json } => commands::user::run_list(&cfg, &prefix, json).await,
        Command::Present { name } => commands::user::run_present(&cfg, &name).await,
        Command::Send { id, data, hex } => commands::user::run_send(&cfg, id, &data, hex).await,
        Command::SendTo { name, data, hex } => {
            commands::user::run_send_to(&cfg, &name, &data, hex).await
        }
        Command::Commands => commands::user::run_commands(&cfg).await,
        Command::Stop => commands::user::run_stop(&cfg).await,
        Command::Serve {
            name,
            description,
            exec,
        } => {
            if let Some(name) = name {
                cfg.name = name;
            }
            if let Some(description) = description {
                cfg.description = description;
            }
            commands::resource::run_serve(&cfg, exec.as_deref()).await
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("revrpc: {e:#}");
        std::process::exit(1);
    }
}
