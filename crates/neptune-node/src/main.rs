mod config;
mod node;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use neptune_protocol::NodeCrypto;

use config::NodeConfig;
use node::RelayNode;

#[derive(Parser)]
#[command(name = "neptune-node", version, about = "Neptune federated message relay node")]
struct Cli {
    /// TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `node_name`.
    #[arg(short, long)]
    name: Option<String>,

    /// Overrides `bus_url` (internal://<name> or rabbitmq://<host>:<port>[/<queue>]).
    #[arg(long)]
    bus: Option<String>,

    /// Overrides `log_level`. RUST_LOG wins over both.
    #[arg(long)]
    log_level: Option<String>,

    /// Overrides `max_hops`.
    #[arg(long)]
    max_hops: Option<u32>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay until Ctrl-C (default).
    Run,
    /// Load and validate the configuration, print it, exit.
    CheckConfig,
    /// Print a fresh identity seed and its public key.
    Keygen,
}

fn load_config(cli: &Cli) -> Result<NodeConfig> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load_from_file(path)?,
        None => NodeConfig::default(),
    };
    config.merge_with_env()?;
    if let Some(name) = &cli.name {
        config.node_name = name.clone();
    }
    if let Some(bus) = &cli.bus {
        config.bus_url = Some(bus.clone());
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if let Some(max_hops) = cli.max_hops {
        config.max_hops = max_hops;
    }
    Ok(config)
}

fn init_logging(config: &NodeConfig) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    match cli.command.take().unwrap_or(Command::Run) {
        Command::Keygen => {
            let crypto = NodeCrypto::generate();
            println!("identity_seed = \"{}\"", crypto.seed_hex());
            println!("public_key    = \"{}\"", crypto.public_key_hex());
        }
        Command::CheckConfig => {
            let config = load_config(&cli)?;
            config.validate()?;
            let mut shown = config;
            shown.shared_key = "<redacted>".into();
            shown.identity_seed = shown.identity_seed.map(|_| "<redacted>".into());
            println!("{}", toml::to_string_pretty(&shown)?);
        }
        Command::Run => {
            let config = load_config(&cli)?;
            init_logging(&config);
            eprintln!("neptune-node v{}", env!("CARGO_PKG_VERSION"));
            let node = RelayNode::build(&config).await?;
            node.run_until(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("ctrl-c handler failed: {e}");
                }
            })
            .await?;
        }
    }
    Ok(())
}
