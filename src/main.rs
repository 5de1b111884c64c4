use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use switchboard::channels::loopback::LoopbackChannel;
use switchboard::channels::ChannelRegistry;
use switchboard::tools::ToolRegistry;
use switchboard::{Config, Gateway};

/// Switchboard - gateway between messaging channels and AI agents
#[derive(Parser)]
#[command(name = "switchboard", version, about)]
struct Cli {
    /// Path to the config file (default: ./switchboard.toml)
    #[arg(short, long, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// Port for the RPC listener (overrides config)
    #[arg(long, env = "SWITCHBOARD_PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway in the foreground
    Run {
        /// Register the in-process loopback channel (for development)
        #[arg(long)]
        loopback: bool,
    },
    /// Validate the config file and print a summary
    CheckConfig,
    /// Print the deterministic session key for a routing tuple
    Resolve {
        #[arg(long)]
        channel: String,
        #[arg(long, default_value = "default")]
        account: String,
        #[arg(long)]
        peer: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,switchboard=info",
        1 => "info,switchboard=debug",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = switchboard::config::file::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.rpc.port = port;
    }

    match cli.command.unwrap_or(Command::Run { loopback: false }) {
        Command::Run { loopback } => run_gateway(config, cli.config, loopback).await,
        Command::CheckConfig => check_config(&config),
        Command::Resolve {
            channel,
            account,
            peer,
        } => resolve_tuple(&config, &channel, &account, &peer),
    }
}

async fn run_gateway(
    config: Config,
    config_path: Option<PathBuf>,
    loopback: bool,
) -> anyhow::Result<()> {
    let mut channels = ChannelRegistry::new();
    if loopback {
        channels.register(Arc::new(LoopbackChannel::new("loopback")))?;
        tracing::info!("loopback channel registered");
    }

    let gateway = Gateway::new(
        config,
        config_path,
        channels,
        ToolRegistry::with_builtins(),
    )?;
    gateway.run().await?;
    Ok(())
}

fn check_config(config: &Config) -> anyhow::Result<()> {
    config.validate()?;
    println!(
        "ok: {} agents, {} bindings, {} channels, {} provider profiles",
        config.agents.len(),
        config.bindings.len(),
        config.channels.len(),
        config.providers.len()
    );
    Ok(())
}

fn resolve_tuple(
    config: &Config,
    channel: &str,
    account: &str,
    peer: &str,
) -> anyhow::Result<()> {
    let envelope = switchboard::Envelope {
        channel: channel.to_string(),
        account: account.to_string(),
        peer: peer.to_string(),
        chat_kind: switchboard::ChatKind::Dm,
        group: None,
        from_display: peer.to_string(),
        timestamp: chrono::Utc::now(),
        text: String::new(),
        attachments: Vec::new(),
        reply_to: None,
        mentions: Vec::new(),
    };
    let decision = switchboard::resolve(&envelope, config);
    println!("agent: {}", decision.agent_id);
    println!("session_key: {}", decision.session_key);
    match decision.policy.blocked {
        Some(reason) => println!("blocked: {reason:?}"),
        None => println!("admitted"),
    }
    Ok(())
}
