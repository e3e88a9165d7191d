//! OpenVPN client CLI.

use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ovpnc::{parse_config_file, Muxer, Options, Pinger};

#[derive(Parser)]
#[command(name = "ovpnc")]
#[command(about = "Minimal OpenVPN client")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Establish the tunnel and ping a host through it
    Ping {
        /// Target for the ICMP echo requests
        #[arg(short, long, default_value = "8.8.8.8")]
        target: String,

        /// Stop after sending this many echo requests
        #[arg(short = 'n', long, default_value_t = 3)]
        count: u32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let fallback = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false).without_time())
        .try_init()
        .ok();

    let options = parse_config_file(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config))?;

    match cli.command {
        Command::Ping { target, count } => run_ping(options, &target, count),
    }
}

fn run_ping(options: Options, target: &str, count: u32) -> Result<()> {
    let target: Ipv4Addr = target
        .parse()
        .with_context(|| format!("invalid ping target: {target}"))?;

    info!(remote = %options.remote_endpoint(), "connecting");
    let mut muxer = Muxer::connect(options).context("failed to reach the server")?;
    muxer.handshake().context("VPN handshake failed")?;
    let tunnel = muxer
        .tunnel()
        .context("server pushed no tunnel parameters")?;
    info!(ip = %tunnel.ip, "tunnel up");

    let (reader, writer) = muxer.split();
    let mut pinger = Pinger::new(reader, writer, tunnel.ip, target, count);
    let summary = pinger.run().context("ping series failed")?;
    println!("{summary}");
    Ok(())
}
