use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use shelly_meter_bridge::config::{self, BridgeConfig};
use shelly_meter_bridge::{ModbusBus, Orchestrator};
use tokio::net::TcpListener;
use tracing::{error, info, Level};

/// Shelly EM / 3EM to SunSpec Modbus meter bridge
#[derive(Parser, Debug)]
#[command(name = "shelly-meter-bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(
        short = 'c',
        long = "config",
        value_name = "PATH",
        env = "SHELLY_BRIDGE_CONFIG",
        default_value = "config.toml"
    )]
    config: PathBuf,

    /// Overrides global.log_level (e.g. debug, WARNING or 20)
    #[arg(short = 'l', long = "log-level", value_name = "LEVEL", value_parser = parse_level_arg)]
    log_level: Option<Level>,
}

fn parse_level_arg(s: &str) -> Result<Level, String> {
    config::parse_level_name(s).ok_or_else(|| format!("Unknown log level: {s}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let text = match config::read_config_text(&cli.config) {
        Ok(text) => text,
        Err(err) => {
            tracing_subscriber::fmt()
                .with_max_level(cli.log_level.unwrap_or(Level::INFO))
                .init();
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let level = cli
        .log_level
        .unwrap_or_else(|| config::log_level_from_toml(&text));
    tracing_subscriber::fmt().with_max_level(level).init();

    match run(&text).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config_text: &str) -> anyhow::Result<()> {
    let config = BridgeConfig::from_toml_str(config_text).context("invalid configuration")?;
    info!(
        "Starting Shelly meter bridge for {} device(s)",
        config.devices.len()
    );

    let mut orchestrator = Orchestrator::start(&config)?;

    let modbus_server = match config.global.modbus_listen {
        Some(socket_addr) => {
            let listener = TcpListener::bind(socket_addr)
                .await
                .with_context(|| format!("failed to bind Modbus server to {socket_addr}"))?;
            info!("Starting up Modbus server on {socket_addr}");
            let bus = ModbusBus::new(orchestrator.readers());
            Some(tokio::spawn(async move {
                if let Err(err) = bus.serve_listener(listener).await {
                    error!("Modbus server stopped: {err:#}");
                }
            }))
        }
        None => {
            info!("No modbus_listen configured; Modbus publishing disabled");
            None
        }
    };

    orchestrator
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {err}");
            }
        })
        .await;

    orchestrator.shutdown().await;
    if let Some(handle) = modbus_server {
        handle.abort();
    }
    info!("Shelly meter bridge stopped");
    Ok(())
}
