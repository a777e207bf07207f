use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use discv5_common::logger::{setup_logger, LogLevel};
use discv5_common::tokio::select;
use discv5_common::{get_cli_styles, VERSION};
use discv5_daemon::discovery::{DiscoveryConfig, DiscoveryEvent, DiscoveryServer};
use log::{debug, info};

#[derive(Parser, Clone, Debug)]
#[command(name = "discv5_daemon", version = VERSION, styles = get_cli_styles())]
#[command(about = "Discovery v5 node: finds peers over encrypted UDP")]
pub struct CliConfig {
    /// Set log level
    #[clap(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Disable colors in the terminal output
    #[clap(long)]
    disable_log_color: bool,

    /// JSON configuration file, replaces the discovery flags when set
    #[clap(long)]
    config_file: Option<String>,

    /// Write the effective configuration to `--config-file` and exit
    #[clap(long, requires = "config_file")]
    generate_config_template: bool,

    #[clap(flatten)]
    discovery: DiscoveryConfig,
}

fn load_config(cli: &CliConfig) -> Result<DiscoveryConfig> {
    let Some(path) = &cli.config_file else {
        return Ok(cli.discovery.clone());
    };
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config file {}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid config file {}", path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliConfig::parse();
    setup_logger(cli.log_level, cli.disable_log_color)?;

    if cli.generate_config_template {
        if let Some(path) = &cli.config_file {
            if Path::new(path).exists() {
                anyhow::bail!("Config file already exists at {}", path);
            }
            fs::write(path, serde_json::to_string_pretty(&cli.discovery)?)?;
            info!("Configuration template written to {}", path);
        }
        return Ok(());
    }

    let config = load_config(&cli)?;
    if !config.is_enabled() {
        info!("Discovery is disabled, nothing to do");
        return Ok(());
    }

    info!("discv5_daemon v{}", VERSION);
    let (server, mut events) = DiscoveryServer::start(config).await?;

    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(DiscoveryEvent::EnrAdded { record, replaced }) => {
                    info!("Peer {} added to the routing table (replaced: {:?})", record.node_id(), replaced);
                }
                Some(DiscoveryEvent::AddressUpdated(addr)) => {
                    info!("External address is now {}", addr);
                }
                Some(event) => {
                    if log::log_enabled!(log::Level::Debug) {
                        debug!("Discovery event: {:?}", event);
                    }
                }
                None => break,
            }
        }
    }

    server.shutdown().await;
    Ok(())
}
