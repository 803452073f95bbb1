pub mod agent;
pub mod config;
pub mod mqtt;
pub mod persistence;
pub mod publisher;
pub mod web;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use config::RelayConfig;
use publisher::PublishRequest;
use rumqttc::QoS;
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;
use web::RatesOptions;

#[derive(Parser, Debug)]
#[command(name = "mqtt-relay", version, about = "Small MQTT relay tools")]
struct Cli {
    /// Configuration file (defaults to the per-user config dir)
    #[arg(long, global = true, env = "MQTT_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Broker host, overrides the configuration file
    #[arg(short, long, global = true, env = "MQTT_RELAY_BROKER")]
    broker: Option<String>,

    /// Broker port, overrides the configuration file
    #[arg(long, global = true, env = "MQTT_RELAY_PORT")]
    port: Option<u16>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish one message, or every line typed on stdin
    Publish {
        #[arg(short, long)]
        topic: Option<String>,
        #[arg(short, long)]
        message: Option<String>,
        #[arg(long, value_parser = parse_qos)]
        qos: Option<QoS>,
        #[arg(long)]
        retain: bool,
    },
    /// Serve the exchange-rate page and mirror the data onto MQTT
    Rates {
        #[arg(long)]
        no_mqtt: bool,
        /// Replace the stored data set with this JSON file first
        #[arg(long)]
        import: Option<PathBuf>,
    },
    /// Run remote commands received on the command topic
    Agent,
    /// Write the default configuration file
    InitConfig {
        #[arg(long)]
        force: bool,
    },
}

fn parse_qos(value: &str) -> Result<QoS, String> {
    match value {
        "0" => Ok(QoS::AtMostOnce),
        "1" => Ok(QoS::AtLeastOnce),
        other => Err(format!("unsupported QoS {} (use 0 or 1)", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup(cli.verbose)?;

    let path = cli.config.clone().unwrap_or_else(RelayConfig::default_path);
    if let Command::InitConfig { force } = cli.command {
        return RelayConfig::write_default(&path, force)
            .await
            .map_err(|e| eyre!("Failed to initialize configuration: {}", e));
    }

    let mut config = RelayConfig::load_or_default(&path).await?;
    if let Some(host) = cli.broker {
        config.mqtt = config.mqtt.with_host(&host);
    }
    if let Some(port) = cli.port {
        config.mqtt.port = port;
    }
    debug!("Using broker {}:{}", config.mqtt.host, config.mqtt.port);

    match cli.command {
        Command::Publish {
            topic,
            message,
            qos,
            retain,
        } => {
            publisher::run(
                config,
                PublishRequest {
                    topic,
                    message,
                    qos,
                    retain,
                },
            )
            .await
        }
        Command::Rates { no_mqtt, import } => {
            web::run(config, RatesOptions { no_mqtt, import }).await
        }
        Command::Agent => agent::run(config).await,
        Command::InitConfig { .. } => Ok(()),
    }
}

fn setup(verbose: bool) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    let level = if verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
    Ok(())
}
