//! # Command Relay Agent
//!
//! Listens on a command topic for single-digit codes, runs the matching command
//! on a remote machine over SSH and publishes the plaintext result (or the SSH
//! failure text) on a result topic.
//!
//! ```text
//! broker ─[expo/test]→ CommandHooks ─mpsc→ worker ─ssh→ remote
//!                                              │
//! broker ←[expo/test/results]── Publisher ◄────┘
//! ```

pub mod commands;
pub mod relay;
pub mod shell;

use crate::config::RelayConfig;
use crate::mqtt::config::client_id;
use crate::mqtt::mqtt_handler::MqttSession;
use color_eyre::Result;
use relay::{run_worker, CommandHooks};
use serde::{Deserialize, Serialize};
use shell::SshShell;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const COMMAND_QUEUE: usize = 32;

/// Where and how to reach the machine commands run on
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    /// ssh client binary
    pub program: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 22,
            user: "agent".to_string(),
            identity_file: None,
            connect_timeout_secs: 10,
            program: "ssh".to_string(),
        }
    }
}

impl SshConfig {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub command_topic: String,
    pub result_topic: String,
    pub client_id_prefix: String,
    pub confirm_timeout_secs: u64,
    pub ssh: SshConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command_topic: "expo/test".to_string(),
            result_topic: "expo/test/results".to_string(),
            client_id_prefix: "system_agent_".to_string(),
            confirm_timeout_secs: 10,
            ssh: SshConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }
}

/// Runs the agent until Ctrl-C.
///
/// Without a broker at startup the session keeps retrying in the background, so
/// commands are served as soon as a connection comes up.
pub async fn run(config: RelayConfig) -> Result<()> {
    serve(config, tokio::signal::ctrl_c()).await
}

/// Serves commands until `stop` resolves, then shuts the session down even when
/// waiting for the stop signal failed
async fn serve<F>(config: RelayConfig, stop: F) -> Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    let agent = config.agent;
    let client_id = client_id(&agent.client_id_prefix, None);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let hooks = Arc::new(CommandHooks::new(agent.command_topic.clone(), command_tx));

    let session = MqttSession::create(config.mqtt.clone(), &client_id).start(hooks);
    if !session.wait_connected(config.mqtt.connect_timeout()).await {
        warn!(
            "No MQTT connection after {:?}, continuing and retrying in the background",
            config.mqtt.connect_timeout()
        );
    }

    let worker = tokio::spawn(run_worker(
        Arc::new(SshShell::new(agent.ssh.clone())),
        session.context().clone(),
        agent.result_topic.clone(),
        agent.confirm_timeout(),
        command_rx,
    ));
    info!(
        "Listening for commands on {} (results on {}, target {})",
        agent.command_topic,
        agent.result_topic,
        agent.ssh.destination()
    );

    match stop.await {
        Ok(()) => info!("Shutting down"),
        Err(e) => error!("Failed to wait for Ctrl-C, shutting down: {}", e),
    }
    session.shutdown().await?;
    worker.abort();
    info!("Agent stopped");
    Ok(())
}
