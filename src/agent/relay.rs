use super::commands;
use super::shell::RemoteShell;
use crate::mqtt::mqtt_handler::{RelayContext, SessionHooks};
use rumqttc::{Publish, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Subscribes to the command topic and hands payloads to the worker.
///
/// Commands run over SSH and can take seconds, so they never execute on the
/// event-loop task.
pub struct CommandHooks {
    command_topic: String,
    commands: mpsc::Sender<String>,
}

impl CommandHooks {
    pub fn new(command_topic: impl Into<String>, commands: mpsc::Sender<String>) -> Self {
        CommandHooks {
            command_topic: command_topic.into(),
            commands,
        }
    }
}

impl SessionHooks for CommandHooks {
    fn on_connect(&self, ctx: &RelayContext) {
        match ctx.publisher().subscribe(&self.command_topic, QoS::AtLeastOnce) {
            Ok(()) => info!("Subscribed to {}", self.command_topic),
            Err(e) => error!("Failed to subscribe to {}: {}", self.command_topic, e),
        }
    }

    fn on_message(&self, _ctx: &RelayContext, publish: &Publish) {
        if publish.topic != self.command_topic {
            return;
        }
        let command = String::from_utf8_lossy(&publish.payload).trim().to_string();
        info!("Received command: {}", command);
        if let Err(e) = self.commands.try_send(command) {
            warn!("Dropping command, worker unavailable: {}", e);
        }
    }
}

/// Executes queued commands in arrival order and publishes each result
pub async fn run_worker<S>(
    shell: Arc<S>,
    ctx: RelayContext,
    result_topic: String,
    confirm_timeout: Duration,
    mut commands: mpsc::Receiver<String>,
) where
    S: RemoteShell + ?Sized,
{
    while let Some(command) = commands.recv().await {
        let result = commands::execute(shell.as_ref(), &command, chrono::Utc::now().timestamp()).await;
        match ctx
            .publisher()
            .publish_confirmed(
                &result_topic,
                result.as_bytes(),
                QoS::AtLeastOnce,
                false,
                confirm_timeout,
            )
            .await
        {
            Ok(receipt) => info!("Published result (message {}): {}", receipt.pkid, result),
            Err(e) => error!("Failed to publish result for command {}: {}", command, e),
        }
    }
    info!("Command worker stopped");
}
