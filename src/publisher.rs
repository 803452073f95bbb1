//! Manual publisher
//!
//! Either reads lines from stdin and publishes each one, or publishes a single
//! message and waits for the broker to confirm it.

use crate::config::RelayConfig;
use crate::mqtt::config::client_id;
use crate::mqtt::mqtt_handler::{MqttSession, NoHooks, RelayContext};
use color_eyre::{eyre::eyre, Result};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const PROMPT: &[u8] = b"Enter message: ";
const INPUT_QUEUE: usize = 16;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PublisherConfig {
    pub topic: String,
    pub client_id_prefix: String,
    pub confirm_timeout_secs: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            topic: "testtopic/temperature".to_string(),
            client_id_prefix: "publisher_".to_string(),
            confirm_timeout_secs: 10,
        }
    }
}

/// What to publish, as given on the command line
#[derive(Clone, Debug, Default)]
pub struct PublishRequest {
    pub topic: Option<String>,
    /// One-shot payload; stdin lines when absent
    pub message: Option<String>,
    pub qos: Option<QoS>,
    pub retain: bool,
}

pub async fn run(config: RelayConfig, request: PublishRequest) -> Result<()> {
    let settings = config.publisher;
    let topic = request.topic.clone().unwrap_or(settings.topic.clone());
    let confirm_timeout = Duration::from_secs(settings.confirm_timeout_secs);
    let client_id = client_id(&settings.client_id_prefix, Some(8));

    let session = MqttSession::create(config.mqtt.clone(), &client_id).start(Arc::new(NoHooks));
    if !session.wait_connected(config.mqtt.connect_timeout()).await {
        warn!(
            "No MQTT connection after {:?}, messages will be skipped until it comes up",
            config.mqtt.connect_timeout()
        );
    }
    let ctx = session.context().clone();

    let outcome = match request.message {
        Some(message) => {
            let qos = request.qos.unwrap_or(QoS::AtLeastOnce);
            publish_once(&ctx, &topic, &message, qos, request.retain, confirm_timeout).await
        }
        None => {
            let qos = request.qos.unwrap_or(QoS::AtMostOnce);
            let lines = spawn_stdin_reader();
            tokio::select! {
                queued = publish_lines(&ctx, &topic, qos, request.retain, confirm_timeout, lines) => {
                    info!("Input closed after {} messages", queued);
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                }
            }
            Ok(())
        }
    };

    session.shutdown().await?;
    outcome
}

async fn publish_once(
    ctx: &RelayContext,
    topic: &str,
    message: &str,
    qos: QoS,
    retain: bool,
    confirm_timeout: Duration,
) -> Result<()> {
    let receipt = ctx
        .publisher()
        .publish_confirmed(topic, message, qos, retain, confirm_timeout)
        .await
        .map_err(|e| eyre!("Failed to publish to {}: {}", topic, e))?;
    info!(
        "Published to {} (message {}): {}",
        topic, receipt.pkid, message
    );
    Ok(())
}

/// Reads stdin on a plain thread so Ctrl-C never waits for the next newline
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(INPUT_QUEUE);
    let spawned = std::thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || read_lines(std::io::stdin().lock(), std::io::stdout(), tx));
    if let Err(e) = spawned {
        error!("Failed to start stdin reader: {}", e);
    }
    rx
}

/// Prompts, reads and forwards lines until EOF or until the receiver is gone
fn read_lines<R, W>(mut input: R, mut prompt: W, lines: mpsc::Sender<String>)
where
    R: BufRead,
    W: Write,
{
    loop {
        if let Err(e) = prompt.write_all(PROMPT).and_then(|_| prompt.flush()) {
            debug!("Failed to write prompt: {}", e);
        }

        let mut line = String::new();
        match input.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                let line = line.trim_end_matches(&['\r', '\n'][..]).to_string();
                if lines.blocking_send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("Failed to read input: {}", e);
                break;
            }
        }
    }
}

/// Publishes every line received on `lines`. Returns how many were queued.
pub async fn publish_lines(
    ctx: &RelayContext,
    topic: &str,
    qos: QoS,
    retain: bool,
    confirm_timeout: Duration,
    mut lines: mpsc::Receiver<String>,
) -> usize {
    let mut queued = 0;
    while let Some(line) = lines.recv().await {
        match ctx.publisher().publish(topic, line.as_bytes(), qos, retain) {
            Ok(pending) => {
                queued += 1;
                if let Err(e) = pending.wait(confirm_timeout).await {
                    warn!("Message to {} not confirmed: {}", topic, e);
                }
            }
            Err(e) => warn!("Skipped message to {}: {}", topic, e),
        }
    }
    queued
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::publish::tests::RecordingOutbound;
    use std::io;

    fn input(lines: &[&str]) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            tx.try_send(line.to_string()).unwrap();
        }
        rx
    }

    struct ClosedStdout;

    impl Write for ClosedStdout {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    #[test]
    fn reader_forwards_lines_and_prompts() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut prompts = Vec::new();
        read_lines(&b"21.5\r\n22.0"[..], &mut prompts, tx);
        assert_eq!(rx.try_recv().unwrap(), "21.5");
        assert_eq!(rx.try_recv().unwrap(), "22.0");
        assert!(rx.try_recv().is_err());
        assert_eq!(prompts, b"Enter message: ".repeat(3));
    }

    #[test]
    fn reader_survives_a_closed_stdout() {
        let (tx, mut rx) = mpsc::channel(4);
        read_lines(&b"hello\n"[..], ClosedStdout, tx);
        assert_eq!(rx.try_recv().unwrap(), "hello");
    }

    #[test]
    fn reader_stops_when_the_publisher_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        read_lines(&b"a\nb\n"[..], io::sink(), tx);
    }

    #[tokio::test]
    async fn every_line_is_published_in_order() {
        let outbound = Arc::new(RecordingOutbound::default());
        let ctx = RelayContext::new("pub", outbound.clone(), 10);
        ctx.state().set_connected(true);

        let queued = publish_lines(
            &ctx,
            "testtopic/temperature",
            QoS::AtMostOnce,
            false,
            Duration::from_millis(5),
            input(&["21.5", "22.0"]),
        )
        .await;

        assert_eq!(queued, 2);
        assert_eq!(
            outbound.published(),
            vec![
                ("testtopic/temperature".to_string(), "21.5".to_string()),
                ("testtopic/temperature".to_string(), "22.0".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn lines_are_skipped_while_disconnected() {
        let outbound = Arc::new(RecordingOutbound::default());
        let ctx = RelayContext::new("pub", outbound.clone(), 10);
        let queued = publish_lines(
            &ctx,
            "t",
            QoS::AtMostOnce,
            false,
            Duration::from_millis(5),
            input(&["hello"]),
        )
        .await;
        assert_eq!(queued, 0);
        assert!(outbound.published().is_empty());
    }

    #[tokio::test]
    async fn one_shot_fails_without_confirmation() {
        let outbound = Arc::new(RecordingOutbound::default());
        let ctx = RelayContext::new("pub", outbound.clone(), 10);
        ctx.state().set_connected(true);
        let result = publish_once(
            &ctx,
            "expo/test",
            "https://www.gsmarena.com/",
            QoS::AtLeastOnce,
            false,
            Duration::from_millis(5),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(outbound.published().len(), 1);
    }
}
