//! MQTT session lifecycle and event relay
//!
//! A session owns the rumqttc event loop and runs it on its own tokio task. Every
//! event the loop yields goes through [`dispatch_event`], which updates the shared
//! [`RelayContext`] and then calls the binary-specific [`SessionHooks`]. Events are
//! handled one at a time in arrival order, so hooks never run concurrently with
//! each other, only with the foreground task.
//!
//! # State Machine
//!
//! ```text
//! Configured ──start()──► Running ──shutdown()──► (dropped)
//! ```

use super::config::MqttConfig;
use super::connection::{ConnectionFlag, ConnectionState};
use super::message_manager::{MessageLog, MessageRecord};
use super::publish::{Outbound, PublishTracker, Publisher};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet, Publish,
};
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("MQTT event loop task failed: {0}")]
    EventLoop(#[from] tokio::task::JoinError),
}

/// Per-binary reactions to connection lifecycle events.
///
/// Hooks run on the event-loop task and must not block; hand long work to a
/// channel instead.
pub trait SessionHooks: Send + Sync + 'static {
    fn on_connect(&self, _ctx: &RelayContext) {}

    fn on_message(&self, _ctx: &RelayContext, _publish: &Publish) {}

    fn on_disconnect(&self, _ctx: &RelayContext) {}
}

/// Hooks that only keep the shared state current
pub struct NoHooks;

impl SessionHooks for NoHooks {}

/// Everything a collaborator needs to observe or drive the relay
#[derive(Clone)]
pub struct RelayContext {
    client_id: Arc<str>,
    log: Arc<MessageLog>,
    state: ConnectionFlag,
    publisher: Publisher,
}

impl RelayContext {
    pub fn new(client_id: &str, outbound: Arc<dyn Outbound>, history_capacity: usize) -> Self {
        let state = ConnectionFlag::new();
        let publisher = Publisher::new(outbound, Arc::new(PublishTracker::default()), state.clone());
        RelayContext {
            client_id: Arc::from(client_id),
            log: Arc::new(MessageLog::with_capacity(history_capacity)),
            state,
            publisher,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    pub fn state(&self) -> &ConnectionFlag {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }
}

/// Applies one event from the network loop to the relay state
pub fn dispatch_event(ctx: &RelayContext, hooks: &dyn SessionHooks, event: &Event) {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) => {
            if ack.code == ConnectReturnCode::Success {
                info!("Connected to MQTT broker as {}", ctx.client_id());
                ctx.state.set_connected(true);
                ctx.log.record(MessageRecord::connected());
                hooks.on_connect(ctx);
            } else {
                error!(
                    "Failed to connect to MQTT broker: {}",
                    refusal_reason(ack.code)
                );
                mark_disconnected(ctx, hooks);
            }
        }
        Event::Incoming(Packet::Publish(publish)) => {
            let payload = String::from_utf8_lossy(&publish.payload);
            debug!(
                "Received MQTT message on {} (QoS {:?}, retain {}): {}",
                publish.topic, publish.qos, publish.retain, payload
            );
            ctx.log
                .record(MessageRecord::inbound(publish.topic.clone(), payload));
            hooks.on_message(ctx, publish);
        }
        Event::Incoming(Packet::PubAck(ack)) => {
            debug!("Message published with ID: {}", ack.pkid);
            ctx.publisher.tracker().on_ack(ack.pkid);
            ctx.log.record(MessageRecord::publish_confirmed(ack.pkid));
        }
        Event::Incoming(Packet::SubAck(ack)) => {
            debug!("Subscription {} acknowledged: {:?}", ack.pkid, ack.return_codes);
        }
        Event::Incoming(Packet::Disconnect) | Event::Outgoing(Outgoing::Disconnect) => {
            mark_disconnected(ctx, hooks);
        }
        Event::Outgoing(Outgoing::Publish(pkid)) => {
            ctx.publisher.tracker().on_outgoing(*pkid);
        }
        other => {
            debug!("MQTT event: {:?}", other);
        }
    }
}

fn mark_disconnected(ctx: &RelayContext, hooks: &dyn SessionHooks) {
    let previous = ctx.state.set_connected(false);
    if previous == ConnectionState::Connected {
        info!("Disconnected from MQTT broker");
        ctx.log.record(MessageRecord::disconnected());
        hooks.on_disconnect(ctx);
    }
    let dropped = ctx.publisher.tracker().fail_all();
    if dropped > 0 {
        warn!("{} unconfirmed publishes dropped on disconnect", dropped);
    }
}

fn refusal_reason(code: ConnectReturnCode) -> &'static str {
    match code {
        ConnectReturnCode::Success => "Connection successful",
        ConnectReturnCode::RefusedProtocolVersion => {
            "Connection refused - incorrect protocol version"
        }
        ConnectReturnCode::BadClientId => "Connection refused - invalid client identifier",
        ConnectReturnCode::ServiceUnavailable => "Connection refused - server unavailable",
        ConnectReturnCode::BadUserNamePassword => "Connection refused - bad username or password",
        ConnectReturnCode::NotAuthorized => "Connection refused - not authorized",
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    ctx: RelayContext,
    hooks: Arc<dyn SessionHooks>,
    shutdown: CancellationToken,
    reconnect_delay: Duration,
) {
    info!("MQTT event loop started");
    loop {
        let polled = tokio::select! {
            _ = shutdown.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(event) => {
                let finished = matches!(event, Event::Outgoing(Outgoing::Disconnect));
                dispatch_event(&ctx, hooks.as_ref(), &event);
                if finished {
                    break;
                }
            }
            Err(e) => {
                match &e {
                    ConnectionError::ConnectionRefused(code) => {
                        error!("Failed to connect to MQTT broker: {}", refusal_reason(*code))
                    }
                    other => warn!("MQTT connection error: {}", other),
                }
                mark_disconnected(&ctx, hooks.as_ref());

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {
                        debug!("Retrying MQTT connection");
                    }
                }
            }
        }
    }
    info!("MQTT event loop stopped");
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Configured, // Client built, event loop not yet polled
    Running,    // Event loop task live, reconnecting on its own
}

#[machine]
pub struct MqttSession<S: SessionState> {
    config: MqttConfig,
    client: AsyncClient,
    eventloop: Option<EventLoop>,
    context: RelayContext,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<S: SessionState> MqttSession<S> {
    pub fn context(&self) -> &RelayContext {
        &self.context
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }
}

impl MqttSession<Configured> {
    pub fn create(config: MqttConfig, client_id: &str) -> Self {
        debug!(
            "Creating MQTT client {} for {}:{}",
            client_id, config.host, config.port
        );
        let (client, eventloop) =
            AsyncClient::new(config.options(client_id), config.request_capacity);
        let context = RelayContext::new(
            client_id,
            Arc::new(client.clone()),
            config.history_capacity,
        );

        Self::new(
            config,
            client,
            Some(eventloop),
            context,
            CancellationToken::new(),
            None, // task
        )
    }

    /// Spawns the event-loop task and transitions to `Running`
    pub fn start(mut self, hooks: Arc<dyn SessionHooks>) -> MqttSession<Running> {
        if let Some(eventloop) = self.eventloop.take() {
            let handle = tokio::spawn(run_event_loop(
                eventloop,
                self.context.clone(),
                hooks,
                self.shutdown.clone(),
                self.config.reconnect_delay(),
            ));
            self.task = Some(handle);
        }
        self.transition()
    }
}

impl MqttSession<Running> {
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        self.context.state().wait_connected(timeout).await
    }

    /// Sends DISCONNECT when connected, then stops the event-loop task
    pub async fn shutdown(mut self) -> Result<(), SessionError> {
        info!("Shutting down MQTT session {}", self.context.client_id());
        if self.context.is_connected() {
            if let Err(e) = self.client.try_disconnect() {
                warn!("Failed to queue MQTT disconnect: {}", e);
                self.shutdown.cancel();
            }
        } else {
            // nothing to say goodbye to
            self.shutdown.cancel();
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
                Ok(joined) => joined?,
                Err(_) => {
                    self.shutdown.cancel();
                    task.await?;
                }
            }
        }
        self.shutdown.cancel();
        self.context.state().set_connected(false);
        Ok(())
    }
}

/// Connects to the configured broker, falling back to the alternates in order.
///
/// Each attempt waits at most `connect_timeout`. Returns `None` when no broker
/// accepts the connection; callers continue without MQTT.
pub async fn bootstrap(
    config: &MqttConfig,
    client_id: &str,
    hooks: Arc<dyn SessionHooks>,
) -> Option<MqttSession<Running>> {
    for host in config.broker_hosts() {
        let attempt = config.with_host(&host);
        info!("Connecting to {}:{} as {}", host, attempt.port, client_id);
        let session = MqttSession::create(attempt, client_id).start(hooks.clone());

        if session.wait_connected(config.connect_timeout()).await {
            info!("MQTT connection established successfully");
            return Some(session);
        }

        warn!(
            "MQTT connection to {} timed out after {:?}",
            host,
            config.connect_timeout()
        );
        if let Err(e) = session.shutdown().await {
            warn!("Failed to stop MQTT session: {}", e);
        }
    }
    None
}
