//! Publish-and-confirm on top of rumqttc's request channel
//!
//! rumqttc does not hand back a packet id from `publish`. The event loop reports
//! `Outgoing::Publish(pkid)` in the order requests were queued, so the tracker keeps
//! a FIFO of waiters and binds each to its pkid when that event arrives. The broker's
//! `PubAck(pkid)` then resolves the waiter. QoS 0 publishes resolve on send.
//!
//! A disconnect fails every waiter, but requests already handed to the client stay
//! in its channel and go out after the reconnect. The tracker counts them and lets
//! that many `Outgoing::Publish` events pass unbound, so a new waiter is never
//! resolved by a stale message's acknowledgement.

use super::connection::ConnectionFlag;
use rumqttc::{AsyncClient, ClientError, QoS};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Narrow view of the network client used by the relay
pub trait Outbound: Send + Sync {
    fn enqueue_publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), ClientError>;

    fn enqueue_subscribe(&self, topic: &str, qos: QoS) -> Result<(), ClientError>;
}

impl Outbound for AsyncClient {
    fn enqueue_publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), ClientError> {
        self.try_publish(topic, qos, retain, payload)
    }

    fn enqueue_subscribe(&self, topic: &str, qos: QoS) -> Result<(), ClientError> {
        self.try_subscribe(topic, qos)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("MQTT client not connected, cannot publish")]
    NotConnected,

    #[error("Failed to queue publish: {0}")]
    Client(#[from] ClientError),

    #[error("No broker confirmation within {0:?}")]
    Timeout(Duration),

    #[error("Connection dropped before the publish was confirmed")]
    Interrupted,

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outcome of a confirmed publish
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Packet id assigned by the client, 0 for QoS 0
    pub pkid: u16,
}

/// In-flight publish returned by [`Publisher::publish`]
#[derive(Debug)]
pub struct PendingPublish {
    topic: String,
    qos: QoS,
    confirmation: oneshot::Receiver<u16>,
}

impl PendingPublish {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Blocks the calling task until the publish is confirmed or `timeout` elapses.
    /// There is no retry; a confirmation arriving later is only recorded in the history.
    pub async fn wait(self, timeout: Duration) -> Result<PublishReceipt, PublishError> {
        match tokio::time::timeout(timeout, self.confirmation).await {
            Ok(Ok(pkid)) => Ok(PublishReceipt { pkid }),
            Ok(Err(_)) => Err(PublishError::Interrupted),
            Err(_) => {
                warn!(
                    "Publish to {} not confirmed within {:?}",
                    self.topic, timeout
                );
                Err(PublishError::Timeout(timeout))
            }
        }
    }
}

struct Queued {
    qos: QoS,
    waiter: oneshot::Sender<u16>,
}

#[derive(Default)]
struct TrackerState {
    queued: VecDeque<Queued>,
    inflight: HashMap<u16, oneshot::Sender<u16>>,
    /// Requests from before the last disconnect not yet seen by the event loop
    stale: usize,
}

/// Matches queued publishes to the pkids and acknowledgements seen by the event loop
#[derive(Default)]
pub struct PublishTracker {
    state: Mutex<TrackerState>,
}

impl PublishTracker {
    /// Registers a waiter and runs `send` under the same lock so queue order
    /// matches request-channel order.
    fn enqueue<F>(&self, qos: QoS, send: F) -> Result<oneshot::Receiver<u16>, ClientError>
    where
        F: FnOnce() -> Result<(), ClientError>,
    {
        let (waiter, confirmation) = oneshot::channel();
        let mut state = self.guard();
        state.queued.push_back(Queued { qos, waiter });
        if let Err(e) = send() {
            state.queued.pop_back();
            return Err(e);
        }
        Ok(confirmation)
    }

    /// Called for every `Outgoing::Publish(pkid)` event
    pub fn on_outgoing(&self, pkid: u16) {
        let mut state = self.guard();
        if state.stale > 0 {
            state.stale -= 1;
            debug!("Outgoing publish {} was queued before the last disconnect", pkid);
            return;
        }
        let Some(queued) = state.queued.pop_front() else {
            debug!("Outgoing publish {} was not queued through the tracker", pkid);
            return;
        };
        match queued.qos {
            QoS::AtMostOnce => {
                let _ = queued.waiter.send(pkid);
            }
            _ => {
                state.inflight.insert(pkid, queued.waiter);
            }
        }
    }

    /// Called for every `PubAck(pkid)`. Returns whether a waiter was bound to it.
    pub fn on_ack(&self, pkid: u16) -> bool {
        let Some(waiter) = self.guard().inflight.remove(&pkid) else {
            debug!("Acknowledgement for untracked publish {}", pkid);
            return false;
        };
        if waiter.send(pkid).is_err() {
            debug!("Late confirmation for publish {}, caller stopped waiting", pkid);
        }
        true
    }

    /// Fails every outstanding waiter. Returns how many were dropped.
    ///
    /// Waiters still queued belong to requests the client has not sent yet; those
    /// are remembered so their outgoing events are skipped after a reconnect.
    pub fn fail_all(&self) -> usize {
        let mut state = self.guard();
        let dropped = state.queued.len() + state.inflight.len();
        state.stale += state.queued.len();
        state.queued.clear();
        state.inflight.clear();
        dropped
    }

    pub fn pending(&self) -> usize {
        let state = self.guard();
        state.queued.len() + state.inflight.len()
    }

    fn guard(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Publish tracker lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Publishes through an [`Outbound`] client, refusing while disconnected
#[derive(Clone)]
pub struct Publisher {
    outbound: Arc<dyn Outbound>,
    tracker: Arc<PublishTracker>,
    state: ConnectionFlag,
}

impl Publisher {
    pub fn new(
        outbound: Arc<dyn Outbound>,
        tracker: Arc<PublishTracker>,
        state: ConnectionFlag,
    ) -> Self {
        Publisher {
            outbound,
            tracker,
            state,
        }
    }

    /// Queues a publish and returns its pending handle immediately.
    ///
    /// Fails with [`PublishError::NotConnected`] without touching the network
    /// client when the broker is not known to be connected.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> Result<PendingPublish, PublishError> {
        if !self.state.is_connected() {
            debug!("Skipping publish to {}: not connected", topic);
            return Err(PublishError::NotConnected);
        }

        let payload = payload.into();
        debug!(
            "Publishing {} bytes to {} ({:?}, retain={})",
            payload.len(),
            topic,
            qos,
            retain
        );
        let confirmation = self.tracker.enqueue(qos, || {
            self.outbound.enqueue_publish(topic, qos, retain, payload)
        })?;

        Ok(PendingPublish {
            topic: topic.to_string(),
            qos,
            confirmation,
        })
    }

    /// Publish and wait for the confirmation in one call
    pub async fn publish_confirmed(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
        timeout: Duration,
    ) -> Result<PublishReceipt, PublishError> {
        self.publish(topic, payload, qos, retain)?.wait(timeout).await
    }

    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), PublishError> {
        self.outbound.enqueue_subscribe(topic, qos)?;
        Ok(())
    }

    pub fn tracker(&self) -> &Arc<PublishTracker> {
        &self.tracker
    }
}
