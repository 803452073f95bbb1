//! MQTT side of the rates viewer: connect-time subscriptions, the startup data
//! publish and forwarding of messages typed into the page.

use crate::mqtt::message_manager::timestamp_text;
use crate::mqtt::mqtt_handler::{RelayContext, SessionHooks};
use crate::mqtt::publish::{PublishError, PublishReceipt};
use crate::persistence::RatesSnapshot;
use rumqttc::QoS;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Payload of the data topic
#[derive(Serialize, Debug)]
struct DataEnvelope<'a> {
    timestamp: String,
    client_id: &'a str,
    data: &'a Value,
}

/// Structured form of a message typed into the page
#[derive(Serialize, Debug)]
struct ChatEnvelope<'a> {
    timestamp: String,
    sender: &'a str,
    message: &'a str,
}

fn encode<T: Serialize>(envelope: &T) -> Result<Vec<u8>, PublishError> {
    serde_json::to_vec(envelope).map_err(|e| {
        error!("Failed to encode MQTT payload: {}", e);
        PublishError::Encode(e)
    })
}

/// Topic pair shared by the hooks and the page handlers
#[derive(Clone, Debug)]
pub struct RatesTopics {
    pub data: String,
    pub messages: String,
}

pub struct RatesHooks {
    topics: RatesTopics,
}

impl RatesHooks {
    pub fn new(topics: RatesTopics) -> Self {
        RatesHooks { topics }
    }
}

impl SessionHooks for RatesHooks {
    fn on_connect(&self, ctx: &RelayContext) {
        let publisher = ctx.publisher();
        for topic in [&self.topics.data, &self.topics.messages] {
            if let Err(e) = publisher.subscribe(topic, QoS::AtLeastOnce) {
                error!("Failed to subscribe to {}: {}", topic, e);
            }
        }
        debug!(
            "Subscribed to topics: {} and {}",
            self.topics.data, self.topics.messages
        );

        let test_message = format!(
            "Test message from {} at {}",
            ctx.client_id(),
            timestamp_text()
        );
        for topic in [&self.topics.data, &self.topics.messages] {
            if let Err(e) = publisher.publish(topic, test_message.as_bytes(), QoS::AtLeastOnce, false)
            {
                warn!("Failed to publish test message to {}: {}", topic, e);
            }
        }
    }
}

/// Publishes the data set (retained, QoS 1) and waits for the broker. On success a
/// short notice follows on the messages topic.
pub async fn publish_rates(
    ctx: &RelayContext,
    topics: &RatesTopics,
    snapshot: &RatesSnapshot,
    confirm_timeout: Duration,
) -> Result<PublishReceipt, PublishError> {
    let timestamp = timestamp_text();
    let envelope = DataEnvelope {
        timestamp: timestamp.clone(),
        client_id: ctx.client_id(),
        data: snapshot.document(),
    };
    let payload = encode(&envelope)?;
    debug!(
        "Publishing {} bytes to {} with QoS 1",
        payload.len(),
        topics.data
    );

    let receipt = ctx
        .publisher()
        .publish_confirmed(&topics.data, payload, QoS::AtLeastOnce, true, confirm_timeout)
        .await?;
    info!("Published exchange rate data to {}", topics.data);

    let notice = format!("Exchange rates updated at {}", timestamp);
    if let Err(e) = ctx
        .publisher()
        .publish(&topics.messages, notice.as_bytes(), QoS::AtLeastOnce, false)
    {
        warn!("Failed to publish update notice: {}", e);
    }
    Ok(receipt)
}

/// Sends a page message as structured JSON plus the raw text for simple clients.
/// Only the structured publish is awaited.
pub async fn forward_user_message(
    ctx: Option<&RelayContext>,
    topics: &RatesTopics,
    message: &str,
    confirm_timeout: Duration,
) -> Result<PublishReceipt, PublishError> {
    let Some(ctx) = ctx else {
        warn!("MQTT client not initialized, cannot publish user message");
        return Err(PublishError::NotConnected);
    };

    let envelope = ChatEnvelope {
        timestamp: timestamp_text(),
        sender: ctx.client_id(),
        message,
    };
    let structured = encode(&envelope)?;

    let pending =
        ctx.publisher()
            .publish(&topics.messages, structured, QoS::AtLeastOnce, false)?;
    if let Err(e) = ctx
        .publisher()
        .publish(&topics.messages, message.as_bytes(), QoS::AtLeastOnce, false)
    {
        warn!("Failed to publish raw user message: {}", e);
    }

    let receipt = pending.wait(confirm_timeout).await?;
    info!("Successfully published user message");
    Ok(receipt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::mqtt_handler::{dispatch_event, NoHooks};
    use crate::mqtt::publish::tests::RecordingOutbound;
    use rumqttc::{ConnAck, ConnectReturnCode, Event, Outgoing, Packet, PubAck};
    use serde_json::json;
    use std::sync::Arc;

    fn topics() -> RatesTopics {
        RatesTopics {
            data: "exchange/rates/data".into(),
            messages: "exchange/rates/messages".into(),
        }
    }

    fn connected() -> (RelayContext, Arc<RecordingOutbound>) {
        let outbound = Arc::new(RecordingOutbound::default());
        let ctx = RelayContext::new("exchange-rates-app-1234abcd", outbound.clone(), 10);
        dispatch_event(
            &ctx,
            &RatesHooks::new(topics()),
            &Event::Incoming(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false))),
        );
        (ctx, outbound)
    }

    #[test]
    fn connect_subscribes_and_announces_on_both_topics() {
        let (_ctx, outbound) = connected();
        let subs: Vec<String> = outbound
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.clone())
            .collect();
        assert_eq!(subs, vec!["exchange/rates/data", "exchange/rates/messages"]);

        let published = outbound.published();
        assert_eq!(published.len(), 2);
        assert!(published
            .iter()
            .all(|(_, p)| p.starts_with("Test message from exchange-rates-app-1234abcd at ")));
    }

    #[tokio::test]
    async fn rates_are_wrapped_and_retained() {
        let (ctx, outbound) = connected();
        outbound.publishes.lock().unwrap().clear();
        // the two test messages from on_connect are confirmed first
        for pkid in [1, 2] {
            ctx.publisher().tracker().on_outgoing(pkid);
            ctx.publisher().tracker().on_ack(pkid);
        }

        let snapshot = RatesSnapshot::from_value(json!({"base_code": "USD", "rates": {"EUR": 0.9}}));
        let acker = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                while ctx.publisher().tracker().pending() == 0 {
                    tokio::task::yield_now().await;
                }
                dispatch_event(&ctx, &NoHooks, &Event::Outgoing(Outgoing::Publish(3)));
                dispatch_event(&ctx, &NoHooks, &Event::Incoming(Packet::PubAck(PubAck::new(3))));
            })
        };

        let receipt = publish_rates(&ctx, &topics(), &snapshot, Duration::from_secs(2))
            .await
            .unwrap();
        acker.await.unwrap();
        assert_eq!(receipt.pkid, 3);

        let publishes = outbound.publishes.lock().unwrap();
        let (topic, qos, retain, payload) = &publishes[0];
        assert_eq!(topic, "exchange/rates/data");
        assert_eq!(*qos, QoS::AtLeastOnce);
        assert!(*retain);
        let body: Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(body["client_id"], "exchange-rates-app-1234abcd");
        assert_eq!(body["data"]["rates"]["EUR"], 0.9);
        assert!(body["timestamp"].is_string());

        let (notice_topic, _, _, notice) = &publishes[1];
        assert_eq!(notice_topic, "exchange/rates/messages");
        assert!(String::from_utf8_lossy(notice).starts_with("Exchange rates updated at "));
    }

    #[tokio::test]
    async fn user_message_goes_out_structured_then_raw() {
        let (ctx, outbound) = connected();
        outbound.publishes.lock().unwrap().clear();

        let result = forward_user_message(
            Some(&ctx),
            &topics(),
            "hello there",
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(PublishError::Timeout(_))));

        let published = outbound.published();
        assert_eq!(published.len(), 2);
        let structured: Value = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(structured["message"], "hello there");
        assert_eq!(structured["sender"], "exchange-rates-app-1234abcd");
        assert_eq!(published[1].1, "hello there");
    }

    #[test]
    fn unencodable_payload_is_an_error() {
        let mut keyed = std::collections::BTreeMap::new();
        keyed.insert((1, 2), "non-string keys");
        assert!(matches!(encode(&keyed), Err(PublishError::Encode(_))));
        assert_eq!(encode(&json!({"a": 1})).unwrap(), br#"{"a":1}"#.to_vec());
    }

    #[tokio::test]
    async fn user_message_without_mqtt_is_refused() {
        let result =
            forward_user_message(None, &topics(), "hi", Duration::from_millis(10)).await;
        assert!(matches!(result, Err(PublishError::NotConnected)));
    }
}
