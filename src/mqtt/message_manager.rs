//! Relay history: a fixed-capacity, lossy record of recent MQTT activity
//!
//! The event-loop task writes records as connection events, inbound messages and
//! broker confirmations arrive. Page handlers read a copied snapshot, never the
//! live buffer.

use chrono::{NaiveDateTime, Timelike};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Default number of records kept by a [`MessageLog`]
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// What produced a [`MessageRecord`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Connected,
    Disconnected,
    Inbound { topic: String },
    PublishConfirmed { pkid: u16 },
}

/// One immutable entry of the relay history
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRecord {
    timestamp: NaiveDateTime,
    kind: MessageKind,
    payload: String,
}

impl MessageRecord {
    pub fn new(kind: MessageKind, payload: impl Into<String>) -> Self {
        Self::at(now_seconds(), kind, payload)
    }

    pub fn at(timestamp: NaiveDateTime, kind: MessageKind, payload: impl Into<String>) -> Self {
        MessageRecord {
            timestamp,
            kind,
            payload: payload.into(),
        }
    }

    pub fn connected() -> Self {
        Self::new(MessageKind::Connected, "")
    }

    pub fn disconnected() -> Self {
        Self::new(MessageKind::Disconnected, "")
    }

    pub fn inbound(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(
            MessageKind::Inbound {
                topic: topic.into(),
            },
            payload,
        )
    }

    pub fn publish_confirmed(pkid: u16) -> Self {
        Self::new(MessageKind::PublishConfirmed { pkid }, "")
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

impl fmt::Display for MessageRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] ", self.timestamp.format(TIMESTAMP_FORMAT))?;
        match &self.kind {
            MessageKind::Connected => write!(f, "Connected to MQTT broker"),
            MessageKind::Disconnected => write!(f, "Disconnected from MQTT broker"),
            MessageKind::Inbound { topic } => {
                write!(f, "Topic: {}, Message: {}", topic, self.payload)
            }
            MessageKind::PublishConfirmed { pkid } => {
                write!(f, "Published message with ID: {}", pkid)
            }
        }
    }
}

/// Wall-clock local time truncated to whole seconds
pub fn now_seconds() -> NaiveDateTime {
    let now = chrono::Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Timestamp text used in payloads built by the relay binaries
pub fn timestamp_text() -> String {
    now_seconds().format(TIMESTAMP_FORMAT).to_string()
}

/// Bounded FIFO of [`MessageRecord`]s shared between the event loop and readers
///
/// Inserting into a full log evicts the oldest record first, so the length never
/// exceeds the capacity. A capacity of zero keeps nothing.
#[derive(Debug)]
pub struct MessageLog {
    capacity: usize,
    records: Mutex<VecDeque<MessageRecord>>,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl MessageLog {
    pub fn with_capacity(capacity: usize) -> Self {
        MessageLog {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a record, evicting the oldest one when full. Never fails.
    pub fn record(&self, record: MessageRecord) {
        if self.capacity == 0 {
            debug!("History disabled, dropping record: {}", record);
            return;
        }

        let mut records = self.guard();
        while records.len() >= self.capacity {
            if let Some(evicted) = records.pop_front() {
                debug!("History full, evicting: {}", evicted);
            }
        }
        records.push_back(record);
    }

    /// Ordered copy of the current contents, oldest first
    pub fn snapshot(&self) -> Vec<MessageRecord> {
        self.guard().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A panic while holding the lock leaves the deque intact, so keep using it.
    fn guard(&self) -> MutexGuard<'_, VecDeque<MessageRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| {
            warn!("Message history lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn payloads(log: &MessageLog) -> Vec<String> {
        log.snapshot()
            .iter()
            .map(|r| r.payload().to_string())
            .collect()
    }

    #[test]
    fn keeps_everything_below_capacity_in_order() {
        let log = MessageLog::with_capacity(5);
        for p in ["a", "b", "c"] {
            log.record(MessageRecord::inbound("t", p));
        }
        assert_eq!(payloads(&log), vec!["a", "b", "c"]);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let log = MessageLog::with_capacity(10);
        for c in 'A'..='Z' {
            log.record(MessageRecord::inbound("t", c.to_string()));
        }
        let expected: Vec<String> = ('Q'..='Z').map(|c| c.to_string()).collect();
        assert_eq!(payloads(&log), expected);
        assert_eq!(log.len(), 10);
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let log = MessageLog::with_capacity(0);
        log.record(MessageRecord::connected());
        assert!(log.is_empty());
    }

    #[test]
    fn snapshot_is_a_copy() {
        let log = MessageLog::with_capacity(3);
        log.record(MessageRecord::inbound("t", "first"));
        let before = log.snapshot();
        log.record(MessageRecord::inbound("t", "second"));
        assert_eq!(before.len(), 1);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn concurrent_writers_respect_capacity() {
        let log = Arc::new(MessageLog::with_capacity(50));
        let handles: Vec<_> = (0..4)
            .map(|w| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        log.record(MessageRecord::inbound("t", format!("{w}-{i}")));
                        assert!(log.snapshot().len() <= 50);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(log.len(), 50);
    }

    #[test]
    fn renders_like_the_status_page() {
        let ts = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 30, 5)
            .unwrap();
        let inbound = MessageRecord::at(
            ts,
            MessageKind::Inbound {
                topic: "exchange/rates/messages".into(),
            },
            "hello",
        );
        assert_eq!(
            inbound.to_string(),
            "[2024-05-01 12:30:05] Topic: exchange/rates/messages, Message: hello"
        );
        let confirmed = MessageRecord::at(ts, MessageKind::PublishConfirmed { pkid: 7 }, "");
        assert_eq!(
            confirmed.to_string(),
            "[2024-05-01 12:30:05] Published message with ID: 7"
        );
        let connected = MessageRecord::at(ts, MessageKind::Connected, "");
        assert_eq!(connected.to_string(), "[2024-05-01 12:30:05] Connected to MQTT broker");
    }

    #[test]
    fn timestamps_have_second_resolution() {
        assert_eq!(MessageRecord::connected().timestamp().nanosecond(), 0);
    }
}
