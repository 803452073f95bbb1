//! # MQTT Relay Core
//!
//! Shared plumbing behind every relay binary: a background task drives the rumqttc
//! event loop while the foreground (a stdin loop, a web handler or a command worker)
//! reads the relay state and publishes through it.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker settings and client id generation
//! ├── connection.rs       - Last-known connectivity (watch channel)
//! ├── message_manager.rs  - Bounded relay history
//! ├── publish.rs          - Publish-and-confirm over the request channel
//! └── mqtt_handler.rs     - Session state machine and event dispatch
//! ```
//!
//! ## Shared State
//!
//! The history and the connection flag are the only state touched by both the
//! event-loop task and the foreground. Both sit behind synchronized accessors and
//! are reached through a [`mqtt_handler::RelayContext`] passed to each collaborator.
//!
//! ## Degraded Mode
//!
//! Startup waits a bounded time for the first CONNACK. When no broker answers, the
//! binaries keep running without MQTT: every publish reports
//! [`publish::PublishError::NotConnected`] and is logged, never raised.

pub mod config;
pub mod connection;
pub mod message_manager;
pub mod mqtt_handler;
pub mod publish;
