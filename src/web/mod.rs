//! # Exchange Rates Viewer
//!
//! Serves the stored exchange-rate data set as a web page and mirrors it onto
//! MQTT. The page shows the connection status and the recent relay history, and
//! has a form that publishes typed messages to the messages topic.
//!
//! Runs without MQTT when no broker answers (or with `--no-mqtt`).

pub mod bridge;
pub mod page;

use crate::config::RelayConfig;
use crate::mqtt::config::client_id;
use crate::mqtt::mqtt_handler::bootstrap;
use crate::persistence::RatesStore;
use bridge::{publish_rates, RatesHooks, RatesTopics};
use color_eyre::{eyre::eyre, Result};
use page::{router, AppState};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RatesConfig {
    pub data_topic: String,
    pub messages_topic: String,
    /// JSON document the page renders
    pub data_file: PathBuf,
    pub bind: String,
    pub client_id_prefix: String,
    pub data_confirm_secs: u64,
    pub message_confirm_secs: u64,
    /// Page auto-refresh interval
    pub refresh_secs: u64,
}

impl Default for RatesConfig {
    fn default() -> Self {
        Self {
            data_topic: "exchange/rates/data".to_string(),
            messages_topic: "exchange/rates/messages".to_string(),
            data_file: PathBuf::from("any_api.json"),
            bind: "127.0.0.1:5000".to_string(),
            client_id_prefix: "exchange-rates-app-".to_string(),
            data_confirm_secs: 10,
            message_confirm_secs: 5,
            refresh_secs: 60,
        }
    }
}

impl RatesConfig {
    pub fn topics(&self) -> RatesTopics {
        RatesTopics {
            data: self.data_topic.clone(),
            messages: self.messages_topic.clone(),
        }
    }
}

/// Command-line switches of the viewer
#[derive(Clone, Debug, Default)]
pub struct RatesOptions {
    pub no_mqtt: bool,
    /// Replace the data file with this document before starting
    pub import: Option<PathBuf>,
}

pub async fn run(config: RelayConfig, opts: RatesOptions) -> Result<()> {
    let rates = config.rates;
    let store = RatesStore::new(&rates.data_file);

    if let Some(source) = &opts.import {
        let snapshot = store
            .import(source)
            .await
            .map_err(|e| eyre!("Failed to import {}: {}", source.display(), e))?;
        info!(
            "Imported {} rates into {}",
            snapshot.rates().len(),
            store.path().display()
        );
    }

    let snapshot = store.load().await.map_err(|e| {
        error!("Failed to load exchange rate data: {}", e);
        eyre!("Failed to load exchange rate data: {}", e)
    })?;
    info!(
        "Loaded {} rates (base {}, updated {})",
        snapshot.rates().len(),
        snapshot.base_code(),
        snapshot.last_updated()
    );

    let topics = rates.topics();
    let session = if opts.no_mqtt {
        info!("MQTT disabled");
        None
    } else {
        let id = client_id(&rates.client_id_prefix, Some(8));
        let hooks = Arc::new(RatesHooks::new(topics.clone()));
        let session = bootstrap(&config.mqtt, &id, hooks).await;
        if session.is_none() {
            warn!("Continuing without MQTT functionality");
        }
        session
    };
    let relay = session.as_ref().map(|s| s.context().clone());

    if let Some(ctx) = relay.as_ref().filter(|ctx| ctx.is_connected()) {
        match publish_rates(
            ctx,
            &topics,
            &snapshot,
            Duration::from_secs(rates.data_confirm_secs),
        )
        .await
        {
            Ok(receipt) => info!("Exchange rates published (message {})", receipt.pkid),
            Err(e) => warn!("Failed to publish exchange rates: {}", e),
        }
    }

    let state = Arc::new(AppState {
        store,
        relay,
        topics,
        message_confirm: Duration::from_secs(rates.message_confirm_secs),
        refresh_secs: rates.refresh_secs,
    });

    let listener = tokio::net::TcpListener::bind(&rates.bind).await?;
    info!("Open your browser at http://{}/", rates.bind);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await?;

    info!("Web server stopped");
    if let Some(session) = session {
        session.shutdown().await?;
    }
    Ok(())
}
