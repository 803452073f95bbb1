use super::bridge::{forward_user_message, RatesTopics};
use crate::mqtt::mqtt_handler::RelayContext;
use crate::persistence::RatesStore;
use askama::Template;
use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Shared state behind the page handlers
pub struct AppState {
    pub store: RatesStore,
    /// `None` when running without MQTT
    pub relay: Option<RelayContext>,
    pub topics: RatesTopics,
    pub message_confirm: Duration,
    pub refresh_secs: u64,
}

#[derive(Template)]
#[template(path = "index.html")]
struct RatesPage {
    base_currency: String,
    last_updated: String,
    rates: Vec<(String, f64)>,
    json_data: String,
    mqtt_enabled: bool,
    mqtt_connected: bool,
    messages: Vec<String>,
    refresh_secs: u64,
}

#[derive(Deserialize, Debug, Default)]
pub struct MessageForm {
    #[serde(default)]
    pub message: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/publish_message", post(publish_message))
        .with_state(state)
}

/// Rates page with the relay history snapshot
pub async fn home(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = match state.store.load().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Failed to load rates: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e)).into_response();
        }
    };
    let json_data = match snapshot.pretty() {
        Ok(text) => text,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e)).into_response()
        }
    };

    let (mqtt_connected, messages) = match &state.relay {
        Some(relay) => (
            relay.is_connected(),
            relay
                .log()
                .snapshot()
                .iter()
                .map(ToString::to_string)
                .collect(),
        ),
        None => (false, Vec::new()),
    };

    let page = RatesPage {
        base_currency: snapshot.base_code().to_string(),
        last_updated: snapshot.last_updated().to_string(),
        rates: snapshot.rates().into_iter().collect(),
        json_data,
        mqtt_enabled: state.relay.is_some(),
        mqtt_connected,
        messages,
        refresh_secs: state.refresh_secs,
    };

    match page.render() {
        Ok(body) => Html(body).into_response(),
        Err(e) => {
            error!("Failed to render rates page: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error rendering page: {}", e),
            )
                .into_response()
        }
    }
}

/// Forwards the form text to the messages topic and always redirects home
pub async fn publish_message(
    State(state): State<Arc<AppState>>,
    Form(form): Form<MessageForm>,
) -> Redirect {
    if !form.message.is_empty() {
        if let Err(e) = forward_user_message(
            state.relay.as_ref(),
            &state.topics,
            &form.message,
            state.message_confirm,
        )
        .await
        {
            warn!("Failed to publish user message: {}", e);
        }
    }
    Redirect::to("/")
}
