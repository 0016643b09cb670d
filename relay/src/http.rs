//! The HTTP-upgrade bootstrap for the opaque framed transport.
//! Treated as an external collaborator by the core relay logic — this
//! module exists only to translate an inbound HTTP request into the
//! `(channel, client_name, password, WebSocket)` tuple `Relay::handle_connection`
//! expects.

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;

use crate::relay::Relay;

#[derive(Deserialize)]
struct ConnectQuery {
    channel: String,
    #[serde(rename = "clientName")]
    client_name: String,
}

pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/api/ws/connect", get(connect))
        .with_state(relay)
}

async fn connect(
    State(relay): State<Arc<Relay>>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let password = match parse_basic_password(&headers) {
        Some(password) => password,
        None => return (StatusCode::UNAUTHORIZED, "missing Authorization header").into_response(),
    };

    upgrade.on_upgrade(move |socket| async move {
        relay
            .handle_connection(query.channel, query.client_name, password, socket)
            .await;
    })
}

/// The `Authorization: Basic <password>` header is opaque — not
/// parsed as a real username:password pair, just decoded and handed
/// straight to the membership authenticator as the channel password.
fn parse_basic_password(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded).ok()?;
    String::from_utf8(decoded).ok()
}
