//! HTTP surface: websocket upgrade, NIP-11 relay descriptor, health check.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::config::Settings;
use crate::relay::Relay;
use crate::ws;

/// Media type clients send to request the relay information document.
const NOSTR_JSON: &str = "application/nostr+json";

/// Shared state behind every connection and endpoint.
pub struct App {
    pub relay: Relay,
    pub settings: Settings,
    /// Flips to `true` when the process is shutting down.
    pub shutdown: watch::Receiver<bool>,
}

/// Build the axum router for the relay's HTTP surface.
pub fn app_router(app: Arc<App>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .with_state(app)
}

/// Serve the relay on `addr`, draining connections once `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    app: Arc<App>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app_router(app).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Upgrade to a websocket, or serve the NIP-11 document when the client
/// asks for `application/nostr+json`.
async fn root(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let wants_info = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains(NOSTR_JSON))
        .unwrap_or(false);
    if wants_info {
        return relay_info(&app.settings).into_response();
    }
    match ws {
        Some(upgrade) => {
            let conn_id = Uuid::new_v4().to_string();
            upgrade
                .max_message_size(app.settings.max_msg_bytes)
                .on_upgrade(move |socket| ws::serve_socket(socket, app, conn_id))
                .into_response()
        }
        None => (
            StatusCode::UPGRADE_REQUIRED,
            "websocket upgrade or application/nostr+json required",
        )
            .into_response(),
    }
}

#[derive(Serialize, Deserialize)]
struct Health {
    status: String,
    events: usize,
    capacity: usize,
}

/// Health check endpoint, reporting cache usage.
async fn healthz(State(app): State<Arc<App>>) -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
        events: app.relay.cached_events().await,
        capacity: app.relay.cache_capacity(),
    })
}

/// NIP-11 relay information document.
#[derive(Debug, Serialize, Deserialize)]
struct RelayInfo {
    name: String,
    description: String,
    software: String,
    version: String,
    supported_nips: Vec<u16>,
    limitation: RelayLimitation,
}

#[derive(Debug, Serialize, Deserialize)]
struct RelayLimitation {
    max_message_length: usize,
    max_subscriptions: usize,
    max_filters: usize,
}

fn relay_info(settings: &Settings) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, NOSTR_JSON),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        Json(RelayInfo {
            name: "memrelay".into(),
            description: "bounded in-memory nostr relay".into(),
            software: env!("CARGO_PKG_NAME").into(),
            version: env!("CARGO_PKG_VERSION").into(),
            supported_nips: vec![1, 11],
            limitation: RelayLimitation {
                max_message_length: settings.max_msg_bytes,
                max_subscriptions: settings.max_subs_per_conn,
                max_filters: settings.max_filters_per_req,
            },
        }),
    )
}
