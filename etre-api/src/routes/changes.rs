//! Live change-stream endpoint.
//!
//! `GET /api/v1/changes?since=<epoch-ms>` upgrades to a websocket. The
//! server replays history from `since`, then forwards live events until the
//! client disconnects, falls behind, or the server shuts down. Idle
//! keep-alive pings detect dead connections.

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use etre_core::{Error, ErrorKind};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::auth::Action;
use crate::cdc::{CloseReason, StreamItem, StreamerFactory};
use crate::error::{error_body, ApiError, ApiResult};
use crate::metrics::Metrics;
use crate::state::AppState;

use super::{authenticate, authorize};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ChangesParams {
    /// Replay events with `ts >= since`; defaults to "now" (live only).
    pub since: Option<i64>,
}

/// GET /api/v1/changes
///
/// The upgrade is extracted as a `Result` so CDC availability and auth are
/// checked before any websocket handshake concerns.
pub(crate) async fn changes(
    State(state): State<AppState>,
    Query(params): Query<ChangesParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> ApiResult<Response> {
    let Some(factory) = state.streamer_factory.clone() else {
        return Err(ApiError(Error::new(ErrorKind::CdcDisabled, "CDC disabled")));
    };

    let caller = authenticate(&state, &headers).await?;
    authorize(&state, &caller, Action::cdc()).await?;

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let since = params
        .since
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
    let metrics = state.metrics.clone();
    tracing::info!(caller = %caller.name, since, "CDC stream requested");

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, factory, metrics, since)))
}

async fn handle_socket(
    socket: WebSocket,
    factory: StreamerFactory,
    metrics: std::sync::Arc<Metrics>,
    since: i64,
) {
    metrics.cdc_clients.fetch_add(1, Ordering::Relaxed);
    let (mut sender, mut receiver) = socket.split();

    // Cancelled when this connection's task ends, aborting the history
    // read if the client is already gone.
    let (ctx, _guard) = super::request_token();

    let mut streamer = match factory.start(&ctx, since).await {
        Ok(streamer) => streamer,
        Err(e) => {
            tracing::error!(error = %e, "cannot start CDC stream");
            let _ = send_error(&mut sender, &e).await;
            metrics.cdc_clients.fetch_sub(1, Ordering::Relaxed);
            return;
        }
    };
    tracing::debug!(subscriber = streamer.id(), "CDC stream started");

    // Drain client frames so pings are answered and closes are seen.
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    });

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            item = streamer.next() => match item {
                StreamItem::Event(event) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!(error = %e, "cannot encode CDC event");
                            break;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                StreamItem::Closed(CloseReason::SlowConsumer) => {
                    let err = Error::internal("slow consumer: event queue overflowed");
                    let _ = send_error(&mut sender, &err).await;
                    break;
                }
                StreamItem::Closed(CloseReason::ServerShutdown) => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },

            _ = &mut recv_task => break,

            _ = keepalive.tick() => {
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    recv_task.abort();
    metrics.cdc_clients.fetch_sub(1, Ordering::Relaxed);
    tracing::debug!(subscriber = streamer.id(), "CDC stream ended");
}

async fn send_error(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    error: &Error,
) -> Result<(), axum::Error> {
    let body = serde_json::to_string(&error_body(error)).map_err(axum::Error::new)?;
    sender.send(Message::Text(body.into())).await?;
    sender.send(Message::Close(None)).await
}
