use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use dagline_core::event::{names, EventEnvelope};
use dagline_core::types::RunId;

use crate::state::AppState;

/// A client-to-server control message. The only text frames accepted are
/// `"ping"` and this JSON shape.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub action: String,
    #[serde(default)]
    pub run_id: Option<String>,
}

type WsSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Idle cutoff: twice the expected ping interval, never zero.
fn idle_limit(ping_interval_secs: u64) -> Duration {
    Duration::from_secs(ping_interval_secs.max(1) * 2)
}

async fn send_envelope(tx: &WsSink, envelope: &EventEnvelope) -> bool {
    match serde_json::to_string(envelope) {
        Ok(json) => tx
            .lock()
            .await
            .send(Message::Text(json.into()))
            .await
            .is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize envelope");
            true
        }
    }
}

/// Handle a single WebSocket connection.
///
/// Scoping policy: a connection with no subscriptions receives every run's
/// events; after the first `{action:"subscribe", run_id}` it receives only
/// events for subscribed runs.
pub async fn handle_connection(ws: WebSocket, state: Arc<AppState>) {
    let (ws_tx, mut ws_rx) = ws.split();
    let ws_tx: WsSink = Arc::new(Mutex::new(ws_tx));

    if !send_envelope(&ws_tx, &EventEnvelope::bare(names::CONNECTED)).await {
        return;
    }

    let subscribed: Arc<Mutex<Vec<RunId>>> = Arc::new(Mutex::new(Vec::new()));

    // Forward bus events, scoped to this connection's subscriptions
    let mut event_rx = state.bus.subscribe();
    let event_tx = ws_tx.clone();
    let event_subs = subscribed.clone();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            {
                let subs = event_subs.lock().await;
                if !subs.is_empty() && !subs.contains(event.run_id()) {
                    continue;
                }
            }
            if !send_envelope(&event_tx, &event.to_envelope()).await {
                break;
            }
        }
    });

    // A client that pings within the interval keeps the connection open
    let idle_limit = idle_limit(state.config.ping_interval_secs);

    loop {
        let msg = match tokio::time::timeout(idle_limit, ws_rx.next()).await {
            Ok(Some(Ok(m))) => m,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "WebSocket read error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                debug!("WebSocket idle limit reached, closing");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let text = text.to_string();
                if text.trim() == "ping" {
                    if !send_envelope(&ws_tx, &EventEnvelope::bare(names::PING)).await {
                        break;
                    }
                    continue;
                }

                let parsed: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        let _ = send_envelope(
                            &ws_tx,
                            &EventEnvelope::error(format!("malformed message: {e}")),
                        )
                        .await;
                        continue;
                    }
                };

                match parsed.action.as_str() {
                    "subscribe" => match parsed.run_id {
                        Some(raw) => {
                            let run_id = RunId::from_string(&raw);
                            let mut subs = subscribed.lock().await;
                            if !subs.contains(&run_id) {
                                debug!(run_id = %run_id, "Client subscribed to run");
                                subs.push(run_id);
                            }
                        }
                        None => {
                            let _ = send_envelope(
                                &ws_tx,
                                &EventEnvelope::error("subscribe requires run_id"),
                            )
                            .await;
                        }
                    },
                    other => {
                        let _ = send_envelope(
                            &ws_tx,
                            &EventEnvelope::error(format!("unknown action: {other}")),
                        )
                        .await;
                    }
                }
            }
            Message::Ping(data) => {
                let _ = ws_tx.lock().await.send(Message::Pong(data)).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    event_task.abort();
}
