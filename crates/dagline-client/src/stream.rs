use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dagline_core::event::EventEnvelope;
use dagline_core::types::RunId;

/// What the event stream reports to its consumer.
#[derive(Debug)]
pub enum StreamNotice {
    /// Socket (re)connected; the consumer should refresh its REST snapshot
    /// because events may have been missed while disconnected.
    Connected,
    Event(EventEnvelope),
    /// A connection attempt or the live socket failed. The stream keeps
    /// retrying until the attempt budget is spent.
    ConnectionError(String),
    /// Reconnection budget exhausted or shutdown requested.
    Closed,
}

/// Configuration for [`run_event_stream`].
#[derive(Debug, Clone)]
pub struct EventStreamConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:8787/ws`.
    pub url: String,
    /// Run to subscribe to after connecting; `None` streams all runs.
    pub run_id: Option<RunId>,
    pub ping_interval: Duration,
    /// Reconnection attempts before giving up.
    pub max_reconnects: u32,
    /// Base reconnect delay, doubled per consecutive failure.
    pub reconnect_backoff: Duration,
}

impl EventStreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            run_id: None,
            ping_interval: Duration::from_secs(30),
            max_reconnects: 5,
            reconnect_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// Connect to the gateway WebSocket and forward envelopes until shutdown.
///
/// Keep-alive pings are sent every `ping_interval`; on socket failure the
/// stream reconnects with doubling backoff up to `max_reconnects` times,
/// surfacing each failure as a [`StreamNotice::ConnectionError`].
pub async fn run_event_stream(
    config: EventStreamConfig,
    tx: mpsc::Sender<StreamNotice>,
    shutdown: CancellationToken,
) {
    let mut failures: u32 = 0;

    loop {
        if shutdown.is_cancelled() {
            let _ = tx.send(StreamNotice::Closed).await;
            return;
        }

        let ws_stream = tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = tx.send(StreamNotice::Closed).await;
                return;
            }
            connected = tokio_tungstenite::connect_async(&config.url) => match connected {
                Ok((stream, _)) => stream,
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, attempt = failures, "WebSocket connect failed");
                    let _ = tx.send(StreamNotice::ConnectionError(e.to_string())).await;
                    if failures > config.max_reconnects {
                        let _ = tx.send(StreamNotice::Closed).await;
                        return;
                    }
                    let backoff = config.reconnect_backoff * 2u32.pow(failures - 1);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            }
        };

        failures = 0;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        if let Some(run_id) = &config.run_id {
            let subscribe = serde_json::json!({
                "action": "subscribe",
                "run_id": run_id,
            });
            if let Err(e) = ws_tx
                .send(WsMessage::Text(subscribe.to_string().into()))
                .await
            {
                warn!(error = %e, "Failed to send subscribe");
                continue;
            }
        }

        if tx.send(StreamNotice::Connected).await.is_err() {
            return;
        }

        let mut ping = tokio::time::interval(config.ping_interval);
        ping.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = tx.send(StreamNotice::Closed).await;
                    return;
                }
                _ = ping.tick() => {
                    if ws_tx.send(WsMessage::Text("ping".into())).await.is_err() {
                        break; // reconnect
                    }
                }
                msg = ws_rx.next() => {
                    let msg = match msg {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => {
                            warn!(error = %e, "WebSocket error, reconnecting");
                            let _ = tx.send(StreamNotice::ConnectionError(e.to_string())).await;
                            break;
                        }
                        None => {
                            warn!("WebSocket closed, reconnecting");
                            let _ = tx
                                .send(StreamNotice::ConnectionError("socket closed".into()))
                                .await;
                            break;
                        }
                    };

                    match msg {
                        WsMessage::Text(text) => {
                            match serde_json::from_str::<EventEnvelope>(&text) {
                                Ok(envelope) => {
                                    if tx.send(StreamNotice::Event(envelope)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    debug!(error = %e, "Non-envelope frame ignored");
                                }
                            }
                        }
                        WsMessage::Ping(data) => {
                            let _ = ws_tx.send(WsMessage::Pong(data)).await;
                        }
                        WsMessage::Close(_) => break,
                        _ => {}
                    }
                }
            }
        }

        failures += 1;
        if failures > config.max_reconnects {
            let _ = tx.send(StreamNotice::Closed).await;
            return;
        }
        tokio::time::sleep(config.reconnect_backoff).await;
    }
}
