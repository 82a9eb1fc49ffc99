//! Publisher ingress
//!
//! Exposes the `/publish` upgrade endpoint. Each accepted publisher gets
//! one reader loop: decode failures are recoverable (structured error reply
//! on the same socket), socket failures close the connection. Decoded
//! updates are delivered to every runner's ingress queue with the
//! non-blocking drop-on-full policy.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::net::{ConnectionId, WsConnection};
use crate::trigger::DropLogLimiter;
use crate::types::{PriceUpdate, WsEnvelope, MSG_TYPE_ERROR, MSG_TYPE_PRICES};

/// Shared state of the ingress endpoint: one sender per runner plus the
/// live publisher connection map.
pub struct IngressState {
    update_txs: Vec<mpsc::Sender<PriceUpdate>>,
    connections: RwLock<HashMap<ConnectionId, Arc<WsConnection>>>,
}

impl IngressState {
    pub fn new(update_txs: Vec<mpsc::Sender<PriceUpdate>>) -> Arc<Self> {
        Arc::new(Self {
            update_txs,
            connections: RwLock::new(HashMap::new()),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }
}

/// Build the ingress router with the `/publish` upgrade endpoint.
pub fn router(state: Arc<IngressState>) -> Router {
    Router::new()
        .route("/publish", get(publish_handler))
        .with_state(state)
}

async fn publish_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<IngressState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_publisher_socket(socket, state))
}

async fn handle_publisher_socket(socket: WebSocket, state: Arc<IngressState>) {
    let conn_id = ConnectionId::generate();
    info!(conn_id = %conn_id, "adding publisher websocket");

    let conn = {
        let state = Arc::clone(&state);
        let conn_id = conn_id.clone();
        Arc::new(WsConnection::new(
            conn_id.clone(),
            Box::new(move || {
                state.connections.write().remove(&conn_id);
                info!(conn_id = %conn_id, "removing publisher websocket");
            }),
        ))
    };
    state
        .connections
        .write()
        .insert(conn_id.clone(), Arc::clone(&conn));

    let (mut sender, mut receiver) = socket.split();
    let mut closed = conn.closed_signal();
    let mut drop_log = DropLogLimiter::new();

    loop {
        tokio::select! {
            maybe = receiver.next() => {
                match maybe {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(reply) = deliver_prices_frame(&text, &state.update_txs, &mut drop_log) {
                            // recoverable, per-message: reply and keep reading
                            if let Ok(json) = serde_json::to_string(&reply) {
                                if sender.send(Message::Text(json)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(conn_id = %conn_id, "publisher websocket closed, exiting read loop");
                        break;
                    }
                    Some(Ok(_)) => {
                        warn!(conn_id = %conn_id, "non-text websocket message received, exiting read loop");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(conn_id = %conn_id, error = %e, "network error on publisher websocket, exiting read loop");
                        break;
                    }
                    None => {
                        debug!(conn_id = %conn_id, "publisher stream ended, exiting read loop");
                        break;
                    }
                }
            }
            _ = closed.changed() => {
                break;
            }
        }
    }

    // best-effort close frame before the transition to Closed
    let _ = sender.send(Message::Close(None)).await;
    conn.close();
}

/// Decode one `prices` frame and fan its updates out to every runner.
fn deliver_prices_frame(
    text: &str,
    update_txs: &[mpsc::Sender<PriceUpdate>],
    drop_log: &mut DropLogLimiter,
) -> Result<(), WsEnvelope<()>> {
    let envelope: WsEnvelope<Vec<PriceUpdate>> = serde_json::from_str(text).map_err(|e| {
        warn!(error = %e, "failed to parse incoming message");
        WsEnvelope::error(MSG_TYPE_ERROR, "failed to parse price update")
    })?;

    if envelope.msg_type != MSG_TYPE_PRICES {
        return Ok(());
    }

    for update in envelope.data.unwrap_or_default() {
        for tx in update_txs {
            if tx.try_send(update.clone()).is_err() && drop_log.should_log() {
                warn!("dropped incoming price update - too many updates");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssetId;

    fn frame(json: &str) -> String {
        json.to_string()
    }

    #[tokio::test]
    async fn valid_prices_frame_reaches_every_runner() {
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let mut drop_log = DropLogLimiter::new();

        let text = frame(r#"{"type":"prices","data":[{"t":1234,"a":"BTCUSD","p":42.5}]}"#);
        deliver_prices_frame(&text, &[tx_a, tx_b], &mut drop_log).unwrap();

        let got_a = rx_a.recv().await.unwrap();
        let got_b = rx_b.recv().await.unwrap();
        assert_eq!(got_a.asset, AssetId::from("BTCUSD"));
        assert_eq!(got_a, got_b);
    }

    #[test]
    fn malformed_frame_yields_error_reply() {
        let (tx, _rx) = mpsc::channel(4);
        let mut drop_log = DropLogLimiter::new();

        let reply = deliver_prices_frame("not json", &[tx], &mut drop_log).unwrap_err();
        assert_eq!(reply.msg_type, MSG_TYPE_ERROR);
        assert_eq!(reply.error, "failed to parse price update");
    }

    #[test]
    fn non_prices_types_are_ignored() {
        let (tx, mut rx) = mpsc::channel::<PriceUpdate>(4);
        let mut drop_log = DropLogLimiter::new();

        let text = frame(r#"{"type":"subscribe","data":[]}"#);
        deliver_prices_frame(&text, &[tx], &mut drop_log).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_ingress_queue_drops_without_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let mut drop_log = DropLogLimiter::new();

        let text = frame(
            r#"{"type":"prices","data":[{"t":1,"a":"BTCUSD","p":1.0},{"t":2,"a":"BTCUSD","p":2.0},{"t":3,"a":"BTCUSD","p":3.0}]}"#,
        );
        // queue capacity is 1; the call must return despite the overflow
        deliver_prices_frame(&text, &[tx], &mut drop_log).unwrap();
    }
}
