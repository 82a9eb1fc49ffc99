//! Pull-based ingress
//!
//! Some publishers expose their own websocket feed instead of dialing our
//! `/publish` endpoint. The puller dials that feed, optionally sends a
//! subscription request, and forwards decoded `prices` envelopes into the
//! same ingress queues with the same drop-on-full policy. Reconnects
//! forever on a fixed delay.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::trigger::DropLogLimiter;
use crate::types::{AuthToken, PriceUpdate, WsEnvelope, MSG_TYPE_PRICES};

/// Dials a remote publisher feed and pulls raw price updates from it.
pub struct IncomingWebsocketPuller {
    pub url: String,
    pub auth: AuthToken,
    pub subscription_request: String,
    pub reconnect_delay: Duration,
    pub read_timeout: Duration,
    pub update_txs: Vec<mpsc::Sender<PriceUpdate>>,
}

impl IncomingWebsocketPuller {
    pub async fn run(self) {
        loop {
            debug!(url = %self.url, "connecting to pull-based websocket");

            let mut request = match self.url.as_str().into_client_request() {
                Ok(request) => request,
                Err(e) => {
                    error!(url = %self.url, error = %e, "invalid pull-based websocket url, giving up");
                    return;
                }
            };
            if !self.auth.is_empty() {
                match HeaderValue::from_str(&format!("Basic {}", self.auth.as_str())) {
                    Ok(value) => {
                        request.headers_mut().insert(AUTHORIZATION, value);
                    }
                    Err(e) => {
                        error!(error = %e, "invalid pull-based auth token, giving up");
                        return;
                    }
                }
            }

            let mut ws = match connect_async(request).await {
                Ok((ws, _)) => ws,
                Err(e) => {
                    error!(url = %self.url, error = %e, "failed to connect to pull-based websocket");
                    tokio::time::sleep(self.reconnect_delay).await;
                    continue;
                }
            };
            info!(url = %self.url, "connected to pull-based websocket");

            if !self.subscription_request.is_empty() {
                debug!(request = %self.subscription_request, "sending subscription request");
                if let Err(e) = ws
                    .send(Message::Text(self.subscription_request.clone()))
                    .await
                {
                    error!(error = %e, "failed to send subscription request to pull-based websocket");
                    tokio::time::sleep(self.reconnect_delay).await;
                    continue;
                }
            }

            self.read_until_failure(&mut ws).await;

            info!(
                delay_secs = self.reconnect_delay.as_secs(),
                "waiting to reconnect to pull-based websocket"
            );
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    async fn read_until_failure(
        &self,
        ws: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let mut drop_log = DropLogLimiter::new();

        loop {
            let frame = if self.read_timeout.is_zero() {
                ws.next().await
            } else {
                match tokio::time::timeout(self.read_timeout, ws.next()).await {
                    Ok(frame) => frame,
                    Err(_) => {
                        warn!(
                            timeout_secs = self.read_timeout.as_secs(),
                            "timed out waiting for next message from pull-based websocket, exiting read loop"
                        );
                        return;
                    }
                }
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    let envelope: WsEnvelope<Vec<PriceUpdate>> = match serde_json::from_str(&text)
                    {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            error!(error = %e, "failed to parse message from pull-based websocket, exiting read loop");
                            return;
                        }
                    };
                    if envelope.msg_type != MSG_TYPE_PRICES {
                        continue;
                    }
                    for update in envelope.data.unwrap_or_default() {
                        for tx in &self.update_txs {
                            if tx.try_send(update.clone()).is_err() && drop_log.should_log() {
                                warn!("dropped incoming price update - too many updates");
                            }
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    warn!("pull-based websocket closed by remote, exiting read loop");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "failed to read from pull-based websocket, exiting read loop");
                    return;
                }
                None => {
                    warn!("pull-based websocket stream ended, exiting read loop");
                    return;
                }
            }
        }
    }
}
