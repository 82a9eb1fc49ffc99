//! Outgoing broker connections
//!
//! One writer loop per broker endpoint. The loop selects between freshly
//! flushed signed batches (filtered against the connection's current
//! subscription set) and the close signal. A write failure closes the
//! connection and lets the supervisor redial; an explicit `remove()` marks
//! the connection as intentionally retired so it is not redialed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::SinkExt;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, warn};

use crate::net::WsConnection;
use crate::types::{
    AssetId, SignedPriceUpdateBatch, WsEnvelope, MSG_TYPE_SIGNED_PRICES, WILDCARD_ASSET,
};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of each connection's private outbound queue.
const OUTGOING_QUEUE_CAPACITY: usize = 4096;

/// An established egress connection to one broker.
pub struct OutgoingConnection {
    conn: WsConnection,
    asset_ids: RwLock<HashSet<AssetId>>,
    removed: AtomicBool,
    batch_tx: mpsc::Sender<SignedPriceUpdateBatch>,
}

impl OutgoingConnection {
    /// Wrap an accepted connection; the returned receiver feeds the writer
    /// loop and the connection keeps the matching sender for fan-out.
    pub fn new(
        conn: WsConnection,
        asset_ids: HashSet<AssetId>,
    ) -> (Arc<Self>, mpsc::Receiver<SignedPriceUpdateBatch>) {
        let (batch_tx, batch_rx) = mpsc::channel(OUTGOING_QUEUE_CAPACITY);
        let connection = Arc::new(Self {
            conn,
            asset_ids: RwLock::new(asset_ids),
            removed: AtomicBool::new(false),
            batch_tx,
        });
        (connection, batch_rx)
    }

    pub fn connection(&self) -> &WsConnection {
        &self.conn
    }

    /// Replace the subscription set; called by the reconciliation loop while
    /// the writer keeps running.
    pub fn update_assets(&self, asset_ids: HashSet<AssetId>) {
        *self.asset_ids.write() = asset_ids;
    }

    /// Retire the connection on purpose: the supervisor will not redial.
    pub fn remove(&self) {
        warn!(conn_id = %self.conn.id(), "removal requested for outgoing connection");
        self.removed.store(true, Ordering::SeqCst);
        self.conn.close();
    }

    pub fn was_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    /// Non-blocking hand-off from the fan-out task into this connection's
    /// private queue.
    pub fn try_send_batch(&self, batch: SignedPriceUpdateBatch) -> bool {
        self.batch_tx.try_send(batch).is_ok()
    }

    /// Keep the entries this connection subscribes to; wildcard keeps all.
    fn filter_batch(&self, batch: SignedPriceUpdateBatch) -> SignedPriceUpdateBatch {
        let asset_ids = self.asset_ids.read();
        if asset_ids.contains(&AssetId::from(WILDCARD_ASSET)) {
            return batch;
        }
        batch
            .into_iter()
            .filter(|(asset, _)| asset_ids.contains(asset))
            .collect()
    }

    /// Write loop: runs until a write fails or close is requested. Always
    /// leaves the connection Closed on exit.
    pub async fn write_loop(
        &self,
        mut ws: WsStream,
        mut batch_rx: mpsc::Receiver<SignedPriceUpdateBatch>,
    ) {
        let mut closed = self.conn.closed_signal();

        loop {
            tokio::select! {
                maybe = batch_rx.recv() => {
                    let Some(batch) = maybe else {
                        break;
                    };
                    let filtered = self.filter_batch(batch);
                    if filtered.is_empty() {
                        continue;
                    }
                    let envelope = WsEnvelope::new(MSG_TYPE_SIGNED_PRICES, filtered);
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(e) => {
                            error!(error = %e, "failed to serialize signed price batch");
                            continue;
                        }
                    };
                    if let Err(e) = ws.send(Message::Text(text)).await {
                        warn!(
                            conn_id = %self.conn.id(),
                            error = %e,
                            "failed to send signed prices, exiting write loop"
                        );
                        break;
                    }
                }
                _ = closed.changed() => {
                    debug!(conn_id = %self.conn.id(), "close requested, exiting write loop");
                    let _ = ws.close(None).await;
                    break;
                }
            }
        }

        self.conn.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ConnectionId;
    use crate::signer::{
        PublisherKey, QuantizedPrice, Signature, SignatureType, StarkSignature,
        TimestampedSignature,
    };
    use crate::types::{OracleId, SignedPriceUpdate, TriggerType};

    fn signed_update(asset: &str) -> SignedPriceUpdate {
        SignedPriceUpdate {
            oracle_id: OracleId("czowx".to_string()),
            asset_id: AssetId::from(asset),
            trigger: TriggerType::Clock,
            publisher_key: PublisherKey("0xkey".to_string()),
            external_asset_id: asset.to_string(),
            signature_type: SignatureType::Stark,
            quantized_price: QuantizedPrice("1000000000000000000".to_string()),
            timestamped_signature: TimestampedSignature {
                signature: Signature::Stark(StarkSignature {
                    r: "0x01".to_string(),
                    s: "0x02".to_string(),
                }),
                timestamp: 1,
                msg_hash: "0x03".to_string(),
            },
        }
    }

    fn batch(assets: &[&str]) -> SignedPriceUpdateBatch {
        assets
            .iter()
            .map(|asset| (AssetId::from(*asset), signed_update(asset)))
            .collect()
    }

    fn connection(assets: &[&str]) -> Arc<OutgoingConnection> {
        let subscribed = assets.iter().map(|a| AssetId::from(*a)).collect();
        let (conn, _rx) = OutgoingConnection::new(
            WsConnection::new(ConnectionId::generate(), Box::new(|| {})),
            subscribed,
        );
        conn
    }

    #[test]
    fn filter_keeps_only_subscribed_assets() {
        let conn = connection(&["BTCUSD"]);
        let filtered = conn.filter_batch(batch(&["BTCUSD", "ETHUSD"]));
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key(&AssetId::from("BTCUSD")));
    }

    #[test]
    fn wildcard_subscription_keeps_everything() {
        let conn = connection(&["*"]);
        let filtered = conn.filter_batch(batch(&["BTCUSD", "ETHUSD", "SOLUSD"]));
        assert_eq!(filtered.len(), 3);
    }

    #[test]
    fn unsubscribed_connection_filters_everything() {
        let conn = connection(&["DOGEUSD"]);
        let filtered = conn.filter_batch(batch(&["BTCUSD", "ETHUSD"]));
        assert!(filtered.is_empty());
    }

    #[test]
    fn update_assets_applies_immediately() {
        let conn = connection(&["BTCUSD"]);
        conn.update_assets([AssetId::from("ETHUSD")].into_iter().collect());
        let filtered = conn.filter_batch(batch(&["BTCUSD", "ETHUSD"]));
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key(&AssetId::from("ETHUSD")));
    }

    #[test]
    fn remove_marks_and_closes() {
        let conn = connection(&["BTCUSD"]);
        assert!(!conn.was_removed());
        conn.remove();
        assert!(conn.was_removed());
        assert!(conn.connection().is_closed());
    }

    #[test]
    fn full_outbound_queue_drops_without_blocking() {
        let conn = connection(&["*"]);
        // _rx was dropped by the helper, so the channel refuses new sends;
        // the hand-off must fail fast instead of blocking the fan-out task
        assert!(!conn.try_send_batch(batch(&["BTCUSD"])));
    }
}
