//! Publisher agent runner
//!
//! One runner per configured signature scheme. A runner owns its ingress
//! queue, trigger engine, outgoing-connection map and desired-subscription
//! state, fans flushed batches out across live broker connections, and
//! reconciles the connection set against the registry on a fixed interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, error, info, warn};

use crate::net::outgoing::OutgoingConnection;
use crate::net::{ConnectionId, WsConnection};
use crate::registry::RegistryClient;
use crate::signer::Signer;
use crate::trigger::{DropLogLimiter, PriceUpdateProcessor};
use crate::types::{
    AuthToken, BrokerPublishUrl, BrokerSubscriptions, OracleId, PriceUpdate,
    SignedPriceUpdateBatch,
};

const BATCH_QUEUE_CAPACITY: usize = 4096;

/// Everything a runner needs beyond its signer.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub oracle_id: OracleId,
    /// Total number of runners sharing the host's cores.
    pub num_runners: usize,
    pub clock_period: Duration,
    pub delta_check_period: Duration,
    /// Relative-change threshold as a 0-1 proportion.
    pub change_threshold_proportion: f64,
    pub sign_every_update: bool,
    pub registry_base_url: String,
    pub registry_refresh_interval: Duration,
    pub broker_reconnect_delay: Duration,
    pub auth_token: AuthToken,
}

/// Difference between the previous and the freshly fetched desired broker
/// state. Level-triggered: computed from the full state each tick.
#[derive(Debug, Default, PartialEq)]
pub struct BrokerDiff {
    pub added: Vec<BrokerPublishUrl>,
    pub retained: Vec<BrokerPublishUrl>,
    pub removed: Vec<BrokerPublishUrl>,
}

/// Compute which brokers to connect, refresh or retire.
pub fn diff_broker_state(current: &BrokerSubscriptions, desired: &BrokerSubscriptions) -> BrokerDiff {
    let mut diff = BrokerDiff::default();
    for url in desired.keys() {
        if current.contains_key(url) {
            diff.retained.push(url.clone());
        } else {
            diff.added.push(url.clone());
        }
    }
    for url in current.keys() {
        if !desired.contains_key(url) {
            diff.removed.push(url.clone());
        }
    }
    diff
}

pub struct PublisherAgentRunner {
    settings: RunnerSettings,
    signer: Arc<Signer>,
    registry: RegistryClient,
    outgoing: RwLock<HashMap<BrokerPublishUrl, Arc<OutgoingConnection>>>,
    desired: RwLock<BrokerSubscriptions>,
}

impl PublisherAgentRunner {
    pub fn new(settings: RunnerSettings, signer: Arc<Signer>) -> Arc<Self> {
        let registry = RegistryClient::new(
            settings.registry_base_url.clone(),
            settings.auth_token.clone(),
        );
        Arc::new(Self {
            settings,
            signer,
            registry,
            outgoing: RwLock::new(HashMap::new()),
            desired: RwLock::new(BrokerSubscriptions::new()),
        })
    }

    pub fn signer(&self) -> &Arc<Signer> {
        &self.signer
    }

    /// Run the agent until the ingress channel closes.
    pub async fn run(self: Arc<Self>, update_rx: mpsc::Receiver<PriceUpdate>) {
        if self.settings.clock_period.is_zero() && !self.settings.sign_every_update {
            // delta ticks never surface assets without a baseline, so with
            // the clock off nothing would ever seed one (DESIGN.md)
            warn!(
                "clock updates disabled and sign_every_update off - assets will only publish after a delta against a seeded baseline"
            );
        }

        let (batch_tx, batch_rx) = mpsc::channel::<SignedPriceUpdateBatch>(BATCH_QUEUE_CAPACITY);

        tokio::spawn(Arc::clone(&self).run_fanout(batch_rx));
        tokio::spawn(Arc::clone(&self).run_registry_reconciler());

        let processor = PriceUpdateProcessor::new(
            Arc::clone(&self.signer),
            self.settings.oracle_id.clone(),
            self.settings.num_runners,
            self.settings.clock_period,
            self.settings.delta_check_period,
            self.settings.change_threshold_proportion,
            self.settings.sign_every_update,
        );
        processor.run(update_rx, batch_tx).await;
    }

    /// Deliver every flushed batch to every live outgoing connection's
    /// private queue. Non-blocking: one slow broker cannot stall the rest.
    async fn run_fanout(self: Arc<Self>, mut batch_rx: mpsc::Receiver<SignedPriceUpdateBatch>) {
        let mut drop_log = DropLogLimiter::new();
        while let Some(batch) = batch_rx.recv().await {
            let connections: Vec<(BrokerPublishUrl, Arc<OutgoingConnection>)> = self
                .outgoing
                .read()
                .iter()
                .map(|(url, conn)| (url.clone(), Arc::clone(conn)))
                .collect();
            for (url, connection) in connections {
                if !connection.try_send_batch(batch.clone()) && drop_log.should_log() {
                    warn!(broker_url = %url, "dropped signed batch - outgoing queue full");
                }
            }
        }
    }

    /// Reconcile once at startup, then on the fixed refresh interval.
    async fn run_registry_reconciler(self: Arc<Self>) {
        loop {
            Arc::clone(&self).reconcile_brokers().await;
            tokio::time::sleep(self.settings.registry_refresh_interval).await;
        }
    }

    /// Level-triggered reconciliation against the registry's full desired
    /// state. A fetch failure skips the tick and keeps the previous state,
    /// so a transient registry outage never drops live connections.
    async fn reconcile_brokers(self: Arc<Self>) {
        debug!("running broker connection updater");

        let desired = match self.registry.brokers_for_publisher(&self.signer).await {
            Ok(desired) => desired,
            Err(e) => {
                error!(error = %e, "failed to get broker connections from registry");
                return;
            }
        };

        let diff = diff_broker_state(&self.desired.read(), &desired);

        for url in &diff.retained {
            let asset_ids = desired[url].clone();
            let connection = self.outgoing.read().get(url).map(Arc::clone);
            if let Some(connection) = connection {
                connection.update_assets(asset_ids);
            }
        }

        for url in &diff.removed {
            let connection = self.outgoing.read().get(url).map(Arc::clone);
            if let Some(connection) = connection {
                connection.remove();
            }
        }

        *self.desired.write() = desired;

        for url in diff.added {
            tokio::spawn(Arc::clone(&self).run_outgoing_connection(url));
        }

        debug!("broker connection updater finished");
    }

    /// Supervise one broker connection: dial, register, write to
    /// completion, then redial after a fixed delay unless removed (or the
    /// broker left the desired state while we were disconnected).
    async fn run_outgoing_connection(self: Arc<Self>, url: BrokerPublishUrl) {
        loop {
            let Some(asset_ids) = self.desired.read().get(&url).cloned() else {
                info!(broker_url = %url, "broker no longer desired - not reconnecting");
                return;
            };

            debug!(broker_url = %url, "connecting to broker websocket");
            let mut request = match url.as_str().into_client_request() {
                Ok(request) => request,
                Err(e) => {
                    error!(broker_url = %url, error = %e, "invalid broker url, giving up");
                    return;
                }
            };
            if !self.settings.auth_token.is_empty() {
                match HeaderValue::from_str(&format!(
                    "Basic {}",
                    self.settings.auth_token.as_str()
                )) {
                    Ok(value) => {
                        request.headers_mut().insert(AUTHORIZATION, value);
                    }
                    Err(e) => {
                        error!(error = %e, "invalid broker auth token, giving up");
                        return;
                    }
                }
            }

            let ws = match connect_async(request).await {
                Ok((ws, _)) => ws,
                Err(e) => {
                    error!(broker_url = %url, error = %e, "failed to connect to broker websocket");
                    tokio::time::sleep(self.settings.broker_reconnect_delay).await;
                    continue;
                }
            };

            info!(broker_url = %url, "adding broker websocket");
            let (connection, batch_rx) = OutgoingConnection::new(
                WsConnection::new(ConnectionId::generate(), {
                    let runner = Arc::clone(&self);
                    let url = url.clone();
                    Box::new(move || {
                        info!(broker_url = %url, "removing broker websocket");
                        runner.outgoing.write().remove(&url);
                    })
                }),
                asset_ids,
            );
            self.outgoing
                .write()
                .insert(url.clone(), Arc::clone(&connection));

            // the broker may have been retired while the dial was in flight
            if !self.desired.read().contains_key(&url) {
                connection.remove();
                return;
            }

            connection.write_loop(ws, batch_rx).await;

            if connection.was_removed() {
                info!(broker_url = %url, "outgoing websocket was removed - not reconnecting");
                return;
            }
            warn!(
                broker_url = %url,
                delay_secs = self.settings.broker_reconnect_delay.as_secs(),
                "outgoing websocket writer failed - reconnecting"
            );
            tokio::time::sleep(self.settings.broker_reconnect_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssetId;
    use std::collections::HashSet;

    fn subscriptions(entries: &[(&str, &[&str])]) -> BrokerSubscriptions {
        entries
            .iter()
            .map(|(url, assets)| {
                (
                    BrokerPublishUrl(url.to_string()),
                    assets.iter().map(|a| AssetId::from(*a)).collect::<HashSet<_>>(),
                )
            })
            .collect()
    }

    #[test]
    fn diff_spawns_new_brokers() {
        let current = subscriptions(&[]);
        let desired = subscriptions(&[("wss://a", &["BTCUSD"])]);
        let diff = diff_broker_state(&current, &desired);
        assert_eq!(diff.added, vec![BrokerPublishUrl("wss://a".to_string())]);
        assert!(diff.retained.is_empty());
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn diff_removes_undesired_brokers() {
        let current = subscriptions(&[("wss://a", &["BTCUSD"]), ("wss://b", &["*"])]);
        let desired = subscriptions(&[("wss://a", &["BTCUSD"])]);
        let diff = diff_broker_state(&current, &desired);
        assert!(diff.added.is_empty());
        assert_eq!(diff.retained, vec![BrokerPublishUrl("wss://a".to_string())]);
        assert_eq!(diff.removed, vec![BrokerPublishUrl("wss://b".to_string())]);
    }

    #[test]
    fn reconciling_twice_with_unchanged_state_is_churn_free() {
        let state = subscriptions(&[("wss://a", &["BTCUSD"]), ("wss://b", &["ETHUSD", "*"])]);

        let first = diff_broker_state(&BrokerSubscriptions::new(), &state);
        assert_eq!(first.added.len(), 2);

        // second pass against the identical response: nothing created or
        // removed, every broker only refreshed in place
        let second = diff_broker_state(&state, &state);
        assert!(second.added.is_empty());
        assert!(second.removed.is_empty());
        assert_eq!(second.retained.len(), 2);
    }

    #[test]
    fn diff_tracks_subscription_changes_as_retained() {
        let current = subscriptions(&[("wss://a", &["BTCUSD"])]);
        let desired = subscriptions(&[("wss://a", &["BTCUSD", "ETHUSD"])]);
        let diff = diff_broker_state(&current, &desired);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        assert_eq!(diff.retained, vec![BrokerPublishUrl("wss://a".to_string())]);
    }
}
