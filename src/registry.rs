//! Registry client
//!
//! Fetches the desired broker/subscription set for this publisher from the
//! registry REST API. Requests carry the bearer token plus a signed,
//! timestamp-bound header pair; the timestamp doubles as replay protection.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use tracing::warn;

use crate::signer::Signer;
use crate::types::{AuthToken, BrokerConnectionConfig, BrokerSubscriptions};

const BROKERS_PATH: &str = "/v1/registry/brokers";

/// Header carrying the request timestamp in nanoseconds.
pub const TIMESTAMP_HEADER: &str = "x-publisher-timestamp";
/// Header carrying the signature over the timestamp.
pub const SIGNATURE_HEADER: &str = "x-publisher-signature";

#[derive(Debug, Deserialize)]
struct RegistryErrorResponse {
    error: String,
}

/// REST client for the broker registry.
pub struct RegistryClient {
    base_url: String,
    auth_token: AuthToken,
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(base_url: String, auth_token: AuthToken) -> Self {
        Self {
            base_url,
            auth_token,
            http: reqwest::Client::new(),
        }
    }

    /// Fetch the brokers this publisher should feed. Entries sharing a url
    /// are unioned into one subscription set. An empty result is valid but
    /// worth flagging, since a misconfigured publisher key produces it.
    pub async fn brokers_for_publisher(&self, signer: &Signer) -> Result<BrokerSubscriptions> {
        let publisher_key = signer.publisher_key();
        let timestamp_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let signature = signer
            .sign_auth(timestamp_ns)
            .context("failed to sign registry request timestamp")?;

        let mut headers = HeaderMap::new();
        if !self.auth_token.is_empty() {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Basic {}", self.auth_token.as_str()))
                    .context("invalid registry auth token")?,
            );
        }
        headers.insert(
            TIMESTAMP_HEADER,
            HeaderValue::from_str(&timestamp_ns.to_string())
                .context("invalid timestamp header value")?,
        );
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&signature).context("invalid signature header value")?,
        );

        let url = format!("{}{}", self.base_url.trim_end_matches('/'), BROKERS_PATH);
        let body = self
            .http
            .get(&url)
            .query(&[("publisher_key", publisher_key.as_str())])
            .headers(headers)
            .send()
            .await
            .context("failed to query the registry")?
            .text()
            .await
            .context("failed to read the registry response body")?;

        let brokers: Vec<BrokerConnectionConfig> = match serde_json::from_str(&body) {
            Ok(brokers) => brokers,
            Err(_) => {
                // the registry reports failures in-band as {"error": ...}
                if let Ok(response) = serde_json::from_str::<RegistryErrorResponse>(&body) {
                    if response.error == "Unauthorized" {
                        bail!("not authorized to query the registry - check the configured auth token");
                    }
                    bail!("registry query failed: {}", response.error);
                }
                bail!("failed to parse registry response: {}", body);
            }
        };

        if brokers.is_empty() {
            warn!(
                publisher_key = %publisher_key,
                "no registry broker found for publisher key - check that the key is whitelisted"
            );
        }

        Ok(union_by_url(brokers))
    }
}

/// Combine registry entries into a single asset set per publish url.
fn union_by_url(brokers: Vec<BrokerConnectionConfig>) -> BrokerSubscriptions {
    let mut subscriptions = BrokerSubscriptions::new();
    for broker in brokers {
        let asset_ids: &mut HashSet<_> = subscriptions.entry(broker.publish_url).or_default();
        asset_ids.extend(broker.asset_ids);
    }
    subscriptions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssetId, BrokerPublishUrl};

    #[test]
    fn broker_entries_sharing_a_url_are_unioned() {
        let entries: Vec<BrokerConnectionConfig> = serde_json::from_str(
            r#"[
                {"publish_url": "wss://broker-a", "asset_ids": ["BTCUSD"]},
                {"publish_url": "wss://broker-a", "asset_ids": ["ETHUSD", "BTCUSD"]},
                {"publish_url": "wss://broker-b", "asset_ids": ["*"]}
            ]"#,
        )
        .unwrap();

        let subscriptions = union_by_url(entries);

        let a = &subscriptions[&BrokerPublishUrl("wss://broker-a".to_string())];
        assert_eq!(a.len(), 2);
        assert!(a.contains(&AssetId::from("BTCUSD")));
        assert!(a.contains(&AssetId::from("ETHUSD")));
        let b = &subscriptions[&BrokerPublishUrl("wss://broker-b".to_string())];
        assert_eq!(b.len(), 1);
        assert!(b.contains(&AssetId::from("*")));
    }
}
