//! Core types used throughout Pricewire
//!
//! Defines the data model for raw and signed price updates plus the
//! websocket wire envelope shared by ingress and egress connections.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Asset subscribed to this id receives every asset.
pub const WILDCARD_ASSET: &str = "*";

/// Identifier of a priced asset (e.g. "BTCUSD").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetId(pub String);

impl AssetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD_ASSET
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        AssetId(s.to_string())
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity publishing signed prices; disambiguates otherwise-identical
/// asset encodings across independent publishers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OracleId(pub String);

impl OracleId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OracleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque bearer token forwarded on registry and broker requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken(pub String);

impl AuthToken {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Why an update was selected for signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    /// Periodic full refresh of every known asset.
    Clock,
    /// Relative change against the baseline exceeded the threshold.
    Delta,
    /// Sign-every-update mode, no trigger decision involved.
    Unspecified,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerType::Clock => write!(f, "clock"),
            TriggerType::Delta => write!(f, "delta"),
            TriggerType::Unspecified => write!(f, "unspecified"),
        }
    }
}

/// Raw price observation as published to us.
///
/// Wire form uses the compact field names of the `prices` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    /// Publish timestamp in nanoseconds.
    #[serde(rename = "t")]
    pub publish_timestamp: i64,
    #[serde(rename = "a")]
    pub asset: AssetId,
    #[serde(rename = "p")]
    pub price: f64,
}

/// A raw update paired with the reason it was selected for signing.
#[derive(Debug, Clone)]
pub struct TriggeredPriceUpdate {
    pub update: PriceUpdate,
    pub trigger: TriggerType,
}

/// Fully signed update for one asset, ready for the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedPriceUpdate {
    pub oracle_id: OracleId,
    pub asset_id: AssetId,
    pub trigger: TriggerType,
    pub publisher_key: crate::signer::PublisherKey,
    pub external_asset_id: String,
    pub signature_type: crate::signer::SignatureType,
    pub quantized_price: crate::signer::QuantizedPrice,
    pub timestamped_signature: crate::signer::TimestampedSignature,
}

/// Unit of wire transmission: at most one signed update per asset.
pub type SignedPriceUpdateBatch = HashMap<AssetId, SignedPriceUpdate>;

/// Bidirectional JSON websocket envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEnvelope<T> {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> WsEnvelope<T> {
    pub fn new(msg_type: &str, data: T) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            error: String::new(),
            trace_id: String::new(),
            data: Some(data),
        }
    }

    pub fn error(msg_type: &str, error: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            error: error.into(),
            trace_id: String::new(),
            data: None,
        }
    }
}

/// Message type of inbound raw price updates.
pub const MSG_TYPE_PRICES: &str = "prices";
/// Message type of outbound signed batches.
pub const MSG_TYPE_SIGNED_PRICES: &str = "signed_prices";
/// Message type of error replies.
pub const MSG_TYPE_ERROR: &str = "error";

/// Websocket URL a broker receives signed batches on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerPublishUrl(pub String);

impl BrokerPublishUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrokerPublishUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One registry entry: a broker endpoint and the assets it wants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConnectionConfig {
    pub publish_url: BrokerPublishUrl,
    pub asset_ids: Vec<AssetId>,
}

/// Desired broker state: publish url -> subscribed asset set.
pub type BrokerSubscriptions = HashMap<BrokerPublishUrl, HashSet<AssetId>>;
