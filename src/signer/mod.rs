//! Multi-scheme price signing
//!
//! One signer instance binds exactly one private key and one signature
//! scheme at construction. The signature set is closed (EVM | STARK); call
//! sites match exhaustively rather than dispatching through a trait object.

mod evm;
mod quantize;
mod stark;

pub use evm::EvmSigner;
pub use quantize::{quantize, QuantizedPrice};
pub use stark::StarkSigner;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AssetId, OracleId, PriceUpdate, SignedPriceUpdate, TriggerType};

/// Scheme a publisher signs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureType {
    Evm,
    Stark,
}

impl fmt::Display for SignatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureType::Evm => write!(f, "evm"),
            SignatureType::Stark => write!(f, "stark"),
        }
    }
}

/// Public key a publisher is known by (checksummed address or field element).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublisherKey(pub String);

impl PublisherKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublisherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmSignature {
    pub r: String,
    pub s: String,
    pub v: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarkSignature {
    pub r: String,
    pub s: String,
}

/// Closed variant set of supported signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Signature {
    Evm(EvmSignature),
    Stark(StarkSignature),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedSignature {
    pub signature: Signature,
    /// Publish timestamp in nanoseconds.
    pub timestamp: i64,
    pub msg_hash: String,
}

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),
    #[error("invalid quantized price '{0}'")]
    InvalidQuantizedPrice(String),
    #[error("value does not fit the signing encoding: {0}")]
    ValueOutOfRange(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

/// A private key bound to one signature scheme.
#[derive(Debug, Clone)]
pub enum Signer {
    Evm(EvmSigner),
    Stark(StarkSigner),
}

impl Signer {
    /// Build an EVM signer. Fails fast on malformed key material.
    pub fn new_evm(private_key: &str) -> Result<Self, SignerError> {
        Ok(Signer::Evm(EvmSigner::new(private_key)?))
    }

    /// Build a STARK signer. Fails fast on malformed key material.
    pub fn new_stark(
        private_key: &str,
        public_key: &str,
        oracle_id: &OracleId,
    ) -> Result<Self, SignerError> {
        Ok(Signer::Stark(StarkSigner::new(private_key, public_key, oracle_id)?))
    }

    pub fn signature_type(&self) -> SignatureType {
        match self {
            Signer::Evm(_) => SignatureType::Evm,
            Signer::Stark(_) => SignatureType::Stark,
        }
    }

    pub fn publisher_key(&self) -> &PublisherKey {
        match self {
            Signer::Evm(s) => s.publisher_key(),
            Signer::Stark(s) => s.publisher_key(),
        }
    }

    /// Quantize and sign one observation into a wire-ready update.
    ///
    /// Pure given the bound key: identical inputs always yield identical
    /// output, whichever scheme is bound.
    pub fn sign(
        &self,
        oracle_id: &OracleId,
        update: &PriceUpdate,
        trigger: TriggerType,
    ) -> Result<SignedPriceUpdate, SignerError> {
        let quantized = quantize(update.price);
        let (timestamped_signature, external_asset_id) =
            self.sign_quantized(update.publish_timestamp, &update.asset, &quantized)?;

        Ok(SignedPriceUpdate {
            oracle_id: oracle_id.clone(),
            asset_id: update.asset.clone(),
            trigger,
            publisher_key: self.publisher_key().clone(),
            external_asset_id,
            signature_type: self.signature_type(),
            quantized_price: quantized,
            timestamped_signature,
        })
    }

    /// Sign an already-quantized price.
    pub fn sign_quantized(
        &self,
        publish_timestamp_ns: i64,
        asset: &AssetId,
        quantized: &QuantizedPrice,
    ) -> Result<(TimestampedSignature, String), SignerError> {
        match self {
            Signer::Evm(s) => s.sign_price(publish_timestamp_ns, asset, quantized),
            Signer::Stark(s) => s.sign_price(publish_timestamp_ns, asset, quantized),
        }
    }

    /// Sign a bare timestamp for request authorization headers.
    pub fn sign_auth(&self, timestamp_ns: i64) -> Result<String, SignerError> {
        match self {
            Signer::Evm(s) => s.sign_auth(timestamp_ns),
            Signer::Stark(s) => s.sign_auth(timestamp_ns),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evm_signature_serializes_with_v() {
        let sig = Signature::Evm(EvmSignature {
            r: "0x01".to_string(),
            s: "0x02".to_string(),
            v: "0x1b".to_string(),
        });
        let json = serde_json::to_string(&sig).unwrap();
        assert_eq!(json, r#"{"r":"0x01","s":"0x02","v":"0x1b"}"#);
    }

    #[test]
    fn stark_signature_roundtrips_untagged() {
        let sig = Signature::Stark(StarkSignature {
            r: "0x01".to_string(),
            s: "0x02".to_string(),
        });
        let json = serde_json::to_string(&sig).unwrap();
        assert_eq!(json, r#"{"r":"0x01","s":"0x02"}"#);
        let back: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sig);
    }

    #[test]
    fn signer_reports_bound_scheme() {
        let signer = Signer::new_evm(
            "0x8b558d5fc31eb64bb51d44b4b28658180e96764d5d5ac68e6d124f86f576d9de",
        )
        .unwrap();
        assert_eq!(signer.signature_type(), SignatureType::Evm);
        assert_eq!(
            signer.publisher_key().as_str().to_lowercase(),
            "0x99e295e85cb07c16b7bb62a44df532a7f2620237"
        );
    }

    #[test]
    fn sign_produces_wire_ready_update() {
        let signer = Signer::new_evm(
            "0x8b558d5fc31eb64bb51d44b4b28658180e96764d5d5ac68e6d124f86f576d9de",
        )
        .unwrap();
        let update = PriceUpdate {
            publish_timestamp: 1720730544719000064,
            asset: AssetId::from("BTCUSD"),
            price: 60000.0,
        };
        let signed = signer
            .sign(&OracleId("czowx".to_string()), &update, TriggerType::Clock)
            .unwrap();
        assert_eq!(signed.asset_id, AssetId::from("BTCUSD"));
        assert_eq!(signed.trigger, TriggerType::Clock);
        assert_eq!(signed.signature_type, SignatureType::Evm);
        assert_eq!(signed.quantized_price.as_str(), "60000000000000000000000");
        assert_eq!(signed.timestamped_signature.timestamp, 1720730544719000064);
    }
}
