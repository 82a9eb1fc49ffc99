//! STARK publisher signatures
//!
//! Encodes asset and oracle identity into one field element and price and
//! timestamp into another, Pedersen-hashes the pair, and signs the hash on
//! the STARK curve. The oracle name term keeps two oracles from ever
//! colliding on the same asset encoding.

use ethers::types::{I256, U256};
use starknet_core::crypto::ecdsa_sign;
use starknet_crypto::pedersen_hash;
use starknet_types_core::felt::Felt;

use crate::signer::{
    PublisherKey, QuantizedPrice, Signature, SignerError, StarkSignature, TimestampedSignature,
};
use crate::types::{AssetId, OracleId};

const NANOS_PER_SEC: i64 = 1_000_000_000;
/// Bits reserved for the oracle name below the asset encoding.
const ORACLE_NAME_SHIFT: usize = 40;
/// Bits reserved for the timestamp below the price encoding.
const TIMESTAMP_SHIFT: usize = 32;
/// Hex digits the asset encoding is right-padded to.
const ASSET_HEX_WIDTH: usize = 32;

/// Binds one STARK-curve private key and oracle identity.
#[derive(Debug, Clone)]
pub struct StarkSigner {
    private_key: Felt,
    publisher_key: PublisherKey,
    oracle_name_hex: String,
    oracle_name_int: U256,
}

impl StarkSigner {
    pub fn new(
        private_key: &str,
        public_key: &str,
        oracle_id: &OracleId,
    ) -> Result<Self, SignerError> {
        let mut trimmed = private_key.trim_start_matches("0x").to_string();
        if trimmed.len() % 2 != 0 {
            trimmed.insert(0, '0');
        }
        let decoded = hex::decode(&trimmed)
            .map_err(|e| SignerError::InvalidPrivateKey(format!("{}", e)))?;
        if decoded.is_empty() || decoded.len() > 32 {
            return Err(SignerError::InvalidPrivateKey(format!(
                "expected at most 32 bytes, got {}",
                decoded.len()
            )));
        }
        let mut key_bytes = [0u8; 32];
        key_bytes[32 - decoded.len()..].copy_from_slice(&decoded);

        let oracle_name_hex = hex::encode(oracle_id.as_str().as_bytes());
        let oracle_name_int = U256::from_str_radix(&oracle_name_hex, 16)
            .map_err(|e| SignerError::InvalidPrivateKey(format!("bad oracle id: {}", e)))?;

        Ok(Self {
            private_key: Felt::from_bytes_be(&key_bytes),
            publisher_key: PublisherKey(public_key.to_string()),
            oracle_name_hex,
            oracle_name_int,
        })
    }

    pub fn publisher_key(&self) -> &PublisherKey {
        &self.publisher_key
    }

    /// Sign one quantized price observation.
    ///
    /// Returns the timestamped signature and the external asset id, which is
    /// the padded asset hex with the oracle name appended.
    pub fn sign_price(
        &self,
        publish_timestamp_ns: i64,
        asset: &AssetId,
        quantized: &QuantizedPrice,
    ) -> Result<(TimestampedSignature, String), SignerError> {
        let timestamp_secs = publish_timestamp_ns / NANOS_PER_SEC;

        let mut asset_hex = hex::encode(asset.as_str().as_bytes());
        if asset_hex.len() < ASSET_HEX_WIDTH {
            asset_hex.push_str(&"0".repeat(ASSET_HEX_WIDTH - asset_hex.len()));
        }
        let external_asset_id = format!("0x{}{}", asset_hex, self.oracle_name_hex);

        let asset_int = U256::from_str_radix(&asset_hex, 16)
            .map_err(|_| SignerError::ValueOutOfRange(format!("asset id {}", asset)))?;
        if asset_int.leading_zeros() < ORACLE_NAME_SHIFT as u32 {
            return Err(SignerError::ValueOutOfRange(format!("asset id {}", asset)));
        }
        let x = (asset_int << ORACLE_NAME_SHIFT) + self.oracle_name_int;

        let price = I256::from_dec_str(quantized.as_str())
            .map_err(|_| SignerError::InvalidQuantizedPrice(quantized.as_str().to_string()))?;
        let price_mag = price.unsigned_abs();
        if price_mag.leading_zeros() < TIMESTAMP_SHIFT as u32 {
            return Err(SignerError::ValueOutOfRange(quantized.as_str().to_string()));
        }
        let shifted = price_mag << TIMESTAMP_SHIFT;
        let timestamp_int = U256::from(timestamp_secs as u64);
        // y = price << 32 + ts; a negative price signs the magnitude of the sum.
        let y = if price.is_negative() {
            shifted - timestamp_int
        } else {
            shifted + timestamp_int
        };

        let hash = pedersen_hash(&to_felt(x), &to_felt(y));
        let signature = ecdsa_sign(&self.private_key, &hash)
            .map_err(|e| SignerError::Signing(format!("{}", e)))?;

        let timestamped = TimestampedSignature {
            signature: Signature::Stark(StarkSignature {
                r: format!("0x{:x}", signature.r),
                s: format!("0x{:x}", signature.s),
            }),
            timestamp: publish_timestamp_ns,
            msg_hash: format!("0x{:x}", hash),
        };

        Ok((timestamped, external_asset_id))
    }

    /// Sign a bare timestamp for registry/metadata authorization headers.
    pub fn sign_auth(&self, timestamp_ns: i64) -> Result<String, SignerError> {
        let hash = pedersen_hash(&Felt::from(timestamp_ns as u64), &Felt::ZERO);
        let signature = ecdsa_sign(&self.private_key, &hash)
            .map_err(|e| SignerError::Signing(format!("{}", e)))?;
        Ok(format!(
            "0x{}{}",
            hex::encode(signature.r.to_bytes_be()),
            hex::encode(signature.s.to_bytes_be())
        ))
    }
}

fn to_felt(value: U256) -> Felt {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    Felt::from_bytes_be(&buf)
}
