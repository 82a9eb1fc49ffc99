//! EVM publisher signatures
//!
//! Signs quantized prices with secp256k1 ECDSA over the standard Ethereum
//! signed-message prefix. The reported `msg_hash` is the payload hash from
//! before the prefix is applied, which is what on-chain verifiers recompute.

use ethers::core::utils::{hash_message, keccak256, to_checksum};
use ethers::signers::{LocalWallet, Signer as _};
use ethers::types::{Address, I256, U256};

use crate::signer::{
    EvmSignature, PublisherKey, QuantizedPrice, Signature, SignerError, TimestampedSignature,
};
use crate::types::AssetId;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Binds one secp256k1 private key for the lifetime of the agent.
#[derive(Debug, Clone)]
pub struct EvmSigner {
    wallet: LocalWallet,
    address: Address,
    publisher_key: PublisherKey,
}

impl EvmSigner {
    pub fn new(private_key: &str) -> Result<Self, SignerError> {
        let wallet: LocalWallet = private_key
            .parse()
            .map_err(|e| SignerError::InvalidPrivateKey(format!("{}", e)))?;
        let address = wallet.address();
        let publisher_key = PublisherKey(to_checksum(&address, None));
        Ok(Self {
            wallet,
            address,
            publisher_key,
        })
    }

    pub fn publisher_key(&self) -> &PublisherKey {
        &self.publisher_key
    }

    /// Sign one quantized price observation.
    ///
    /// Returns the timestamped signature and the external asset id (for the
    /// EVM scheme the asset id travels unchanged).
    pub fn sign_price(
        &self,
        publish_timestamp_ns: i64,
        asset: &AssetId,
        quantized: &QuantizedPrice,
    ) -> Result<(TimestampedSignature, String), SignerError> {
        let timestamp_secs = publish_timestamp_ns / NANOS_PER_SEC;

        let price = I256::from_dec_str(quantized.as_str())
            .map_err(|_| SignerError::InvalidQuantizedPrice(quantized.as_str().to_string()))?;

        // address ∥ asset ∥ pad32(timestamp_secs) ∥ pad32(|price|)
        let mut message = Vec::with_capacity(20 + asset.as_str().len() + 64);
        message.extend_from_slice(self.address.as_bytes());
        message.extend_from_slice(asset.as_str().as_bytes());
        let mut word = [0u8; 32];
        U256::from(timestamp_secs as u64).to_big_endian(&mut word);
        message.extend_from_slice(&word);
        price.unsigned_abs().to_big_endian(&mut word);
        message.extend_from_slice(&word);

        let payload_hash = keccak256(&message);
        let prefixed_hash = hash_message(payload_hash);

        let signature = self
            .wallet
            .sign_hash(prefixed_hash)
            .map_err(|e| SignerError::Signing(format!("{}", e)))?;

        let timestamped = TimestampedSignature {
            signature: Signature::Evm(EvmSignature {
                r: format!("0x{:064x}", signature.r),
                s: format!("0x{:064x}", signature.s),
                v: format!("0x{:x}", signature.v),
            }),
            timestamp: publish_timestamp_ns,
            msg_hash: format!("0x{}", hex::encode(payload_hash)),
        };

        Ok((timestamped, asset.as_str().to_string()))
    }

    /// Sign a bare timestamp for registry/metadata authorization headers.
    pub fn sign_auth(&self, timestamp_ns: i64) -> Result<String, SignerError> {
        let payload_hash = keccak256(timestamp_ns.to_string().as_bytes());
        let prefixed_hash = hash_message(payload_hash);
        let signature = self
            .wallet
            .sign_hash(prefixed_hash)
            .map_err(|e| SignerError::Signing(format!("{}", e)))?;
        Ok(format!("0x{}", signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE_KEY: &str = "0x28253097630cca4158c909efa1af971e7aa759eb3d966cdb34e50f5ca1916ac7";

    fn evm_parts(sig: &TimestampedSignature) -> EvmSignature {
        match &sig.signature {
            Signature::Evm(parts) => parts.clone(),
            Signature::Stark(_) => panic!("expected an EVM signature"),
        }
    }

    #[test]
    fn rejects_malformed_private_key() {
        assert!(EvmSigner::new("0xnot-a-key").is_err());
        assert!(EvmSigner::new("").is_err());
    }

    #[test]
    fn sign_price_known_vector() {
        let signer = EvmSigner::new(PRIVATE_KEY).unwrap();
        let (sig, external_asset_id) = signer
            .sign_price(
                1720730544719000064,
                &AssetId::from("BTCUSD"),
                &QuantizedPrice("60000000000000000000000".to_string()),
            )
            .unwrap();

        assert_eq!(external_asset_id, "BTCUSD");
        assert_eq!(sig.timestamp, 1720730544719000064);
        assert_eq!(
            sig.msg_hash,
            "0x94796ac50f614eaec60734ffb48577da56f6cb4d9cf4ce5c61c222f1d3693be1"
        );
        let parts = evm_parts(&sig);
        assert_eq!(
            parts.r,
            "0x8ac298121624afad3057ec39bd5d7d08dbccd98453b67add7d871d94a18c3302"
        );
        assert_eq!(
            parts.s,
            "0x3cf613d9bee0cbc01073ac7b23ca3e86eb34bc2bd5748f07cab984377b4291b3"
        );
        assert_eq!(parts.v, "0x1c");
    }

    #[test]
    fn sign_price_negative_known_vector() {
        let signer = EvmSigner::new(PRIVATE_KEY).unwrap();
        let (sig, _) = signer
            .sign_price(
                1720730544719000064,
                &AssetId::from("BTCUSD"),
                &QuantizedPrice("-60000000000000000000000".to_string()),
            )
            .unwrap();

        assert_eq!(
            sig.msg_hash,
            "0x2aa596404bdb22d180d4a6d297a7781aa9590300ac66124f59ece77c25acad4e"
        );
        let parts = evm_parts(&sig);
        assert_eq!(
            parts.r,
            "0xf7f78a5074adc80dccc6a5abfbf47b993ff4ee50b6e09c8db08a0d99b37b9637"
        );
        assert_eq!(
            parts.s,
            "0x5b057e5d67bb77eab748e47653bdf9b34225a7de1f1af333e953bc79f6991212"
        );
        assert_eq!(parts.v, "0x1c");
    }

    #[test]
    fn sign_price_is_deterministic() {
        let signer = EvmSigner::new(PRIVATE_KEY).unwrap();
        let asset = AssetId::from("ETHUSD");
        let quantized = QuantizedPrice("3335950349880000000".to_string());
        let (first, _) = signer.sign_price(1708940577123456789, &asset, &quantized).unwrap();
        let (second, _) = signer.sign_price(1708940577123456789, &asset, &quantized).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn sign_auth_known_vector() {
        let signer =
            EvmSigner::new("0x8b558d5fc31eb64bb51d44b4b28658180e96764d5d5ac68e6d124f86f576d9de")
                .unwrap();
        let sig = signer.sign_auth(1710191092123456789).unwrap();
        assert!(sig.starts_with("0x"));
        assert_eq!(sig.len(), 132);
    }
}
