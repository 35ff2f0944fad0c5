//! secp256k1 key helpers for Nostr signing.
//!
//! Nostr uses BIP340 Schnorr signatures over secp256k1 with 32-byte
//! x-only public keys. Everything crossing a provider boundary is
//! fixed-length: 32-byte secrets, 32-byte public keys, 32-byte hashes,
//! 64-byte signatures.

use bech32::{Bech32, Hrp};
use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{KeywardError, Result};
use crate::secret::SecretBuffer;

/// Bech32 human-readable prefix for Nostr public keys.
pub const NPUB_HRP: &str = "npub";

/// x-only secp256k1 public key (32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XOnlyPublicKey(pub [u8; 32]);

impl XOnlyPublicKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| KeywardError::Failed(format!("Invalid public key hex: {}", e)))?;
        Ok(Self(bytes))
    }

    /// Encode as a bech32 `npub1…` string.
    pub fn to_npub(&self) -> Result<String> {
        let hrp = Hrp::parse(NPUB_HRP)
            .map_err(|e| KeywardError::Failed(format!("Invalid bech32 prefix: {}", e)))?;
        bech32::encode::<Bech32>(hrp, &self.0)
            .map_err(|e| KeywardError::Failed(format!("Bech32 encoding failed: {}", e)))
    }

    /// Decode from a bech32 `npub1…` string.
    pub fn from_npub(npub: &str) -> Result<Self> {
        let (hrp, data) = bech32::decode(npub)
            .map_err(|e| KeywardError::Failed(format!("Invalid npub: {}", e)))?;
        if hrp.as_str() != NPUB_HRP {
            return Err(KeywardError::Failed(format!(
                "Expected npub prefix, got '{}'",
                hrp.as_str()
            )));
        }
        let bytes: [u8; 32] = data
            .as_slice()
            .try_into()
            .map_err(|_| KeywardError::Failed(format!("npub payload is {} bytes", data.len())))?;
        Ok(Self(bytes))
    }

    /// Verify a 64-byte BIP340 signature over a 32-byte hash.
    pub fn verify(&self, hash: &[u8; 32], signature: &[u8; 64]) -> Result<()> {
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| KeywardError::Failed(format!("Invalid public key: {}", e)))?;
        let sig = Signature::try_from(signature.as_slice())
            .map_err(|e| KeywardError::Failed(format!("Invalid signature: {}", e)))?;
        key.verify_raw(hash, &sig)
            .map_err(|_| KeywardError::SigningFailed("Signature verification failed".into()))
    }
}

impl AsRef<[u8]> for XOnlyPublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Zeroize for XOnlyPublicKey {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// Derive the x-only public key for a 32-byte secret.
pub fn derive_public_key(secret: &SecretBuffer) -> Result<XOnlyPublicKey> {
    let signing_key = SigningKey::from_bytes(secret.as_bytes())
        .map_err(|e| KeywardError::Failed(format!("Invalid private key: {}", e)))?;
    let bytes: [u8; 32] = signing_key
        .verifying_key()
        .to_bytes()
        .as_slice()
        .try_into()
        .map_err(|_| KeywardError::Failed("Unexpected public key length".into()))?;
    Ok(XOnlyPublicKey(bytes))
}

/// BIP340-sign a 32-byte hash with a 32-byte secret. Fresh auxiliary
/// randomness is drawn per signature.
pub fn sign_hash(secret: &SecretBuffer, hash: &[u8; 32]) -> Result<[u8; 64]> {
    let signing_key = SigningKey::from_bytes(secret.as_bytes())
        .map_err(|e| KeywardError::SigningFailed(format!("Invalid private key: {}", e)))?;
    let mut aux_rand = [0u8; 32];
    OsRng.fill_bytes(&mut aux_rand);
    let signature = signing_key
        .sign_raw(hash, &aux_rand)
        .map_err(|e| KeywardError::SigningFailed(format!("Schnorr signing failed: {}", e)))?;
    Ok(signature.to_bytes())
}
