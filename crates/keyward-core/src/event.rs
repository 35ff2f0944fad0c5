//! Nostr event model and canonical id computation.
//!
//! The canonical event id is the SHA-256 of the compact JSON array
//! `[0, pubkey, created_at, kind, tags, content]` (NIP-01). Signing an
//! event is always: fill in `pubkey`, compute the id, BIP340-sign the
//! id, then attach `id` and `sig`.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::{KeywardError, Result};
use crate::keys::{self, XOnlyPublicKey};
use crate::secret::SecretBuffer;

/// An event before id and signature are attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    #[serde(default)]
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
}

/// A fully signed event with `id` and `sig` populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl UnsignedEvent {
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| KeywardError::Failed(format!("Invalid event JSON: {}", e)))
    }

    /// Compute the canonical 32-byte event id. `pubkey` must already be
    /// the 64-hex x-only key of the signer.
    pub fn canonical_id(&self) -> [u8; 32] {
        let serialized = json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        // serde_json emits compact form with no insignificant whitespace
        let bytes = serde_json::to_string(&serialized).expect("event serialization is infallible");
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_bytes());
        hasher.finalize().into()
    }

    /// Attach a precomputed id and signature.
    pub fn into_signed(self, id: [u8; 32], signature: [u8; 64]) -> Event {
        Event {
            id: hex::encode(id),
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(signature),
        }
    }
}

impl Event {
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| KeywardError::Failed(format!("Invalid event JSON: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| KeywardError::Failed(format!("Event serialization failed: {}", e)))
    }

    fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// Check that `id` matches the canonical hash and `sig` verifies
    /// against `pubkey`.
    pub fn verify(&self) -> Result<()> {
        let expected = self.unsigned().canonical_id();
        if self.id != hex::encode(expected) {
            return Err(KeywardError::Failed("Event id mismatch".into()));
        }
        let pubkey = XOnlyPublicKey::from_hex(&self.pubkey)?;
        let mut sig = [0u8; 64];
        hex::decode_to_slice(&self.sig, &mut sig)
            .map_err(|e| KeywardError::Failed(format!("Invalid signature hex: {}", e)))?;
        pubkey.verify(&expected, &sig)
    }
}

/// Sign an unsigned event JSON string with a raw 32-byte secret.
///
/// The signer's public key overrides whatever `pubkey` the input
/// carried, so callers cannot produce an event whose id was hashed over
/// a different key than the one that signed it.
pub fn sign_event_with(secret: &SecretBuffer, event_json: &str) -> Result<String> {
    let mut unsigned = UnsignedEvent::from_json(event_json)?;
    let pubkey = keys::derive_public_key(secret)?;
    unsigned.pubkey = pubkey.to_hex();
    let id = unsigned.canonical_id();
    let signature = keys::sign_hash(secret, &id)?;
    unsigned.into_signed(id, signature).to_json()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_unsigned() -> String {
        json!({
            "pubkey": "",
            "created_at": 1_700_000_000i64,
            "kind": 1,
            "tags": [["p", "abc"]],
            "content": "hello"
        })
        .to_string()
    }

    #[test]
    fn canonical_id_is_stable() {
        let event = UnsignedEvent::from_json(&sample_unsigned()).unwrap();
        assert_eq!(event.canonical_id(), event.canonical_id());
    }

    #[test]
    fn canonical_id_changes_with_content() {
        let mut a = UnsignedEvent::from_json(&sample_unsigned()).unwrap();
        let b = a.clone();
        a.content = "other".into();
        assert_ne!(a.canonical_id(), b.canonical_id());
    }

    #[test]
    fn signed_event_verifies() {
        let secret = SecretBuffer::random();
        let signed_json = sign_event_with(&secret, &sample_unsigned()).unwrap();
        let event = Event::from_json(&signed_json).unwrap();
        event.verify().unwrap();
        assert_eq!(event.pubkey.len(), 64);
        assert_eq!(event.sig.len(), 128);
    }

    #[test]
    fn sign_event_equals_hash_then_sign() {
        let secret = SecretBuffer::random();
        let pubkey = keys::derive_public_key(&secret).unwrap();

        let mut unsigned = UnsignedEvent::from_json(&sample_unsigned()).unwrap();
        unsigned.pubkey = pubkey.to_hex();
        let id = unsigned.canonical_id();

        let via_sign_event = Event::from_json(&sign_event_with(&secret, &sample_unsigned()).unwrap()).unwrap();
        assert_eq!(via_sign_event.id, hex::encode(id));
        // signatures are randomized, but both must verify over the same id
        pubkey
            .verify(&id, &{
                let mut sig = [0u8; 64];
                hex::decode_to_slice(&via_sign_event.sig, &mut sig).unwrap();
                sig
            })
            .unwrap();
    }

    #[test]
    fn tampered_event_fails_verification() {
        let secret = SecretBuffer::random();
        let signed_json = sign_event_with(&secret, &sample_unsigned()).unwrap();
        let mut event = Event::from_json(&signed_json).unwrap();
        event.content = "forged".into();
        assert!(event.verify().is_err());
    }

    #[test]
    fn missing_fields_are_defaulted() {
        let minimal = json!({"created_at": 1, "kind": 0}).to_string();
        let event = UnsignedEvent::from_json(&minimal).unwrap();
        assert!(event.tags.is_empty());
        assert!(event.content.is_empty());
    }
}
