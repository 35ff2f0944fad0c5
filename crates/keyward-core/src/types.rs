//! Value types describing hardware slots and stored keys.

use serde::{Deserialize, Serialize};

/// Device capability flags carried in [`DeviceInfo::flags`].
pub mod device_flags {
    /// The device can sign with keys it holds.
    pub const SIGN: u32 = 1 << 0;
    /// The device can generate keys on-token.
    pub const GENERATE: u32 = 1 << 1;
    /// The device accepts imported key material.
    pub const IMPORT: u32 = 1 << 2;
    /// The device can delete stored keys.
    pub const DELETE: u32 = 1 << 3;
}

/// A snapshot of one hardware slot/token, produced by `detect_devices`.
///
/// Instances are created fresh on every enumeration and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub slot_id: u64,
    pub label: String,
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub flags: u32,
    pub is_token_present: bool,
    pub is_initialized: bool,
    pub needs_pin: bool,
}

impl DeviceInfo {
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

/// Curve/algorithm of a stored key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Unknown,
    Secp256k1,
    Ed25519,
}

/// Descriptor of one key held by a backend.
///
/// `key_id` is opaque and backend-defined: base64 random bytes for the
/// software backends, the base64 of `CKA_ID` for PKCS#11 tokens.
/// When the public key is known, `pubkey_hex` is the 64-character
/// x-only hex form and `npub` its bech32 encoding starting `npub1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub key_id: String,
    pub label: String,
    pub npub: String,
    pub pubkey_hex: String,
    pub key_type: KeyType,
    pub created_at: String,
    pub slot_id: u64,
    pub can_sign: bool,
    pub is_extractable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_test() {
        let info = DeviceInfo {
            slot_id: 0,
            label: "t".into(),
            manufacturer: String::new(),
            model: String::new(),
            serial: String::new(),
            flags: device_flags::SIGN | device_flags::GENERATE,
            is_token_present: true,
            is_initialized: true,
            needs_pin: false,
        };
        assert!(info.has_flag(device_flags::SIGN));
        assert!(!info.has_flag(device_flags::IMPORT));
    }

    #[test]
    fn key_type_serde() {
        let json = serde_json::to_string(&KeyType::Secp256k1).unwrap();
        assert_eq!(json, "\"secp256k1\"");
    }
}
