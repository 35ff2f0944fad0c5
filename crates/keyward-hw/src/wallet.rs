//! Hardware-wallet provider contract and BIP32 path helpers.

use serde::{Deserialize, Serialize};

use keyward_core::{KeywardError, Result, XOnlyPublicKey};

/// NIP-06 derivation path for the primary Nostr identity.
pub const NOSTR_DERIVATION_PATH: &str = "m/44'/1237'/0'/0/0";

/// High bit marking a hardened path component.
pub const HARDENED: u32 = 0x8000_0000;

/// Connection/readiness state of one wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceState {
    Disconnected,
    Connected,
    /// Connected, but the signing app is not running.
    AppClosed,
    Ready,
    Busy,
    Error,
}

/// One enumerated wallet. `path` is the native USB device path and is
/// the identifier used for every subsequent operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletDevice {
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
}

/// A USB hardware-wallet backend.
///
/// Calls may block for HID I/O, including waits for the user to press
/// a button on the device.
pub trait HwWalletProvider: Send + Sync {
    fn name(&self) -> &str;

    /// List currently connected wallets this provider can drive.
    fn enumerate_devices(&self) -> Result<Vec<WalletDevice>>;

    /// Open a device by path and probe its readiness.
    fn open_device(&self, path: &str) -> Result<()>;

    fn close_device(&self, path: &str) -> Result<()>;

    fn device_state(&self, path: &str) -> DeviceState;

    /// Fetch the x-only public key for a derivation path. With
    /// `confirm`, the device displays the key for user confirmation.
    fn get_public_key(
        &self,
        path: &str,
        derivation_path: &str,
        confirm: bool,
    ) -> Result<XOnlyPublicKey>;

    /// Sign a 32-byte hash with the key at a derivation path.
    fn sign_hash(&self, path: &str, derivation_path: &str, hash: &[u8; 32]) -> Result<[u8; 64]>;
}

/// Parse a BIP32 path string ("m/44'/1237'/0'/0/0") into components.
/// Hardened components (`'` or `h` suffix) get the high bit set.
pub fn parse_derivation_path(path: &str) -> Result<Vec<u32>> {
    let mut parts = path.split('/');
    if parts.next() != Some("m") {
        return Err(KeywardError::Failed(format!(
            "Derivation path must start with 'm': {}",
            path
        )));
    }
    let mut components = Vec::new();
    for part in parts {
        let (num_str, hardened) = if let Some(stripped) = part.strip_suffix('\'') {
            (stripped, true)
        } else if let Some(stripped) = part.strip_suffix('h') {
            (stripped, true)
        } else {
            (part, false)
        };
        let num: u32 = num_str.parse().map_err(|_| {
            KeywardError::Failed(format!("Invalid path component '{}' in {}", part, path))
        })?;
        if num & HARDENED != 0 {
            return Err(KeywardError::Failed(format!(
                "Path component out of range: {}",
                part
            )));
        }
        components.push(if hardened { num | HARDENED } else { num });
    }
    if components.is_empty() {
        return Err(KeywardError::Failed(format!("Empty derivation path: {}", path)));
    }
    Ok(components)
}

/// Serialize path components for an APDU payload: a count byte
/// followed by each component as big-endian u32.
pub fn encode_bip32_path(components: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + components.len() * 4);
    out.push(components.len() as u8);
    for component in components {
        out.extend_from_slice(&component.to_be_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nostr_path() {
        let components = parse_derivation_path(NOSTR_DERIVATION_PATH).unwrap();
        assert_eq!(
            components,
            vec![44 | HARDENED, 1237 | HARDENED, HARDENED, 0, 0]
        );
    }

    #[test]
    fn accepts_h_suffix() {
        let a = parse_derivation_path("m/44'/0'/0'").unwrap();
        let b = parse_derivation_path("m/44h/0h/0h").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(parse_derivation_path("44'/1237'").is_err());
        assert!(parse_derivation_path("m/abc").is_err());
        assert!(parse_derivation_path("m").is_err());
        assert!(parse_derivation_path("m/4294967295").is_err());
    }

    #[test]
    fn encodes_length_prefixed_big_endian() {
        let encoded = encode_bip32_path(&[44 | HARDENED, 0]);
        assert_eq!(encoded.len(), 9);
        assert_eq!(encoded[0], 2);
        assert_eq!(&encoded[1..5], &[0x80, 0x00, 0x00, 0x2c]);
        assert_eq!(&encoded[5..9], &[0x00, 0x00, 0x00, 0x00]);
    }
}
