//! Zeroize-on-drop container for 32-byte secrets.

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{KeywardError, Result};

/// A 32-byte secret (private key or derived key material).
///
/// The buffer is zeroed when dropped, so secrets are moved by value and
/// never copied into caller-managed byte slices. All code that needs
/// the raw bytes borrows them for the duration of one operation.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretBuffer([u8; 32]);

impl SecretBuffer {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Fill from the OS random number generator.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse from a 64-character hex string. The intermediate decode
    /// buffer is zeroed regardless of outcome.
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(s, bytes.as_mut())
            .map_err(|e| KeywardError::Failed(format!("Invalid secret hex: {}", e)))?;
        Ok(Self(*bytes))
    }

    /// Copy from a slice that must be exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeywardError::Failed(format!("Expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// Debug must never print key material.
impl std::fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBuffer([redacted])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let secret = SecretBuffer::random();
        let hex = hex::encode(secret.as_bytes());
        let parsed = SecretBuffer::from_hex(&hex).unwrap();
        assert_eq!(secret.as_bytes(), parsed.as_bytes());
    }

    #[test]
    fn rejects_bad_length() {
        assert!(SecretBuffer::from_hex("abcd").is_err());
        assert!(SecretBuffer::from_slice(&[0u8; 31]).is_err());
    }

    #[test]
    fn debug_is_redacted() {
        let secret = SecretBuffer::random();
        assert_eq!(format!("{:?}", secret), "SecretBuffer([redacted])");
    }
}
