//! Error types shared by all Keyward backends.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeywardError>;

/// The single error taxonomy every backend maps its native codes into.
///
/// Backend-native codes (PKCS#11 return values, HID errors, hardware
/// wallet status words) never cross a provider boundary; they are
/// converted to exactly one of these kinds at the backend that saw them.
#[derive(Error, Debug)]
pub enum KeywardError {
    #[error("Operation failed: {0}")]
    Failed(String),

    #[error("Not available: {0}")]
    NotAvailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("PIN required: {0}")]
    PinRequired(String),

    #[error("PIN incorrect: {0}")]
    PinIncorrect(String),

    #[error("PIN locked: {0}")]
    PinLocked(String),

    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("Device removed: {0}")]
    DeviceRemoved(String),
}

impl KeywardError {
    /// Stable kind name, independent of the message payload.
    pub fn kind(&self) -> &'static str {
        match self {
            KeywardError::Failed(_) => "failed",
            KeywardError::NotAvailable(_) => "not-available",
            KeywardError::NotFound(_) => "not-found",
            KeywardError::PermissionDenied(_) => "permission-denied",
            KeywardError::DeviceError(_) => "device-error",
            KeywardError::KeyGenerationFailed(_) => "key-generation-failed",
            KeywardError::SigningFailed(_) => "signing-failed",
            KeywardError::AlreadyExists(_) => "already-exists",
            KeywardError::PinRequired(_) => "pin-required",
            KeywardError::PinIncorrect(_) => "pin-incorrect",
            KeywardError::PinLocked(_) => "pin-locked",
            KeywardError::NotInitialized(_) => "not-initialized",
            KeywardError::DeviceRemoved(_) => "device-removed",
        }
    }

    /// True when two errors are of the same kind, ignoring messages.
    pub fn same_kind(&self, other: &KeywardError) -> bool {
        self.kind() == other.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_ignores_message() {
        let a = KeywardError::PinIncorrect("slot 1".into());
        let b = KeywardError::PinIncorrect("slot 2".into());
        assert!(a.same_kind(&b));
        assert!(!a.same_kind(&KeywardError::PinLocked("slot 1".into())));
    }

    #[test]
    fn display_includes_payload() {
        let e = KeywardError::NotFound("key abc".into());
        assert_eq!(e.to_string(), "Not found: key abc");
    }
}
