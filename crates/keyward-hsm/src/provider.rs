//! The provider capability interface shared by every HSM backend.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use keyward_core::{DeviceInfo, KeyInfo, KeywardError, Result, SecretBuffer, XOnlyPublicKey};

/// A key-custody backend.
///
/// Implementations guard their mutable state with one internal mutex
/// and may block the calling thread for hardware I/O. Operations a
/// backend does not support fail with `NotAvailable`; operations on a
/// PIN-protected slot before `login` fail with `PinRequired`.
pub trait HsmProvider: Send + Sync {
    /// Stable provider name used for registry lookup.
    fn name(&self) -> &str;

    /// Whether the backend can work on this platform/build. Must not
    /// block on hardware.
    fn is_available(&self) -> bool;

    /// Establish native handles. Idempotent: a second call succeeds
    /// without re-initializing.
    fn init(&self) -> Result<()>;

    /// Release all native resources. Safe to call when never
    /// initialized.
    fn shutdown(&self);

    /// Enumerate currently reachable devices/slots.
    fn detect_devices(&self) -> Result<Vec<DeviceInfo>>;

    fn list_keys(&self, slot_id: u64) -> Result<Vec<KeyInfo>>;

    fn get_public_key(&self, slot_id: u64, key_id: &str) -> Result<XOnlyPublicKey>;

    /// BIP340-sign a 32-byte hash, returning the 64-byte signature.
    fn sign_hash(&self, slot_id: u64, key_id: &str, hash: &[u8; 32]) -> Result<[u8; 64]>;

    /// Sign an unsigned Nostr event JSON string. Equivalent to
    /// computing the canonical id, calling `sign_hash` on it, and
    /// attaching `id`/`sig`.
    fn sign_event(&self, slot_id: u64, key_id: &str, event_json: &str) -> Result<String>;

    fn generate_key(&self, _slot_id: u64, _label: &str) -> Result<KeyInfo> {
        Err(KeywardError::NotAvailable(
            "Key generation not supported by this provider".into(),
        ))
    }

    /// Import raw key material. The secret is consumed by move and
    /// zeroed when the backend is done with it.
    fn import_key(&self, _slot_id: u64, _secret: SecretBuffer, _label: &str) -> Result<KeyInfo> {
        Err(KeywardError::NotAvailable(
            "Key import not supported by this provider".into(),
        ))
    }

    fn delete_key(&self, _slot_id: u64, _key_id: &str) -> Result<()> {
        Err(KeywardError::NotAvailable(
            "Key deletion not supported by this provider".into(),
        ))
    }

    /// Authenticate against a PIN-protected slot. A no-op for backends
    /// without a PIN concept.
    fn login(&self, _slot_id: u64, _pin: &str) -> Result<()> {
        Ok(())
    }

    fn logout(&self, _slot_id: u64) -> Result<()> {
        Ok(())
    }
}

/// Async variants of the blocking entry points.
///
/// No backend here has a native async path, so these dispatch the
/// synchronous call onto the blocking thread pool and race it against
/// the cancellation token. Callers never need to know which path was
/// taken. A cancelled call leaves the blocking task to run to
/// completion detached; the backend's own mutex keeps that safe, and
/// any session the task opened is released by the backend as usual.
#[async_trait]
pub trait HsmProviderAsync {
    async fn detect_devices_async(&self, cancel: CancellationToken) -> Result<Vec<DeviceInfo>>;

    async fn sign_event_async(
        &self,
        slot_id: u64,
        key_id: &str,
        event_json: &str,
        cancel: CancellationToken,
    ) -> Result<String>;
}

fn cancelled() -> KeywardError {
    KeywardError::Failed("Operation cancelled".into())
}

#[async_trait]
impl HsmProviderAsync for Arc<dyn HsmProvider> {
    async fn detect_devices_async(&self, cancel: CancellationToken) -> Result<Vec<DeviceInfo>> {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let provider = Arc::clone(self);
        let task = tokio::task::spawn_blocking(move || provider.detect_devices());
        tokio::select! {
            _ = cancel.cancelled() => Err(cancelled()),
            joined = task => joined
                .map_err(|e| KeywardError::Failed(format!("Worker task failed: {}", e)))?,
        }
    }

    async fn sign_event_async(
        &self,
        slot_id: u64,
        key_id: &str,
        event_json: &str,
        cancel: CancellationToken,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let provider = Arc::clone(self);
        let key_id = key_id.to_string();
        let event_json = event_json.to_string();
        let task =
            tokio::task::spawn_blocking(move || provider.sign_event(slot_id, &key_id, &event_json));
        tokio::select! {
            _ = cancel.cancelled() => Err(cancelled()),
            joined = task => joined
                .map_err(|e| KeywardError::Failed(format!("Worker task failed: {}", e)))?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHsmProvider;

    #[tokio::test]
    async fn async_detect_matches_sync() {
        let mock = MockHsmProvider::new();
        mock.add_device(1, "Async Token", false);
        let provider: Arc<dyn HsmProvider> = Arc::new(mock);

        let sync_devices = provider.detect_devices().unwrap();
        let async_devices = provider
            .detect_devices_async(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sync_devices, async_devices);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let provider: Arc<dyn HsmProvider> = Arc::new(MockHsmProvider::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = provider.detect_devices_async(cancel).await.unwrap_err();
        assert_eq!(err.kind(), "failed");
    }

    #[tokio::test]
    async fn async_sign_event_produces_valid_event() {
        let mock = MockHsmProvider::new();
        mock.add_device(1, "Async Token", false);
        let provider: Arc<dyn HsmProvider> = Arc::new(mock);
        let key = provider.generate_key(1, "async key").unwrap();

        let unsigned = serde_json::json!({
            "created_at": 1_700_000_000i64,
            "kind": 1,
            "tags": [],
            "content": "via worker thread"
        })
        .to_string();

        let signed = provider
            .sign_event_async(1, &key.key_id, &unsigned, CancellationToken::new())
            .await
            .unwrap();
        keyward_core::Event::from_json(&signed).unwrap().verify().unwrap();
    }
}
