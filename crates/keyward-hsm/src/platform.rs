//! Platform keystore backend: per-identity keys derived from one
//! hardware-protected master secret.
//!
//! Instead of storing a key per Nostr identity, a single 32-byte master
//! secret lives in the platform's credential store (TPM-backed on
//! Linux, Secure-Enclave-backed on macOS, the OS key store on
//! Windows). A signing key for an identity is derived on demand with
//! HKDF-SHA256 and never persisted: the same npub always re-derives the
//! same key.
//!
//! `key_id` at this provider's boundary is the identity's npub string.

use std::sync::Mutex;

use hkdf::Hkdf;
use sha2::Sha256;
use tracing::{debug, info, warn};

use keyward_core::event;
use keyward_core::types::device_flags;
use keyward_core::{
    keys, DeviceInfo, KeyInfo, KeywardError, Result, SecretBuffer, XOnlyPublicKey,
};

use crate::provider::HsmProvider;

/// Credential-store coordinates for the master secret.
const KEYRING_SERVICE: &str = "org.gnostr.Signer.HardwareKeystore";
const KEYRING_ACCOUNT: &str = "master-key";

/// Domain-separation string for signing-key derivation. Changing it
/// changes every derived key, so it is versioned.
const HKDF_INFO: &[u8] = b"nostr-signing-key-v1";

const MASTER_KEY_LABEL: &str = "gnostr-master-key";

/// Which hardware path protects the master secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeystoreBackend {
    Tpm,
    SecureEnclave,
    PlatformKeystore,
    Software,
}

impl KeystoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeystoreBackend::Tpm => "TPM 2.0",
            KeystoreBackend::SecureEnclave => "Secure Enclave",
            KeystoreBackend::PlatformKeystore => "Platform key store",
            KeystoreBackend::Software => "Software",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeystoreStatus {
    Available,
    Unavailable,
    UsingFallback,
    Error,
}

/// Report of the detected backend, for display to the user.
#[derive(Debug, Clone)]
pub struct KeystoreInfo {
    pub backend: KeystoreBackend,
    pub status: KeystoreStatus,
    pub description: String,
}

/// Storage for the single master secret. The production implementation
/// is the OS credential store; tests substitute an in-memory one.
pub trait SecretStore: Send + Sync {
    fn load(&self) -> Result<Option<SecretBuffer>>;
    fn store(&self, secret: &SecretBuffer) -> Result<()>;
    /// Returns false when there was nothing to delete.
    fn delete(&self) -> Result<bool>;
}

/// OS credential store via the keyring API.
pub struct KeyringStore;

impl KeyringStore {
    fn entry(&self) -> Result<keyring::Entry> {
        keyring::Entry::new(KEYRING_SERVICE, KEYRING_ACCOUNT)
            .map_err(|e| KeywardError::NotAvailable(format!("Credential store unavailable: {}", e)))
    }
}

impl SecretStore for KeyringStore {
    fn load(&self) -> Result<Option<SecretBuffer>> {
        match self.entry()?.get_secret() {
            Ok(bytes) => {
                let secret = SecretBuffer::from_slice(&bytes)?;
                Ok(Some(secret))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(KeywardError::Failed(format!(
                "Failed to read master key: {}",
                e
            ))),
        }
    }

    fn store(&self, secret: &SecretBuffer) -> Result<()> {
        self.entry()?
            .set_secret(secret.as_bytes())
            .map_err(|e| KeywardError::Failed(format!("Failed to store master key: {}", e)))
    }

    fn delete(&self) -> Result<bool> {
        match self.entry()?.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(KeywardError::Failed(format!(
                "Failed to delete master key: {}",
                e
            ))),
        }
    }
}

/// Derive a 32-byte signing key for `npub` from the master secret.
///
/// Salt is the npub string truncated or zero-padded to exactly
/// 32 bytes; info is the fixed protocol-version string.
pub fn derive_signing_key_from(master: &SecretBuffer, npub: &str) -> SecretBuffer {
    let mut salt = [0u8; 32];
    let npub_bytes = npub.as_bytes();
    let len = npub_bytes.len().min(32);
    salt[..len].copy_from_slice(&npub_bytes[..len]);

    let hk = Hkdf::<Sha256>::new(Some(&salt), master.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(HKDF_INFO, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    SecretBuffer::new(okm)
}

struct PlatformState {
    initialized: bool,
    backend: KeystoreBackend,
    status: KeystoreStatus,
    fallback_enabled: bool,
    cached_master: Option<SecretBuffer>,
}

/// HSM provider over the platform keystore.
pub struct PlatformKeystoreProvider {
    store: Box<dyn SecretStore>,
    state: Mutex<PlatformState>,
}

impl PlatformKeystoreProvider {
    pub fn new() -> Self {
        Self::with_store(Box::new(KeyringStore))
    }

    /// Construct over a custom secret store.
    pub fn with_store(store: Box<dyn SecretStore>) -> Self {
        Self {
            store,
            state: Mutex::new(PlatformState {
                initialized: false,
                backend: KeystoreBackend::Software,
                status: KeystoreStatus::Unavailable,
                fallback_enabled: true,
                cached_master: None,
            }),
        }
    }

    /// Probe the platform for a hardware-backed keystore.
    fn detect_backend() -> (KeystoreBackend, KeystoreStatus) {
        #[cfg(target_os = "linux")]
        {
            use std::path::Path;
            if Path::new("/dev/tpmrm0").exists() || Path::new("/dev/tpm0").exists() {
                return (KeystoreBackend::Tpm, KeystoreStatus::Available);
            }
            (KeystoreBackend::Software, KeystoreStatus::UsingFallback)
        }
        #[cfg(target_os = "macos")]
        {
            (KeystoreBackend::SecureEnclave, KeystoreStatus::Available)
        }
        #[cfg(target_os = "windows")]
        {
            (KeystoreBackend::PlatformKeystore, KeystoreStatus::Available)
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            (KeystoreBackend::Software, KeystoreStatus::UsingFallback)
        }
    }

    /// Description of the backend protecting the master secret.
    pub fn keystore_info(&self) -> KeystoreInfo {
        let state = self.state.lock().unwrap();
        let description = match state.status {
            KeystoreStatus::Available => {
                format!("Master key protected by {}", state.backend.as_str())
            }
            KeystoreStatus::UsingFallback => {
                "Master key stored in the OS credential store (software fallback)".to_string()
            }
            KeystoreStatus::Unavailable => "No keystore backend available".to_string(),
            KeystoreStatus::Error => "Keystore backend failed".to_string(),
        };
        KeystoreInfo {
            backend: state.backend,
            status: state.status,
            description,
        }
    }

    /// Permit or forbid the software fallback when no hardware backend
    /// is present.
    pub fn set_fallback_enabled(&self, enabled: bool) {
        let mut state = self.state.lock().unwrap();
        state.fallback_enabled = enabled;
        if state.initialized && state.status == KeystoreStatus::UsingFallback && !enabled {
            state.status = KeystoreStatus::Unavailable;
        }
    }

    pub fn is_using_fallback(&self) -> bool {
        self.state.lock().unwrap().status == KeystoreStatus::UsingFallback
    }

    pub fn has_master_key(&self) -> Result<bool> {
        if self.state.lock().unwrap().cached_master.is_some() {
            return Ok(true);
        }
        Ok(self.store.load()?.is_some())
    }

    /// Create the master secret. Refuses to overwrite an existing one:
    /// rotation requires an explicit [`delete_master_key`](Self::delete_master_key).
    pub fn create_master_key(&self) -> Result<()> {
        self.ensure_usable()?;
        if self.store.load()?.is_some() {
            return Err(KeywardError::AlreadyExists(format!(
                "{} already present; delete it first to rotate",
                MASTER_KEY_LABEL
            )));
        }
        let master = SecretBuffer::random();
        self.store.store(&master)?;
        self.state.lock().unwrap().cached_master = Some(master);
        info!("Created new master key");
        Ok(())
    }

    pub fn delete_master_key(&self) -> Result<()> {
        self.state.lock().unwrap().cached_master = None;
        if self.store.delete()? {
            info!("Deleted master key");
            Ok(())
        } else {
            Err(KeywardError::NotFound("No master key to delete".into()))
        }
    }

    /// Derive the signing key for an identity. Fails with `NotFound`
    /// until a master key has been created.
    pub fn derive_signing_key(&self, npub: &str) -> Result<SecretBuffer> {
        let master = self.master_key()?;
        Ok(derive_signing_key_from(&master, npub))
    }

    fn master_key(&self) -> Result<SecretBuffer> {
        {
            let state = self.state.lock().unwrap();
            if let Some(master) = &state.cached_master {
                return Ok(master.clone());
            }
        }
        let loaded = self.store.load()?.ok_or_else(|| {
            KeywardError::NotFound(
                "No master key exists yet; create one before deriving signing keys".into(),
            )
        })?;
        let mut state = self.state.lock().unwrap();
        state.cached_master = Some(loaded.clone());
        Ok(loaded)
    }

    fn ensure_usable(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        match state.status {
            KeystoreStatus::Available => Ok(()),
            KeystoreStatus::UsingFallback if state.fallback_enabled => Ok(()),
            _ if !state.initialized => {
                // init is lazy; detection happens on first use
                drop(state);
                self.init()?;
                self.ensure_usable()
            }
            _ => Err(KeywardError::NotAvailable(
                "No usable keystore backend on this platform".into(),
            )),
        }
    }

    fn key_info_for(&self, npub: &str) -> Result<KeyInfo> {
        let secret = self.derive_signing_key(npub)?;
        let pubkey = keys::derive_public_key(&secret)?;
        Ok(KeyInfo {
            key_id: npub.to_string(),
            label: MASTER_KEY_LABEL.to_string(),
            npub: pubkey.to_npub()?,
            pubkey_hex: pubkey.to_hex(),
            key_type: keyward_core::KeyType::Secp256k1,
            created_at: String::new(),
            slot_id: 0,
            can_sign: true,
            is_extractable: false,
        })
    }
}

impl Default for PlatformKeystoreProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl HsmProvider for PlatformKeystoreProvider {
    fn name(&self) -> &str {
        "platform"
    }

    fn is_available(&self) -> bool {
        let state = self.state.lock().unwrap();
        if state.initialized {
            return matches!(
                state.status,
                KeystoreStatus::Available | KeystoreStatus::UsingFallback
            );
        }
        drop(state);
        let (_, status) = Self::detect_backend();
        matches!(
            status,
            KeystoreStatus::Available | KeystoreStatus::UsingFallback
        )
    }

    fn init(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.initialized {
            return Ok(());
        }
        let (backend, mut status) = Self::detect_backend();
        if status == KeystoreStatus::UsingFallback && !state.fallback_enabled {
            status = KeystoreStatus::Unavailable;
        }
        match status {
            KeystoreStatus::Available => {
                info!("Keystore backend: {}", backend.as_str())
            }
            KeystoreStatus::UsingFallback => {
                warn!("No hardware keystore found; using credential-store fallback")
            }
            _ => {}
        }
        state.backend = backend;
        state.status = status;
        state.initialized = true;
        if state.status == KeystoreStatus::Unavailable {
            return Err(KeywardError::NotAvailable(
                "No usable keystore backend on this platform".into(),
            ));
        }
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.cached_master = None;
        state.initialized = false;
        debug!("Platform keystore shut down");
    }

    // A derivation backend has no enumerable hardware; it reports one
    // synthetic device representing itself.
    fn detect_devices(&self) -> Result<Vec<DeviceInfo>> {
        self.ensure_usable()?;
        let state = self.state.lock().unwrap();
        Ok(vec![DeviceInfo {
            slot_id: 0,
            label: "Platform keystore".to_string(),
            manufacturer: "Keyward".to_string(),
            model: state.backend.as_str().to_string(),
            serial: String::new(),
            flags: device_flags::SIGN,
            is_token_present: true,
            is_initialized: true,
            needs_pin: false,
        }])
    }

    // Derived keys are never persisted, so there is nothing to list.
    fn list_keys(&self, _slot_id: u64) -> Result<Vec<KeyInfo>> {
        self.ensure_usable()?;
        Ok(Vec::new())
    }

    fn get_public_key(&self, _slot_id: u64, key_id: &str) -> Result<XOnlyPublicKey> {
        let info = self.key_info_for(key_id)?;
        XOnlyPublicKey::from_hex(&info.pubkey_hex)
    }

    fn sign_hash(&self, _slot_id: u64, key_id: &str, hash: &[u8; 32]) -> Result<[u8; 64]> {
        let secret = self.derive_signing_key(key_id)?;
        keys::sign_hash(&secret, hash)
    }

    fn sign_event(&self, _slot_id: u64, key_id: &str, event_json: &str) -> Result<String> {
        let secret = self.derive_signing_key(key_id)?;
        event::sign_event_with(&secret, event_json)
    }

    // generate_key / import_key / delete_key fall through to the
    // NotAvailable defaults: only the single master key is managed, via
    // create_master_key / delete_master_key.
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemoryStore {
        secret: StdMutex<Option<SecretBuffer>>,
    }

    impl SecretStore for MemoryStore {
        fn load(&self) -> Result<Option<SecretBuffer>> {
            Ok(self.secret.lock().unwrap().clone())
        }
        fn store(&self, secret: &SecretBuffer) -> Result<()> {
            *self.secret.lock().unwrap() = Some(secret.clone());
            Ok(())
        }
        fn delete(&self) -> Result<bool> {
            Ok(self.secret.lock().unwrap().take().is_some())
        }
    }

    fn provider() -> PlatformKeystoreProvider {
        PlatformKeystoreProvider::with_store(Box::<MemoryStore>::default())
    }

    #[test]
    fn derivation_is_deterministic() {
        let master = SecretBuffer::new([5u8; 32]);
        let a = derive_signing_key_from(&master, "npub1example");
        let b = derive_signing_key_from(&master, "npub1example");
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn distinct_identities_get_distinct_keys() {
        let master = SecretBuffer::new([5u8; 32]);
        let a = derive_signing_key_from(&master, "npub1alice");
        let b = derive_signing_key_from(&master, "npub1bob");
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn long_npub_salt_is_truncated_not_rejected() {
        let master = SecretBuffer::new([5u8; 32]);
        let long = "npub1".repeat(20);
        let a = derive_signing_key_from(&master, &long);
        // only the first 32 salt bytes matter
        let b = derive_signing_key_from(&master, &long[..32]);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn create_refuses_overwrite() {
        let provider = provider();
        provider.init().unwrap();
        provider.create_master_key().unwrap();
        let err = provider.create_master_key().unwrap_err();
        assert_eq!(err.kind(), "already-exists");
    }

    #[test]
    fn derive_without_master_is_not_found() {
        let provider = provider();
        provider.init().unwrap();
        let err = provider.derive_signing_key("npub1example").unwrap_err();
        assert_eq!(err.kind(), "not-found");
    }

    #[test]
    fn delete_then_create_rotates() {
        let provider = provider();
        provider.init().unwrap();
        provider.create_master_key().unwrap();
        let before = provider.derive_signing_key("npub1example").unwrap();
        provider.delete_master_key().unwrap();
        provider.create_master_key().unwrap();
        let after = provider.derive_signing_key("npub1example").unwrap();
        assert_ne!(before.as_bytes(), after.as_bytes());
    }

    #[test]
    fn delete_without_master_is_not_found() {
        let provider = provider();
        assert_eq!(provider.delete_master_key().unwrap_err().kind(), "not-found");
    }

    #[test]
    fn single_synthetic_device() {
        let provider = provider();
        provider.init().unwrap();
        let devices = provider.detect_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].slot_id, 0);
        assert!(!devices[0].needs_pin);
    }

    #[test]
    fn per_identity_ops_are_unavailable() {
        let provider = provider();
        assert_eq!(provider.generate_key(0, "x").unwrap_err().kind(), "not-available");
        assert_eq!(provider.delete_key(0, "x").unwrap_err().kind(), "not-available");
    }

    #[test]
    fn signed_event_verifies() {
        let provider = provider();
        provider.init().unwrap();
        provider.create_master_key().unwrap();
        let unsigned = serde_json::json!({
            "created_at": 1_700_000_000i64,
            "kind": 1,
            "tags": [],
            "content": "derived key signing"
        })
        .to_string();
        let signed = provider.sign_event(0, "npub1example", &unsigned).unwrap();
        let event = keyward_core::Event::from_json(&signed).unwrap();
        event.verify().unwrap();
        // the event pubkey is the derived key, queryable via the interface
        let pubkey = provider.get_public_key(0, "npub1example").unwrap();
        assert_eq!(event.pubkey, pubkey.to_hex());
    }

    #[test]
    fn login_logout_are_noops() {
        let provider = provider();
        provider.login(0, "ignored").unwrap();
        provider.logout(0).unwrap();
    }
}
