//! In-memory backend for tests and development.
//!
//! Slots and keys live in process memory, but signing is real BIP340
//! over stored secp256k1 secrets, so higher layers can be exercised
//! end-to-end without hardware. Failure injection: arm an error with
//! [`MockHsmProvider::simulate_error`] and the next operation consumes
//! it, after which behavior reverts to normal.

use std::collections::BTreeMap;
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;

use keyward_core::event::UnsignedEvent;
use keyward_core::types::device_flags;
use keyward_core::{
    keys, DeviceInfo, KeyInfo, KeyType, KeywardError, Result, SecretBuffer, XOnlyPublicKey,
};

use crate::provider::HsmProvider;

struct MockKey {
    info: KeyInfo,
    secret: SecretBuffer,
}

struct MockDevice {
    label: String,
    needs_pin: bool,
    pin: Option<String>,
    authenticated: bool,
    keys: BTreeMap<String, MockKey>,
}

#[derive(Default)]
struct MockState {
    initialized: bool,
    devices: BTreeMap<u64, MockDevice>,
    simulate: Option<KeywardError>,
    operations: u64,
}

/// Software-only provider holding simulated devices and real keys.
pub struct MockHsmProvider {
    state: Mutex<MockState>,
}

impl MockHsmProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    /// Add a simulated device. With `needs_pin`, key operations fail
    /// with `PinRequired` until a successful `login`.
    pub fn add_device(&self, slot_id: u64, label: &str, needs_pin: bool) {
        let mut state = self.state.lock().unwrap();
        state.devices.insert(
            slot_id,
            MockDevice {
                label: label.to_string(),
                needs_pin,
                pin: None,
                authenticated: false,
                keys: BTreeMap::new(),
            },
        );
    }

    /// Set the PIN a device will accept.
    pub fn set_pin(&self, slot_id: u64, pin: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(device) = state.devices.get_mut(&slot_id) {
            device.pin = Some(pin.to_string());
        }
    }

    /// Arm a one-shot error: the next operation fails with `error`.
    pub fn simulate_error(&self, error: KeywardError) {
        self.state.lock().unwrap().simulate = Some(error);
    }

    pub fn clear_simulated_error(&self) {
        self.state.lock().unwrap().simulate = None;
    }

    /// Number of operations performed since construction or
    /// [`reset_operation_count`](Self::reset_operation_count).
    pub fn operation_count(&self) -> u64 {
        self.state.lock().unwrap().operations
    }

    pub fn reset_operation_count(&self) {
        self.state.lock().unwrap().operations = 0;
    }

    /// Count the operation and consume a pending simulated error.
    fn begin_op(state: &mut MockState) -> Result<()> {
        state.operations += 1;
        match state.simulate.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn device<'a>(state: &'a MockState, slot_id: u64) -> Result<&'a MockDevice> {
        state
            .devices
            .get(&slot_id)
            .ok_or_else(|| KeywardError::NotFound(format!("No device in slot {}", slot_id)))
    }

    fn device_mut<'a>(state: &'a mut MockState, slot_id: u64) -> Result<&'a mut MockDevice> {
        state
            .devices
            .get_mut(&slot_id)
            .ok_or_else(|| KeywardError::NotFound(format!("No device in slot {}", slot_id)))
    }

    fn check_auth(device: &MockDevice, slot_id: u64) -> Result<()> {
        if device.needs_pin && !device.authenticated {
            return Err(KeywardError::PinRequired(format!(
                "Slot {} requires login",
                slot_id
            )));
        }
        Ok(())
    }

    fn random_key_id() -> String {
        let mut bytes = [0u8; 8];
        OsRng.fill_bytes(&mut bytes);
        BASE64.encode(bytes)
    }

    fn store_key(
        device: &mut MockDevice,
        slot_id: u64,
        secret: SecretBuffer,
        label: &str,
    ) -> Result<KeyInfo> {
        let pubkey = keys::derive_public_key(&secret)
            .map_err(|e| KeywardError::KeyGenerationFailed(e.to_string()))?;
        let info = KeyInfo {
            key_id: Self::random_key_id(),
            label: label.to_string(),
            npub: pubkey.to_npub()?,
            pubkey_hex: pubkey.to_hex(),
            key_type: KeyType::Secp256k1,
            created_at: chrono::Utc::now().to_rfc3339(),
            slot_id,
            can_sign: true,
            is_extractable: false,
        };
        device
            .keys
            .insert(info.key_id.clone(), MockKey { info: info.clone(), secret });
        Ok(info)
    }
}

impl Default for MockHsmProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl HsmProvider for MockHsmProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn init(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.initialized {
            debug!("Mock provider initialized");
            state.initialized = true;
        }
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.initialized = false;
        state.devices.clear();
        state.simulate = None;
    }

    fn detect_devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut state = self.state.lock().unwrap();
        Self::begin_op(&mut state)?;
        Ok(state
            .devices
            .iter()
            .map(|(slot_id, device)| DeviceInfo {
                slot_id: *slot_id,
                label: device.label.clone(),
                manufacturer: "Keyward".to_string(),
                model: "Mock HSM".to_string(),
                serial: format!("MOCK-{:04}", slot_id),
                flags: device_flags::SIGN
                    | device_flags::GENERATE
                    | device_flags::IMPORT
                    | device_flags::DELETE,
                is_token_present: true,
                is_initialized: true,
                needs_pin: device.needs_pin,
            })
            .collect())
    }

    fn list_keys(&self, slot_id: u64) -> Result<Vec<KeyInfo>> {
        let mut state = self.state.lock().unwrap();
        Self::begin_op(&mut state)?;
        let device = Self::device(&state, slot_id)?;
        Self::check_auth(device, slot_id)?;
        Ok(device.keys.values().map(|k| k.info.clone()).collect())
    }

    fn get_public_key(&self, slot_id: u64, key_id: &str) -> Result<XOnlyPublicKey> {
        let mut state = self.state.lock().unwrap();
        Self::begin_op(&mut state)?;
        let device = Self::device(&state, slot_id)?;
        Self::check_auth(device, slot_id)?;
        let key = device
            .keys
            .get(key_id)
            .ok_or_else(|| KeywardError::NotFound(format!("Key '{}' not found", key_id)))?;
        XOnlyPublicKey::from_hex(&key.info.pubkey_hex)
    }

    fn sign_hash(&self, slot_id: u64, key_id: &str, hash: &[u8; 32]) -> Result<[u8; 64]> {
        let mut state = self.state.lock().unwrap();
        Self::begin_op(&mut state)?;
        let device = Self::device(&state, slot_id)?;
        Self::check_auth(device, slot_id)?;
        let key = device
            .keys
            .get(key_id)
            .ok_or_else(|| KeywardError::NotFound(format!("Key '{}' not found", key_id)))?;
        keys::sign_hash(&key.secret, hash)
    }

    // Composed from public operations; the state lock is never held
    // across the nested calls.
    fn sign_event(&self, slot_id: u64, key_id: &str, event_json: &str) -> Result<String> {
        let pubkey = self.get_public_key(slot_id, key_id)?;
        let mut unsigned = UnsignedEvent::from_json(event_json)?;
        unsigned.pubkey = pubkey.to_hex();
        let id = unsigned.canonical_id();
        let signature = self.sign_hash(slot_id, key_id, &id)?;
        unsigned.into_signed(id, signature).to_json()
    }

    fn generate_key(&self, slot_id: u64, label: &str) -> Result<KeyInfo> {
        let mut state = self.state.lock().unwrap();
        Self::begin_op(&mut state)?;
        let device = Self::device_mut(&mut state, slot_id)?;
        Self::check_auth(device, slot_id)?;
        Self::store_key(device, slot_id, SecretBuffer::random(), label)
    }

    fn import_key(&self, slot_id: u64, secret: SecretBuffer, label: &str) -> Result<KeyInfo> {
        let mut state = self.state.lock().unwrap();
        Self::begin_op(&mut state)?;
        let device = Self::device_mut(&mut state, slot_id)?;
        Self::check_auth(device, slot_id)?;
        Self::store_key(device, slot_id, secret, label)
    }

    fn delete_key(&self, slot_id: u64, key_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::begin_op(&mut state)?;
        let device = Self::device_mut(&mut state, slot_id)?;
        Self::check_auth(device, slot_id)?;
        device
            .keys
            .remove(key_id)
            .map(|_| ())
            .ok_or_else(|| KeywardError::NotFound(format!("Key '{}' not found", key_id)))
    }

    fn login(&self, slot_id: u64, pin: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::begin_op(&mut state)?;
        let device = Self::device_mut(&mut state, slot_id)?;
        if !device.needs_pin {
            return Ok(());
        }
        match &device.pin {
            Some(expected) if expected == pin => {
                device.authenticated = true;
                Ok(())
            }
            _ => Err(KeywardError::PinIncorrect(format!(
                "Wrong PIN for slot {}",
                slot_id
            ))),
        }
    }

    fn logout(&self, slot_id: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::begin_op(&mut state)?;
        let device = Self::device_mut(&mut state, slot_id)?;
        device.authenticated = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_core::Event;

    fn provider_with_device() -> MockHsmProvider {
        let provider = MockHsmProvider::new();
        provider.add_device(1, "Test Token", false);
        provider
    }

    fn unsigned_event() -> String {
        serde_json::json!({
            "created_at": 1_700_000_000i64,
            "kind": 1,
            "tags": [],
            "content": "mock signing test"
        })
        .to_string()
    }

    #[test]
    fn generated_key_invariants() {
        let provider = provider_with_device();
        let key = provider.generate_key(1, "identity").unwrap();
        assert_eq!(key.pubkey_hex.len(), 64);
        assert!(key.npub.starts_with("npub1"));
        assert!(key.can_sign);
        assert!(!key.is_extractable);
        let pubkey = XOnlyPublicKey::from_hex(&key.pubkey_hex).unwrap();
        assert_eq!(pubkey.to_npub().unwrap(), key.npub);
    }

    #[test]
    fn sign_hash_verifies() {
        let provider = provider_with_device();
        let key = provider.generate_key(1, "signer").unwrap();
        let hash = [7u8; 32];
        let sig = provider.sign_hash(1, &key.key_id, &hash).unwrap();
        let pubkey = provider.get_public_key(1, &key.key_id).unwrap();
        pubkey.verify(&hash, &sig).unwrap();
    }

    #[test]
    fn sign_event_matches_hash_then_sign() {
        let provider = provider_with_device();
        let key = provider.generate_key(1, "signer").unwrap();

        let signed = provider.sign_event(1, &key.key_id, &unsigned_event()).unwrap();
        let event = Event::from_json(&signed).unwrap();
        event.verify().unwrap();

        // same canonical id as the manual path
        let mut unsigned = UnsignedEvent::from_json(&unsigned_event()).unwrap();
        unsigned.pubkey = key.pubkey_hex.clone();
        assert_eq!(event.id, hex::encode(unsigned.canonical_id()));
    }

    #[test]
    fn pin_state_machine() {
        let provider = MockHsmProvider::new();
        provider.add_device(2, "PIN Token", true);
        provider.set_pin(2, "1234");

        // before login
        let err = provider.list_keys(2).unwrap_err();
        assert_eq!(err.kind(), "pin-required");

        // wrong PIN leaves the slot unauthenticated
        let err = provider.login(2, "9999").unwrap_err();
        assert_eq!(err.kind(), "pin-incorrect");
        assert_eq!(provider.list_keys(2).unwrap_err().kind(), "pin-required");

        // correct PIN unlocks
        provider.login(2, "1234").unwrap();
        assert!(provider.list_keys(2).unwrap().is_empty());
        provider.generate_key(2, "k").unwrap();

        // logout locks again
        provider.logout(2).unwrap();
        assert_eq!(provider.list_keys(2).unwrap_err().kind(), "pin-required");
    }

    #[test]
    fn login_without_pin_requirement_is_trivial() {
        let provider = provider_with_device();
        provider.login(1, "anything").unwrap();
    }

    #[test]
    fn simulated_error_is_one_shot() {
        let provider = provider_with_device();
        provider.simulate_error(KeywardError::DeviceError("injected".into()));
        let err = provider.detect_devices().unwrap_err();
        assert_eq!(err.kind(), "device-error");
        // next operation succeeds
        provider.detect_devices().unwrap();
    }

    #[test]
    fn operation_counter() {
        let provider = provider_with_device();
        provider.detect_devices().unwrap();
        provider.generate_key(1, "k").unwrap();
        assert_eq!(provider.operation_count(), 2);
        provider.reset_operation_count();
        assert_eq!(provider.operation_count(), 0);
    }

    #[test]
    fn import_preserves_public_key() {
        let provider = provider_with_device();
        let secret = SecretBuffer::new([3u8; 32]);
        let expected = keys::derive_public_key(&secret).unwrap();
        let key = provider.import_key(1, secret, "imported").unwrap();
        assert_eq!(key.pubkey_hex, expected.to_hex());
    }

    #[test]
    fn delete_then_sign_fails() {
        let provider = provider_with_device();
        let key = provider.generate_key(1, "k").unwrap();
        provider.delete_key(1, &key.key_id).unwrap();
        let err = provider.sign_hash(1, &key.key_id, &[0u8; 32]).unwrap_err();
        assert_eq!(err.kind(), "not-found");
        // deleting again is NotFound, not a crash
        assert_eq!(provider.delete_key(1, &key.key_id).unwrap_err().kind(), "not-found");
    }

    #[test]
    fn unknown_slot_is_not_found() {
        let provider = MockHsmProvider::new();
        assert_eq!(provider.list_keys(42).unwrap_err().kind(), "not-found");
    }
}
