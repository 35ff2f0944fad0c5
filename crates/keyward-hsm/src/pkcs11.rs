//! PKCS#11 token backend.
//!
//! Works against any PKCS#11 module (SoftHSM 2, YubiHSM 2, Nitrokey,
//! smart cards behind p11-kit). Key identifiers at this provider's
//! boundary are the base64 encoding of the token object's `CKA_ID`.
//!
//! Most tokens only implement ECDSA over the NIST curves; secp256k1
//! support is probed per slot. When a token cannot sign natively and
//! the software fallback is enabled, extractable keys are read out for
//! a single in-memory Schnorr signature and zeroed immediately.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as CkError, RvError};
use cryptoki::mechanism::{Mechanism, MechanismType};
use cryptoki::object::{Attribute, AttributeType, KeyType as CkKeyType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use keyward_core::event::UnsignedEvent;
use keyward_core::types::device_flags;
use keyward_core::{
    keys, DeviceInfo, KeyInfo, KeyType, KeywardError, Result, SecretBuffer, XOnlyPublicKey,
};

use crate::provider::HsmProvider;

/// DER encoding of the secp256k1 curve OID (1.3.132.0.10), used as
/// `CKA_EC_PARAMS`.
const SECP256K1_OID_DER: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x0a];

/// Module paths tried by `init` when none were added explicitly.
const DEFAULT_MODULE_PATHS: &[&str] = &[
    "/usr/lib/x86_64-linux-gnu/p11-kit-proxy.so",
    "/usr/lib/p11-kit-proxy.so",
    "/usr/lib/x86_64-linux-gnu/softhsm/libsofthsm2.so",
    "/usr/lib/softhsm/libsofthsm2.so",
];

/// Map a cryptoki error onto the shared taxonomy. Callers above the
/// provider boundary never see `CKR_*` values.
fn map_pkcs11_error(err: CkError, context: &str) -> KeywardError {
    if let CkError::Pkcs11(rv, _) = &err {
        return match rv {
            RvError::PinIncorrect | RvError::PinInvalid | RvError::PinLenRange => {
                KeywardError::PinIncorrect(format!("{}: {}", context, err))
            }
            RvError::PinLocked => KeywardError::PinLocked(format!("{}: {}", context, err)),
            RvError::PinExpired => KeywardError::PinIncorrect(format!("{}: {}", context, err)),
            RvError::TokenNotPresent | RvError::SlotIdInvalid => {
                KeywardError::NotFound(format!("{}: {}", context, err))
            }
            RvError::DeviceError | RvError::DeviceMemory => {
                KeywardError::DeviceError(format!("{}: {}", context, err))
            }
            RvError::DeviceRemoved => KeywardError::DeviceRemoved(format!("{}: {}", context, err)),
            RvError::UserNotLoggedIn => KeywardError::PinRequired(format!("{}: {}", context, err)),
            RvError::CryptokiNotInitialized => {
                KeywardError::NotInitialized(format!("{}: {}", context, err))
            }
            RvError::MechanismInvalid => {
                KeywardError::NotAvailable(format!("{}: {}", context, err))
            }
            _ => KeywardError::Failed(format!("{}: {}", context, err)),
        };
    }
    KeywardError::Failed(format!("{}: {}", context, err))
}

/// Extract the 32-byte x-only coordinate from any EC point encoding a
/// token may return: bare x-only, SEC1 compressed/uncompressed, or a
/// DER `OCTET STRING` wrapping one of those.
pub fn extract_x_only(data: &[u8]) -> Result<[u8; 32]> {
    if data.len() == 32 {
        let mut x = [0u8; 32];
        x.copy_from_slice(data);
        return Ok(x);
    }
    if data.len() == 65 && data[0] == 0x04 {
        let mut x = [0u8; 32];
        x.copy_from_slice(&data[1..33]);
        return Ok(x);
    }
    if data.len() == 33 && (data[0] == 0x02 || data[0] == 0x03) {
        let mut x = [0u8; 32];
        x.copy_from_slice(&data[1..33]);
        return Ok(x);
    }
    // OCTET STRING wrap: tag 0x04 (which collides with the SEC1
    // uncompressed prefix, hence the exact-length checks above)
    if data.first() == Some(&0x04) {
        if let Ok((value, rest)) = read_tlv(data, 0x04) {
            if rest.is_empty() && value.len() != data.len() {
                return extract_x_only(value);
            }
        }
    }
    Err(KeywardError::Failed(format!(
        "Unsupported EC point encoding: {} bytes, first byte 0x{:02x}",
        data.len(),
        data.first().copied().unwrap_or(0)
    )))
}

/// Read one DER TLV with the expected tag, returning (value, rest).
/// Supports short form and the one/two-byte long length forms.
fn read_tlv(data: &[u8], expected_tag: u8) -> Result<(&[u8], &[u8])> {
    let malformed = || KeywardError::Failed("Malformed DER".into());
    if data.len() < 2 || data[0] != expected_tag {
        return Err(malformed());
    }
    let (len, header) = match data[1] {
        l if l < 0x80 => (l as usize, 2),
        0x81 => (*data.get(2).ok_or_else(malformed)? as usize, 3),
        0x82 => {
            let hi = *data.get(2).ok_or_else(malformed)? as usize;
            let lo = *data.get(3).ok_or_else(malformed)? as usize;
            (hi << 8 | lo, 4)
        }
        _ => return Err(malformed()),
    };
    if data.len() < header + len {
        return Err(malformed());
    }
    Ok((&data[header..header + len], &data[header + len..]))
}

/// Normalize an ECDSA signature to the fixed 64-byte `r ∥ s` form.
///
/// Tokens return either the raw 64 bytes or a DER `SEQUENCE` of two
/// `INTEGER`s whose values may carry a sign-padding zero or be shorter
/// than 32 bytes.
pub fn normalize_ecdsa_signature(sig: &[u8]) -> Result<[u8; 64]> {
    if sig.len() == 64 {
        let mut out = [0u8; 64];
        out.copy_from_slice(sig);
        return Ok(out);
    }
    let (seq, rest) = read_tlv(sig, 0x30)?;
    if !rest.is_empty() {
        return Err(KeywardError::Failed("Trailing bytes after DER signature".into()));
    }
    let (r, after_r) = read_tlv(seq, 0x02)?;
    let (s, after_s) = read_tlv(after_r, 0x02)?;
    if !after_s.is_empty() {
        return Err(KeywardError::Failed("Trailing bytes in DER signature".into()));
    }
    let mut out = [0u8; 64];
    write_integer(r, &mut out[..32])?;
    write_integer(s, &mut out[32..])?;
    Ok(out)
}

/// Left-pad a DER INTEGER value into a 32-byte field, stripping the
/// sign-padding zero when present.
fn write_integer(value: &[u8], out: &mut [u8]) -> Result<()> {
    let mut v = value;
    while v.len() > 1 && v[0] == 0 {
        v = &v[1..];
    }
    if v.len() > out.len() {
        return Err(KeywardError::Failed(format!(
            "DER integer too large: {} bytes",
            v.len()
        )));
    }
    let start = out.len() - v.len();
    out[start..].copy_from_slice(v);
    Ok(())
}

struct LoadedModule {
    path: PathBuf,
    ctx: Pkcs11,
}

#[derive(Default)]
struct Pkcs11State {
    initialized: bool,
    module_paths: Vec<PathBuf>,
    modules: Vec<LoadedModule>,
    sessions: HashMap<u64, Session>,
    secp256k1_support: HashMap<u64, bool>,
    software_fallback: bool,
}

/// HSM provider over one or more loaded PKCS#11 modules.
pub struct Pkcs11Provider {
    state: Mutex<Pkcs11State>,
}

impl Pkcs11Provider {
    pub fn new() -> Self {
        let mut state = Pkcs11State::default();
        state.software_fallback = true;
        Self {
            state: Mutex::new(state),
        }
    }

    /// Add a module path to load on `init` (or immediately when already
    /// initialized).
    pub fn add_module(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let mut state = self.state.lock().unwrap();
        if state.module_paths.contains(&path) {
            return Ok(());
        }
        state.module_paths.push(path.clone());
        if state.initialized {
            let module = Self::load_module(&path)?;
            state.modules.push(module);
        }
        Ok(())
    }

    /// Unload a module. Sessions opened against its slots are dropped.
    pub fn remove_module(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let mut state = self.state.lock().unwrap();
        state.module_paths.retain(|p| p != path);
        state.modules.retain(|m| m.path != path);
        // slot ids from the removed module are now stale
        state.sessions.clear();
        state.secp256k1_support.clear();
    }

    /// Allow or forbid reading extractable keys out for software
    /// signing when the token lacks secp256k1 support.
    pub fn set_software_fallback_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().software_fallback = enabled;
    }

    fn load_module(path: &Path) -> Result<LoadedModule> {
        let ctx = Pkcs11::new(path).map_err(|e| {
            KeywardError::NotAvailable(format!("Failed to load module {}: {}", path.display(), e))
        })?;
        match ctx.initialize(CInitializeArgs::OsThreads) {
            Ok(()) => {}
            Err(CkError::AlreadyInitialized)
            | Err(CkError::Pkcs11(RvError::CryptokiAlreadyInitialized, _)) => {}
            Err(e) => {
                return Err(KeywardError::NotAvailable(format!(
                    "Failed to initialize module {}: {}",
                    path.display(),
                    e
                )))
            }
        }
        info!("Loaded PKCS#11 module {}", path.display());
        Ok(LoadedModule {
            path: path.to_path_buf(),
            ctx,
        })
    }

    fn default_module_paths() -> Vec<PathBuf> {
        DEFAULT_MODULE_PATHS
            .iter()
            .map(PathBuf::from)
            .filter(|p| p.exists())
            .collect()
    }

    /// Locate the module and slot owning `slot_id`. First module that
    /// exposes the id wins.
    fn find_slot(state: &Pkcs11State, slot_id: u64) -> Result<(&Pkcs11, Slot)> {
        for module in &state.modules {
            let slots = module
                .ctx
                .get_slots_with_token()
                .map_err(|e| map_pkcs11_error(e, "Slot enumeration failed"))?;
            if let Some(slot) = slots.into_iter().find(|s| s.id() == slot_id) {
                return Ok((&module.ctx, slot));
            }
        }
        Err(KeywardError::NotFound(format!(
            "No token in slot {}",
            slot_id
        )))
    }

    /// Run `f` with a session for the slot: the cached (logged-in)
    /// session when one exists, otherwise a fresh session that is
    /// closed afterwards.
    fn with_session<T>(
        state: &Pkcs11State,
        slot_id: u64,
        f: impl FnOnce(&Session) -> Result<T>,
    ) -> Result<T> {
        if let Some(session) = state.sessions.get(&slot_id) {
            return f(session);
        }
        let (ctx, slot) = Self::find_slot(state, slot_id)?;
        let session = ctx
            .open_rw_session(slot)
            .map_err(|e| map_pkcs11_error(e, "Failed to open session"))?;
        f(&session)
    }

    /// Check (and cache) whether the slot's token can do ECDSA over
    /// secp256k1: the mechanism's key-size range must cover 256 bits,
    /// then a session-scoped throwaway key pair must actually generate.
    fn supports_secp256k1(state: &mut Pkcs11State, slot_id: u64) -> bool {
        if let Some(cached) = state.secp256k1_support.get(&slot_id) {
            return *cached;
        }
        let supported = Self::probe_secp256k1(state, slot_id);
        state.secp256k1_support.insert(slot_id, supported);
        debug!(slot_id, supported, "secp256k1 capability probe");
        supported
    }

    fn probe_secp256k1(state: &Pkcs11State, slot_id: u64) -> bool {
        let (ctx, slot) = match Self::find_slot(state, slot_id) {
            Ok(found) => found,
            Err(_) => return false,
        };
        let info = match ctx.get_mechanism_info(slot, MechanismType::ECDSA) {
            Ok(info) => info,
            Err(_) => return false,
        };
        // key sizes are in bits for EC mechanisms; 0 means unreported
        let min = info.min_key_size();
        let max = info.max_key_size();
        if (min != 0 && min > 256) || (max != 0 && max < 256) {
            return false;
        }
        let session = match ctx.open_rw_session(slot) {
            Ok(session) => session,
            Err(_) => return false,
        };
        let pub_template = [
            Attribute::Token(false),
            Attribute::Verify(true),
            Attribute::EcParams(SECP256K1_OID_DER.to_vec()),
        ];
        let priv_template = [Attribute::Token(false), Attribute::Sign(true)];
        match session.generate_key_pair(&Mechanism::EccKeyPairGen, &pub_template, &priv_template) {
            Ok((public, private)) => {
                let _ = session.destroy_object(private);
                let _ = session.destroy_object(public);
                true
            }
            Err(_) => false,
        }
    }

    fn decode_key_id(key_id: &str) -> Result<Vec<u8>> {
        BASE64
            .decode(key_id)
            .map_err(|e| KeywardError::NotFound(format!("Invalid key id '{}': {}", key_id, e)))
    }

    fn find_key(session: &Session, class: ObjectClass, cka_id: &[u8]) -> Result<ObjectHandle> {
        let template = vec![Attribute::Class(class), Attribute::Id(cka_id.to_vec())];
        let objects = session
            .find_objects(&template)
            .map_err(|e| map_pkcs11_error(e, "Object search failed"))?;
        objects.into_iter().next().ok_or_else(|| {
            KeywardError::NotFound(format!("No {:?} with id {}", class, BASE64.encode(cka_id)))
        })
    }

    /// Fetch the EC point for a key, trying the private object first
    /// and falling back to a matching public object.
    fn public_point(session: &Session, cka_id: &[u8]) -> Result<[u8; 32]> {
        for class in [ObjectClass::PRIVATE_KEY, ObjectClass::PUBLIC_KEY] {
            let handle = match Self::find_key(session, class, cka_id) {
                Ok(handle) => handle,
                Err(_) => continue,
            };
            let attrs = session
                .get_attributes(handle, &[AttributeType::EcPoint])
                .unwrap_or_default();
            for attr in attrs {
                if let Attribute::EcPoint(point) = attr {
                    return extract_x_only(&point);
                }
            }
        }
        Err(KeywardError::NotFound(format!(
            "No EC point for key {}",
            BASE64.encode(cka_id)
        )))
    }

    fn key_info_from_handle(
        session: &Session,
        handle: ObjectHandle,
        slot_id: u64,
    ) -> Option<KeyInfo> {
        let attrs = session
            .get_attributes(
                handle,
                &[
                    AttributeType::Id,
                    AttributeType::Label,
                    AttributeType::Sign,
                    AttributeType::Extractable,
                ],
            )
            .ok()?;
        let mut cka_id = Vec::new();
        let mut label = String::new();
        let mut can_sign = false;
        let mut extractable = false;
        for attr in attrs {
            match attr {
                Attribute::Id(id) => cka_id = id,
                Attribute::Label(bytes) => {
                    label = String::from_utf8_lossy(&bytes).trim_end().to_string()
                }
                Attribute::Sign(v) => can_sign = v,
                Attribute::Extractable(v) => extractable = v,
                _ => {}
            }
        }
        if cka_id.is_empty() {
            return None;
        }
        let (npub, pubkey_hex) = match Self::public_point(session, &cka_id) {
            Ok(x) => {
                let pubkey = XOnlyPublicKey::new(x);
                (pubkey.to_npub().ok()?, pubkey.to_hex())
            }
            Err(_) => (String::new(), String::new()),
        };
        Some(KeyInfo {
            key_id: BASE64.encode(&cka_id),
            label,
            npub,
            pubkey_hex,
            key_type: KeyType::Secp256k1,
            created_at: String::new(),
            slot_id,
            can_sign,
            is_extractable: extractable,
        })
    }

    fn random_cka_id() -> Vec<u8> {
        let mut id = vec![0u8; 8];
        OsRng.fill_bytes(&mut id);
        id
    }

    /// Read an extractable private value and sign in software. The key
    /// bytes live only for the duration of this call.
    fn software_sign(
        session: &Session,
        handle: ObjectHandle,
        hash: &[u8; 32],
    ) -> Result<[u8; 64]> {
        let attrs = session
            .get_attributes(handle, &[AttributeType::Extractable])
            .map_err(|e| map_pkcs11_error(e, "Attribute read failed"))?;
        let extractable = attrs
            .iter()
            .any(|a| matches!(a, Attribute::Extractable(true)));
        if !extractable {
            return Err(KeywardError::PermissionDenied(
                "Token lacks secp256k1 signing and the key is not extractable".into(),
            ));
        }
        let attrs = session
            .get_attributes(handle, &[AttributeType::Value])
            .map_err(|e| map_pkcs11_error(e, "Key value read failed"))?;
        for attr in attrs {
            if let Attribute::Value(value) = attr {
                let value = Zeroizing::new(value);
                let secret = SecretBuffer::from_slice(&value)?;
                return keys::sign_hash(&secret, hash);
            }
        }
        Err(KeywardError::PermissionDenied(
            "Token refused to return the key value".into(),
        ))
    }

    /// Store a software-generated key on the token as an extractable
    /// object, plus a best-effort public-key object.
    fn store_software_key(
        session: &Session,
        secret: &SecretBuffer,
        label: &str,
        cka_id: &[u8],
    ) -> Result<XOnlyPublicKey> {
        let pubkey = keys::derive_public_key(secret)
            .map_err(|e| KeywardError::KeyGenerationFailed(e.to_string()))?;
        let priv_template = vec![
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::KeyType(CkKeyType::EC),
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(false),
            Attribute::Extractable(true),
            Attribute::Sign(true),
            Attribute::Label(label.as_bytes().to_vec()),
            Attribute::Id(cka_id.to_vec()),
            Attribute::EcParams(SECP256K1_OID_DER.to_vec()),
            Attribute::Value(secret.as_bytes().to_vec()),
        ];
        session
            .create_object(&priv_template)
            .map_err(|e| map_pkcs11_error(e, "Failed to store key object"))?;

        let pub_template = vec![
            Attribute::Class(ObjectClass::PUBLIC_KEY),
            Attribute::KeyType(CkKeyType::EC),
            Attribute::Token(true),
            Attribute::Verify(true),
            Attribute::Label(label.as_bytes().to_vec()),
            Attribute::Id(cka_id.to_vec()),
            Attribute::EcParams(SECP256K1_OID_DER.to_vec()),
            Attribute::EcPoint(pubkey.as_bytes().to_vec()),
        ];
        if let Err(e) = session.create_object(&pub_template) {
            warn!("Could not store public key object: {}", e);
        }
        Ok(pubkey)
    }
}

impl Default for Pkcs11Provider {
    fn default() -> Self {
        Self::new()
    }
}

impl HsmProvider for Pkcs11Provider {
    fn name(&self) -> &str {
        "pkcs11"
    }

    fn is_available(&self) -> bool {
        let state = self.state.lock().unwrap();
        if state.initialized {
            return !state.modules.is_empty();
        }
        !state.module_paths.is_empty() || !Self::default_module_paths().is_empty()
    }

    fn init(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.initialized {
            return Ok(());
        }
        if state.module_paths.is_empty() {
            state.module_paths = Self::default_module_paths();
        }
        let mut modules = Vec::new();
        for path in &state.module_paths {
            match Self::load_module(path) {
                Ok(module) => modules.push(module),
                Err(e) => warn!("Skipping module {}: {}", path.display(), e),
            }
        }
        if modules.is_empty() {
            return Err(KeywardError::NotAvailable(
                "No PKCS#11 modules could be loaded".into(),
            ));
        }
        state.modules = modules;
        state.initialized = true;
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        for (_, session) in state.sessions.drain() {
            let _ = session.logout();
        }
        state.modules.clear();
        state.secp256k1_support.clear();
        state.initialized = false;
        debug!("PKCS#11 provider shut down");
    }

    fn detect_devices(&self) -> Result<Vec<DeviceInfo>> {
        let state = self.state.lock().unwrap();
        if !state.initialized {
            return Err(KeywardError::NotInitialized("Provider not initialized".into()));
        }
        let mut devices = Vec::new();
        for module in &state.modules {
            let slots = module
                .ctx
                .get_slots_with_token()
                .map_err(|e| map_pkcs11_error(e, "Slot enumeration failed"))?;
            for slot in slots {
                let token = match module.ctx.get_token_info(slot) {
                    Ok(token) => token,
                    Err(e) => {
                        warn!("Skipping slot {}: {}", slot.id(), e);
                        continue;
                    }
                };
                let token_present = module
                    .ctx
                    .get_slot_info(slot)
                    .map(|s| s.token_present())
                    .unwrap_or(true);
                // token fields are fixed-width and space padded
                devices.push(DeviceInfo {
                    slot_id: slot.id(),
                    label: token.label().trim_end().to_string(),
                    manufacturer: token.manufacturer_id().trim_end().to_string(),
                    model: token.model().trim_end().to_string(),
                    serial: token.serial_number().trim_end().to_string(),
                    flags: device_flags::SIGN
                        | device_flags::GENERATE
                        | device_flags::IMPORT
                        | device_flags::DELETE,
                    is_token_present: token_present,
                    is_initialized: token.token_initialized(),
                    needs_pin: token.login_required(),
                });
            }
        }
        Ok(devices)
    }

    fn list_keys(&self, slot_id: u64) -> Result<Vec<KeyInfo>> {
        let state = self.state.lock().unwrap();
        Self::with_session(&state, slot_id, |session| {
            let template = vec![
                Attribute::Class(ObjectClass::PRIVATE_KEY),
                Attribute::KeyType(CkKeyType::EC),
            ];
            let handles = session
                .find_objects(&template)
                .map_err(|e| map_pkcs11_error(e, "Key search failed"))?;
            Ok(handles
                .into_iter()
                .filter_map(|h| Self::key_info_from_handle(session, h, slot_id))
                .collect())
        })
    }

    fn get_public_key(&self, slot_id: u64, key_id: &str) -> Result<XOnlyPublicKey> {
        let cka_id = Self::decode_key_id(key_id)?;
        let state = self.state.lock().unwrap();
        Self::with_session(&state, slot_id, |session| {
            Ok(XOnlyPublicKey::new(Self::public_point(session, &cka_id)?))
        })
    }

    fn sign_hash(&self, slot_id: u64, key_id: &str, hash: &[u8; 32]) -> Result<[u8; 64]> {
        let cka_id = Self::decode_key_id(key_id)?;
        let mut state = self.state.lock().unwrap();
        let native = Self::supports_secp256k1(&mut state, slot_id);
        let fallback = state.software_fallback;
        Self::with_session(&state, slot_id, |session| {
            let handle = Self::find_key(session, ObjectClass::PRIVATE_KEY, &cka_id)?;
            if native {
                let raw = session
                    .sign(&Mechanism::Ecdsa, handle, hash)
                    .map_err(|e| map_pkcs11_error(e, "Token signing failed"))?;
                return normalize_ecdsa_signature(&raw);
            }
            if !fallback {
                return Err(KeywardError::NotAvailable(
                    "Token lacks secp256k1 support and software fallback is disabled".into(),
                ));
            }
            Self::software_sign(session, handle, hash)
        })
    }

    // Composed from public operations; the state lock is released
    // between them.
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
        let native = Self::supports_secp256k1(&mut state, slot_id);
        let cka_id = Self::random_cka_id();
        let result = Self::with_session(&state, slot_id, |session| {
            let pubkey = if native {
                let pub_template = vec![
                    Attribute::Token(true),
                    Attribute::Verify(true),
                    Attribute::Label(label.as_bytes().to_vec()),
                    Attribute::Id(cka_id.clone()),
                    Attribute::EcParams(SECP256K1_OID_DER.to_vec()),
                ];
                let priv_template = vec![
                    Attribute::Token(true),
                    Attribute::Private(true),
                    Attribute::Sensitive(true),
                    Attribute::Extractable(false),
                    Attribute::Sign(true),
                    Attribute::Label(label.as_bytes().to_vec()),
                    Attribute::Id(cka_id.clone()),
                ];
                let (public, _private) = session
                    .generate_key_pair(&Mechanism::EccKeyPairGen, &pub_template, &priv_template)
                    .map_err(|e| map_pkcs11_error(e, "Key generation failed"))?;
                let attrs = session
                    .get_attributes(public, &[AttributeType::EcPoint])
                    .map_err(|e| map_pkcs11_error(e, "EC point read failed"))?;
                let point = attrs
                    .into_iter()
                    .find_map(|a| match a {
                        Attribute::EcPoint(p) => Some(p),
                        _ => None,
                    })
                    .ok_or_else(|| {
                        KeywardError::KeyGenerationFailed("Token returned no EC point".into())
                    })?;
                XOnlyPublicKey::new(extract_x_only(&point)?)
            } else {
                // token keeps custody of a software-generated key
                let secret = SecretBuffer::random();
                Self::store_software_key(session, &secret, label, &cka_id)?
            };
            Ok((pubkey, !native))
        })?;
        let (pubkey, extractable) = result;
        Ok(KeyInfo {
            key_id: BASE64.encode(&cka_id),
            label: label.to_string(),
            npub: pubkey.to_npub()?,
            pubkey_hex: pubkey.to_hex(),
            key_type: KeyType::Secp256k1,
            created_at: chrono::Utc::now().to_rfc3339(),
            slot_id,
            can_sign: true,
            is_extractable: extractable,
        })
    }

    fn import_key(&self, slot_id: u64, secret: SecretBuffer, label: &str) -> Result<KeyInfo> {
        let state = self.state.lock().unwrap();
        let cka_id = Self::random_cka_id();
        let pubkey = Self::with_session(&state, slot_id, |session| {
            Self::store_software_key(session, &secret, label, &cka_id)
        })?;
        Ok(KeyInfo {
            key_id: BASE64.encode(&cka_id),
            label: label.to_string(),
            npub: pubkey.to_npub()?,
            pubkey_hex: pubkey.to_hex(),
            key_type: KeyType::Secp256k1,
            created_at: chrono::Utc::now().to_rfc3339(),
            slot_id,
            can_sign: true,
            is_extractable: true,
        })
    }

    fn delete_key(&self, slot_id: u64, key_id: &str) -> Result<()> {
        let cka_id = Self::decode_key_id(key_id)?;
        let state = self.state.lock().unwrap();
        Self::with_session(&state, slot_id, |session| {
            let private = Self::find_key(session, ObjectClass::PRIVATE_KEY, &cka_id)?;
            session
                .destroy_object(private)
                .map_err(|e| map_pkcs11_error(e, "Key deletion failed"))?;
            if let Ok(public) = Self::find_key(session, ObjectClass::PUBLIC_KEY, &cka_id) {
                let _ = session.destroy_object(public);
            }
            Ok(())
        })
    }

    /// Open a session, authenticate, and cache the session so later
    /// operations on the slot reuse it.
    fn login(&self, slot_id: u64, pin: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.sessions.contains_key(&slot_id) {
            return Ok(());
        }
        let session = {
            let (ctx, slot) = Self::find_slot(&state, slot_id)?;
            let session = ctx
                .open_rw_session(slot)
                .map_err(|e| map_pkcs11_error(e, "Failed to open session"))?;
            let pin = AuthPin::new(pin.to_string());
            match session.login(UserType::User, Some(&pin)) {
                Ok(()) => {}
                Err(CkError::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => {}
                Err(e) => return Err(map_pkcs11_error(e, "Login failed")),
            }
            session
        };
        state.sessions.insert(slot_id, session);
        debug!(slot_id, "PKCS#11 login");
        Ok(())
    }

    fn logout(&self, slot_id: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(session) = state.sessions.remove(&slot_id) {
            let _ = session.logout();
            debug!(slot_id, "PKCS#11 logout");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptoki::context::Function;

    const X: [u8; 32] = [
        0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff,
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f, 0x10,
    ];

    fn uncompressed() -> Vec<u8> {
        let mut point = vec![0x04];
        point.extend_from_slice(&X);
        point.extend_from_slice(&[0xab; 32]); // y
        point
    }

    #[test]
    fn extracts_uncompressed_point() {
        assert_eq!(extract_x_only(&uncompressed()).unwrap(), X);
    }

    #[test]
    fn extracts_compressed_point() {
        for prefix in [0x02u8, 0x03] {
            let mut point = vec![prefix];
            point.extend_from_slice(&X);
            assert_eq!(extract_x_only(&point).unwrap(), X);
        }
    }

    #[test]
    fn extracts_bare_x_only() {
        assert_eq!(extract_x_only(&X).unwrap(), X);
    }

    #[test]
    fn extracts_der_wrapped_point() {
        let inner = uncompressed();
        let mut wrapped = vec![0x04, inner.len() as u8];
        wrapped.extend_from_slice(&inner);
        assert_eq!(extract_x_only(&wrapped).unwrap(), X);
    }

    #[test]
    fn extracts_long_form_der_wrapped_point() {
        let inner = uncompressed();
        let mut wrapped = vec![0x04, 0x81, inner.len() as u8];
        wrapped.extend_from_slice(&inner);
        assert_eq!(extract_x_only(&wrapped).unwrap(), X);
    }

    #[test]
    fn all_four_encodings_agree() {
        let mut compressed = vec![0x02];
        compressed.extend_from_slice(&X);
        let mut wrapped = vec![0x04, 65];
        wrapped.extend_from_slice(&uncompressed());
        let results = [
            extract_x_only(&uncompressed()).unwrap(),
            extract_x_only(&compressed).unwrap(),
            extract_x_only(&wrapped).unwrap(),
            extract_x_only(&X).unwrap(),
        ];
        assert!(results.iter().all(|r| *r == X));
    }

    #[test]
    fn rejects_garbage_point() {
        assert!(extract_x_only(&[0u8; 17]).is_err());
        assert!(extract_x_only(&[]).is_err());
    }

    fn der_sig(r: &[u8], s: &[u8]) -> Vec<u8> {
        let mut body = vec![0x02, r.len() as u8];
        body.extend_from_slice(r);
        body.push(0x02);
        body.push(s.len() as u8);
        body.extend_from_slice(s);
        let mut sig = vec![0x30, body.len() as u8];
        sig.extend_from_slice(&body);
        sig
    }

    #[test]
    fn raw_signature_passes_through() {
        let raw = [0x5au8; 64];
        assert_eq!(normalize_ecdsa_signature(&raw).unwrap(), raw);
    }

    #[test]
    fn der_signature_full_width() {
        let r = [0x11u8; 32];
        let s = [0x22u8; 32];
        let out = normalize_ecdsa_signature(&der_sig(&r, &s)).unwrap();
        assert_eq!(&out[..32], &r);
        assert_eq!(&out[32..], &s);
    }

    #[test]
    fn der_signature_with_sign_padding() {
        // high bit set forces a 33-byte INTEGER with a leading zero
        let mut r = vec![0x00];
        r.extend_from_slice(&[0x80; 32]);
        let s = [0x22u8; 32];
        let out = normalize_ecdsa_signature(&der_sig(&r, &s)).unwrap();
        assert_eq!(&out[..32], &[0x80; 32]);
    }

    #[test]
    fn der_signature_with_short_integers() {
        // r fits in one byte and must be left-padded
        let out = normalize_ecdsa_signature(&der_sig(&[0x7f], &[0x01, 0x02])).unwrap();
        assert_eq!(out[31], 0x7f);
        assert!(out[..31].iter().all(|b| *b == 0));
        assert_eq!(&out[62..], &[0x01, 0x02]);
    }

    #[test]
    fn der_signature_rejects_trailing_bytes() {
        let mut sig = der_sig(&[0x01; 32], &[0x02; 32]);
        sig.push(0xff);
        assert!(normalize_ecdsa_signature(&sig).is_err());
    }

    #[test]
    fn der_signature_rejects_oversized_integer() {
        let r = [0x7fu8; 40];
        assert!(normalize_ecdsa_signature(&der_sig(&r, &[0x01])).is_err());
    }

    #[test]
    fn error_mapping_covers_pin_and_device_cases() {
        let cases = [
            (RvError::PinIncorrect, "pin-incorrect"),
            (RvError::PinLocked, "pin-locked"),
            (RvError::TokenNotPresent, "not-found"),
            (RvError::SlotIdInvalid, "not-found"),
            (RvError::DeviceError, "device-error"),
            (RvError::DeviceRemoved, "device-removed"),
            (RvError::UserNotLoggedIn, "pin-required"),
            (RvError::CryptokiNotInitialized, "not-initialized"),
            (RvError::FunctionFailed, "failed"),
        ];
        for (rv, kind) in cases {
            let mapped = map_pkcs11_error(CkError::Pkcs11(rv, Function::Sign), "test");
            assert_eq!(mapped.kind(), kind, "for {:?}", rv);
        }
    }

    #[test]
    fn key_id_round_trips_through_base64() {
        let cka_id = Pkcs11Provider::random_cka_id();
        let encoded = BASE64.encode(&cka_id);
        assert_eq!(Pkcs11Provider::decode_key_id(&encoded).unwrap(), cka_id);
    }

    #[test]
    fn invalid_key_id_is_not_found() {
        let err = Pkcs11Provider::decode_key_id("not base64 !!").unwrap_err();
        assert_eq!(err.kind(), "not-found");
    }

    #[test]
    fn uninitialized_provider_reports_it() {
        let provider = Pkcs11Provider::new();
        let err = provider.detect_devices().unwrap_err();
        assert_eq!(err.kind(), "not-initialized");
    }
}
