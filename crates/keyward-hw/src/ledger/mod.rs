//! Ledger wallet backend (Nano S / S Plus / X).
//!
//! Speaks the vendor APDU protocol over HID. Readiness is probed when
//! a device is opened by asking for the running app's name; signing
//! requires the Nostr app (or a compatible Bitcoin build) to be open.

pub mod framing;

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Mutex;

use hidapi::HidDevice;
use tracing::{debug, info, warn};

use keyward_core::{KeywardError, Result, XOnlyPublicKey};

use crate::hid;
use crate::wallet::{
    encode_bip32_path, parse_derivation_path, DeviceState, HwWalletProvider, WalletDevice,
};

pub const LEDGER_VENDOR_ID: u16 = 0x2c97;

const PID_NANO_S: u16 = 0x0001;
const PID_NANO_X: u16 = 0x0004;
const PID_NANO_S_PLUS: u16 = 0x0005;

const CLA: u8 = 0xe0;
const INS_GET_APP_NAME: u8 = 0x04;
const INS_GET_PUBLIC_KEY: u8 = 0x05;
const INS_SIGN_HASH: u8 = 0x07;

const SW_OK: u16 = 0x9000;
const SW_USER_REJECTED: u16 = 0x6985;
const SW_CLA_NOT_SUPPORTED: u16 = 0x6e00;
const SW_APP_NOT_OPEN: u16 = 0x6e01;
const SW_INS_NOT_SUPPORTED: u16 = 0x6d00;
const SW_DEVICE_LOCKED: u16 = 0x5515;

/// Read timeout generous enough for on-device confirmation.
const READ_TIMEOUT_MS: i32 = 30_000;

/// App names that can serve Nostr signing requests.
const ACCEPTED_APP_PREFIXES: &[&str] = &["Nostr", "Bitcoin"];

fn map_status_word(sw: u16) -> KeywardError {
    match sw {
        SW_USER_REJECTED => KeywardError::PermissionDenied("User rejected on device".into()),
        SW_APP_NOT_OPEN | SW_CLA_NOT_SUPPORTED | SW_INS_NOT_SUPPORTED => {
            KeywardError::NotAvailable("Nostr app not open on device".into())
        }
        SW_DEVICE_LOCKED => KeywardError::PinLocked("Device is locked".into()),
        _ => KeywardError::DeviceError(format!("Device returned status 0x{:04x}", sw)),
    }
}

fn build_apdu(ins: u8, p1: u8, p2: u8, data: &[u8]) -> Vec<u8> {
    let mut apdu = vec![CLA, ins, p1, p2, data.len() as u8];
    apdu.extend_from_slice(data);
    apdu
}

fn model_name(product_id: u16) -> &'static str {
    match product_id {
        PID_NANO_S => "Ledger Nano S",
        PID_NANO_X => "Ledger Nano X",
        PID_NANO_S_PLUS => "Ledger Nano S Plus",
        _ => "Ledger",
    }
}

/// Write an APDU, read the wrapped response, and split off the
/// trailing status word.
fn exchange(device: &HidDevice, apdu: &[u8]) -> Result<(Vec<u8>, u16)> {
    for packet in framing::wrap_apdu(apdu) {
        // report id 0x00 precedes each 64-byte packet on the wire
        let mut report = Vec::with_capacity(framing::PACKET_SIZE + 1);
        report.push(0x00);
        report.extend_from_slice(&packet);
        device
            .write(&report)
            .map_err(|e| KeywardError::DeviceError(format!("HID write failed: {}", e)))?;
    }

    let mut reader = framing::ApduReader::new();
    loop {
        let mut packet = [0u8; framing::PACKET_SIZE];
        let read = device
            .read_timeout(&mut packet, READ_TIMEOUT_MS)
            .map_err(|e| KeywardError::DeviceError(format!("HID read failed: {}", e)))?;
        if read == 0 {
            return Err(KeywardError::Failed("Timed out waiting for device".into()));
        }
        if let Some(response) = reader.feed(&packet[..read])? {
            if response.len() < 2 {
                return Err(KeywardError::DeviceError(format!(
                    "Response too short: {} bytes",
                    response.len()
                )));
            }
            let sw = u16::from_be_bytes([response[response.len() - 2], response[response.len() - 1]]);
            let data = response[..response.len() - 2].to_vec();
            return Ok((data, sw));
        }
    }
}

/// Pull the 32-byte x-only key out of a `[len ∥ key ∥ …]` response.
fn parse_public_key_response(data: &[u8]) -> Result<XOnlyPublicKey> {
    let key_len = *data
        .first()
        .ok_or_else(|| KeywardError::DeviceError("Empty public key response".into()))? as usize;
    let key = data
        .get(1..1 + key_len)
        .ok_or_else(|| KeywardError::DeviceError("Truncated public key response".into()))?;
    let x: [u8; 32] = match key_len {
        65 if key[0] == 0x04 => key[1..33].try_into().expect("slice is 32 bytes"),
        33 if key[0] == 0x02 || key[0] == 0x03 => key[1..33].try_into().expect("slice is 32 bytes"),
        32 => key.try_into().expect("slice is 32 bytes"),
        _ => {
            return Err(KeywardError::DeviceError(format!(
                "Unexpected public key length {}",
                key_len
            )))
        }
    };
    Ok(XOnlyPublicKey::new(x))
}

struct OpenLedger {
    device: HidDevice,
    state: DeviceState,
    app_name: Option<String>,
}

/// Hardware-wallet provider for Ledger devices.
pub struct LedgerProvider {
    open: Mutex<HashMap<String, OpenLedger>>,
}

impl LedgerProvider {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Ask the device for the running app's name and derive the
    /// readiness state from it.
    fn probe_app(device: &HidDevice) -> (DeviceState, Option<String>) {
        let apdu = build_apdu(INS_GET_APP_NAME, 0, 0, &[]);
        match exchange(device, &apdu) {
            Ok((data, SW_OK)) => {
                let name = String::from_utf8_lossy(&data).trim_end_matches('\0').to_string();
                let ready = ACCEPTED_APP_PREFIXES.iter().any(|p| name.starts_with(p));
                debug!(app = %name, ready, "Ledger app probe");
                if ready {
                    (DeviceState::Ready, Some(name))
                } else {
                    (DeviceState::AppClosed, Some(name))
                }
            }
            Ok((_, SW_DEVICE_LOCKED)) => (DeviceState::Error, None),
            Ok((_, _)) => (DeviceState::AppClosed, None),
            Err(e) => {
                warn!("Ledger app probe failed: {}", e);
                (DeviceState::Error, None)
            }
        }
    }

    /// Name of the app seen at open time, when the probe got one.
    pub fn running_app(&self, path: &str) -> Option<String> {
        self.open
            .lock()
            .unwrap()
            .get(path)
            .and_then(|d| d.app_name.clone())
    }

    fn with_ready_device<T>(
        &self,
        path: &str,
        f: impl FnOnce(&HidDevice) -> Result<T>,
    ) -> Result<T> {
        let open = self.open.lock().unwrap();
        let entry = open.get(path).ok_or_else(|| {
            KeywardError::NotFound(format!("Device {} is not open", path))
        })?;
        if entry.state != DeviceState::Ready {
            return Err(KeywardError::NotAvailable(
                "Nostr app not open on device".into(),
            ));
        }
        f(&entry.device)
    }
}

impl Default for LedgerProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl HwWalletProvider for LedgerProvider {
    fn name(&self) -> &str {
        "ledger"
    }

    fn enumerate_devices(&self) -> Result<Vec<WalletDevice>> {
        hid::with_api(|api| {
            Ok(api
                .device_list()
                .filter(|d| d.vendor_id() == LEDGER_VENDOR_ID)
                // Nano X exposes extra interfaces; the APDU one is 0
                .filter(|d| d.interface_number() <= 0)
                .map(|d| WalletDevice {
                    path: d.path().to_string_lossy().into_owned(),
                    vendor_id: d.vendor_id(),
                    product_id: d.product_id(),
                    manufacturer: d.manufacturer_string().unwrap_or("Ledger").to_string(),
                    product: d
                        .product_string()
                        .unwrap_or(model_name(d.product_id()))
                        .to_string(),
                    serial: d.serial_number().unwrap_or("").to_string(),
                })
                .collect())
        })
    }

    fn open_device(&self, path: &str) -> Result<()> {
        {
            let open = self.open.lock().unwrap();
            if open.contains_key(path) {
                return Ok(());
            }
        }
        let c_path = CString::new(path)
            .map_err(|_| KeywardError::NotFound(format!("Invalid device path: {}", path)))?;
        let device = hid::with_api(|api| {
            api.open_path(&c_path)
                .map_err(|e| KeywardError::DeviceError(format!("Failed to open {}: {}", path, e)))
        })?;
        let (state, app_name) = Self::probe_app(&device);
        info!(path, ?state, "Opened Ledger device");
        self.open.lock().unwrap().insert(
            path.to_string(),
            OpenLedger {
                device,
                state,
                app_name,
            },
        );
        Ok(())
    }

    fn close_device(&self, path: &str) -> Result<()> {
        if self.open.lock().unwrap().remove(path).is_some() {
            debug!(path, "Closed Ledger device");
        }
        Ok(())
    }

    fn device_state(&self, path: &str) -> DeviceState {
        self.open
            .lock()
            .unwrap()
            .get(path)
            .map(|d| d.state)
            .unwrap_or(DeviceState::Disconnected)
    }

    fn get_public_key(
        &self,
        path: &str,
        derivation_path: &str,
        confirm: bool,
    ) -> Result<XOnlyPublicKey> {
        let components = parse_derivation_path(derivation_path)?;
        let payload = encode_bip32_path(&components);
        self.with_ready_device(path, |device| {
            let p1 = if confirm { 0x01 } else { 0x00 };
            let apdu = build_apdu(INS_GET_PUBLIC_KEY, p1, 0x00, &payload);
            let (data, sw) = exchange(device, &apdu)?;
            if sw != SW_OK {
                return Err(map_status_word(sw));
            }
            parse_public_key_response(&data)
        })
    }

    fn sign_hash(&self, path: &str, derivation_path: &str, hash: &[u8; 32]) -> Result<[u8; 64]> {
        let components = parse_derivation_path(derivation_path)?;
        let mut payload = encode_bip32_path(&components);
        payload.extend_from_slice(hash);
        self.with_ready_device(path, |device| {
            let apdu = build_apdu(INS_SIGN_HASH, 0x00, 0x00, &payload);
            let (data, sw) = exchange(device, &apdu)?;
            if sw != SW_OK {
                return Err(map_status_word(sw));
            }
            if data.len() < 64 {
                return Err(KeywardError::SigningFailed(format!(
                    "Signature response is {} bytes",
                    data.len()
                )));
            }
            let mut signature = [0u8; 64];
            signature.copy_from_slice(&data[..64]);
            Ok(signature)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_word_mapping() {
        assert_eq!(map_status_word(SW_USER_REJECTED).kind(), "permission-denied");
        assert_eq!(map_status_word(SW_APP_NOT_OPEN).kind(), "not-available");
        assert_eq!(map_status_word(SW_CLA_NOT_SUPPORTED).kind(), "not-available");
        assert_eq!(map_status_word(SW_DEVICE_LOCKED).kind(), "pin-locked");
        assert_eq!(map_status_word(0x6f00).kind(), "device-error");
    }

    #[test]
    fn apdu_layout() {
        let apdu = build_apdu(INS_SIGN_HASH, 1, 2, &[0xaa, 0xbb]);
        assert_eq!(apdu, vec![CLA, INS_SIGN_HASH, 1, 2, 2, 0xaa, 0xbb]);
    }

    #[test]
    fn parses_uncompressed_pubkey_response() {
        let mut response = vec![65u8, 0x04];
        response.extend_from_slice(&[0x11; 32]); // x
        response.extend_from_slice(&[0x22; 32]); // y
        let key = parse_public_key_response(&response).unwrap();
        assert_eq!(key.as_bytes(), &[0x11; 32]);
    }

    #[test]
    fn parses_compressed_and_xonly_responses() {
        let mut compressed = vec![33u8, 0x02];
        compressed.extend_from_slice(&[0x33; 32]);
        assert_eq!(
            parse_public_key_response(&compressed).unwrap().as_bytes(),
            &[0x33; 32]
        );

        let mut xonly = vec![32u8];
        xonly.extend_from_slice(&[0x44; 32]);
        assert_eq!(
            parse_public_key_response(&xonly).unwrap().as_bytes(),
            &[0x44; 32]
        );
    }

    #[test]
    fn rejects_truncated_pubkey_response() {
        assert!(parse_public_key_response(&[]).is_err());
        assert!(parse_public_key_response(&[65, 0x04, 0x11]).is_err());
    }

    #[test]
    fn unopened_device_state_is_disconnected() {
        let provider = LedgerProvider::new();
        assert_eq!(provider.device_state("/nope"), DeviceState::Disconnected);
        assert!(provider.running_app("/nope").is_none());
    }

    #[test]
    fn operations_on_unopened_device_fail() {
        let provider = LedgerProvider::new();
        let err = provider
            .sign_hash("/nope", "m/44'/1237'/0'/0/0", &[0u8; 32])
            .unwrap_err();
        assert_eq!(err.kind(), "not-found");
    }
}
