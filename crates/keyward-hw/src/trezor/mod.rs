//! Trezor wallet backend (Model One, Model T).
//!
//! Exchanges are multi-round-trip: a request may be answered with a
//! `ButtonRequest` that must be acknowledged with a `ButtonAck` before
//! the device sends the real response, repeated for every press the
//! device wants.

pub mod proto;
pub mod wire;

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Mutex;

use hidapi::HidDevice;
use tracing::{debug, info, warn};

use keyward_core::{KeywardError, Result, XOnlyPublicKey};

use crate::hid;
use crate::wallet::{parse_derivation_path, DeviceState, HwWalletProvider, WalletDevice};

pub const TREZOR_VENDOR_ID: u16 = 0x1209;

const PID_MODEL_ONE: u16 = 0x53c0;
const PID_MODEL_T: u16 = 0x53c1;

// message types of the device protocol
const MSG_INITIALIZE: u16 = 0;
const MSG_FAILURE: u16 = 3;
const MSG_GET_PUBLIC_KEY: u16 = 11;
const MSG_PUBLIC_KEY: u16 = 12;
const MSG_FEATURES: u16 = 17;
const MSG_BUTTON_REQUEST: u16 = 26;
const MSG_BUTTON_ACK: u16 = 27;
const MSG_SIGN_MESSAGE: u16 = 38;
const MSG_MESSAGE_SIGNATURE: u16 = 40;

const CURVE_NAME: &str = "secp256k1";
const COIN_NAME: &str = "Bitcoin";

/// Failure.code value for a user cancellation.
const FAILURE_ACTION_CANCELLED: u64 = 4;

/// Generous timeout: reads may wait on a physical button press.
const READ_TIMEOUT_MS: i32 = 30_000;

fn model_name(product_id: u16) -> &'static str {
    match product_id {
        PID_MODEL_ONE => "Trezor Model One",
        PID_MODEL_T => "Trezor Model T",
        _ => "Trezor",
    }
}

/// Turn a `Failure` payload (code field 1, message field 2) into an
/// error of the shared taxonomy.
fn map_failure(payload: &[u8]) -> KeywardError {
    let code = proto::find_varint(payload, 1).ok().flatten();
    let message = proto::find_bytes(payload, 2)
        .ok()
        .flatten()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_else(|| "Device reported failure".to_string());
    match code {
        Some(FAILURE_ACTION_CANCELLED) => KeywardError::PermissionDenied(message),
        _ => KeywardError::DeviceError(message),
    }
}

/// Encode the path components as repeated uint32 field 1.
fn encode_path(buf: &mut Vec<u8>, components: &[u32]) {
    for component in components {
        proto::encode_uint32_field(buf, 1, *component);
    }
}

/// Extract the x-only public key from a `PublicKey` response: the node
/// blob is field 1; inside it the public key is the 33-byte
/// length-delimited field.
fn parse_public_key(payload: &[u8]) -> Result<XOnlyPublicKey> {
    let node = proto::find_bytes(payload, 1)?
        .ok_or_else(|| KeywardError::DeviceError("Response carries no node".into()))?;
    for item in proto::FieldIter::new(node) {
        let item = item?;
        if let proto::FieldValue::Bytes(bytes) = item.value {
            if bytes.len() == 33 && (bytes[0] == 0x02 || bytes[0] == 0x03) {
                let x: [u8; 32] = bytes[1..].try_into().expect("slice is 32 bytes");
                return Ok(XOnlyPublicKey::new(x));
            }
        }
    }
    Err(KeywardError::DeviceError(
        "No public key in device response".into(),
    ))
}

/// Extract the 64-byte signature from a `MessageSignature` response
/// (field 2).
fn parse_signature(payload: &[u8]) -> Result<[u8; 64]> {
    let bytes = proto::find_bytes(payload, 2)?
        .ok_or_else(|| KeywardError::DeviceError("Response carries no signature".into()))?;
    if bytes.len() < 64 {
        return Err(KeywardError::SigningFailed(format!(
            "Signature is {} bytes",
            bytes.len()
        )));
    }
    let mut signature = [0u8; 64];
    signature.copy_from_slice(&bytes[..64]);
    Ok(signature)
}

/// One write + one read of the wire protocol.
fn exchange(device: &HidDevice, msg_type: u16, payload: &[u8]) -> Result<(u16, Vec<u8>)> {
    for report in wire::encode_message(msg_type, payload) {
        let mut framed = Vec::with_capacity(wire::REPORT_SIZE + 1);
        framed.push(0x00); // report id
        framed.extend_from_slice(&report);
        device
            .write(&framed)
            .map_err(|e| KeywardError::DeviceError(format!("HID write failed: {}", e)))?;
    }
    let mut reader = wire::MessageReader::new();
    loop {
        let mut report = [0u8; wire::REPORT_SIZE];
        let read = device
            .read_timeout(&mut report, READ_TIMEOUT_MS)
            .map_err(|e| KeywardError::DeviceError(format!("HID read failed: {}", e)))?;
        if read == 0 {
            return Err(KeywardError::Failed("Timed out waiting for device".into()));
        }
        if let Some(message) = reader.feed(&report[..read])? {
            return Ok(message);
        }
    }
}

/// Run an exchange and acknowledge every `ButtonRequest` until the
/// device sends something else.
fn exchange_with_buttons(
    device: &HidDevice,
    msg_type: u16,
    payload: &[u8],
) -> Result<(u16, Vec<u8>)> {
    let (mut recv_type, mut recv_payload) = exchange(device, msg_type, payload)?;
    while recv_type == MSG_BUTTON_REQUEST {
        debug!("Acknowledging button request");
        let next = exchange(device, MSG_BUTTON_ACK, &[])?;
        recv_type = next.0;
        recv_payload = next.1;
    }
    Ok((recv_type, recv_payload))
}

struct OpenTrezor {
    device: HidDevice,
    state: DeviceState,
}

/// Hardware-wallet provider for Trezor devices.
pub struct TrezorProvider {
    open: Mutex<HashMap<String, OpenTrezor>>,
}

impl TrezorProvider {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Handshake with `Initialize`; a `Features` response means the
    /// device is usable.
    fn probe(device: &HidDevice) -> DeviceState {
        match exchange(device, MSG_INITIALIZE, &[]) {
            Ok((MSG_FEATURES, _)) => DeviceState::Ready,
            Ok((MSG_FAILURE, payload)) => {
                warn!("Trezor handshake failed: {}", map_failure(&payload));
                DeviceState::Error
            }
            Ok((other, _)) => {
                warn!("Unexpected handshake response type {}", other);
                DeviceState::Error
            }
            Err(e) => {
                warn!("Trezor handshake failed: {}", e);
                DeviceState::Error
            }
        }
    }

    fn with_ready_device<T>(
        &self,
        path: &str,
        f: impl FnOnce(&HidDevice) -> Result<T>,
    ) -> Result<T> {
        let open = self.open.lock().unwrap();
        let entry = open
            .get(path)
            .ok_or_else(|| KeywardError::NotFound(format!("Device {} is not open", path)))?;
        if entry.state != DeviceState::Ready {
            return Err(KeywardError::DeviceError("Device is not ready".into()));
        }
        f(&entry.device)
    }
}

impl Default for TrezorProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl HwWalletProvider for TrezorProvider {
    fn name(&self) -> &str {
        "trezor"
    }

    fn enumerate_devices(&self) -> Result<Vec<WalletDevice>> {
        hid::with_api(|api| {
            Ok(api
                .device_list()
                .filter(|d| d.vendor_id() == TREZOR_VENDOR_ID)
                .filter(|d| d.product_id() == PID_MODEL_ONE || d.product_id() == PID_MODEL_T)
                .map(|d| WalletDevice {
                    path: d.path().to_string_lossy().into_owned(),
                    vendor_id: d.vendor_id(),
                    product_id: d.product_id(),
                    manufacturer: d.manufacturer_string().unwrap_or("SatoshiLabs").to_string(),
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
        let state = Self::probe(&device);
        info!(path, ?state, "Opened Trezor device");
        self.open
            .lock()
            .unwrap()
            .insert(path.to_string(), OpenTrezor { device, state });
        Ok(())
    }

    fn close_device(&self, path: &str) -> Result<()> {
        if self.open.lock().unwrap().remove(path).is_some() {
            debug!(path, "Closed Trezor device");
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
        let mut payload = Vec::new();
        encode_path(&mut payload, &components);
        proto::encode_string_field(&mut payload, 2, CURVE_NAME);
        if confirm {
            proto::encode_bool_field(&mut payload, 3, true);
        }
        self.with_ready_device(path, |device| {
            let (recv_type, recv) = exchange_with_buttons(device, MSG_GET_PUBLIC_KEY, &payload)?;
            match recv_type {
                MSG_PUBLIC_KEY => parse_public_key(&recv),
                MSG_FAILURE => Err(map_failure(&recv)),
                other => Err(KeywardError::DeviceError(format!(
                    "Unexpected response type {}",
                    other
                ))),
            }
        })
    }

    fn sign_hash(&self, path: &str, derivation_path: &str, hash: &[u8; 32]) -> Result<[u8; 64]> {
        let components = parse_derivation_path(derivation_path)?;
        let mut payload = Vec::new();
        encode_path(&mut payload, &components);
        proto::encode_bytes_field(&mut payload, 2, hash);
        proto::encode_string_field(&mut payload, 3, COIN_NAME);
        self.with_ready_device(path, |device| {
            let (recv_type, recv) = exchange_with_buttons(device, MSG_SIGN_MESSAGE, &payload)?;
            match recv_type {
                MSG_MESSAGE_SIGNATURE => parse_signature(&recv),
                MSG_FAILURE => Err(map_failure(&recv)),
                other => Err(KeywardError::DeviceError(format!(
                    "Unexpected response type {}",
                    other
                ))),
            }
        })
    }
}
