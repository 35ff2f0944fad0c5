//! Shared HID context.
//!
//! hidapi allows one live context per process, and both wallet
//! backends need it, so access goes through a process-wide handle.
//! Enumeration data is refreshed on every use.

use std::sync::Mutex;

use hidapi::HidApi;

use keyward_core::{KeywardError, Result};

static API: Mutex<Option<HidApi>> = Mutex::new(None);

pub fn with_api<T>(f: impl FnOnce(&mut HidApi) -> Result<T>) -> Result<T> {
    let mut guard = API.lock().unwrap();
    if guard.is_none() {
        let api = HidApi::new().map_err(|e| {
            KeywardError::NotAvailable(format!("HID subsystem unavailable: {}", e))
        })?;
        *guard = Some(api);
    }
    let api = guard.as_mut().expect("initialized above");
    if let Err(e) = api.refresh_devices() {
        return Err(KeywardError::DeviceError(format!(
            "HID enumeration failed: {}",
            e
        )));
    }
    f(api)
}
