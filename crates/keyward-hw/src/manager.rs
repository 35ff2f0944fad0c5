//! Registry of hardware-wallet providers and hotplug monitoring.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keyward_core::Result;

use crate::ledger::LedgerProvider;
use crate::trezor::TrezorProvider;
use crate::wallet::{HwWalletProvider, WalletDevice};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A change observed between two enumeration passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected(WalletDevice),
    Disconnected(String),
}

/// Compare two enumeration snapshots keyed by device path.
fn diff_snapshots(
    previous: &HashMap<String, WalletDevice>,
    current: &HashMap<String, WalletDevice>,
) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    for (path, device) in current {
        if !previous.contains_key(path) {
            events.push(DeviceEvent::Connected(device.clone()));
        }
    }
    for path in previous.keys() {
        if !current.contains_key(path) {
            events.push(DeviceEvent::Disconnected(path.clone()));
        }
    }
    events
}

/// Insertion-ordered, deduplicated set of wallet providers.
///
/// The registry lock is only held around list manipulation, never
/// across a provider operation.
pub struct HwWalletManager {
    providers: Mutex<Vec<Arc<dyn HwWalletProvider>>>,
    /// Device path to owning provider name, refreshed on enumeration.
    ownership: Mutex<HashMap<String, String>>,
    monitor: Mutex<Option<CancellationToken>>,
}

impl HwWalletManager {
    pub fn new() -> Self {
        Self {
            providers: Mutex::new(Vec::new()),
            ownership: Mutex::new(HashMap::new()),
            monitor: Mutex::new(None),
        }
    }

    /// Process-wide instance, constructed on first use.
    pub fn global() -> &'static HwWalletManager {
        static GLOBAL: OnceLock<HwWalletManager> = OnceLock::new();
        GLOBAL.get_or_init(HwWalletManager::new)
    }

    /// Register a provider. Registering the same instance twice is a
    /// no-op.
    pub fn register(&self, provider: Arc<dyn HwWalletProvider>) {
        let mut providers = self.providers.lock().unwrap();
        if providers.iter().any(|p| Arc::ptr_eq(p, &provider)) {
            debug!("Provider '{}' already registered", provider.name());
            return;
        }
        info!("Registered wallet provider '{}'", provider.name());
        providers.push(provider);
    }

    /// Remove a provider. Unregistering an unknown provider is a no-op.
    pub fn unregister(&self, provider: &Arc<dyn HwWalletProvider>) {
        let mut providers = self.providers.lock().unwrap();
        providers.retain(|p| !Arc::ptr_eq(p, provider));
    }

    pub fn providers(&self) -> Vec<Arc<dyn HwWalletProvider>> {
        self.providers.lock().unwrap().clone()
    }

    /// First registered provider with the given name.
    pub fn provider_by_name(&self, name: &str) -> Option<Arc<dyn HwWalletProvider>> {
        self.providers
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// Ask every provider for its devices. A provider that fails to
    /// enumerate is logged and skipped; the others still report.
    pub fn enumerate_all_devices(&self) -> Result<Vec<WalletDevice>> {
        let snapshot = self.providers();
        let mut devices = Vec::new();
        let mut ownership = HashMap::new();
        for provider in snapshot {
            match provider.enumerate_devices() {
                Ok(found) => {
                    for device in found {
                        ownership.insert(device.path.clone(), provider.name().to_string());
                        devices.push(device);
                    }
                }
                Err(e) => {
                    warn!("Provider '{}' failed to enumerate: {}", provider.name(), e);
                }
            }
        }
        *self.ownership.lock().unwrap() = ownership;
        Ok(devices)
    }

    /// Provider that reported the device at `path` during the most
    /// recent enumeration.
    pub fn provider_for_device(&self, path: &str) -> Option<Arc<dyn HwWalletProvider>> {
        let name = self.ownership.lock().unwrap().get(path).cloned()?;
        self.provider_by_name(&name)
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().unwrap().is_some()
    }

    /// Start polling for device arrivals and removals. Returns the
    /// event stream; `None` when a monitor is already running.
    pub fn start_monitor(self: Arc<Self>) -> Option<mpsc::UnboundedReceiver<DeviceEvent>> {
        self.start_monitor_with_interval(POLL_INTERVAL)
    }

    pub fn start_monitor_with_interval(
        self: Arc<Self>,
        interval: Duration,
    ) -> Option<mpsc::UnboundedReceiver<DeviceEvent>> {
        let mut monitor = self.monitor.lock().unwrap();
        if monitor.is_some() {
            debug!("Device monitor already running");
            return None;
        }
        let token = CancellationToken::new();
        *monitor = Some(token.clone());
        drop(monitor);

        let (tx, rx) = mpsc::unbounded_channel();
        let manager = self;
        tokio::spawn(async move {
            info!("Device monitor started");
            let mut known: HashMap<String, WalletDevice> = HashMap::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let snapshot = {
                    let manager = Arc::clone(&manager);
                    tokio::task::spawn_blocking(move || manager.enumerate_all_devices()).await
                };
                let current: HashMap<String, WalletDevice> = match snapshot {
                    Ok(Ok(devices)) => devices
                        .into_iter()
                        .map(|d| (d.path.clone(), d))
                        .collect(),
                    Ok(Err(e)) => {
                        warn!("Enumeration failed: {}", e);
                        continue;
                    }
                    Err(e) => {
                        warn!("Enumeration task failed: {}", e);
                        continue;
                    }
                };
                for event in diff_snapshots(&known, &current) {
                    if tx.send(event).is_err() {
                        // receiver dropped, nothing left to notify
                        return;
                    }
                }
                known = current;
            }
            info!("Device monitor stopped");
        });
        Some(rx)
    }

    /// Stop the monitor. A no-op when none is running.
    pub fn stop_monitor(&self) {
        if let Some(token) = self.monitor.lock().unwrap().take() {
            token.cancel();
        }
    }
}

impl Default for HwWalletManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire up the standard backends: Ledger and Trezor devices.
pub fn register_default_providers(manager: &HwWalletManager) {
    manager.register(Arc::new(LedgerProvider::new()));
    manager.register(Arc::new(TrezorProvider::new()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::DeviceState;
    use keyward_core::{KeywardError, XOnlyPublicKey};

    struct StubProvider {
        name: String,
        devices: Mutex<Vec<WalletDevice>>,
        fail: Mutex<bool>,
    }

    impl StubProvider {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                devices: Mutex::new(Vec::new()),
                fail: Mutex::new(false),
            }
        }

        fn set_devices(&self, devices: Vec<WalletDevice>) {
            *self.devices.lock().unwrap() = devices;
        }

        fn set_failing(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }
    }

    fn device(path: &str) -> WalletDevice {
        WalletDevice {
            path: path.to_string(),
            vendor_id: 0x2c97,
            product_id: 0x0001,
            manufacturer: "Stub".to_string(),
            product: "Stub Wallet".to_string(),
            serial: "0001".to_string(),
        }
    }

    impl HwWalletProvider for StubProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn enumerate_devices(&self) -> Result<Vec<WalletDevice>> {
            if *self.fail.lock().unwrap() {
                return Err(KeywardError::DeviceError("stub failure".into()));
            }
            Ok(self.devices.lock().unwrap().clone())
        }

        fn open_device(&self, _path: &str) -> Result<()> {
            Ok(())
        }

        fn close_device(&self, _path: &str) -> Result<()> {
            Ok(())
        }

        fn device_state(&self, _path: &str) -> DeviceState {
            DeviceState::Disconnected
        }

        fn get_public_key(
            &self,
            _path: &str,
            _derivation_path: &str,
            _confirm: bool,
        ) -> Result<XOnlyPublicKey> {
            Err(KeywardError::NotAvailable("stub".into()))
        }

        fn sign_hash(
            &self,
            _path: &str,
            _derivation_path: &str,
            _hash: &[u8; 32],
        ) -> Result<[u8; 64]> {
            Err(KeywardError::NotAvailable("stub".into()))
        }
    }

    #[test]
    fn registration_is_idempotent() {
        let manager = HwWalletManager::new();
        let provider: Arc<dyn HwWalletProvider> = Arc::new(StubProvider::new("stub"));
        manager.register(Arc::clone(&provider));
        manager.register(Arc::clone(&provider));
        assert_eq!(manager.providers().len(), 1);
    }

    #[test]
    fn enumeration_aggregates_and_skips_failures() {
        let manager = HwWalletManager::new();
        let healthy = Arc::new(StubProvider::new("healthy"));
        healthy.set_devices(vec![device("/dev/hid0")]);
        let broken = Arc::new(StubProvider::new("broken"));
        broken.set_failing(true);
        manager.register(healthy.clone() as Arc<dyn HwWalletProvider>);
        manager.register(broken as Arc<dyn HwWalletProvider>);

        let devices = manager.enumerate_all_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].path, "/dev/hid0");
    }

    #[test]
    fn ownership_maps_device_to_provider() {
        let manager = HwWalletManager::new();
        let stub = Arc::new(StubProvider::new("stub"));
        stub.set_devices(vec![device("/dev/hid7")]);
        manager.register(stub as Arc<dyn HwWalletProvider>);
        manager.enumerate_all_devices().unwrap();

        let owner = manager.provider_for_device("/dev/hid7").unwrap();
        assert_eq!(owner.name(), "stub");
        assert!(manager.provider_for_device("/dev/none").is_none());
    }

    #[test]
    fn snapshot_diff_reports_arrivals_and_removals() {
        let mut previous = HashMap::new();
        previous.insert("/a".to_string(), device("/a"));
        previous.insert("/b".to_string(), device("/b"));
        let mut current = HashMap::new();
        current.insert("/b".to_string(), device("/b"));
        current.insert("/c".to_string(), device("/c"));

        let events = diff_snapshots(&previous, &current);
        assert_eq!(events.len(), 2);
        assert!(events.contains(&DeviceEvent::Connected(device("/c"))));
        assert!(events.contains(&DeviceEvent::Disconnected("/a".to_string())));
    }

    #[tokio::test]
    async fn monitor_emits_events_and_stops() {
        let manager = Arc::new(HwWalletManager::new());
        let stub = Arc::new(StubProvider::new("stub"));
        manager.register(stub.clone() as Arc<dyn HwWalletProvider>);

        let mut rx = Arc::clone(&manager)
            .start_monitor_with_interval(Duration::from_millis(10))
            .unwrap();
        assert!(manager.is_monitoring());
        // a second start is refused while the first is running
        assert!(Arc::clone(&manager)
            .start_monitor_with_interval(Duration::from_millis(10))
            .is_none());

        stub.set_devices(vec![device("/dev/hid1")]);
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("monitor produced no event")
            .unwrap();
        assert_eq!(event, DeviceEvent::Connected(device("/dev/hid1")));

        stub.set_devices(Vec::new());
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("monitor produced no event")
            .unwrap();
        assert_eq!(event, DeviceEvent::Disconnected("/dev/hid1".to_string()));

        manager.stop_monitor();
        assert!(!manager.is_monitoring());
    }
}
