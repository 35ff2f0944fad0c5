//! Registry of HSM providers.

use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, info};

use crate::mock::MockHsmProvider;
use crate::pkcs11::Pkcs11Provider;
use crate::platform::PlatformKeystoreProvider;
use crate::provider::HsmProvider;

/// Insertion-ordered, deduplicated set of providers.
///
/// The registry lock is only held around list manipulation, never
/// across a provider operation.
pub struct HsmManager {
    providers: Mutex<Vec<Arc<dyn HsmProvider>>>,
}

impl HsmManager {
    pub fn new() -> Self {
        Self {
            providers: Mutex::new(Vec::new()),
        }
    }

    /// Process-wide instance, constructed on first use.
    pub fn global() -> &'static HsmManager {
        static GLOBAL: OnceLock<HsmManager> = OnceLock::new();
        GLOBAL.get_or_init(HsmManager::new)
    }

    /// Register a provider. Registering the same instance twice is a
    /// no-op.
    pub fn register(&self, provider: Arc<dyn HsmProvider>) {
        let mut providers = self.providers.lock().unwrap();
        if providers.iter().any(|p| Arc::ptr_eq(p, &provider)) {
            debug!("Provider '{}' already registered", provider.name());
            return;
        }
        info!("Registered HSM provider '{}'", provider.name());
        providers.push(provider);
    }

    /// Remove a provider. Unregistering an unknown provider is a no-op.
    pub fn unregister(&self, provider: &Arc<dyn HsmProvider>) {
        let mut providers = self.providers.lock().unwrap();
        providers.retain(|p| !Arc::ptr_eq(p, provider));
    }

    pub fn providers(&self) -> Vec<Arc<dyn HsmProvider>> {
        self.providers.lock().unwrap().clone()
    }

    /// Providers whose `is_available` is true right now. Availability
    /// is queried outside the registry lock.
    pub fn available_providers(&self) -> Vec<Arc<dyn HsmProvider>> {
        let snapshot = self.providers();
        snapshot.into_iter().filter(|p| p.is_available()).collect()
    }

    /// First registered provider with the given name.
    pub fn provider_by_name(&self, name: &str) -> Option<Arc<dyn HsmProvider>> {
        self.providers
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }
}

impl Default for HsmManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire up the standard backends: PKCS#11 tokens, the platform
/// keystore, and the in-memory mock.
pub fn register_default_providers(manager: &HsmManager) {
    manager.register(Arc::new(Pkcs11Provider::new()));
    manager.register(Arc::new(PlatformKeystoreProvider::new()));
    manager.register(Arc::new(MockHsmProvider::new()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHsmProvider;

    #[test]
    fn registration_is_idempotent() {
        let manager = HsmManager::new();
        let provider: Arc<dyn HsmProvider> = Arc::new(MockHsmProvider::new());
        manager.register(Arc::clone(&provider));
        manager.register(Arc::clone(&provider));
        assert_eq!(manager.providers().len(), 1);
    }

    #[test]
    fn unregister_unknown_is_noop() {
        let manager = HsmManager::new();
        let registered: Arc<dyn HsmProvider> = Arc::new(MockHsmProvider::new());
        let stranger: Arc<dyn HsmProvider> = Arc::new(MockHsmProvider::new());
        manager.register(Arc::clone(&registered));
        manager.unregister(&stranger);
        assert_eq!(manager.providers().len(), 1);
        manager.unregister(&registered);
        assert!(manager.providers().is_empty());
    }

    #[test]
    fn lookup_by_name_returns_first_match() {
        let manager = HsmManager::new();
        let a: Arc<dyn HsmProvider> = Arc::new(MockHsmProvider::new());
        let b: Arc<dyn HsmProvider> = Arc::new(MockHsmProvider::new());
        manager.register(Arc::clone(&a));
        manager.register(Arc::clone(&b));
        let found = manager.provider_by_name("mock").unwrap();
        assert!(Arc::ptr_eq(&found, &a));
        assert!(manager.provider_by_name("missing").is_none());
    }

    #[test]
    fn insertion_order_is_preserved() {
        let manager = HsmManager::new();
        let a: Arc<dyn HsmProvider> = Arc::new(MockHsmProvider::new());
        let b: Arc<dyn HsmProvider> = Arc::new(MockHsmProvider::new());
        manager.register(Arc::clone(&a));
        manager.register(Arc::clone(&b));
        let listed = manager.providers();
        assert!(Arc::ptr_eq(&listed[0], &a));
        assert!(Arc::ptr_eq(&listed[1], &b));
    }

    #[test]
    fn available_filters_on_availability() {
        let manager = HsmManager::new();
        let mock: Arc<dyn HsmProvider> = Arc::new(MockHsmProvider::new());
        manager.register(Arc::clone(&mock));
        // the mock is always available
        assert_eq!(manager.available_providers().len(), 1);
    }
}
