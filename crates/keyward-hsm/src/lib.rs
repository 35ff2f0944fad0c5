//! HSM provider abstraction and backends.
//!
//! A provider is anything that can enumerate key-holding devices, manage
//! keys on them, and sign Nostr events: an in-memory mock for tests, a
//! PKCS#11 token, or a platform keystore that derives per-identity keys
//! from a hardware-held master secret. All backends share one operation
//! contract ([`HsmProvider`]) and one error taxonomy
//! (`keyward_core::KeywardError`), so callers never branch on the
//! concrete backend.

pub mod manager;
pub mod mock;
pub mod pkcs11;
pub mod platform;
pub mod provider;

pub use manager::{register_default_providers, HsmManager};
pub use mock::MockHsmProvider;
pub use pkcs11::Pkcs11Provider;
pub use platform::{KeystoreBackend, KeystoreInfo, KeystoreStatus, PlatformKeystoreProvider};
pub use provider::{HsmProvider, HsmProviderAsync};
