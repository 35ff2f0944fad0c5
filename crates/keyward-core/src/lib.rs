//! Core types and cryptographic primitives for Keyward.
//!
//! This crate defines the pieces shared by every key-custody backend:
//! the error taxonomy, the `DeviceInfo`/`KeyInfo` value types, a
//! zeroize-on-drop secret buffer, secp256k1/BIP340 key helpers, and the
//! Nostr event model with canonical id computation.

pub mod error;
pub mod event;
pub mod keys;
pub mod secret;
pub mod types;

pub use error::{KeywardError, Result};
pub use event::{Event, UnsignedEvent};
pub use keys::XOnlyPublicKey;
pub use secret::SecretBuffer;
pub use types::{DeviceInfo, KeyInfo, KeyType};
