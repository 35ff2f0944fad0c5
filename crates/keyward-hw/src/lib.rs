//! USB-HID hardware wallet support.
//!
//! A narrower sibling of the HSM provider interface, specialized for
//! wallets that are identified by USB device path and sign with keys
//! derived from a BIP32 path: Ledger (APDU over HID framing) and
//! Trezor (magic-framed wire protocol with protobuf-style messages).

mod hid;
pub mod ledger;
pub mod manager;
pub mod trezor;
pub mod wallet;

pub use ledger::LedgerProvider;
pub use manager::{register_default_providers, DeviceEvent, HwWalletManager};
pub use trezor::TrezorProvider;
pub use wallet::{
    encode_bip32_path, parse_derivation_path, DeviceState, HwWalletProvider, WalletDevice,
    NOSTR_DERIVATION_PATH,
};
