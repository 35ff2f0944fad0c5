//! Keyward CLI - command-line access to hardware-backed Nostr signing
//!
//! Talks to the same provider registries the library exposes: HSM
//! backends (PKCS#11 tokens, the platform keystore) and USB hardware
//! wallets (Ledger, Trezor).

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use keyward_core::SecretBuffer;
use keyward_hsm::{HsmManager, HsmProvider, PlatformKeystoreProvider};
use keyward_hw::{HwWalletManager, HwWalletProvider, NOSTR_DERIVATION_PATH};

#[derive(Parser)]
#[command(name = "keyward")]
#[command(about = "Hardware-backed Nostr signing key management", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List devices across every registered backend
    Devices,

    /// List keys on an HSM device
    Keys {
        /// Provider name (pkcs11, platform, ...)
        #[arg(long, default_value = "pkcs11")]
        provider: String,

        /// Device slot id
        #[arg(short, long, default_value_t = 0)]
        slot: u64,

        /// User PIN, when the token requires one
        #[arg(long)]
        pin: Option<String>,
    },

    /// Generate a new signing key on a device
    Generate {
        #[arg(long, default_value = "pkcs11")]
        provider: String,

        #[arg(short, long, default_value_t = 0)]
        slot: u64,

        /// Human-readable key label
        #[arg(short, long)]
        label: String,

        #[arg(long)]
        pin: Option<String>,
    },

    /// Import an existing secret key (hex) onto a device
    Import {
        #[arg(long, default_value = "pkcs11")]
        provider: String,

        #[arg(short, long, default_value_t = 0)]
        slot: u64,

        /// Secret key, 64 hex characters
        #[arg(long)]
        secret: String,

        #[arg(short, long)]
        label: String,

        #[arg(long)]
        pin: Option<String>,
    },

    /// Delete a key from a device
    Delete {
        #[arg(long, default_value = "pkcs11")]
        provider: String,

        #[arg(short, long, default_value_t = 0)]
        slot: u64,

        /// Key id as printed by `keys`
        #[arg(short, long)]
        key_id: String,

        #[arg(long)]
        pin: Option<String>,
    },

    /// Sign an event with a device-held key
    Sign {
        #[arg(long, default_value = "pkcs11")]
        provider: String,

        #[arg(short, long, default_value_t = 0)]
        slot: u64,

        #[arg(short, long)]
        key_id: String,

        /// Event JSON file, or '-' to read stdin
        #[arg(short, long)]
        event: PathBuf,

        #[arg(long)]
        pin: Option<String>,
    },

    /// Platform keystore management
    #[command(subcommand)]
    Keystore(KeystoreCommands),

    /// Hardware wallet commands
    #[command(subcommand)]
    Wallet(WalletCommands),
}

#[derive(Subcommand)]
enum KeystoreCommands {
    /// Show the detected backend and its status
    Info,

    /// Create the master key in the OS credential store
    Init,

    /// Delete the master key from the OS credential store
    Delete,
}

#[derive(Subcommand)]
enum WalletCommands {
    /// List connected hardware wallets
    List,

    /// Read the public key from a wallet
    Pubkey {
        /// Device path as printed by `wallet list`
        #[arg(short, long)]
        path: String,

        /// BIP32 derivation path
        #[arg(short, long, default_value = NOSTR_DERIVATION_PATH)]
        derivation: String,

        /// Ask the device to display the key for confirmation
        #[arg(long)]
        confirm: bool,
    },

    /// Sign a 32-byte hash (hex) with a wallet key
    Sign {
        #[arg(short, long)]
        path: String,

        #[arg(short, long, default_value = NOSTR_DERIVATION_PATH)]
        derivation: String,

        /// Hash to sign, 64 hex characters
        #[arg(long)]
        hash: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => handle_devices(),
        Commands::Keys {
            provider,
            slot,
            pin,
        } => {
            let provider = hsm_provider(&provider, slot, pin.as_deref())?;
            let keys = provider.list_keys(slot)?;
            if keys.is_empty() {
                println!("No keys on slot {}", slot);
            }
            for key in keys {
                println!("{}  {}  {}", key.key_id, key.npub, key.label);
            }
            Ok(())
        }
        Commands::Generate {
            provider,
            slot,
            label,
            pin,
        } => {
            let provider = hsm_provider(&provider, slot, pin.as_deref())?;
            let key = provider.generate_key(slot, &label)?;
            println!("Generated key {} ({})", key.key_id, key.npub);
            Ok(())
        }
        Commands::Import {
            provider,
            slot,
            secret,
            label,
            pin,
        } => {
            let provider = hsm_provider(&provider, slot, pin.as_deref())?;
            let secret = SecretBuffer::from_hex(&secret)?;
            let key = provider.import_key(slot, secret, &label)?;
            println!("Imported key {} ({})", key.key_id, key.npub);
            Ok(())
        }
        Commands::Delete {
            provider,
            slot,
            key_id,
            pin,
        } => {
            let provider = hsm_provider(&provider, slot, pin.as_deref())?;
            provider.delete_key(slot, &key_id)?;
            println!("Deleted key {}", key_id);
            Ok(())
        }
        Commands::Sign {
            provider,
            slot,
            key_id,
            event,
            pin,
        } => {
            let provider = hsm_provider(&provider, slot, pin.as_deref())?;
            let event_json = read_event(&event)?;
            let signed = provider.sign_event(slot, &key_id, &event_json)?;
            println!("{}", signed);
            Ok(())
        }
        Commands::Keystore(cmd) => handle_keystore_command(cmd),
        Commands::Wallet(cmd) => handle_wallet_command(cmd),
    }
}

/// Look up a provider by name, initialize it, and log in when a PIN
/// was given.
fn hsm_provider(name: &str, slot: u64, pin: Option<&str>) -> Result<Arc<dyn HsmProvider>> {
    let manager = HsmManager::global();
    if manager.providers().is_empty() {
        keyward_hsm::register_default_providers(manager);
    }
    let provider = manager
        .provider_by_name(name)
        .with_context(|| format!("No provider named '{}'", name))?;
    provider.init()?;
    if let Some(pin) = pin {
        provider.login(slot, pin)?;
    }
    Ok(provider)
}

fn handle_devices() -> Result<()> {
    let hsm = HsmManager::global();
    if hsm.providers().is_empty() {
        keyward_hsm::register_default_providers(hsm);
    }
    for provider in hsm.providers() {
        if provider.init().is_err() {
            continue;
        }
        match provider.detect_devices() {
            Ok(devices) if devices.is_empty() => {
                println!("{}: no devices", provider.name());
            }
            Ok(devices) => {
                for device in devices {
                    println!(
                        "{}: slot {}  {}  ({} {})",
                        provider.name(),
                        device.slot_id,
                        device.label,
                        device.manufacturer,
                        device.model,
                    );
                }
            }
            Err(e) => {
                println!("{}: {}", provider.name(), e);
            }
        }
    }

    let wallets = HwWalletManager::global();
    if wallets.providers().is_empty() {
        keyward_hw::register_default_providers(wallets);
    }
    for device in wallets.enumerate_all_devices()? {
        println!(
            "wallet: {}  {} {}  ({})",
            device.path, device.manufacturer, device.product, device.serial,
        );
    }
    Ok(())
}

fn handle_keystore_command(cmd: KeystoreCommands) -> Result<()> {
    let keystore = PlatformKeystoreProvider::new();
    match cmd {
        KeystoreCommands::Info => {
            let info = keystore.keystore_info();
            println!("Backend: {}", info.backend.as_str());
            println!("Status:  {:?}", info.status);
            println!("{}", info.description);
            println!(
                "Master key present: {}",
                if keystore.has_master_key()? { "yes" } else { "no" }
            );
        }
        KeystoreCommands::Init => {
            keystore.create_master_key()?;
            println!("Master key created");
        }
        KeystoreCommands::Delete => {
            keystore.delete_master_key()?;
            println!("Master key deleted");
        }
    }
    Ok(())
}

fn handle_wallet_command(cmd: WalletCommands) -> Result<()> {
    let manager = HwWalletManager::global();
    if manager.providers().is_empty() {
        keyward_hw::register_default_providers(manager);
    }
    match cmd {
        WalletCommands::List => {
            let devices = manager.enumerate_all_devices()?;
            if devices.is_empty() {
                println!("No hardware wallets connected");
            }
            for device in devices {
                println!(
                    "{}  {} {}  ({})",
                    device.path, device.manufacturer, device.product, device.serial,
                );
            }
        }
        WalletCommands::Pubkey {
            path,
            derivation,
            confirm,
        } => {
            manager.enumerate_all_devices()?;
            let provider = manager
                .provider_for_device(&path)
                .with_context(|| format!("No wallet at '{}'", path))?;
            provider.open_device(&path)?;
            let result = provider.get_public_key(&path, &derivation, confirm);
            provider.close_device(&path)?;
            let pubkey = result?;
            println!("{}", pubkey.to_npub()?);
            println!("{}", pubkey.to_hex());
        }
        WalletCommands::Sign {
            path,
            derivation,
            hash,
        } => {
            let hash_bytes = hex::decode(&hash).context("Hash is not valid hex")?;
            let hash_bytes: [u8; 32] = hash_bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("Hash must be exactly 32 bytes"))?;
            manager.enumerate_all_devices()?;
            let provider = manager
                .provider_for_device(&path)
                .with_context(|| format!("No wallet at '{}'", path))?;
            provider.open_device(&path)?;
            let result = provider.sign_hash(&path, &derivation, &hash_bytes);
            provider.close_device(&path)?;
            println!("{}", hex::encode(result?));
        }
    }
    Ok(())
}

fn read_event(path: &PathBuf) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read event from stdin")?;
        if buf.trim().is_empty() {
            bail!("Empty event on stdin");
        }
        Ok(buf)
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event file {}", path.display()))
    }
}
