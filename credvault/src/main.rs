//! credvault - per-system keys and an encrypted credential store
//!
//! Commands:
//! - keygen <SYSTEM>: generate a key (creates the registry on first run)
//! - rotate <SYSTEM>: replace an existing registry's key for SYSTEM
//! - keys: list registered systems with key fingerprints
//! - encrypt <SYSTEM> NAME=VALUE...: replace the credential store
//! - set <SYSTEM> NAME=VALUE...: add or update entries, keeping the rest
//! - decrypt <SYSTEM>: print the decrypted credentials

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use credvault::config::VaultConfig;
use credvault::store::PlainCredentials;
use credvault::{KeyRegistryStore, SecurityKey};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "credvault")]
#[command(about = "Per-system encryption keys and an encrypted credential store")]
#[command(version)]
#[command(after_help = r#"FILES:
    security_keys.json   system name -> base64 key
    credentials.json     credential name -> encrypted token

LIMITATIONS:
    Rotating a key does not re-encrypt the credential store. Re-run
    `encrypt` or `set` with the new key, or the old entries stay sealed
    under the superseded key."#)]
struct Cli {
    /// JSON config file naming keysPath and credentialsPath
    #[arg(long, env = "CREDVAULT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory holding security_keys.json and credentials.json
    #[arg(long, env = "CREDVAULT_DIR", default_value = ".", global = true)]
    dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a key for a system, creating the registry if needed
    Keygen {
        /// System name (e.g., github)
        system: String,
    },

    /// Replace the key for a system in an existing registry
    Rotate {
        /// System name
        system: String,
    },

    /// List registered systems and key fingerprints
    Keys,

    /// Encrypt credentials, replacing the whole store
    Encrypt {
        /// System whose key seals the store
        system: String,
        /// Credentials as NAME=VALUE
        #[arg(required = true, value_parser = parse_credential)]
        credentials: Vec<(String, String)>,
    },

    /// Add or update credentials, keeping entries already in the store
    Set {
        /// System whose key seals the store
        system: String,
        /// Credentials as NAME=VALUE
        #[arg(required = true, value_parser = parse_credential)]
        credentials: Vec<(String, String)>,
    },

    /// Decrypt and print the credential store
    Decrypt {
        /// System whose key sealed the store
        system: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => VaultConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => VaultConfig::in_dir(&cli.dir),
    };
    let registry_store = config.key_registry();
    let credential_store = config.credential_store();

    match cli.command {
        Commands::Keygen { system } => {
            let registry = registry_store.install_key(&system)?;
            let key = registry.require(&system)?;
            println!("{system}: {}", key.fingerprint());
        }
        Commands::Rotate { system } => {
            let registry = match registry_store.rotate_key(&system) {
                Err(err) if err.is_not_found() => {
                    bail!("no key registry at {}; run `credvault keygen {system}` first", registry_store.path().display())
                }
                other => other?,
            };
            let key = registry.require(&system)?;
            println!("{system}: {}", key.fingerprint());
            eprintln!("note: credentials sealed with the previous key were not re-encrypted");
        }
        Commands::Keys => {
            let registry = registry_store.load_or_default()?;
            if registry.is_empty() {
                println!("No keys registered");
            }
            for (system, key) in registry.iter() {
                println!("{system}\t{}", key.fingerprint());
            }
        }
        Commands::Encrypt { system, credentials } => {
            let key = system_key(&registry_store, &system)?;
            let plain: PlainCredentials = credentials.into_iter().collect();
            let existing = match credential_store.load() {
                Err(err) if err.is_not_found() => None,
                other => Some(other?),
            };
            let encrypted = credential_store.encrypt_all(&plain, &key, existing)?;
            println!("Stored {} credential(s) in {}", encrypted.len(), credential_store.path().display());
        }
        Commands::Set { system, credentials } => {
            let key = system_key(&registry_store, &system)?;
            let plain = credential_store
                .update(&key, credentials.into_iter().collect())
                .context("existing credentials are not readable with this key")?;
            println!("Stored {} credential(s) in {}", plain.len(), credential_store.path().display());
        }
        Commands::Decrypt { system, json } => {
            let key = system_key(&registry_store, &system)?;
            let plain = credential_store
                .decrypt_all(&key)
                .with_context(|| format!("decrypting {}", credential_store.path().display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plain)?);
            } else {
                for (name, value) in &plain {
                    println!("{name}={value}");
                }
            }
        }
    }

    Ok(())
}

fn system_key(registry_store: &KeyRegistryStore, system: &str) -> Result<SecurityKey> {
    let registry = registry_store
        .load()
        .with_context(|| format!("loading key registry {}", registry_store.path().display()))?;
    Ok(registry.require(system)?.clone())
}

fn parse_credential(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got {arg:?}")),
    }
}
