//! Key bundle generation, fingerprints, and on-disk persistence.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as ExchangePublicKey, StaticSecret};

use drawlatch_core::{encode_hex, write_text_atomic, write_text_atomic_with_mode};

const SIGNING_KEY_FILE: &str = "signing.key";
const SIGNING_PUB_FILE: &str = "signing.pub";
const EXCHANGE_KEY_FILE: &str = "exchange.key";
const EXCHANGE_PUB_FILE: &str = "exchange.pub";

const PRIVATE_FILE_MODE: u32 = 0o600;
const KEY_DIR_MODE: u32 = 0o700;

/// Number of fingerprint bytes taken from the digest; printed as 32 hex chars.
const FINGERPRINT_BYTES: usize = 16;

/// A caller or server identity: a long-lived Ed25519 signing keypair plus an
/// X25519 exchange keypair.
#[derive(Clone)]
pub struct KeyBundle {
    pub signing: SigningKey,
    pub exchange: StaticSecret,
}

impl KeyBundle {
    pub fn public(&self) -> PublicKeyBundle {
        PublicKeyBundle {
            signing: self.signing.verifying_key(),
            exchange: ExchangePublicKey::from(&self.exchange),
        }
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public())
    }
}

impl PartialEq for KeyBundle {
    fn eq(&self, other: &Self) -> bool {
        self.signing.to_bytes() == other.signing.to_bytes()
            && self.exchange.to_bytes() == other.exchange.to_bytes()
    }
}

impl std::fmt::Debug for KeyBundle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("KeyBundle")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// The exported public halves of a [`KeyBundle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyBundle {
    pub signing: VerifyingKey,
    pub exchange: ExchangePublicKey,
}

#[derive(Serialize, Deserialize)]
struct PublicKeyBundleFile {
    signing: String,
    exchange: String,
}

/// Generates a fresh identity from the OS entropy source.
pub fn generate_key_bundle() -> KeyBundle {
    KeyBundle {
        signing: SigningKey::generate(&mut OsRng),
        exchange: StaticSecret::random_from_rng(OsRng),
    }
}

/// Deterministic short hash of the concatenated public keys, printable hex.
/// Changes iff either public key changes.
pub fn fingerprint(bundle: &PublicKeyBundle) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bundle.signing.as_bytes());
    hasher.update(bundle.exchange.as_bytes());
    let digest = hasher.finalize();
    encode_hex(&digest[..FINGERPRINT_BYTES])
}

/// Persists both keypairs into `dir` (created with mode 0700); private key
/// files are written with mode 0600.
pub fn save_key_bundle(bundle: &KeyBundle, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(KEY_DIR_MODE))
            .with_context(|| format!("failed to set mode on {}", dir.display()))?;
    }

    write_key_file(&dir.join(SIGNING_KEY_FILE), &bundle.signing.to_bytes())?;
    write_key_file(&dir.join(EXCHANGE_KEY_FILE), &bundle.exchange.to_bytes())?;
    write_key_file(
        &dir.join(SIGNING_PUB_FILE),
        bundle.signing.verifying_key().as_bytes(),
    )?;
    write_key_file(
        &dir.join(EXCHANGE_PUB_FILE),
        ExchangePublicKey::from(&bundle.exchange).as_bytes(),
    )?;
    Ok(())
}

/// Loads a bundle previously written by [`save_key_bundle`].
pub fn load_key_bundle(dir: &Path) -> Result<KeyBundle> {
    let signing_bytes = read_key_file(&dir.join(SIGNING_KEY_FILE))?;
    let exchange_bytes = read_key_file(&dir.join(EXCHANGE_KEY_FILE))?;
    Ok(KeyBundle {
        signing: SigningKey::from_bytes(&signing_bytes),
        exchange: StaticSecret::from(exchange_bytes),
    })
}

/// Writes a peer's public bundle into a peers directory as `<name>.pub`.
pub fn save_peer_public_bundle(bundle: &PublicKeyBundle, dir: &Path, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("peer name cannot be empty");
    }
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let file = PublicKeyBundleFile {
        signing: BASE64.encode(bundle.signing.as_bytes()),
        exchange: BASE64.encode(bundle.exchange.as_bytes()),
    };
    let mut payload =
        serde_json::to_string_pretty(&file).context("failed to encode public key bundle")?;
    payload.push('\n');
    write_text_atomic(&dir.join(format!("{}.pub", name.trim())), &payload)
}

/// Loads every `*.pub` bundle in a peers directory, sorted by file name.
pub fn load_peer_bundles(dir: &Path) -> Result<Vec<(String, PublicKeyBundle)>> {
    let mut bundles = Vec::new();
    if !dir.exists() {
        return Ok(bundles);
    }
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("failed to list {}", dir.display()))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let Some(name) = path
            .file_name()
            .and_then(|value| value.to_str())
            .and_then(|value| value.strip_suffix(".pub"))
        else {
            continue;
        };
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let file: PublicKeyBundleFile = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        let signing_bytes = decode_key_b64("signing public key", &file.signing)?;
        let exchange_bytes = decode_key_b64("exchange public key", &file.exchange)?;
        let signing = VerifyingKey::from_bytes(&signing_bytes)
            .with_context(|| format!("invalid signing public key in {}", path.display()))?;
        bundles.push((
            name.to_string(),
            PublicKeyBundle {
                signing,
                exchange: ExchangePublicKey::from(exchange_bytes),
            },
        ));
    }
    Ok(bundles)
}

/// Fingerprints of every peer bundle in a directory.
pub fn load_peer_fingerprints(dir: &Path) -> Result<BTreeSet<String>> {
    Ok(load_peer_bundles(dir)?
        .iter()
        .map(|(_, bundle)| fingerprint(bundle))
        .collect())
}

fn write_key_file(path: &Path, bytes: &[u8; 32]) -> Result<()> {
    let mut payload = BASE64.encode(bytes);
    payload.push('\n');
    write_text_atomic_with_mode(path, &payload, PRIVATE_FILE_MODE)
        .with_context(|| format!("failed to write {}", path.display()))
}

fn read_key_file(path: &Path) -> Result<[u8; 32]> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    decode_key_b64(&path.display().to_string(), &raw)
}

fn decode_key_b64(label: &str, raw: &str) -> Result<[u8; 32]> {
    let decoded = BASE64
        .decode(raw.trim())
        .with_context(|| format!("failed to decode base64 in {}", label))?;
    let decoded_len = decoded.len();
    decoded
        .try_into()
        .map_err(|_| anyhow::anyhow!("{} decoded to {} bytes (expected 32)", label, decoded_len))
}
