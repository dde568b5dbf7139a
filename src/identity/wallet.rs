//! Ledger keypair generation, persistence and signing.
//!
//! Keys are secp256k1. An address is the Keccak-256 hash of the scheme flag
//! followed by the compressed public key. Signatures are serialized as
//! base64(flag || r||s || compressed public key) so a verifier can recover
//! the signer address without a key registry.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Signature scheme flag for secp256k1.
pub const SECP256K1_FLAG: u8 = 0x01;

const COMPRESSED_PUBKEY_LEN: usize = 33;
const SIGNATURE_LEN: usize = 64;
const SERIALIZED_SIGNATURE_LEN: usize = 1 + SIGNATURE_LEN + COMPRESSED_PUBKEY_LEN;

/// What a signature is being produced for. Mixed into the digest so a
/// transaction signature can never be replayed as a message signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Transaction,
    PersonalMessage,
}

impl Intent {
    fn prefix(self) -> [u8; 3] {
        match self {
            Self::Transaction => [0, 0, 0],
            Self::PersonalMessage => [3, 0, 0],
        }
    }
}

/// Key file stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletFile {
    /// Hex-encoded private key with 0x prefix.
    #[serde(rename = "privateKey")]
    pub private_key: String,
    /// ISO 8601 creation timestamp.
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

/// An in-memory signing identity.
#[derive(Clone)]
pub struct Wallet {
    signing_key: SigningKey,
    /// Ledger address derived from the public key.
    pub address: String,
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Wallet {
    /// Generate a fresh random key held only in memory.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Parse a hex private key, with or without `0x`.
    pub fn from_hex(private_key: &str) -> Result<Self> {
        let key_hex = private_key.trim();
        let key_hex = key_hex.strip_prefix("0x").unwrap_or(key_hex);
        let key_bytes = hex::decode(key_hex).context("Invalid hex in private key")?;
        let signing_key = SigningKey::from_slice(&key_bytes).context("Invalid private key bytes")?;
        Ok(Self::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = address_from_verifying_key(signing_key.verifying_key());
        Self {
            signing_key,
            address,
        }
    }

    /// Load an existing key file or generate a new one at the given path.
    pub fn load_or_create(wallet_path: &Path) -> Result<Self> {
        if wallet_path.exists() {
            Self::load(wallet_path)
        } else {
            let wallet = Self::generate();
            wallet.save(wallet_path)?;
            info!("Generated new wallet: {}", wallet.address);
            Ok(wallet)
        }
    }

    /// Load a key file from disk.
    pub fn load(wallet_path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(wallet_path).context("Failed to read wallet file")?;
        let file: WalletFile =
            serde_json::from_str(&contents).context("Failed to parse wallet JSON")?;
        let wallet = Self::from_hex(&file.private_key)?;
        info!("Loaded wallet: {}", wallet.address);
        Ok(wallet)
    }

    /// Persist the key with owner-only permissions.
    pub fn save(&self, wallet_path: &Path) -> Result<PathBuf> {
        let file = WalletFile {
            private_key: self.private_key_hex(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        if let Some(parent) = wallet_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(wallet_path, &json).context("Failed to write wallet file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(wallet_path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(wallet_path.to_path_buf())
    }

    /// Hex-encoded private key with 0x prefix.
    pub fn private_key_hex(&self) -> String {
        format!("0x{}", hex::encode(self.signing_key.to_bytes()))
    }

    /// Sign transaction bytes.
    pub fn sign_transaction(&self, tx_bytes: &[u8]) -> Result<String> {
        self.sign(Intent::Transaction, tx_bytes)
    }

    /// Sign an arbitrary authorization message.
    pub fn sign_message(&self, message: &[u8]) -> Result<String> {
        self.sign(Intent::PersonalMessage, message)
    }

    fn sign(&self, intent: Intent, payload: &[u8]) -> Result<String> {
        let digest = intent_digest(intent, payload);
        let signature: Signature = self
            .signing_key
            .sign_prehash(&digest)
            .context("Signing failed")?;

        let pubkey = self.signing_key.verifying_key().to_encoded_point(true);

        let mut serialized = Vec::with_capacity(SERIALIZED_SIGNATURE_LEN);
        serialized.push(SECP256K1_FLAG);
        serialized.extend_from_slice(&signature.to_bytes());
        serialized.extend_from_slice(pubkey.as_bytes());

        Ok(BASE64.encode(serialized))
    }
}

/// Verify a serialized signature over `payload` and return the signer address.
pub fn verify_signature(intent: Intent, payload: &[u8], serialized: &str) -> Result<String> {
    let raw = BASE64
        .decode(serialized.trim())
        .context("Signature is not valid base64")?;
    if raw.len() != SERIALIZED_SIGNATURE_LEN {
        bail!(
            "Signature has {} bytes, expected {}",
            raw.len(),
            SERIALIZED_SIGNATURE_LEN
        );
    }
    if raw[0] != SECP256K1_FLAG {
        bail!("Unsupported signature scheme flag {:#04x}", raw[0]);
    }

    let signature =
        Signature::from_slice(&raw[1..1 + SIGNATURE_LEN]).context("Malformed signature")?;
    let verifying_key = VerifyingKey::from_sec1_bytes(&raw[1 + SIGNATURE_LEN..])
        .context("Malformed public key in signature")?;

    verifying_key
        .verify_prehash(&intent_digest(intent, payload), &signature)
        .context("Signature does not match payload")?;

    Ok(address_from_verifying_key(&verifying_key))
}

fn intent_digest(intent: Intent, payload: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(intent.prefix());
    hasher.update(payload);
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

fn address_from_verifying_key(key: &VerifyingKey) -> String {
    let compressed = key.to_encoded_point(true);
    let mut hasher = Keccak256::new();
    hasher.update([SECP256K1_FLAG]);
    hasher.update(compressed.as_bytes());
    format!("0x{}", hex::encode(hasher.finalize()))
}

/// Lowercase an address and make sure it carries the `0x` prefix.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim().to_ascii_lowercase();
    if trimmed.starts_with("0x") {
        trimmed
    } else {
        format!("0x{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip_keeps_address() {
        let wallet = Wallet::generate();
        let again = Wallet::from_hex(&wallet.private_key_hex()).unwrap();
        assert_eq!(wallet.address, again.address);
        assert!(wallet.address.starts_with("0x"));
        assert_eq!(wallet.address.len(), 66);
    }

    #[test]
    fn transaction_signature_recovers_signer() {
        let wallet = Wallet::generate();
        let sig = wallet.sign_transaction(b"tx-bytes").unwrap();
        let signer = verify_signature(Intent::Transaction, b"tx-bytes", &sig).unwrap();
        assert_eq!(signer, wallet.address);
    }

    #[test]
    fn signature_over_other_bytes_is_rejected() {
        let wallet = Wallet::generate();
        let sig = wallet.sign_transaction(b"tx-bytes").unwrap();
        assert!(verify_signature(Intent::Transaction, b"tx-bytez", &sig).is_err());
    }

    #[test]
    fn message_signature_is_not_a_transaction_signature() {
        let wallet = Wallet::generate();
        let sig = wallet.sign_message(b"payload").unwrap();
        assert!(verify_signature(Intent::PersonalMessage, b"payload", &sig).is_ok());
        assert!(verify_signature(Intent::Transaction, b"payload", &sig).is_err());
    }

    #[test]
    fn key_file_is_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("collector.json");
        let created = Wallet::load_or_create(&path).unwrap();
        let loaded = Wallet::load_or_create(&path).unwrap();
        assert_eq!(created.address, loaded.address);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn rejects_garbage_key() {
        assert!(Wallet::from_hex("0xnothex").is_err());
        assert!(Wallet::from_hex("0x0000").is_err());
    }

    #[test]
    fn normalizes_addresses() {
        assert_eq!(normalize_address(" ABcd "), "0xabcd");
        assert_eq!(normalize_address("0xABCD"), "0xabcd");
    }
}
