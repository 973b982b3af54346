//! Signing key management
//!
//! `KeyManager` is the only place private key bytes exist. It hands out
//! `Arc<dyn Signer>` capabilities; nothing outside this module can read the
//! key back.
//!
//! # Key Files
//!
//! - One 32-byte secp256k1 secret, hex-encoded, on a single line
//! - Mode 0600 on Unix (owner read/write only)
//! - Created on first use by [`KeyManager::load_or_generate`]

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};

use crate::error::KeyError;
use crate::traits::Signer;
use crate::typed_data::TypedData;
use crate::types::{Address, Signature};

/// Offset added to the recovery id in the `v` byte
const RECOVERY_ID_OFFSET: u8 = 27;

/// Keccak-256 of `data`
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Derive the account address of a public key
fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    // Skip the 0x04 uncompressed-point tag
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&hash[12..]);
    Address::from_bytes(bytes)
}

/// Recover the signer address from a digest and a 65-byte signature
pub fn recover_address(digest: &[u8; 32], signature: &Signature) -> Result<Address, KeyError> {
    let bytes = signature.as_bytes();
    let sig = EcdsaSignature::from_slice(&bytes[..64])
        .map_err(|e| KeyError::Recovery(e.to_string()))?;
    let v = bytes[64];
    let recovery_id = RecoveryId::from_byte(v.checked_sub(RECOVERY_ID_OFFSET).unwrap_or(v))
        .ok_or_else(|| KeyError::Recovery(format!("invalid recovery byte {v}")))?;
    let key = VerifyingKey::recover_from_prehash(digest, &sig, recovery_id)
        .map_err(|e| KeyError::Recovery(e.to_string()))?;
    Ok(address_of(&key))
}

/// A secp256k1 key held in process memory
pub struct LocalSigner {
    key: SigningKey,
    address: Address,
}

impl LocalSigner {
    fn new(key: SigningKey) -> Self {
        let address = address_of(key.verifying_key());
        Self { key, address }
    }

    /// Sign a 32-byte digest directly
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<Signature, KeyError> {
        let (sig, recovery_id) = self
            .key
            .sign_prehash_recoverable(digest)
            .map_err(|e| KeyError::Signing(e.to_string()))?;

        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&sig.to_bytes());
        bytes[64] = recovery_id.to_byte() + RECOVERY_ID_OFFSET;
        Ok(Signature::from_bytes(bytes))
    }
}

impl fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for LocalSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_payload(&self, payload: &[u8]) -> Result<Signature, KeyError> {
        self.sign_digest(&keccak256(payload))
    }

    async fn sign_typed_data(&self, data: &TypedData) -> Result<Signature, KeyError> {
        self.sign_digest(&data.digest()?)
    }
}

/// Owns one keypair and hands out signing capabilities
#[derive(Debug, Clone)]
pub struct KeyManager {
    signer: Arc<LocalSigner>,
}

impl KeyManager {
    /// Generate a fresh ephemeral keypair
    pub fn generate() -> Self {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        Self {
            signer: Arc::new(LocalSigner::new(key)),
        }
    }

    /// Build from a hex secret (with or without `0x`)
    pub fn from_secret_hex(secret: &str) -> Result<Self, KeyError> {
        let secret = secret.trim();
        let digits = secret.strip_prefix("0x").unwrap_or(secret);
        let bytes = hex::decode(digits).map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        let key = SigningKey::from_slice(&bytes).map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        Ok(Self {
            signer: Arc::new(LocalSigner::new(key)),
        })
    }

    /// Load a key file
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let contents = fs::read_to_string(path).map_err(|e| KeyError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_secret_hex(&contents)
    }

    /// Load a key file, generating and saving a new key if it is missing
    pub fn load_or_generate(path: &Path) -> Result<Self, KeyError> {
        if path.exists() {
            return Self::load(path);
        }

        let manager = Self::generate();
        manager.save(path)?;
        tracing::info!(address = %manager.address(), "Generated new signing key at {:?}", path);
        Ok(manager)
    }

    /// Write the secret to `path` with owner-only permissions
    pub fn save(&self, path: &Path) -> Result<(), KeyError> {
        let io_err = |e: std::io::Error| KeyError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let secret = hex::encode(self.signer.key.to_bytes());
        fs::write(path, format!("{secret}\n")).map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
        }

        Ok(())
    }

    /// Address of the managed key
    pub fn address(&self) -> Address {
        self.signer.address
    }

    /// Signing capability for this key
    pub fn signer(&self) -> Arc<dyn Signer> {
        self.signer.clone()
    }

    /// Same capability, concretely typed
    pub fn local_signer(&self) -> Arc<LocalSigner> {
        Arc::clone(&self.signer)
    }
}
