//! Encrypted Master Secret Vault
//!
//! Stores the wallet master secret at rest using:
//! - AES-256-GCM for authenticated encryption
//! - Argon2id for key derivation from the unlock credential
//! - Random salts and nonces so repeated seals never collide

#![allow(deprecated)] // GenericArray::from_slice deprecated in generic-array 1.x

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{ErrorCode, SignerError, SignerResult};
use crate::secrets::{MasterSecret, UnlockCredential};

/// Current vault envelope version.
pub const VAULT_VERSION: u8 = 1;

const SALT_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;

/// Key derivation parameters
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_cost: u32,
    /// Time cost (iterations)
    pub time_cost: u32,
    /// Parallelism
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            // 64 MiB memory, 3 iterations, 4 parallel lanes
            memory_cost: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

/// Sealed master secret envelope
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EncryptedVault {
    /// Version for future compatibility
    pub version: u8,
    /// Salt used for key derivation (32 bytes, base64)
    pub salt: String,
    /// Nonce used for encryption (12 bytes, base64)
    pub nonce: String,
    /// Encrypted master secret (ciphertext + auth tag, base64)
    pub ciphertext: String,
    /// Key derivation parameters
    pub kdf: KdfParams,
}

/// Source of the master secret for the signing engine.
///
/// The engine never sees the credential-to-key derivation; it hands the
/// credential to the vault and receives a live `MasterSecret` or a
/// `VaultUnlockFailed` error.
pub trait SecretVault: Send + Sync {
    fn unlock(&self, credential: &UnlockCredential) -> SignerResult<MasterSecret>;
}

impl EncryptedVault {
    /// Encrypt a master secret under an unlock credential.
    pub fn seal(secret: &MasterSecret, credential: &UnlockCredential) -> SignerResult<Self> {
        if credential.is_empty() {
            return Err(SignerError::missing_credential());
        }
        if secret.is_wiped() {
            return Err(SignerError::invalid_key("Cannot seal a wiped master secret"));
        }

        let mut salt = [0u8; SALT_BYTES];
        OsRng.fill_bytes(&mut salt);

        let mut nonce_bytes = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce_bytes);

        let kdf = KdfParams::default();
        let mut key = derive_key(credential.expose(), &salt, &kdf)?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| SignerError::internal(format!("Failed to create cipher: {}", e)));
        key.zeroize();
        let cipher = cipher?;

        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, secret.expose())
            .map_err(|e| SignerError::internal(format!("Encryption failed: {}", e)))?;

        Ok(Self {
            version: VAULT_VERSION,
            salt: base64_encode(&salt),
            nonce: base64_encode(&nonce_bytes),
            ciphertext: base64_encode(&ciphertext),
            kdf,
        })
    }

    /// Decrypt the master secret with an unlock credential.
    ///
    /// Authentication failure and corrupted ciphertext are indistinguishable
    /// on purpose: both surface the same fixed `VaultUnlockFailed` message.
    pub fn unlock(&self, credential: &UnlockCredential) -> SignerResult<MasterSecret> {
        if credential.is_empty() {
            return Err(SignerError::missing_credential());
        }
        if self.version != VAULT_VERSION {
            return Err(SignerError::new(
                ErrorCode::VaultUnlockFailed,
                format!("Unsupported vault version: {}", self.version),
            ));
        }

        let salt = base64_decode(&self.salt)?;
        let nonce_bytes = base64_decode(&self.nonce)?;
        let ciphertext = base64_decode(&self.ciphertext)?;

        if salt.len() != SALT_BYTES {
            return Err(SignerError::new(
                ErrorCode::VaultUnlockFailed,
                "Invalid salt length",
            ));
        }
        if nonce_bytes.len() != NONCE_BYTES {
            return Err(SignerError::new(
                ErrorCode::VaultUnlockFailed,
                "Invalid nonce length",
            ));
        }

        let mut key = derive_key(credential.expose(), &salt, &self.kdf)?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| SignerError::internal(format!("Failed to create cipher: {}", e)));
        key.zeroize();
        let cipher = cipher?;

        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| SignerError::vault_locked())?;

        Ok(MasterSecret::from_vec(plaintext))
    }

    /// Check whether a credential opens this vault without surfacing the secret.
    ///
    /// The decrypted copy lives only inside this call; `MasterSecret` zeroizes
    /// itself on drop.
    pub fn verify_credential(&self, credential: &UnlockCredential) -> bool {
        self.unlock(credential).is_ok()
    }

    /// Serialize the envelope to pretty JSON for storage.
    pub fn to_json(&self) -> SignerResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SignerError::internal(format!("JSON serialization failed: {}", e)))
    }

    /// Parse an envelope from stored JSON.
    pub fn from_json(json: &str) -> SignerResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            SignerError::new(
                ErrorCode::VaultUnlockFailed,
                format!("Invalid vault JSON: {}", e),
            )
        })
    }

    /// Memory the KDF will touch during unlock, in bytes.
    pub fn unlock_memory_bytes(&self) -> usize {
        (self.kdf.memory_cost as usize) * 1024
    }
}

impl SecretVault for EncryptedVault {
    fn unlock(&self, credential: &UnlockCredential) -> SignerResult<MasterSecret> {
        EncryptedVault::unlock(self, credential)
    }
}

/// Derive the AES key from the credential using Argon2id
fn derive_key(credential: &str, salt: &[u8], params: &KdfParams) -> SignerResult<[u8; 32]> {
    use argon2::{Algorithm, Argon2, Params, Version};

    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(32), // Output length
    )
    .map_err(|e| SignerError::internal(format!("Invalid KDF params: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(credential.as_bytes(), salt, &mut key)
        .map_err(|e| SignerError::internal(format!("Key derivation failed: {}", e)))?;

    Ok(key)
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn base64_decode(s: &str) -> SignerResult<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| SignerError::new(ErrorCode::VaultUnlockFailed, format!("Invalid base64: {}", e)))
}
