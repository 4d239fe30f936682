//! Key Derivation Engine
//!
//! Turns a recovery phrase into a master seed (BIP-39) and a seed plus
//! derivation path into a signing key pair (BIP-32). A session-scoped
//! cache avoids repeating the hardened-derivation walk for hot paths.
//!
//! SECURITY: seeds and derived private keys live in zeroizing buffers.
//! Cache entries are wiped in place before removal.

use std::collections::HashMap;
use std::sync::RwLock;

use bip39::Mnemonic;
use bitcoin::bip32::Xpriv;
use bitcoin::key::{CompressedPublicKey, PublicKey as BitcoinPublicKey};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey, XOnlyPublicKey};
use bitcoin::{Address, Network};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{SignerError, SignerResult};
use crate::policy::DerivationPath;
use crate::secrets::{MasterSecret, SecretBuffer};

/// Derive the 64-byte master seed from a BIP-39 recovery phrase.
///
/// The phrase is checksum-validated; the optional passphrase feeds the
/// PBKDF2 stretch, so two passphrases yield unrelated wallets.
pub fn seed_from_recovery_phrase(phrase: &str, passphrase: &str) -> SignerResult<MasterSecret> {
    let mnemonic = Mnemonic::parse(phrase)?;
    let seed = Zeroizing::new(mnemonic.to_seed(passphrase));
    Ok(MasterSecret::from_bytes(seed.as_ref()))
}

/// A derived secp256k1 key pair. The secret scalar sits in a zeroizing
/// buffer and is wiped on drop.
#[derive(Debug, Clone)]
pub struct KeyPair {
    public: PublicKey,
    secret: SecretBuffer,
}

impl KeyPair {
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// X-only projection of the public key, as used by Schnorr and Taproot.
    pub fn x_only_public_key(&self) -> XOnlyPublicKey {
        self.public.x_only_public_key().0
    }

    /// Reconstruct the secret scalar. Fails once the pair has been wiped.
    pub fn secret_key(&self) -> SignerResult<SecretKey> {
        if self.secret.is_wiped() {
            return Err(SignerError::invalid_key("key material has been wiped"));
        }
        Ok(SecretKey::from_slice(self.secret.expose())?)
    }

    pub fn wipe(&mut self) {
        self.secret.wipe();
    }

    pub fn is_wiped(&self) -> bool {
        self.secret.is_wiped()
    }
}

/// Derive the key pair at `path` from a master seed.
pub fn derive_child(seed: &MasterSecret, path: &DerivationPath) -> SignerResult<KeyPair> {
    if seed.is_wiped() {
        return Err(SignerError::invalid_key("master secret has been wiped"));
    }

    let secp = Secp256k1::new();
    let master = Xpriv::new_master(Network::Bitcoin, seed.expose())?;
    let child = master.derive_priv(&secp, &path.to_bip32())?;

    let secret_key = child.private_key;
    let public = secret_key.public_key(&secp);

    Ok(KeyPair {
        public,
        secret: SecretBuffer::from_bytes(&secret_key.secret_bytes()),
    })
}

/// Session-scoped derivation cache.
///
/// Entries are keyed by SHA-256 over (seed bytes ‖ canonical path string),
/// never by plaintext secrets. Clearing the cache wipes every stored
/// secret before the entries are dropped, and never changes the result of
/// a later derivation.
pub struct DerivationCache {
    entries: RwLock<HashMap<[u8; 32], KeyPair>>,
}

impl DerivationCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached pair for (seed, path), deriving and storing it on
    /// a miss. Hits and misses are indistinguishable to the caller.
    pub fn get_or_derive(
        &self,
        seed: &MasterSecret,
        path: &DerivationPath,
    ) -> SignerResult<KeyPair> {
        if seed.is_wiped() {
            return Err(SignerError::invalid_key("master secret has been wiped"));
        }

        let key = cache_key(seed, path);

        {
            let entries = self
                .entries
                .read()
                .map_err(|_| SignerError::internal("derivation cache lock poisoned"))?;
            if let Some(hit) = entries.get(&key) {
                return Ok(hit.clone());
            }
        }

        let pair = derive_child(seed, path)?;

        let mut entries = self
            .entries
            .write()
            .map_err(|_| SignerError::internal("derivation cache lock poisoned"))?;
        entries.insert(key, pair.clone());
        Ok(pair)
    }

    /// Wipe every cached secret in place, then drop all entries. Proceeds
    /// even if a panicking writer poisoned the lock.
    pub fn clear_and_wipe(&self) {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for pair in entries.values_mut() {
            pair.wipe();
        }
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DerivationCache {
    fn default() -> Self {
        Self::new()
    }
}

fn cache_key(seed: &MasterSecret, path: &DerivationPath) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(seed.expose());
    hasher.update(path.to_string().as_bytes());
    let digest = hasher.finalize();

    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

/// Native segwit (P2WPKH) address for a compressed public key.
pub fn segwit_address(public: &PublicKey, network: Network) -> SignerResult<Address> {
    let compressed = CompressedPublicKey::try_from(BitcoinPublicKey::from(*public))
        .map_err(|_| SignerError::invalid_key("public key is not compressible"))?;
    Ok(Address::p2wpkh(&compressed, network))
}

/// Taproot (P2TR) address for an internal key. The output-key tweak is
/// applied by the address constructor.
pub fn taproot_address(internal: XOnlyPublicKey, network: Network) -> Address {
    let secp = Secp256k1::new();
    Address::p2tr(&secp, internal, None, network)
}
