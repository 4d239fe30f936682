//! BIP-340 Schnorr Signatures
//!
//! Schnorr signing and verification over secp256k1:
//! - Tagged hashes for domain separation
//! - X-only public keys (32 bytes)
//! - 64-byte signatures
//! - Deterministic nonce generation, optional aux randomness
//! - Hash-to-scalar conversion with the zero-remap rule
//!
//! Reference: https://github.com/bitcoin/bips/blob/master/bip-0340.mediawiki

use bitcoin::secp256k1::{
    schnorr::Signature as SchnorrSignature, All, Keypair, Message, PublicKey, Scalar, Secp256k1,
    SecretKey, XOnlyPublicKey,
};
use sha2::{Digest, Sha256};

use super::CryptoError;

// MARK: - Tagged Hash Functions

/// BIP-340 tagged hash computation
///
/// tagged_hash(tag, msg) = SHA256(SHA256(tag) || SHA256(tag) || msg)
pub fn tagged_hash(tag: &str, msg: &[u8]) -> [u8; 32] {
    let tag_hash = Sha256::digest(tag.as_bytes());

    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    hasher.update(msg);
    hasher.finalize().into()
}

/// Standard tags
pub mod tags {
    pub const BIP0340_AUX: &str = "BIP0340/aux";
    pub const BIP0340_NONCE: &str = "BIP0340/nonce";
    pub const BIP0340_CHALLENGE: &str = "BIP0340/challenge";
    pub const TAP_TWEAK: &str = "TapTweak";
}

// MARK: - Scalar Conversion

/// Interpret a 32-byte hash as a curve scalar.
///
/// An all-zero hash maps to scalar 1: reference nonce generation never
/// produces the zero scalar, and interoperable implementations must apply
/// the same remap. Values at or above the curve order are rejected.
pub fn hash_to_scalar(bytes: &[u8; 32]) -> Result<Scalar, CryptoError> {
    if bytes.iter().all(|&b| b == 0) {
        return Ok(Scalar::ONE);
    }
    Scalar::from_be_bytes(*bytes).map_err(|_| CryptoError::ScalarOutOfRange)
}

/// BIP-340 even-Y parity check on a full public key
pub fn has_even_y(public_key: &PublicKey) -> bool {
    public_key.serialize()[0] == 0x02
}

// MARK: - Schnorr Signer

/// BIP-340 Schnorr signer over a reusable secp context
pub struct SchnorrSigner {
    secp: Secp256k1<All>,
}

impl Default for SchnorrSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl SchnorrSigner {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }

    /// Build a signing keypair from a secret key
    pub fn keypair(&self, secret: &SecretKey) -> Keypair {
        Keypair::from_secret_key(&self.secp, secret)
    }

    /// X-only public key for a secret key
    pub fn x_only_public_key(&self, secret: &SecretKey) -> XOnlyPublicKey {
        self.keypair(secret).x_only_public_key().0
    }

    /// Sign a 32-byte digest deterministically (no auxiliary randomness).
    ///
    /// Repeated calls with the same inputs produce the identical signature.
    pub fn sign(&self, digest: &[u8; 32], keypair: &Keypair) -> [u8; 64] {
        let msg = Message::from_digest(*digest);
        let sig = self.secp.sign_schnorr_no_aux_rand(&msg, keypair);
        *sig.as_ref()
    }

    /// Sign a 32-byte digest mixing in caller-supplied auxiliary randomness
    pub fn sign_with_aux_rand(
        &self,
        digest: &[u8; 32],
        keypair: &Keypair,
        aux_rand: &[u8; 32],
    ) -> [u8; 64] {
        let msg = Message::from_digest(*digest);
        let sig = self.secp.sign_schnorr_with_aux_rand(&msg, keypair, aux_rand);
        *sig.as_ref()
    }

    /// Verify a 64-byte signature against a digest and x-only key.
    ///
    /// Pure: malformed signatures verify as false, never as errors.
    pub fn verify(&self, signature: &[u8; 64], digest: &[u8; 32], public_key: &XOnlyPublicKey) -> bool {
        let sig = match SchnorrSignature::from_slice(signature) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        let msg = Message::from_digest(*digest);
        self.secp.verify_schnorr(&sig, &msg, public_key).is_ok()
    }
}

// MARK: - Convenience Functions

/// Sign a digest with BIP-340 Schnorr (deterministic)
pub fn schnorr_sign(digest: &[u8; 32], secret: &SecretKey) -> [u8; 64] {
    let signer = SchnorrSigner::new();
    let keypair = signer.keypair(secret);
    signer.sign(digest, &keypair)
}

/// Verify a BIP-340 Schnorr signature
pub fn schnorr_verify(signature: &[u8; 64], digest: &[u8; 32], public_key: &XOnlyPublicKey) -> bool {
    SchnorrSigner::new().verify(signature, digest, public_key)
}

// MARK: - Tests
