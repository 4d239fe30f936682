//! Taproot Key Tweaking (BIP-341)
//!
//! Key-path Taproot arithmetic:
//! - TapTweak hash computation
//! - Internal-to-output key tweaking, accepting 32- and 33-byte encodings
//! - Tweaked keypairs for key-path spends
//!
//! Reference: https://github.com/bitcoin/bips/blob/master/bip-0341.mediawiki

use bitcoin::key::TapTweak;
use bitcoin::secp256k1::{All, Keypair, Parity, PublicKey, Secp256k1, XOnlyPublicKey};
use bitcoin::taproot::TapNodeHash;

use super::schnorr::{hash_to_scalar, tagged_hash, tags};
use super::CryptoError;

// MARK: - Tweak Hashes

/// tweak = tagged_hash("TapTweak", internal_key || merkle_root?)
///
/// With no script tree the hash covers the internal key alone.
pub fn tap_tweak_hash(internal_key: &[u8; 32], merkle_root: Option<&[u8; 32]>) -> [u8; 32] {
    match merkle_root {
        Some(root) => {
            let mut data = [0u8; 64];
            data[..32].copy_from_slice(internal_key);
            data[32..].copy_from_slice(root);
            tagged_hash(tags::TAP_TWEAK, &data)
        }
        None => tagged_hash(tags::TAP_TWEAK, internal_key),
    }
}

// MARK: - Key Tweaking

/// Parse an internal key from its 32-byte x-only or 33-byte compressed form.
///
/// A compressed key loses its parity byte here: BIP-340 lifting always
/// selects the even-Y point.
fn parse_internal_key(key: &[u8]) -> Result<XOnlyPublicKey, CryptoError> {
    match key.len() {
        32 => XOnlyPublicKey::from_slice(key).map_err(|_| CryptoError::InvalidPublicKey),
        33 => PublicKey::from_slice(key)
            .map(|pk| pk.x_only_public_key().0)
            .map_err(|_| CryptoError::InvalidPublicKey),
        _ => Err(CryptoError::InvalidPublicKey),
    }
}

/// Add `tweak * G` to an internal key.
///
/// The result is the even-Y x-only encoding of `internal + tweak*G`.
pub fn taproot_tweak(internal_key: &[u8], tweak: &[u8; 32]) -> Result<XOnlyPublicKey, CryptoError> {
    let secp = Secp256k1::new();
    let xonly = parse_internal_key(internal_key)?;
    let scalar = hash_to_scalar(tweak)?;

    let (tweaked, _parity) = xonly
        .add_tweak(&secp, &scalar)
        .map_err(|_| CryptoError::TweakFailed)?;
    Ok(tweaked)
}

/// BIP-341 output key: tweak the internal key by the TapTweak hash over
/// itself (and the script-tree merkle root when present).
///
/// The parity is returned alongside; script-path spenders need it for
/// control-block construction.
pub fn taproot_output_key(
    internal_key: &[u8],
    merkle_root: Option<&[u8; 32]>,
) -> Result<(XOnlyPublicKey, Parity), CryptoError> {
    let secp = Secp256k1::new();
    let xonly = parse_internal_key(internal_key)?;

    let tweak = tap_tweak_hash(&xonly.serialize(), merkle_root);
    let scalar = hash_to_scalar(&tweak)?;

    xonly
        .add_tweak(&secp, &scalar)
        .map_err(|_| CryptoError::TweakFailed)
}

/// Tweaked keypair for key-path spending.
///
/// Signing a key-spend sighash with this keypair produces a signature that
/// verifies against [`taproot_output_key`] of the untweaked public key.
pub fn key_spend_keypair(
    secp: &Secp256k1<All>,
    keypair: &Keypair,
    merkle_root: Option<[u8; 32]>,
) -> Keypair {
    let root = merkle_root.map(TapNodeHash::assume_hidden);
    keypair.tap_tweak(secp, root).to_keypair()
}

// MARK: - Tests
