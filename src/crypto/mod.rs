//! Cryptographic primitives
//!
//! Low-level operations shared by the key-derivation engine, the transaction
//! builder, and the multi-party module:
//! - Schnorr signatures (BIP-340)
//! - Taproot key tweaking
//! - Tagged hash functions and hash-to-scalar conversion

pub mod schnorr;
pub mod taproot;

pub use schnorr::*;
pub use taproot::*;

use thiserror::Error;

use crate::error::SignerError;

/// Curve-level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("scalar exceeds the curve order")]
    ScalarOutOfRange,
    #[error("invalid public key encoding")]
    InvalidPublicKey,
    #[error("tweaked key is not a valid curve point")]
    TweakFailed,
}

impl From<CryptoError> for SignerError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidPublicKey => SignerError::invalid_key(e.to_string()),
            CryptoError::ScalarOutOfRange | CryptoError::TweakFailed => {
                SignerError::derivation_failed(e.to_string())
            }
        }
    }
}
