//! Unified error types for the signing engine
//!
//! All failures surfaced to callers flow through [`SignerError`] so that the
//! application layer sees one consistent taxonomy. Messages carried here are
//! safe for display and logs: no secret bytes, no derivation-path indices,
//! no raw upstream error dumps.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Main error type for all signing-engine operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<String>,
}

impl SignerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    // Convenience constructors

    pub fn user_declined() -> Self {
        Self::new(ErrorCode::UserDeclined, "User declined the signing request")
    }

    pub fn integrity_failed() -> Self {
        Self::new(
            ErrorCode::DeviceIntegrityFailed,
            "Device integrity check failed or did not complete",
        )
    }

    pub fn missing_credential() -> Self {
        Self::new(
            ErrorCode::MissingCredential,
            "An unlock credential is required for this operation",
        )
    }

    pub fn vault_locked() -> Self {
        Self::new(
            ErrorCode::VaultUnlockFailed,
            "Vault unlock failed - incorrect credential or corrupted data",
        )
    }

    pub fn invalid_phrase() -> Self {
        Self::new(
            ErrorCode::InvalidRecoveryPhrase,
            "Recovery phrase failed checksum validation",
        )
    }

    pub fn malformed_path(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::MalformedPath, msg)
    }

    pub fn derivation_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::DerivationFailed, msg)
    }

    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidKey, msg)
    }

    pub fn insufficient_funds(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InsufficientFunds, msg)
    }

    pub fn signing_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::SigningFailed, msg)
    }

    pub fn protocol_mismatch(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProtocolMismatch, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, msg)
    }

    /// Broad category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Whether the caller may reasonably retry the whole flow.
    ///
    /// User rejections and builder-level fund errors are recoverable by
    /// adjusting the request; security-gate and cryptographic-input failures
    /// are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::UserRejection | ErrorCategory::TransactionBuild
        )
    }
}

impl fmt::Display for SignerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.code, self.message)?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for SignerError {}

/// Error codes for categorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // User decisions
    UserDeclined,

    // Security gates
    DeviceIntegrityFailed,
    MissingCredential,
    VaultUnlockFailed,
    EnclaveUnavailable,

    // Cryptographic input
    InvalidRecoveryPhrase,
    MalformedPath,
    DerivationFailed,
    InvalidKey,

    // Transaction building
    InsufficientFunds,
    DustOutput,
    MissingSignature,
    SignatureOutOfOrder,
    TransactionFinalized,
    DataCarrierTooLarge,
    UnsupportedSighash,

    // Multi-party / protocol
    InvalidQuorum,
    DuplicateParticipant,
    NonceMismatch,
    ProtocolMismatch,

    // Signing
    SigningFailed,
    VerificationFailed,

    // Internal
    WorkerFailure,
    Internal,
}

/// Coarse grouping an [`ErrorCode`] rolls up into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    UserRejection,
    SecurityGate,
    CryptographicInput,
    TransactionBuild,
    ProtocolMismatch,
    Internal,
}

impl ErrorCode {
    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorCode::UserDeclined => ErrorCategory::UserRejection,

            ErrorCode::DeviceIntegrityFailed
            | ErrorCode::MissingCredential
            | ErrorCode::VaultUnlockFailed
            | ErrorCode::EnclaveUnavailable => ErrorCategory::SecurityGate,

            ErrorCode::InvalidRecoveryPhrase
            | ErrorCode::MalformedPath
            | ErrorCode::DerivationFailed
            | ErrorCode::InvalidKey => ErrorCategory::CryptographicInput,

            ErrorCode::InsufficientFunds
            | ErrorCode::DustOutput
            | ErrorCode::MissingSignature
            | ErrorCode::SignatureOutOfOrder
            | ErrorCode::TransactionFinalized
            | ErrorCode::DataCarrierTooLarge
            | ErrorCode::UnsupportedSighash => ErrorCategory::TransactionBuild,

            ErrorCode::InvalidQuorum
            | ErrorCode::DuplicateParticipant
            | ErrorCode::NonceMismatch
            | ErrorCode::ProtocolMismatch => ErrorCategory::ProtocolMismatch,

            ErrorCode::SigningFailed
            | ErrorCode::VerificationFailed
            | ErrorCode::WorkerFailure
            | ErrorCode::Internal => ErrorCategory::Internal,
        }
    }
}

/// Result type alias for signing-engine operations
pub type SignerResult<T> = Result<T, SignerError>;

// Conversions from common error types.
//
// Messages from cryptographic libraries are replaced with fixed text so that
// upstream detail (which can include index and length information) never
// reaches an externally visible string.

impl From<bip39::Error> for SignerError {
    fn from(_: bip39::Error) -> Self {
        SignerError::invalid_phrase()
    }
}

impl From<bitcoin::bip32::Error> for SignerError {
    fn from(_: bitcoin::bip32::Error) -> Self {
        SignerError::derivation_failed("Hierarchical key derivation failed")
    }
}

impl From<secp256k1::Error> for SignerError {
    fn from(_: secp256k1::Error) -> Self {
        SignerError::new(ErrorCode::InvalidKey, "Invalid curve point or scalar")
    }
}

impl From<serde_json::Error> for SignerError {
    fn from(e: serde_json::Error) -> Self {
        SignerError::new(ErrorCode::Internal, format!("JSON error: {}", e))
    }
}

impl From<hex::FromHexError> for SignerError {
    fn from(e: hex::FromHexError) -> Self {
        SignerError::new(ErrorCode::InvalidKey, format!("Invalid hex: {}", e))
    }
}

impl From<std::io::Error> for SignerError {
    fn from(e: std::io::Error) -> Self {
        SignerError::new(ErrorCode::Internal, e.to_string())
    }
}

impl From<bitcoin::address::ParseError> for SignerError {
    fn from(e: bitcoin::address::ParseError) -> Self {
        SignerError::new(ErrorCode::InvalidKey, format!("Invalid address: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serialization() {
        let err = SignerError::insufficient_funds("Inputs do not cover outputs plus fee")
            .with_details("short by 1200 sats");

        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("insufficient_funds"));
        assert!(json.contains("Inputs do not cover"));
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            SignerError::user_declined().category(),
            ErrorCategory::UserRejection
        );
        assert_eq!(
            SignerError::integrity_failed().category(),
            ErrorCategory::SecurityGate
        );
        assert_eq!(
            SignerError::invalid_phrase().category(),
            ErrorCategory::CryptographicInput
        );
        assert_eq!(
            SignerError::new(ErrorCode::NonceMismatch, "x").category(),
            ErrorCategory::ProtocolMismatch
        );
    }

    #[test]
    fn test_recoverability() {
        assert!(SignerError::user_declined().is_recoverable());
        assert!(SignerError::insufficient_funds("x").is_recoverable());
        assert!(!SignerError::integrity_failed().is_recoverable());
        assert!(!SignerError::invalid_phrase().is_recoverable());
    }

    #[test]
    fn test_phrase_error_is_non_leaking() {
        let err: SignerError = bip39::Error::BadWordCount(13).into();
        assert_eq!(err.code, ErrorCode::InvalidRecoveryPhrase);
        assert!(!err.message.contains("13"));
    }
}
