//! Sovereign Signing Engine
//!
//! Self-custodial signing backend for a layered Bitcoin wallet.
//!
//! # Architecture
//!
//! This crate provides:
//! - **keys**: Recovery-phrase import, BIP-32 derivation, derivation cache
//! - **policy**: Layer-to-path mapping and statechain transfer indices
//! - **crypto**: BIP-340 Schnorr and BIP-341 taproot tweak primitives
//! - **tx**: Transaction building, sighash extraction, finalization
//! - **musig**: MuSig2 key aggregation and signing ceremonies
//! - **vault**: Credential-encrypted master secret storage
//! - **engine**: The signing orchestrator with its confirmation, integrity,
//!   and enclave collaborators
//!
//! # Security
//!
//! Secret material lives in self-zeroizing containers (`secrets`), is wiped
//! on every signing exit path, and never appears in logs or events. High
//! value spends suspend on a device-integrity verdict that fails closed.
//!
//! # Example
//!
//! ```rust,ignore
//! use sovereign_signer::{Layer, SignRequest, SigningEngine, UnlockCredential};
//!
//! let engine = SigningEngine::builder(vault, confirmation, integrity).build();
//! let request = SignRequest::message(Layer::Taproot, 0, payload, "Sign greeting");
//! let result = engine.request_signature(request, credential).await?;
//! println!("signature: {}", result.signature);
//! ```

// Core modules
pub mod error;
pub mod logging;
pub mod secrets;
pub mod types;

// Domain modules
pub mod crypto;
pub mod events;
pub mod keys;
pub mod musig;
pub mod policy;
pub mod tx;
pub mod vault;

// Orchestration
pub mod engine;

// Re-export key types for convenience
pub use error::{ErrorCategory, ErrorCode, SignerError, SignerResult};
pub use types::*;

pub use engine::{
    sign_with_secret, ConfirmationGate, EnclaveError, EnclaveSigner, IntegrityGate, SigningAttempt,
    SigningEngine, SigningEngineBuilder, DEFAULT_HIGH_VALUE_THRESHOLD_SATS, INTEGRITY_TIMEOUT,
};
pub use events::{EngineEvent, EventSink, LogSink, NullSink};
pub use keys::{derive_child, seed_from_recovery_phrase, DerivationCache, KeyPair};
pub use musig::{aggregate_public_keys, AggregatedKey, SigningCeremony};
pub use policy::{path_for, statechain_path, DerivationPath, TransferIndex};
pub use secrets::{MasterSecret, SecretBuffer, UnlockCredential, WipeGuard};
pub use tx::{build_transaction, FinalizedTransaction, Recipient, TxBuilder, Utxo};
pub use vault::{EncryptedVault, SecretVault};
