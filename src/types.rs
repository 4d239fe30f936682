//! Shared types for the signing engine
//!
//! All data structures that cross module boundaries are defined here
//! for consistent serialization.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::policy::TransferIndex;
use crate::tx::TxBuilder;

// =============================================================================
// Layer Types
// =============================================================================

/// Supported signing layers
///
/// Each layer owns a distinct purpose/coin-type slot in the derivation tree,
/// so the same account index can never yield the same key on two layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layer {
    Bitcoin,
    Taproot,
    Lightning,
    Liquid,
    Statechain,
}

impl Layer {
    pub const ALL: [Layer; 5] = [
        Layer::Bitcoin,
        Layer::Taproot,
        Layer::Lightning,
        Layer::Liquid,
        Layer::Statechain,
    ];

    /// BIP-43 purpose segment (hardened)
    pub fn purpose(&self) -> u32 {
        match self {
            Layer::Bitcoin => 84,
            Layer::Taproot => 86,
            Layer::Lightning => 1017,
            Layer::Liquid => 84,
            Layer::Statechain => 87,
        }
    }

    /// Coin-type segment (hardened)
    pub fn coin_type(&self) -> u32 {
        match self {
            Layer::Bitcoin | Layer::Taproot | Layer::Lightning | Layer::Statechain => 0,
            Layer::Liquid => 1776,
        }
    }

    /// Signature scheme used when spending keys on this layer
    pub fn signature_scheme(&self) -> SignatureScheme {
        match self {
            Layer::Bitcoin | Layer::Lightning | Layer::Liquid => SignatureScheme::Ecdsa,
            Layer::Taproot | Layer::Statechain => SignatureScheme::Schnorr,
        }
    }

    /// Statechain keys rotate with every off-chain transfer
    pub fn uses_key_rotation(&self) -> bool {
        matches!(self, Layer::Statechain)
    }

    /// Parse a layer name, falling back to Bitcoin for unknown names.
    ///
    /// Only for untrusted string boundaries (CLI, external requests);
    /// internal code should match on the enum directly.
    pub fn parse_lossy(s: &str) -> Layer {
        s.parse().unwrap_or(Layer::Bitcoin)
    }
}

impl std::str::FromStr for Layer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace("-", "_").as_str() {
            "bitcoin" | "btc" | "segwit" => Ok(Layer::Bitcoin),
            "taproot" | "p2tr" => Ok(Layer::Taproot),
            "lightning" | "ln" => Ok(Layer::Lightning),
            "liquid" | "lbtc" => Ok(Layer::Liquid),
            "statechain" | "mercury" => Ok(Layer::Statechain),
            _ => Err(format!("Unknown layer: {}", s)),
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Layer::Bitcoin => "bitcoin",
            Layer::Taproot => "taproot",
            Layer::Lightning => "lightning",
            Layer::Liquid => "liquid",
            Layer::Statechain => "statechain",
        };
        write!(f, "{}", name)
    }
}

/// Signature scheme selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureScheme {
    /// DER-encoded ECDSA over secp256k1 (segwit v0 and legacy spends)
    Ecdsa,
    /// 64-byte BIP-340 Schnorr (taproot key spends, statechain transfers)
    Schnorr,
}

// =============================================================================
// Signing Requests
// =============================================================================

/// Kind-specific payload of a signing request
#[derive(Debug, Clone)]
pub enum RequestKind {
    /// Spend request carrying a fully built (unsigned) transaction
    Transaction {
        amount_sats: u64,
        transaction: TxBuilder,
    },
    /// Raw message signing (e.g. proofs of ownership shown to third parties)
    Message {
        payload: Vec<u8>,
        digest: Option<[u8; 32]>,
    },
    /// Protocol event signing (statechain transfer attestations)
    Event {
        payload: Vec<u8>,
        digest: Option<[u8; 32]>,
    },
    /// Login / challenge-response proof signing
    Proof {
        payload: Vec<u8>,
        digest: Option<[u8; 32]>,
    },
}

impl RequestKind {
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::Transaction { .. } => "transaction",
            RequestKind::Message { .. } => "message",
            RequestKind::Event { .. } => "event",
            RequestKind::Proof { .. } => "proof",
        }
    }

    /// Message-type requests suspend on an explicit user accept/decline
    pub fn needs_user_confirmation(&self) -> bool {
        !matches!(self, RequestKind::Transaction { .. })
    }

    /// The 32-byte digest actually signed for message-type requests.
    ///
    /// A caller-supplied digest wins; otherwise SHA-256 of the payload.
    /// Transaction requests carry per-input sighashes instead and return None.
    pub fn signing_digest(&self) -> Option<[u8; 32]> {
        match self {
            RequestKind::Transaction { .. } => None,
            RequestKind::Message { payload, digest }
            | RequestKind::Event { payload, digest }
            | RequestKind::Proof { payload, digest } => Some(match digest {
                Some(d) => *d,
                None => Sha256::digest(payload).into(),
            }),
        }
    }
}

/// A request for a signature, routed through the signing engine
#[derive(Debug)]
pub struct SignRequest {
    pub layer: Layer,
    pub account: u32,
    pub kind: RequestKind,
    /// Shown to the user on the confirmation screen. Never hashed or signed.
    pub description: String,
    /// Statechain key-rotation index; ignored by every other layer
    pub transfer_index: Option<TransferIndex>,
}

impl SignRequest {
    pub fn transaction(
        layer: Layer,
        account: u32,
        amount_sats: u64,
        transaction: TxBuilder,
        description: impl Into<String>,
    ) -> Self {
        Self {
            layer,
            account,
            kind: RequestKind::Transaction {
                amount_sats,
                transaction,
            },
            description: description.into(),
            transfer_index: None,
        }
    }

    pub fn message(
        layer: Layer,
        account: u32,
        payload: impl Into<Vec<u8>>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            layer,
            account,
            kind: RequestKind::Message {
                payload: payload.into(),
                digest: None,
            },
            description: description.into(),
            transfer_index: None,
        }
    }

    pub fn event(
        layer: Layer,
        account: u32,
        payload: impl Into<Vec<u8>>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            layer,
            account,
            kind: RequestKind::Event {
                payload: payload.into(),
                digest: None,
            },
            description: description.into(),
            transfer_index: None,
        }
    }

    pub fn proof(
        layer: Layer,
        account: u32,
        payload: impl Into<Vec<u8>>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            layer,
            account,
            kind: RequestKind::Proof {
                payload: payload.into(),
                digest: None,
            },
            description: description.into(),
            transfer_index: None,
        }
    }

    /// Replace the implicit SHA-256 digest with a precomputed one
    pub fn with_digest(mut self, precomputed: [u8; 32]) -> Self {
        match &mut self.kind {
            RequestKind::Message { digest, .. }
            | RequestKind::Event { digest, .. }
            | RequestKind::Proof { digest, .. } => *digest = Some(precomputed),
            RequestKind::Transaction { .. } => {}
        }
        self
    }

    pub fn with_transfer_index(mut self, index: TransferIndex) -> Self {
        self.transfer_index = Some(index);
        self
    }
}

// =============================================================================
// Signing Results
// =============================================================================

/// Immutable outcome of a completed signing request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignResult {
    /// Hex signature. For multi-input transactions this is the first input's
    /// signature; the full witness set lives in the finalized bytes.
    pub signature: String,
    /// Hex compressed public key the signature verifies against
    pub public_key: String,
    /// Broadcastable transaction hex, present for transaction requests only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_transaction: Option<String>,
    /// Wall-clock unix seconds at engine completion. Not monotonic across
    /// concurrent calls.
    pub timestamp: u64,
}

impl SignResult {
    pub fn new(
        signature: String,
        public_key: String,
        finalized_transaction: Option<String>,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            signature,
            public_key,
            finalized_transaction,
            timestamp,
        }
    }
}

// =============================================================================
// Engine State
// =============================================================================

/// Observable states of the signing state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SigningState {
    Idle,
    AwaitingUserConfirmation,
    AwaitingDeviceIntegrity,
    DerivingKey,
    Signing,
    Done,
    Failed,
}

impl SigningState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SigningState::Done | SigningState::Failed)
    }
}

impl std::fmt::Display for SigningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SigningState::Idle => "idle",
            SigningState::AwaitingUserConfirmation => "awaiting-user-confirmation",
            SigningState::AwaitingDeviceIntegrity => "awaiting-device-integrity",
            SigningState::DerivingKey => "deriving-key",
            SigningState::Signing => "signing",
            SigningState::Done => "done",
            SigningState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}
