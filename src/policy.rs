//! Derivation-path policy
//!
//! The single source of truth mapping (layer, account) pairs onto the key
//! hierarchy. No other module builds path strings.
//!
//! | layer      | path                     |
//! |------------|--------------------------|
//! | bitcoin    | m/84'/0'/account'/0/0    |
//! | taproot    | m/86'/0'/account'/0/0    |
//! | lightning  | m/1017'/0'/account'/0/0  |
//! | liquid     | m/84'/1776'/account'/0/0 |
//! | statechain | m/87'/0'/account'/0/t    |
//!
//! Statechain paths rotate the final segment (`t`) on every off-chain
//! transfer. Distinct layers occupy distinct purpose/coin-type slots, so a
//! key derived for one layer can never collide with another layer's key at
//! the same account index.

use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::ChildNumber;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::SignerError;
use crate::types::Layer;

/// First index reserved for hardened derivation
const HARDENED_BOUND: u32 = 0x8000_0000;

/// External (receive) chain segment
const CHANGE_EXTERNAL: u32 = 0;

/// Default address index within the external chain
const ADDRESS_INDEX: u32 = 0;

// =============================================================================
// Errors
// =============================================================================

/// Path and transfer-index validation failures.
///
/// Messages deliberately omit the offending values; path indices are not
/// echoed back to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("derivation path must start with 'm'")]
    MissingMasterPrefix,
    #[error("derivation path contains an empty segment")]
    EmptySegment,
    #[error("derivation path segment is not a valid index")]
    InvalidSegment,
    #[error("derivation path index exceeds the hardened bound")]
    IndexOutOfRange,
    #[error("account index exceeds the hardened bound")]
    AccountOutOfRange,
    #[error("transfer index cannot be negative")]
    NegativeTransferIndex,
    #[error("transfer index must strictly increase within a lineage")]
    StaleTransferIndex,
}

impl From<PolicyError> for SignerError {
    fn from(e: PolicyError) -> Self {
        SignerError::malformed_path(e.to_string())
    }
}

// =============================================================================
// Path Types
// =============================================================================

/// One segment of a derivation path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathComponent {
    pub index: u32,
    pub hardened: bool,
}

impl PathComponent {
    pub fn hardened(index: u32) -> Self {
        Self {
            index,
            hardened: true,
        }
    }

    pub fn normal(index: u32) -> Self {
        Self {
            index,
            hardened: false,
        }
    }
}

impl fmt::Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hardened {
            write!(f, "{}'", self.index)
        } else {
            write!(f, "{}", self.index)
        }
    }
}

/// An immutable, validated hierarchical derivation path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DerivationPath {
    components: Vec<PathComponent>,
}

impl DerivationPath {
    pub fn new(components: Vec<PathComponent>) -> Self {
        Self { components }
    }

    pub fn components(&self) -> &[PathComponent] {
        &self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Convert to the bitcoin crate's path type for actual BIP-32 derivation
    pub fn to_bip32(&self) -> bitcoin::bip32::DerivationPath {
        let children: Vec<ChildNumber> = self
            .components
            .iter()
            .map(|c| {
                if c.hardened {
                    ChildNumber::Hardened { index: c.index }
                } else {
                    ChildNumber::Normal { index: c.index }
                }
            })
            .collect();
        bitcoin::bip32::DerivationPath::from(children)
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m")?;
        for component in &self.components {
            write!(f, "/{}", component)?;
        }
        Ok(())
    }
}

impl FromStr for DerivationPath {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match parts.next() {
            Some("m") | Some("M") => {}
            _ => return Err(PolicyError::MissingMasterPrefix),
        }

        let mut components = Vec::new();
        for part in parts {
            if part.is_empty() {
                return Err(PolicyError::EmptySegment);
            }

            let (digits, hardened) = match part
                .strip_suffix('\'')
                .or_else(|| part.strip_suffix('h'))
                .or_else(|| part.strip_suffix('H'))
            {
                Some(d) => (d, true),
                None => (part, false),
            };

            let index: u32 = digits.parse().map_err(|_| PolicyError::InvalidSegment)?;
            if index >= HARDENED_BOUND {
                return Err(PolicyError::IndexOutOfRange);
            }

            components.push(PathComponent { index, hardened });
        }

        Ok(Self { components })
    }
}

// =============================================================================
// Transfer Indices
// =============================================================================

/// Statechain per-transfer rotation index.
///
/// Construction validates non-negativity; `advance_from` additionally
/// enforces strict monotonic advancement within one UTXO lineage. Lineage
/// bookkeeping itself belongs to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferIndex(u32);

impl TransferIndex {
    pub fn new(value: i64) -> Result<Self, PolicyError> {
        if value < 0 {
            return Err(PolicyError::NegativeTransferIndex);
        }
        if value >= i64::from(HARDENED_BOUND) {
            return Err(PolicyError::IndexOutOfRange);
        }
        Ok(Self(value as u32))
    }

    /// Validate `next` as the successor of `previous` within one lineage
    pub fn advance_from(previous: TransferIndex, next: i64) -> Result<Self, PolicyError> {
        let candidate = Self::new(next)?;
        if candidate.0 <= previous.0 {
            return Err(PolicyError::StaleTransferIndex);
        }
        Ok(candidate)
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TransferIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Policy Functions
// =============================================================================

/// Map a (layer, account) pair to its derivation path.
///
/// Statechain accounts resolve to transfer index 0; rotated statechain keys
/// go through [`statechain_path`].
pub fn path_for(layer: Layer, account: u32) -> Result<DerivationPath, PolicyError> {
    if account >= HARDENED_BOUND {
        return Err(PolicyError::AccountOutOfRange);
    }

    let path = match layer {
        Layer::Statechain => statechain_components(account, 0),
        Layer::Bitcoin | Layer::Taproot | Layer::Lightning | Layer::Liquid => {
            DerivationPath::new(vec![
                PathComponent::hardened(layer.purpose()),
                PathComponent::hardened(layer.coin_type()),
                PathComponent::hardened(account),
                PathComponent::normal(CHANGE_EXTERNAL),
                PathComponent::normal(ADDRESS_INDEX),
            ])
        }
    };

    Ok(path)
}

/// Statechain path parameterized by the rotating transfer index
pub fn statechain_path(
    account: u32,
    transfer: TransferIndex,
) -> Result<DerivationPath, PolicyError> {
    if account >= HARDENED_BOUND {
        return Err(PolicyError::AccountOutOfRange);
    }
    Ok(statechain_components(account, transfer.value()))
}

fn statechain_components(account: u32, transfer: u32) -> DerivationPath {
    let layer = Layer::Statechain;
    DerivationPath::new(vec![
        PathComponent::hardened(layer.purpose()),
        PathComponent::hardened(layer.coin_type()),
        PathComponent::hardened(account),
        PathComponent::normal(CHANGE_EXTERNAL),
        PathComponent::normal(transfer),
    ])
}
