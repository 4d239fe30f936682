//! Unsigned-Transaction Builder
//!
//! Assembles a transaction from explicit inputs and outputs, computes the
//! per-input digests the engine signs, and serializes the finalized result.
//!
//! Lifecycle: add inputs and outputs, optionally `apply_change`, extract
//! sighashes, attach signatures in input order, `finalize`. Any mutation
//! after finalization is rejected.
//!
//! Fee arithmetic uses fixed virtual-size weights so that estimates are
//! repeatable across processes (required for replace-by-fee bumping).

use std::str::FromStr;

use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::key::{CompressedPublicKey, PublicKey as BitcoinPublicKey};
use bitcoin::script::PushBytesBuf;
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ErrorCode, SignerError};
use crate::types::SignatureScheme;

/// Fixed virtual-size overhead of an empty transaction.
pub const TX_BASE_VBYTES: u64 = 10;
/// Fixed virtual size charged per input (P2WPKH-class spend).
pub const INPUT_VBYTES: u64 = 68;
/// Fixed virtual size charged per output.
pub const OUTPUT_VBYTES: u64 = 31;
/// Outputs below this value are uneconomical to spend and are rejected.
pub const DUST_THRESHOLD_SATS: u64 = 546;
/// Maximum OP_RETURN payload accepted by default relay policy.
pub const MAX_DATA_CARRIER_BYTES: usize = 80;

/// Errors raised while assembling or finalizing a transaction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxBuildError {
    #[error("input txid is not valid hex")]
    InvalidTxid,

    #[error("address is invalid for the configured network")]
    InvalidAddress,

    #[error("output of {0} sats is below the {DUST_THRESHOLD_SATS} sat dust threshold")]
    DustOutput(u64),

    #[error("data payload of {0} bytes exceeds the {MAX_DATA_CARRIER_BYTES} byte limit")]
    DataCarrierTooLarge(usize),

    #[error("inputs carry {available} sats but {required} sats are required")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("input {0} has no signature attached")]
    MissingSignature(usize),

    #[error("expected a signature for input {expected}, got one for input {got}")]
    SignatureOutOfOrder { expected: usize, got: usize },

    #[error("transaction is finalized and can no longer be modified")]
    TransactionFinalized,

    #[error("confidential outputs do not support layer-1 sighash extraction")]
    UnsupportedSighash,

    #[error("input {0} is not spendable by the supplied key")]
    UnspendableInput(usize),

    #[error("signature bytes do not match the input script kind")]
    MalformedSignature,

    #[error("sighash computation failed")]
    SighashFailed,
}

impl From<TxBuildError> for SignerError {
    fn from(e: TxBuildError) -> Self {
        let code = match e {
            TxBuildError::InvalidTxid | TxBuildError::InvalidAddress => ErrorCode::InvalidKey,
            TxBuildError::DustOutput(_) => ErrorCode::DustOutput,
            TxBuildError::DataCarrierTooLarge(_) => ErrorCode::DataCarrierTooLarge,
            TxBuildError::InsufficientFunds { .. } => ErrorCode::InsufficientFunds,
            TxBuildError::MissingSignature(_) => ErrorCode::MissingSignature,
            TxBuildError::SignatureOutOfOrder { .. } => ErrorCode::SignatureOutOfOrder,
            TxBuildError::TransactionFinalized => ErrorCode::TransactionFinalized,
            TxBuildError::UnsupportedSighash | TxBuildError::UnspendableInput(_) => {
                ErrorCode::UnsupportedSighash
            }
            TxBuildError::MalformedSignature => ErrorCode::SigningFailed,
            TxBuildError::SighashFailed => ErrorCode::Internal,
        };
        SignerError::new(code, e.to_string())
    }
}

/// Deterministic fee for a transaction shape at a given rate.
pub fn fee_for(input_count: usize, output_count: usize, fee_rate_sats_per_vbyte: u64) -> u64 {
    let vbytes =
        TX_BASE_VBYTES + input_count as u64 * INPUT_VBYTES + output_count as u64 * OUTPUT_VBYTES;
    vbytes * fee_rate_sats_per_vbyte
}

/// A previous output being spent.
#[derive(Debug, Clone)]
pub struct TxInput {
    pub outpoint: OutPoint,
    pub value_sats: u64,
    pub script_pubkey: ScriptBuf,
}

/// One output of the transaction under construction.
#[derive(Debug, Clone)]
pub enum TxOutput {
    /// Plain value-bearing output.
    Explicit {
        value_sats: u64,
        script_pubkey: ScriptBuf,
    },
    /// OP_RETURN data carrier; carries no value.
    Data { script_pubkey: ScriptBuf },
    /// Blinded output. The commitments are opaque to the builder and do
    /// not count toward explicit totals.
    Confidential {
        script_pubkey: ScriptBuf,
        asset_commitment: [u8; 33],
        value_commitment: [u8; 33],
    },
}

impl TxOutput {
    fn explicit_value(&self) -> u64 {
        match self {
            TxOutput::Explicit { value_sats, .. } => *value_sats,
            TxOutput::Data { .. } | TxOutput::Confidential { .. } => 0,
        }
    }
}

/// A per-input digest the engine must sign, tagged with the scheme the
/// input script calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SighashEntry {
    pub hash: [u8; 32],
    pub input_index: usize,
    pub scheme: SignatureScheme,
}

/// Serialized transaction with its identifier and settled amounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedTransaction {
    pub raw_hex: String,
    pub txid: String,
    pub fee_sats: u64,
    pub total_input_sats: u64,
    pub total_output_sats: u64,
}

/// Transaction under construction.
#[derive(Debug, Clone)]
pub struct TxBuilder {
    network: Network,
    inputs: Vec<TxInput>,
    outputs: Vec<TxOutput>,
    witnesses: Vec<Option<Witness>>,
    next_to_sign: usize,
    reserved_fee: Option<u64>,
    finalized: bool,
}

impl TxBuilder {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            inputs: Vec::new(),
            outputs: Vec::new(),
            witnesses: Vec::new(),
            next_to_sign: 0,
            reserved_fee: None,
            finalized: false,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn inputs(&self) -> &[TxInput] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TxOutput] {
        &self.outputs
    }

    pub fn total_input_sats(&self) -> u64 {
        self.inputs.iter().map(|i| i.value_sats).sum()
    }

    /// Sum of explicit output values. Data and confidential outputs
    /// contribute nothing.
    pub fn total_output_sats(&self) -> u64 {
        self.outputs.iter().map(TxOutput::explicit_value).sum()
    }

    /// Fee for the current shape at `fee_rate_sats_per_vbyte`.
    pub fn estimate_fee(&self, fee_rate_sats_per_vbyte: u64) -> u64 {
        fee_for(self.inputs.len(), self.outputs.len(), fee_rate_sats_per_vbyte)
    }

    fn check_mutable(&self) -> Result<(), TxBuildError> {
        if self.finalized {
            return Err(TxBuildError::TransactionFinalized);
        }
        Ok(())
    }

    /// Add an outpoint to spend.
    pub fn add_input(
        &mut self,
        txid: &str,
        vout: u32,
        value_sats: u64,
        script_pubkey: ScriptBuf,
    ) -> Result<(), TxBuildError> {
        self.check_mutable()?;
        let txid = Txid::from_str(txid).map_err(|_| TxBuildError::InvalidTxid)?;
        self.inputs.push(TxInput {
            outpoint: OutPoint::new(txid, vout),
            value_sats,
            script_pubkey,
        });
        self.witnesses.push(None);
        Ok(())
    }

    /// Pay `value_sats` to `address`. The address must parse for the
    /// builder's network; sub-dust values are rejected.
    pub fn add_output(&mut self, address: &str, value_sats: u64) -> Result<(), TxBuildError> {
        self.check_mutable()?;
        if value_sats < DUST_THRESHOLD_SATS {
            return Err(TxBuildError::DustOutput(value_sats));
        }
        let script_pubkey = self.parse_address(address)?.script_pubkey();
        self.outputs.push(TxOutput::Explicit {
            value_sats,
            script_pubkey,
        });
        Ok(())
    }

    /// Embed up to 80 bytes of data in an OP_RETURN output.
    pub fn add_data_output(&mut self, payload: &[u8]) -> Result<(), TxBuildError> {
        self.check_mutable()?;
        if payload.len() > MAX_DATA_CARRIER_BYTES {
            return Err(TxBuildError::DataCarrierTooLarge(payload.len()));
        }
        let push = PushBytesBuf::try_from(payload.to_vec())
            .map_err(|_| TxBuildError::DataCarrierTooLarge(payload.len()))?;
        self.outputs.push(TxOutput::Data {
            script_pubkey: ScriptBuf::new_op_return(&push),
        });
        Ok(())
    }

    /// Add a blinded output carrying precomputed commitments. The builder
    /// performs no arithmetic on them.
    pub fn add_confidential_output(
        &mut self,
        script_pubkey: ScriptBuf,
        asset_commitment: [u8; 33],
        value_commitment: [u8; 33],
    ) -> Result<(), TxBuildError> {
        self.check_mutable()?;
        self.outputs.push(TxOutput::Confidential {
            script_pubkey,
            asset_commitment,
            value_commitment,
        });
        Ok(())
    }

    /// Route the remainder after fee to `address` and return the fee that
    /// was reserved. A remainder below the dust threshold is folded into
    /// the fee instead of creating an uneconomical output.
    pub fn apply_change(
        &mut self,
        address: &str,
        fee_rate_sats_per_vbyte: u64,
    ) -> Result<u64, TxBuildError> {
        self.check_mutable()?;
        let script_pubkey = self.parse_address(address)?.script_pubkey();

        let total_in = self.total_input_sats();
        let total_out = self.total_output_sats();

        let fee_with_change =
            fee_for(self.inputs.len(), self.outputs.len() + 1, fee_rate_sats_per_vbyte);
        let remainder = total_in
            .checked_sub(total_out)
            .and_then(|r| r.checked_sub(fee_with_change));

        let fee = match remainder {
            Some(r) if r >= DUST_THRESHOLD_SATS => {
                self.outputs.push(TxOutput::Explicit {
                    value_sats: r,
                    script_pubkey,
                });
                fee_with_change
            }
            _ => {
                // Remainder is dust (or the change output itself is
                // unaffordable): everything above the outputs goes to fee.
                let fee_floor =
                    fee_for(self.inputs.len(), self.outputs.len(), fee_rate_sats_per_vbyte);
                let spare = total_in.checked_sub(total_out).unwrap_or(0);
                if spare < fee_floor {
                    return Err(TxBuildError::InsufficientFunds {
                        available: total_in,
                        required: total_out + fee_floor,
                    });
                }
                spare
            }
        };

        self.reserved_fee = Some(fee);
        Ok(fee)
    }

    /// Per-input signing digests for a key, in ascending input order.
    ///
    /// P2WPKH inputs get the segwit-v0 all-outputs digest; P2TR inputs get
    /// the key-spend digest over all prevouts with the default hash type.
    /// Transactions carrying confidential outputs have no layer-1 digest.
    pub fn sighashes_for(&self, public_key: &PublicKey) -> Result<Vec<SighashEntry>, TxBuildError> {
        if self.has_confidential_output() {
            return Err(TxBuildError::UnsupportedSighash);
        }

        let secp = Secp256k1::new();
        let compressed = CompressedPublicKey::try_from(BitcoinPublicKey::from(*public_key))
            .map_err(|_| TxBuildError::SighashFailed)?;
        let segwit_script = ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash());
        let taproot_script =
            ScriptBuf::new_p2tr(&secp, public_key.x_only_public_key().0, None);

        let prevouts: Vec<TxOut> = self
            .inputs
            .iter()
            .map(|i| TxOut {
                value: Amount::from_sat(i.value_sats),
                script_pubkey: i.script_pubkey.clone(),
            })
            .collect();

        let mut tx = self.to_transaction(false)?;
        let mut cache = SighashCache::new(&mut tx);

        let mut entries = Vec::with_capacity(self.inputs.len());
        for (index, input) in self.inputs.iter().enumerate() {
            if input.script_pubkey == segwit_script {
                let sighash = cache
                    .p2wpkh_signature_hash(
                        index,
                        &input.script_pubkey,
                        Amount::from_sat(input.value_sats),
                        EcdsaSighashType::All,
                    )
                    .map_err(|_| TxBuildError::SighashFailed)?;
                entries.push(SighashEntry {
                    hash: sighash.to_byte_array(),
                    input_index: index,
                    scheme: SignatureScheme::Ecdsa,
                });
            } else if input.script_pubkey == taproot_script {
                let sighash = cache
                    .taproot_key_spend_signature_hash(
                        index,
                        &Prevouts::All(&prevouts),
                        TapSighashType::Default,
                    )
                    .map_err(|_| TxBuildError::SighashFailed)?;
                entries.push(SighashEntry {
                    hash: sighash.to_byte_array(),
                    input_index: index,
                    scheme: SignatureScheme::Schnorr,
                });
            } else {
                return Err(TxBuildError::UnspendableInput(index));
            }
        }
        Ok(entries)
    }

    /// Attach the signature for one input. Signatures must arrive in
    /// strict input order (0, 1, 2, …).
    ///
    /// For P2WPKH inputs `sig_bytes` is the DER-encoded ECDSA signature
    /// (the sighash-type byte is appended here); for P2TR key spends it is
    /// the 64-byte Schnorr signature.
    pub fn attach_signature(
        &mut self,
        input_index: usize,
        sig_bytes: &[u8],
        pubkey_bytes: &[u8],
    ) -> Result<(), TxBuildError> {
        self.check_mutable()?;
        if input_index != self.next_to_sign || input_index >= self.inputs.len() {
            return Err(TxBuildError::SignatureOutOfOrder {
                expected: self.next_to_sign,
                got: input_index,
            });
        }

        let script = &self.inputs[input_index].script_pubkey;
        let mut witness = Witness::new();
        if script.is_p2wpkh() {
            if sig_bytes.len() < 8 || sig_bytes.len() > 72 || pubkey_bytes.len() != 33 {
                return Err(TxBuildError::MalformedSignature);
            }
            let mut sig = sig_bytes.to_vec();
            sig.push(EcdsaSighashType::All as u8);
            witness.push(sig);
            witness.push(pubkey_bytes);
        } else if script.is_p2tr() {
            if sig_bytes.len() != 64 {
                return Err(TxBuildError::MalformedSignature);
            }
            // Default hash type carries no trailing type byte.
            witness.push(sig_bytes);
        } else {
            return Err(TxBuildError::UnspendableInput(input_index));
        }

        self.witnesses[input_index] = Some(witness);
        self.next_to_sign += 1;
        Ok(())
    }

    /// Serialize the fully signed transaction.
    ///
    /// Requires every input signed and total conservation
    /// `totalInput = totalExplicitOutput + fee`. The builder is sealed
    /// afterwards.
    pub fn finalize(&mut self) -> Result<FinalizedTransaction, TxBuildError> {
        self.check_mutable()?;
        for (index, witness) in self.witnesses.iter().enumerate() {
            if witness.is_none() {
                return Err(TxBuildError::MissingSignature(index));
            }
        }

        let total_in = self.total_input_sats();
        let total_out = self.total_output_sats();
        let fee_floor = self.reserved_fee.unwrap_or(0);
        if total_in < total_out + fee_floor {
            return Err(TxBuildError::InsufficientFunds {
                available: total_in,
                required: total_out + fee_floor,
            });
        }
        let fee = total_in - total_out;

        let (bytes, txid) = if self.has_confidential_output() {
            let stripped = self.encode_confidential(false);
            let mut id = sha256d::Hash::hash(&stripped).to_byte_array();
            id.reverse();
            (self.encode_confidential(true), hex::encode(id))
        } else {
            let tx = self.to_transaction(true)?;
            (encode::serialize(&tx), tx.compute_txid().to_string())
        };

        self.finalized = true;
        Ok(FinalizedTransaction {
            raw_hex: hex::encode(bytes),
            txid,
            fee_sats: fee,
            total_input_sats: total_in,
            total_output_sats: total_out,
        })
    }

    pub fn has_confidential_output(&self) -> bool {
        self.outputs
            .iter()
            .any(|o| matches!(o, TxOutput::Confidential { .. }))
    }

    fn parse_address(&self, address: &str) -> Result<Address, TxBuildError> {
        Address::from_str(address)
            .map_err(|_| TxBuildError::InvalidAddress)?
            .require_network(self.network)
            .map_err(|_| TxBuildError::InvalidAddress)
    }

    /// Consensus `Transaction` with explicit outputs only.
    fn to_transaction(&self, with_witness: bool) -> Result<Transaction, TxBuildError> {
        let mut input = Vec::with_capacity(self.inputs.len());
        for (index, txin) in self.inputs.iter().enumerate() {
            let witness = if with_witness {
                self.witnesses[index].clone().unwrap_or_default()
            } else {
                Witness::default()
            };
            input.push(TxIn {
                previous_output: txin.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness,
            });
        }

        let mut output = Vec::with_capacity(self.outputs.len());
        for out in &self.outputs {
            match out {
                TxOutput::Explicit {
                    value_sats,
                    script_pubkey,
                } => output.push(TxOut {
                    value: Amount::from_sat(*value_sats),
                    script_pubkey: script_pubkey.clone(),
                }),
                TxOutput::Data { script_pubkey } => output.push(TxOut {
                    value: Amount::ZERO,
                    script_pubkey: script_pubkey.clone(),
                }),
                TxOutput::Confidential { .. } => return Err(TxBuildError::UnsupportedSighash),
            }
        }

        Ok(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output,
        })
    }

    /// Confidential envelope: explicit header and inputs, outputs laid out
    /// as asset ‖ value ‖ nil nonce ‖ script. The txid covers the
    /// witness-stripped form.
    fn encode_confidential(&self, include_witness: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u32.to_le_bytes());

        push_compact_size(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            buf.extend_from_slice(&input.outpoint.txid.to_byte_array());
            buf.extend_from_slice(&input.outpoint.vout.to_le_bytes());
            buf.push(0x00);
            buf.extend_from_slice(
                &Sequence::ENABLE_RBF_NO_LOCKTIME.to_consensus_u32().to_le_bytes(),
            );
        }

        push_compact_size(&mut buf, self.outputs.len() as u64);
        for out in &self.outputs {
            match out {
                TxOutput::Confidential {
                    script_pubkey,
                    asset_commitment,
                    value_commitment,
                } => {
                    buf.extend_from_slice(asset_commitment);
                    buf.extend_from_slice(value_commitment);
                    buf.push(0x00);
                    push_script(&mut buf, script_pubkey);
                }
                TxOutput::Explicit {
                    value_sats,
                    script_pubkey,
                } => {
                    push_explicit_confidential(&mut buf, *value_sats, script_pubkey);
                }
                TxOutput::Data { script_pubkey } => {
                    push_explicit_confidential(&mut buf, 0, script_pubkey);
                }
            }
        }

        buf.extend_from_slice(&0u32.to_le_bytes());

        if include_witness {
            for witness in &self.witnesses {
                let witness = witness.clone().unwrap_or_default();
                push_compact_size(&mut buf, witness.len() as u64);
                for item in witness.iter() {
                    push_compact_size(&mut buf, item.len() as u64);
                    buf.extend_from_slice(item);
                }
            }
        }
        buf
    }
}

fn push_compact_size(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

fn push_script(buf: &mut Vec<u8>, script: &ScriptBuf) {
    push_compact_size(buf, script.len() as u64);
    buf.extend_from_slice(script.as_bytes());
}

/// Unblinded output in the confidential layout: nil asset, explicit
/// big-endian value, nil nonce.
fn push_explicit_confidential(buf: &mut Vec<u8>, value_sats: u64, script: &ScriptBuf) {
    buf.push(0x00);
    buf.push(0x01);
    buf.extend_from_slice(&value_sats.to_be_bytes());
    buf.push(0x00);
    push_script(buf, script);
}

// =============================================================================
// Entry Point
// =============================================================================

/// A spendable coin offered to [`build_transaction`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub value_sats: u64,
    /// Hex script of the output being spent
    pub script_pubkey: String,
}

/// A payment requested from [`build_transaction`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub address: String,
    pub value_sats: u64,
}

/// Builder pre-loaded with coins and payments.
///
/// Funds are checked against the payments plus the estimated fee at
/// `fee_rate` so impossible spends fail here rather than at finalize.
/// Change and fee reservation stay explicit via [`TxBuilder::apply_change`].
pub fn build_transaction(
    network: Network,
    utxos: &[Utxo],
    recipients: &[Recipient],
    fee_rate: u64,
) -> Result<TxBuilder, TxBuildError> {
    let mut builder = TxBuilder::new(network);

    for utxo in utxos {
        let script = ScriptBuf::from_hex(&utxo.script_pubkey)
            .map_err(|_| TxBuildError::UnspendableInput(builder.inputs().len()))?;
        builder.add_input(&utxo.txid, utxo.vout, utxo.value_sats, script)?;
    }
    for recipient in recipients {
        builder.add_output(&recipient.address, recipient.value_sats)?;
    }

    let required = builder
        .total_output_sats()
        .saturating_add(builder.estimate_fee(fee_rate));
    if builder.total_input_sats() < required {
        return Err(TxBuildError::InsufficientFunds {
            available: builder.total_input_sats(),
            required,
        });
    }

    Ok(builder)
}
