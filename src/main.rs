//! Command-line inspection tool for the signing backend.
//!
//! Covers the offline subset: phrase generation, per-layer key and address
//! inspection, message signing and verification, and fee estimation.
//! Anything that needs the vault or the confirmation and integrity gates
//! goes through the library engine instead.

use anyhow::{anyhow, Result};
use bip39::Mnemonic;
use bitcoin::Network;
use clap::{Parser, Subcommand};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::json;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use sovereign_signer::crypto::{schnorr_sign, SchnorrSigner};
use sovereign_signer::keys::{segwit_address, taproot_address};
use sovereign_signer::tx::{fee_for, INPUT_VBYTES, OUTPUT_VBYTES, TX_BASE_VBYTES};
use sovereign_signer::{derive_child, path_for, seed_from_recovery_phrase, Layer, SignatureScheme};

#[derive(Parser, Debug)]
#[clap(
    name = "sovereign-signer",
    version,
    about = "Inspection tool for the layered signing backend"
)]
struct Cli {
    /// Enable debug logging on stderr.
    #[clap(long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a fresh 12-word recovery phrase and its first addresses.
    Generate,

    /// Derive the key and address for a layer and account.
    Derive(DeriveArgs),

    /// Sign a message with a derived key (BIP-340 over SHA-256 of the message).
    SignMessage(SignMessageArgs),

    /// Verify a signature produced by `sign-message`.
    Verify(VerifyArgs),

    /// Estimate the fee for a transaction shape at a given fee rate.
    EstimateFee(EstimateFeeArgs),
}

#[derive(Parser, Debug)]
struct DeriveArgs {
    /// Recovery phrase (quoted).
    #[clap(long)]
    phrase: String,

    /// Layer name: bitcoin, taproot, lightning, liquid, statechain.
    /// Unknown names fall back to bitcoin.
    #[clap(long, default_value = "bitcoin")]
    layer: String,

    /// Hardened account index.
    #[clap(long, default_value = "0")]
    account: u32,

    /// Optional BIP-39 passphrase.
    #[clap(long, default_value = "")]
    passphrase: String,

    /// Emit JSON instead of text.
    #[clap(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct SignMessageArgs {
    /// Recovery phrase (quoted).
    #[clap(long)]
    phrase: String,

    /// Layer whose key signs the message.
    #[clap(long, default_value = "taproot")]
    layer: String,

    /// Hardened account index.
    #[clap(long, default_value = "0")]
    account: u32,

    /// Message text to sign.
    #[clap(long)]
    message: String,
}

#[derive(Parser, Debug)]
struct VerifyArgs {
    /// X-only public key, 64 hex characters.
    #[clap(long)]
    public_key: String,

    /// Message text the signature covers.
    #[clap(long)]
    message: String,

    /// Schnorr signature, 128 hex characters.
    #[clap(long)]
    signature: String,
}

#[derive(Parser, Debug)]
struct EstimateFeeArgs {
    /// Number of transaction inputs.
    #[clap(long)]
    inputs: usize,

    /// Number of transaction outputs.
    #[clap(long)]
    outputs: usize,

    /// Fee rate in sats per vbyte.
    #[clap(long, default_value = "1")]
    rate: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        sovereign_signer::logging::enable_debug();
    }

    match cli.command {
        Commands::Generate => run_generate(),
        Commands::Derive(args) => run_derive(args),
        Commands::SignMessage(args) => run_sign_message(args),
        Commands::Verify(args) => run_verify(args),
        Commands::EstimateFee(args) => run_estimate_fee(args),
    }
}

fn run_generate() -> Result<()> {
    let mut entropy = Zeroizing::new([0u8; 16]); // 128 bits = 12 words
    OsRng.fill_bytes(entropy.as_mut());

    let mnemonic = Mnemonic::from_entropy(entropy.as_ref())?;
    let phrase = mnemonic.to_string();

    let seed = seed_from_recovery_phrase(&phrase, "")?;

    let segwit_pair = derive_child(&seed, &path_for(Layer::Bitcoin, 0)?)?;
    let taproot_pair = derive_child(&seed, &path_for(Layer::Taproot, 0)?)?;

    println!("Recovery phrase: {}", phrase);
    println!("First addresses:");
    println!(
        "  bitcoin    {}",
        segwit_address(&segwit_pair.public_key(), Network::Bitcoin)?
    );
    println!(
        "  taproot    {}",
        taproot_address(taproot_pair.x_only_public_key(), Network::Bitcoin)
    );
    Ok(())
}

fn run_derive(args: DeriveArgs) -> Result<()> {
    let layer = Layer::parse_lossy(&args.layer);
    let seed = seed_from_recovery_phrase(&args.phrase, &args.passphrase)?;
    let path = path_for(layer, args.account)?;
    let pair = derive_child(&seed, &path)?;

    let address = match layer.signature_scheme() {
        SignatureScheme::Ecdsa if layer == Layer::Bitcoin => {
            Some(segwit_address(&pair.public_key(), Network::Bitcoin)?.to_string())
        }
        SignatureScheme::Schnorr => {
            Some(taproot_address(pair.x_only_public_key(), Network::Bitcoin).to_string())
        }
        // Lightning node keys and Liquid confidential addresses have no
        // plain on-chain rendering here.
        SignatureScheme::Ecdsa => None,
    };

    if args.json {
        let payload = json!({
            "layer": layer.to_string(),
            "account": args.account,
            "path": path.to_string(),
            "public_key": hex::encode(pair.public_key().serialize()),
            "x_only_public_key": hex::encode(pair.x_only_public_key().serialize()),
            "address": address,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("Layer:       {}", layer);
        println!("Path:        {}", path);
        println!(
            "Public key:  {}",
            hex::encode(pair.public_key().serialize())
        );
        println!(
            "X-only key:  {}",
            hex::encode(pair.x_only_public_key().serialize())
        );
        if let Some(address) = address {
            println!("Address:     {}", address);
        }
    }
    Ok(())
}

fn run_sign_message(args: SignMessageArgs) -> Result<()> {
    let layer = Layer::parse_lossy(&args.layer);
    let seed = seed_from_recovery_phrase(&args.phrase, "")?;
    let path = path_for(layer, args.account)?;
    let pair = derive_child(&seed, &path)?;

    let digest: [u8; 32] = Sha256::digest(args.message.as_bytes()).into();
    let secret_key = pair.secret_key()?;
    let signature = schnorr_sign(&digest, &secret_key);

    println!("Layer:      {}", layer);
    println!("Public key: {}", hex::encode(pair.x_only_public_key().serialize()));
    println!("Signature:  {}", hex::encode(signature));
    Ok(())
}

fn run_verify(args: VerifyArgs) -> Result<()> {
    let key_bytes = hex::decode(&args.public_key)?;
    let public_key = bitcoin::secp256k1::XOnlyPublicKey::from_slice(&key_bytes)
        .map_err(|e| anyhow!("invalid public key: {}", e))?;

    let sig_bytes = hex::decode(&args.signature)?;
    let signature: [u8; 64] = sig_bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("signature must be 64 bytes, got {}", sig_bytes.len()))?;

    let digest: [u8; 32] = Sha256::digest(args.message.as_bytes()).into();

    if SchnorrSigner::new().verify(&signature, &digest, &public_key) {
        println!("Signature valid");
        Ok(())
    } else {
        Err(anyhow!("signature verification failed"))
    }
}

fn run_estimate_fee(args: EstimateFeeArgs) -> Result<()> {
    let vbytes = TX_BASE_VBYTES
        + args.inputs as u64 * INPUT_VBYTES
        + args.outputs as u64 * OUTPUT_VBYTES;
    let fee = fee_for(args.inputs, args.outputs, args.rate);

    println!("Estimated vbytes: {}", vbytes);
    println!("Fee at {} sat/vB: {} sats", args.rate, fee);
    Ok(())
}
