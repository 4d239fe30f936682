//! Signing Orchestrator
//!
//! Drives every signature request through an explicit state machine:
//! confirmation and integrity gates first, then key derivation and signing
//! offloaded to the execution context. Secret material exists only inside
//! the signing job and is wiped on every exit path.

pub mod worker;

pub use worker::{
    default_context, ExecutionContext, InlineContext, Job, JobReply, JobTicket, SignOutcome,
    WorkerContext,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::secp256k1::{Keypair, Message, PublicKey, Secp256k1};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::crypto::{key_spend_keypair, schnorr_sign, SchnorrSigner};
use crate::error::{ErrorCode, SignerError, SignerResult};
use crate::events::{EngineEvent, EventSink, LogSink};
use crate::keys::DerivationCache;
use crate::policy::{self, DerivationPath};
use crate::secrets::{MasterSecret, UnlockCredential, WipeGuard};
use crate::tx::{SighashEntry, TxBuilder};
use crate::types::{Layer, RequestKind, SignRequest, SignResult, SignatureScheme, SigningState};
use crate::vault::SecretVault;
use crate::{log_debug, log_warn};

/// Transactions moving more than this many sats require a device
/// integrity verdict before any key material is touched.
pub const DEFAULT_HIGH_VALUE_THRESHOLD_SATS: u64 = 10_000_000;

/// Upper bound on waiting for the integrity verdict. Expiry fails closed.
pub const INTEGRITY_TIMEOUT: Duration = Duration::from_secs(8);

// =============================================================================
// Collaborator Interfaces
// =============================================================================

/// User approval surface.
///
/// The engine sends the request description; the application resolves the
/// receiver with the user's decision. A dropped sender counts as a decline.
pub trait ConfirmationGate: Send + Sync {
    fn request_confirmation(&self, description: &str) -> oneshot::Receiver<bool>;
}

/// Device attestation surface consulted before high-value spends
pub trait IntegrityGate: Send + Sync {
    fn check_high_value_safety(&self) -> oneshot::Receiver<bool>;
}

/// Failures surfaced by a hardware-backed signer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnclaveError {
    #[error("no enclave session is available")]
    SessionUnavailable,
    #[error("the enclave rejected the signing request")]
    Rejected,
    #[error("the enclave returned a malformed signature")]
    MalformedSignature,
}

impl From<EnclaveError> for SignerError {
    fn from(e: EnclaveError) -> Self {
        SignerError::new(ErrorCode::EnclaveUnavailable, e.to_string())
    }
}

/// Hardware-backed signer, present on platforms that provide one.
///
/// The enclave owns its copy of the key material: `public_key` must match
/// what software derivation produces for the same path, and Taproot entries
/// get the key-path tweak applied inside the enclave.
pub trait EnclaveSigner: Send + Sync {
    fn public_key(&self, path: &DerivationPath) -> Result<PublicKey, EnclaveError>;

    fn sign(
        &self,
        path: &DerivationPath,
        digest: &[u8; 32],
        scheme: SignatureScheme,
        credential: Option<&UnlockCredential>,
    ) -> Result<Vec<u8>, EnclaveError>;
}

// =============================================================================
// Attempt Plan
// =============================================================================

/// One rung of the signing attempt plan.
///
/// The plan is a fixed array, never rebuilt mid-flight: with an enclave
/// configured it is session, then session-with-credential, then software;
/// without one it is software alone. Each rung runs at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAttempt {
    EnclaveSession,
    EnclaveWithCredential,
    Software,
}

/// What one rung produced
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Signature material; the ladder stops here
    Signed(SignOutcome),
    /// Recoverable rung failure; the ladder continues
    Retry(SignerError),
    /// Terminal failure; the ladder stops without fallback
    Fatal(SignerError),
}

const ENCLAVE_PLAN: &[SigningAttempt] = &[
    SigningAttempt::EnclaveSession,
    SigningAttempt::EnclaveWithCredential,
    SigningAttempt::Software,
];

const SOFTWARE_PLAN: &[SigningAttempt] = &[SigningAttempt::Software];

// =============================================================================
// Engine
// =============================================================================

/// The signing orchestrator.
///
/// Shared-state surface is intentionally small: the derivation cache (its
/// own lock) and the request id counter. Everything else per request is a
/// pure function of the request, so one engine serves concurrent tasks.
pub struct SigningEngine {
    vault: Arc<dyn SecretVault>,
    confirmation: Arc<dyn ConfirmationGate>,
    integrity: Arc<dyn IntegrityGate>,
    enclave: Option<Arc<dyn EnclaveSigner>>,
    context: Box<dyn ExecutionContext>,
    events: Arc<dyn EventSink>,
    cache: Arc<DerivationCache>,
    high_value_threshold: u64,
    next_request_id: AtomicU64,
}

/// Configures a [`SigningEngine`]. Vault and both gates are mandatory;
/// everything else has a production default.
pub struct SigningEngineBuilder {
    vault: Arc<dyn SecretVault>,
    confirmation: Arc<dyn ConfirmationGate>,
    integrity: Arc<dyn IntegrityGate>,
    enclave: Option<Arc<dyn EnclaveSigner>>,
    context: Option<Box<dyn ExecutionContext>>,
    events: Option<Arc<dyn EventSink>>,
    high_value_threshold: u64,
}

impl SigningEngineBuilder {
    pub fn with_enclave(mut self, enclave: Arc<dyn EnclaveSigner>) -> Self {
        self.enclave = Some(enclave);
        self
    }

    pub fn with_context(mut self, context: Box<dyn ExecutionContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_high_value_threshold(mut self, sats: u64) -> Self {
        self.high_value_threshold = sats;
        self
    }

    pub fn build(self) -> SigningEngine {
        SigningEngine {
            vault: self.vault,
            confirmation: self.confirmation,
            integrity: self.integrity,
            enclave: self.enclave,
            context: self.context.unwrap_or_else(default_context),
            events: self.events.unwrap_or_else(|| Arc::new(LogSink)),
            cache: Arc::new(DerivationCache::new()),
            high_value_threshold: self.high_value_threshold,
            next_request_id: AtomicU64::new(1),
        }
    }
}

impl SigningEngine {
    pub fn builder(
        vault: Arc<dyn SecretVault>,
        confirmation: Arc<dyn ConfirmationGate>,
        integrity: Arc<dyn IntegrityGate>,
    ) -> SigningEngineBuilder {
        SigningEngineBuilder {
            vault,
            confirmation,
            integrity,
            enclave: None,
            context: None,
            events: None,
            high_value_threshold: DEFAULT_HIGH_VALUE_THRESHOLD_SATS,
        }
    }

    /// Forget every cached key and wipe the stored copies. Derivation
    /// results are unaffected; only the next lookup pays the cost again.
    pub fn clear_derivation_cache(&self) {
        self.cache.clear_and_wipe();
    }

    pub fn cached_key_count(&self) -> usize {
        self.cache.len()
    }

    /// Drive one request through the state machine to a signature.
    ///
    /// Message, Event, and Proof kinds suspend on user confirmation;
    /// Transaction kinds above the high-value threshold suspend on the
    /// device integrity verdict. Derivation and signing then run on the
    /// execution context.
    pub async fn request_signature(
        &self,
        request: SignRequest,
        credential: UnlockCredential,
    ) -> SignerResult<SignResult> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let layer = request.layer;
        let kind_name = request.kind.name();

        log_debug!(
            "engine",
            "Signing request accepted",
            request = request_id,
            layer = layer,
            kind = kind_name,
        );

        let mut state = SigningState::Idle;
        let mut pending = Some(request);
        let mut ticket: Option<JobTicket> = None;
        let mut signed: Option<SignOutcome> = None;
        let mut failure: Option<SignerError> = None;

        while !state.is_terminal() {
            let next = match state {
                SigningState::Idle => match pending.as_ref() {
                    Some(req) if req.kind.needs_user_confirmation() => {
                        SigningState::AwaitingUserConfirmation
                    }
                    Some(req) if self.is_high_value(req) => {
                        SigningState::AwaitingDeviceIntegrity
                    }
                    Some(_) => SigningState::DerivingKey,
                    None => {
                        failure = Some(SignerError::internal("Request consumed before start"));
                        SigningState::Failed
                    }
                },

                SigningState::AwaitingUserConfirmation => {
                    let description = pending
                        .as_ref()
                        .map(|req| req.description.clone())
                        .unwrap_or_default();
                    match self.await_confirmation(&description).await {
                        Ok(()) => SigningState::DerivingKey,
                        Err(e) => {
                            failure = Some(e);
                            SigningState::Failed
                        }
                    }
                }

                SigningState::AwaitingDeviceIntegrity => {
                    match self.await_integrity().await {
                        Ok(()) => SigningState::DerivingKey,
                        Err(e) => {
                            failure = Some(e);
                            SigningState::Failed
                        }
                    }
                }

                SigningState::DerivingKey => match pending.take() {
                    Some(req) => match self.submit_signing_job(req, credential.clone()) {
                        Ok(t) => {
                            ticket = Some(t);
                            SigningState::Signing
                        }
                        Err(e) => {
                            failure = Some(e);
                            SigningState::Failed
                        }
                    },
                    None => {
                        failure = Some(SignerError::internal("Request consumed twice"));
                        SigningState::Failed
                    }
                },

                SigningState::Signing => match ticket.take() {
                    Some(t) => match t.reply.await {
                        Ok(reply) => match reply.output {
                            Ok(outcome) => {
                                signed = Some(outcome);
                                SigningState::Done
                            }
                            Err(e) => {
                                failure = Some(e);
                                SigningState::Failed
                            }
                        },
                        Err(_) => {
                            failure = Some(SignerError::new(
                                ErrorCode::WorkerFailure,
                                "Signing worker dropped the reply",
                            ));
                            SigningState::Failed
                        }
                    },
                    None => {
                        failure = Some(SignerError::internal("Signing reached without a job"));
                        SigningState::Failed
                    }
                },

                // Terminal states never re-enter the loop.
                SigningState::Done | SigningState::Failed => break,
            };
            self.transition(request_id, &mut state, next);
        }

        match (signed, failure) {
            (Some(outcome), None) => {
                let result = format_result(outcome);
                self.events.emit(EngineEvent::Completed {
                    request_id,
                    layer,
                    kind: kind_name,
                });
                Ok(result)
            }
            (_, Some(err)) => {
                self.events.emit(EngineEvent::Failed {
                    request_id,
                    code: err.code,
                });
                Err(err)
            }
            (None, None) => {
                let err = SignerError::internal("State machine finished without an outcome");
                self.events.emit(EngineEvent::Failed {
                    request_id,
                    code: err.code,
                });
                Err(err)
            }
        }
    }

    fn transition(&self, request_id: u64, state: &mut SigningState, next: SigningState) {
        self.events.emit(EngineEvent::StateChanged {
            request_id,
            from: *state,
            to: next,
        });
        *state = next;
    }

    fn is_high_value(&self, request: &SignRequest) -> bool {
        match &request.kind {
            RequestKind::Transaction { amount_sats, .. } => {
                *amount_sats > self.high_value_threshold
            }
            _ => false,
        }
    }

    async fn await_confirmation(&self, description: &str) -> SignerResult<()> {
        let receiver = self.confirmation.request_confirmation(description);
        match receiver.await {
            Ok(true) => Ok(()),
            // Declined, or the application dropped the prompt.
            _ => Err(SignerError::user_declined()),
        }
    }

    async fn await_integrity(&self) -> SignerResult<()> {
        let receiver = self.integrity.check_high_value_safety();
        match timeout(INTEGRITY_TIMEOUT, receiver).await {
            Ok(Ok(true)) => Ok(()),
            // Timeout, dropped sender, and refusal all fail closed.
            _ => Err(SignerError::integrity_failed()),
        }
    }

    fn submit_signing_job(
        &self,
        request: SignRequest,
        credential: UnlockCredential,
    ) -> SignerResult<JobTicket> {
        let path = resolve_path(&request)?;
        let kind = request.kind;

        let vault = Arc::clone(&self.vault);
        let cache = Arc::clone(&self.cache);
        let enclave = self.enclave.clone();

        let job: Job = Box::new(move || {
            run_attempt_plan(
                vault.as_ref(),
                &credential,
                cache.as_ref(),
                enclave.as_deref(),
                &path,
                kind,
            )
        });

        Ok(self.context.submit(job))
    }
}

/// Map a request to the derivation path its key lives at.
///
/// Statechain requests with a transfer index resolve to the rotated slot;
/// everything else uses the layer's account path.
fn resolve_path(request: &SignRequest) -> SignerResult<DerivationPath> {
    match (request.layer, request.transfer_index) {
        (Layer::Statechain, Some(transfer)) => {
            Ok(policy::statechain_path(request.account, transfer)?)
        }
        _ => Ok(policy::path_for(request.layer, request.account)?),
    }
}

fn format_result(outcome: SignOutcome) -> SignResult {
    SignResult::new(
        hex::encode(&outcome.signature),
        hex::encode(outcome.public_key.serialize()),
        outcome.finalized.map(|f| f.raw_hex),
    )
}

// =============================================================================
// Attempt Execution
// =============================================================================

fn run_attempt_plan(
    vault: &dyn SecretVault,
    credential: &UnlockCredential,
    cache: &DerivationCache,
    enclave: Option<&dyn EnclaveSigner>,
    path: &DerivationPath,
    kind: RequestKind,
) -> SignerResult<SignOutcome> {
    let plan = match enclave {
        Some(_) => ENCLAVE_PLAN,
        None => SOFTWARE_PLAN,
    };

    let mut last_error: Option<SignerError> = None;

    for attempt in plan {
        let outcome = match (attempt, enclave) {
            (SigningAttempt::EnclaveSession, Some(enclave)) => {
                attempt_enclave(enclave, path, kind.clone(), None)
            }
            (SigningAttempt::EnclaveWithCredential, Some(enclave)) => {
                attempt_enclave(enclave, path, kind.clone(), Some(credential))
            }
            (SigningAttempt::Software, _) => {
                attempt_software(vault, credential, cache, path, kind.clone())
            }
            // An enclave rung can only be planned when an enclave exists.
            (_, None) => continue,
        };

        match outcome {
            AttemptOutcome::Signed(signed) => return Ok(signed),
            AttemptOutcome::Retry(err) => {
                log_warn!(
                    "engine",
                    "Signing attempt failed, falling through",
                    attempt = format!("{:?}", attempt),
                    code = format!("{:?}", err.code),
                );
                last_error = Some(err);
            }
            AttemptOutcome::Fatal(err) => return Err(err),
        }
    }

    Err(last_error
        .unwrap_or_else(|| SignerError::new(ErrorCode::EnclaveUnavailable, "No signing attempt ran")))
}

fn attempt_enclave(
    enclave: &dyn EnclaveSigner,
    path: &DerivationPath,
    kind: RequestKind,
    credential: Option<&UnlockCredential>,
) -> AttemptOutcome {
    match sign_with_enclave(enclave, path, kind, credential) {
        Ok(outcome) => AttemptOutcome::Signed(outcome),
        // Any enclave rung failure falls through to the next rung.
        Err(err) => AttemptOutcome::Retry(err),
    }
}

fn attempt_software(
    vault: &dyn SecretVault,
    credential: &UnlockCredential,
    cache: &DerivationCache,
    path: &DerivationPath,
    kind: RequestKind,
) -> AttemptOutcome {
    let mut secret = match vault.unlock(credential) {
        Ok(secret) => secret,
        Err(err) => return AttemptOutcome::Fatal(err),
    };

    match sign_with_secret(&mut secret, cache, path, kind) {
        Ok(outcome) => AttemptOutcome::Signed(outcome),
        Err(err) => AttemptOutcome::Fatal(err),
    }
}

fn sign_with_enclave(
    enclave: &dyn EnclaveSigner,
    path: &DerivationPath,
    kind: RequestKind,
    credential: Option<&UnlockCredential>,
) -> SignerResult<SignOutcome> {
    let public_key = enclave.public_key(path)?;

    match kind {
        RequestKind::Transaction { transaction, .. } => {
            sign_transaction_entries(transaction, public_key, |entry| {
                Ok(enclave.sign(path, &entry.hash, entry.scheme, credential)?)
            })
        }
        message => {
            let Some(digest) = message.signing_digest() else {
                return Err(SignerError::internal("Message request without a digest"));
            };
            let signature = enclave.sign(path, &digest, SignatureScheme::Schnorr, credential)?;
            Ok(SignOutcome {
                signature,
                public_key,
                finalized: None,
            })
        }
    }
}

/// Software signing path: derive through the cache and sign.
///
/// The caller's secret is held by a wipe guard for the whole call, so on
/// return or unwind `secret.is_wiped()` holds regardless of the result.
pub fn sign_with_secret(
    secret: &mut MasterSecret,
    cache: &DerivationCache,
    path: &DerivationPath,
    kind: RequestKind,
) -> SignerResult<SignOutcome> {
    let guard = WipeGuard::new(secret);
    let mut pair = cache.get_or_derive(&guard, path)?;

    let result = match kind {
        RequestKind::Transaction { transaction, .. } => {
            let public_key = pair.public_key();
            let secret_key = pair.secret_key()?;
            let secp = Secp256k1::new();
            let signer = SchnorrSigner::new();

            sign_transaction_entries(transaction, public_key, |entry| match entry.scheme {
                SignatureScheme::Ecdsa => {
                    let msg = Message::from_digest(entry.hash);
                    Ok(secp.sign_ecdsa(&msg, &secret_key).serialize_der().to_vec())
                }
                SignatureScheme::Schnorr => {
                    let keypair = Keypair::from_secret_key(&secp, &secret_key);
                    let tweaked = key_spend_keypair(&secp, &keypair, None);
                    Ok(signer.sign(&entry.hash, &tweaked).to_vec())
                }
            })
        }
        message => {
            let Some(digest) = message.signing_digest() else {
                return Err(SignerError::internal("Message request without a digest"));
            };
            let secret_key = pair.secret_key()?;
            Ok(SignOutcome {
                signature: schnorr_sign(&digest, &secret_key).to_vec(),
                public_key: pair.public_key(),
                finalized: None,
            })
        }
    };

    pair.wipe();
    result
}

/// Sign every sighash entry in ascending input order and finalize.
fn sign_transaction_entries<F>(
    mut builder: TxBuilder,
    public_key: PublicKey,
    mut sign_entry: F,
) -> SignerResult<SignOutcome>
where
    F: FnMut(&SighashEntry) -> SignerResult<Vec<u8>>,
{
    let entries = builder.sighashes_for(&public_key)?;
    if entries.is_empty() {
        return Err(SignerError::signing_failed("Transaction has no inputs to sign"));
    }

    let pubkey_bytes = public_key.serialize();
    let mut first_signature: Option<Vec<u8>> = None;

    for entry in &entries {
        let signature = sign_entry(entry)?;
        builder.attach_signature(entry.input_index, &signature, &pubkey_bytes)?;
        if first_signature.is_none() {
            first_signature = Some(signature);
        }
    }

    let finalized = builder.finalize()?;
    let Some(signature) = first_signature else {
        return Err(SignerError::signing_failed("No signature was produced"));
    };

    Ok(SignOutcome {
        signature,
        public_key,
        finalized: Some(finalized),
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use bitcoin::{Address, Network};
    use sha2::{Digest, Sha256};
    use std::str::FromStr;

    use crate::keys::{derive_child, seed_from_recovery_phrase};

    const TEST_PHRASE: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    const GOOD_CREDENTIAL: &str = "open-sesame";
    const OWNER_ADDR: &str = "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu";
    const DEST_ADDR: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
    const DUMMY_TXID: &str = "aabbccddeeff00112233445566778899aabbccddeeff00112233445566778899";

    fn test_seed_bytes() -> Vec<u8> {
        seed_from_recovery_phrase(TEST_PHRASE, "")
            .unwrap()
            .expose()
            .to_vec()
    }

    struct TestVault {
        seed: Vec<u8>,
        unlocks: AtomicUsize,
    }

    impl TestVault {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seed: test_seed_bytes(),
                unlocks: AtomicUsize::new(0),
            })
        }

        fn unlock_count(&self) -> usize {
            self.unlocks.load(Ordering::SeqCst)
        }
    }

    impl SecretVault for TestVault {
        fn unlock(&self, credential: &UnlockCredential) -> SignerResult<MasterSecret> {
            self.unlocks.fetch_add(1, Ordering::SeqCst);
            if credential.expose() == GOOD_CREDENTIAL {
                Ok(MasterSecret::from_bytes(&self.seed))
            } else {
                Err(SignerError::vault_locked())
            }
        }
    }

    /// Gate that answers immediately with a fixed verdict
    struct InstantGate {
        allow: bool,
    }

    impl ConfirmationGate for InstantGate {
        fn request_confirmation(&self, _description: &str) -> oneshot::Receiver<bool> {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(self.allow);
            rx
        }
    }

    impl IntegrityGate for InstantGate {
        fn check_high_value_safety(&self) -> oneshot::Receiver<bool> {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(self.allow);
            rx
        }
    }

    /// Gate whose sender is dropped without answering
    struct DroppedGate;

    impl ConfirmationGate for DroppedGate {
        fn request_confirmation(&self, _description: &str) -> oneshot::Receiver<bool> {
            oneshot::channel().1
        }
    }

    impl IntegrityGate for DroppedGate {
        fn check_high_value_safety(&self) -> oneshot::Receiver<bool> {
            oneshot::channel().1
        }
    }

    /// Gate that holds its sender open and never answers
    #[derive(Default)]
    struct StallingGate {
        held: Mutex<Vec<oneshot::Sender<bool>>>,
    }

    impl IntegrityGate for StallingGate {
        fn check_high_value_safety(&self) -> oneshot::Receiver<bool> {
            let (tx, rx) = oneshot::channel();
            self.held.lock().unwrap().push(tx);
            rx
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<EngineEvent>>,
    }

    impl RecordingSink {
        fn transitions(&self) -> Vec<(SigningState, SigningState)> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    EngineEvent::StateChanged { from, to, .. } => Some((*from, *to)),
                    _ => None,
                })
                .collect()
        }

        fn failure_code(&self) -> Option<ErrorCode> {
            self.events.lock().unwrap().iter().find_map(|e| match e {
                EngineEvent::Failed { code, .. } => Some(*code),
                _ => None,
            })
        }

        fn completed(&self) -> bool {
            self.events
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, EngineEvent::Completed { .. }))
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: EngineEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    /// Enclave backed by the same seed as the vault; fails a configured
    /// number of sign calls before succeeding.
    struct MockEnclave {
        seed: Vec<u8>,
        failures_before_success: usize,
        credential_per_call: Mutex<Vec<bool>>,
    }

    impl MockEnclave {
        fn new(failures_before_success: usize) -> Arc<Self> {
            Arc::new(Self {
                seed: test_seed_bytes(),
                failures_before_success,
                credential_per_call: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<bool> {
            self.credential_per_call.lock().unwrap().clone()
        }

        fn derive(&self, path: &DerivationPath) -> Result<crate::keys::KeyPair, EnclaveError> {
            let seed = MasterSecret::from_bytes(&self.seed);
            derive_child(&seed, path).map_err(|_| EnclaveError::Rejected)
        }
    }

    impl EnclaveSigner for MockEnclave {
        fn public_key(&self, path: &DerivationPath) -> Result<PublicKey, EnclaveError> {
            Ok(self.derive(path)?.public_key())
        }

        fn sign(
            &self,
            path: &DerivationPath,
            digest: &[u8; 32],
            scheme: SignatureScheme,
            credential: Option<&UnlockCredential>,
        ) -> Result<Vec<u8>, EnclaveError> {
            let mut calls = self.credential_per_call.lock().unwrap();
            calls.push(credential.is_some());
            if calls.len() <= self.failures_before_success {
                return Err(EnclaveError::Rejected);
            }
            drop(calls);

            let pair = self.derive(path)?;
            let secret_key = pair.secret_key().map_err(|_| EnclaveError::Rejected)?;
            match scheme {
                SignatureScheme::Schnorr => Ok(schnorr_sign(digest, &secret_key).to_vec()),
                SignatureScheme::Ecdsa => {
                    let secp = Secp256k1::new();
                    let msg = Message::from_digest(*digest);
                    Ok(secp.sign_ecdsa(&msg, &secret_key).serialize_der().to_vec())
                }
            }
        }
    }

    fn engine_with(
        vault: Arc<TestVault>,
        confirmation: Arc<dyn ConfirmationGate>,
        integrity: Arc<dyn IntegrityGate>,
        sink: Arc<RecordingSink>,
    ) -> SigningEngine {
        SigningEngine::builder(vault, confirmation, integrity)
            .with_context(Box::new(InlineContext::new()))
            .with_event_sink(sink)
            .build()
    }

    fn owner_script() -> bitcoin::ScriptBuf {
        Address::from_str(OWNER_ADDR)
            .unwrap()
            .require_network(Network::Bitcoin)
            .unwrap()
            .script_pubkey()
    }

    fn funded_builder() -> TxBuilder {
        let mut builder = TxBuilder::new(Network::Bitcoin);
        builder
            .add_input(DUMMY_TXID, 0, 100_000, owner_script())
            .unwrap();
        builder.add_output(DEST_ADDR, 60_000).unwrap();
        builder.apply_change(OWNER_ADDR, 2).unwrap();
        builder
    }

    fn credential() -> UnlockCredential {
        UnlockCredential::new(GOOD_CREDENTIAL)
    }

    #[tokio::test]
    async fn test_message_request_signs_and_verifies() {
        let vault = TestVault::new();
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(
            vault.clone(),
            Arc::new(InstantGate { allow: true }),
            Arc::new(InstantGate { allow: true }),
            sink.clone(),
        );

        let request = SignRequest::message(Layer::Taproot, 0, b"hello".as_slice(), "Sign greeting");
        let result = engine.request_signature(request, credential()).await.unwrap();

        let digest: [u8; 32] = Sha256::digest(b"hello").into();
        let signature: [u8; 64] = hex::decode(&result.signature)
            .unwrap()
            .try_into()
            .unwrap();
        let public_key = PublicKey::from_slice(&hex::decode(&result.public_key).unwrap()).unwrap();
        let signer = SchnorrSigner::new();
        assert!(signer.verify(&signature, &digest, &public_key.x_only_public_key().0));

        assert!(result.finalized_transaction.is_none());
        assert_eq!(vault.unlock_count(), 1);
        assert!(sink.completed());
        assert_eq!(
            sink.transitions(),
            vec![
                (SigningState::Idle, SigningState::AwaitingUserConfirmation),
                (SigningState::AwaitingUserConfirmation, SigningState::DerivingKey),
                (SigningState::DerivingKey, SigningState::Signing),
                (SigningState::Signing, SigningState::Done),
            ]
        );
    }

    #[tokio::test]
    async fn test_transaction_request_finalizes() {
        let vault = TestVault::new();
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(
            vault.clone(),
            Arc::new(InstantGate { allow: true }),
            Arc::new(InstantGate { allow: true }),
            sink.clone(),
        );

        let request = SignRequest::transaction(
            Layer::Bitcoin,
            0,
            60_000,
            funded_builder(),
            "Send 60k sats",
        );
        let result = engine.request_signature(request, credential()).await.unwrap();

        let raw = result.finalized_transaction.expect("transaction bytes");
        assert!(raw.starts_with("02000000"));
        assert!(!result.signature.is_empty());
        assert_eq!(engine.cached_key_count(), 1);

        // Below the threshold: no gate states at all.
        assert_eq!(
            sink.transitions(),
            vec![
                (SigningState::Idle, SigningState::DerivingKey),
                (SigningState::DerivingKey, SigningState::Signing),
                (SigningState::Signing, SigningState::Done),
            ]
        );
    }

    #[tokio::test]
    async fn test_high_value_transaction_gated_before_unlock() {
        let vault = TestVault::new();
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(
            vault.clone(),
            Arc::new(InstantGate { allow: true }),
            Arc::new(InstantGate { allow: false }),
            sink.clone(),
        );

        let request = SignRequest::transaction(
            Layer::Bitcoin,
            0,
            20_000_000,
            funded_builder(),
            "Send 0.2 BTC",
        );
        let err = engine
            .request_signature(request, credential())
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::DeviceIntegrityFailed);
        assert_eq!(vault.unlock_count(), 0);
        assert_eq!(engine.cached_key_count(), 0);
        assert_eq!(sink.failure_code(), Some(ErrorCode::DeviceIntegrityFailed));
        assert_eq!(
            sink.transitions(),
            vec![
                (SigningState::Idle, SigningState::AwaitingDeviceIntegrity),
                (SigningState::AwaitingDeviceIntegrity, SigningState::Failed),
            ]
        );
    }

    #[tokio::test]
    async fn test_declined_confirmation_stops_before_derivation() {
        let vault = TestVault::new();
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(
            vault.clone(),
            Arc::new(InstantGate { allow: false }),
            Arc::new(InstantGate { allow: true }),
            sink.clone(),
        );

        let request = SignRequest::proof(Layer::Bitcoin, 0, b"challenge".as_slice(), "Login");
        let err = engine
            .request_signature(request, credential())
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::UserDeclined);
        assert_eq!(vault.unlock_count(), 0);
        assert_eq!(engine.cached_key_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_confirmation_counts_as_decline() {
        let vault = TestVault::new();
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(
            vault.clone(),
            Arc::new(DroppedGate),
            Arc::new(InstantGate { allow: true }),
            sink.clone(),
        );

        let request = SignRequest::message(Layer::Bitcoin, 0, b"x".as_slice(), "Sign");
        let err = engine
            .request_signature(request, credential())
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::UserDeclined);
        assert_eq!(vault.unlock_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_integrity_sender_fails_closed() {
        let vault = TestVault::new();
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(
            vault.clone(),
            Arc::new(InstantGate { allow: true }),
            Arc::new(DroppedGate),
            sink.clone(),
        );

        let request = SignRequest::transaction(
            Layer::Bitcoin,
            0,
            20_000_000,
            funded_builder(),
            "Send 0.2 BTC",
        );
        let err = engine
            .request_signature(request, credential())
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::DeviceIntegrityFailed);
        assert_eq!(vault.unlock_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_integrity_times_out_closed() {
        let vault = TestVault::new();
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(
            vault.clone(),
            Arc::new(InstantGate { allow: true }),
            Arc::new(StallingGate::default()),
            sink.clone(),
        );

        let request = SignRequest::transaction(
            Layer::Bitcoin,
            0,
            20_000_000,
            funded_builder(),
            "Send 0.2 BTC",
        );
        let err = engine
            .request_signature(request, credential())
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::DeviceIntegrityFailed);
        assert_eq!(vault.unlock_count(), 0);
    }

    #[tokio::test]
    async fn test_enclave_success_skips_vault() {
        let vault = TestVault::new();
        let enclave = MockEnclave::new(0);
        let sink = Arc::new(RecordingSink::default());
        let engine = SigningEngine::builder(
            vault.clone(),
            Arc::new(InstantGate { allow: true }),
            Arc::new(InstantGate { allow: true }),
        )
        .with_enclave(enclave.clone())
        .with_context(Box::new(InlineContext::new()))
        .with_event_sink(sink.clone())
        .build();

        let request = SignRequest::message(Layer::Taproot, 0, b"hi".as_slice(), "Sign");
        let result = engine.request_signature(request, credential()).await.unwrap();

        assert!(!result.signature.is_empty());
        assert_eq!(vault.unlock_count(), 0);
        // First rung signs without the credential.
        assert_eq!(enclave.calls(), vec![false]);
    }

    #[tokio::test]
    async fn test_enclave_failures_fall_back_to_software_once() {
        let vault = TestVault::new();
        let enclave = MockEnclave::new(usize::MAX);
        let sink = Arc::new(RecordingSink::default());
        let engine = SigningEngine::builder(
            vault.clone(),
            Arc::new(InstantGate { allow: true }),
            Arc::new(InstantGate { allow: true }),
        )
        .with_enclave(enclave.clone())
        .with_context(Box::new(InlineContext::new()))
        .with_event_sink(sink.clone())
        .build();

        let request = SignRequest::message(Layer::Taproot, 0, b"hi".as_slice(), "Sign");
        let result = engine.request_signature(request, credential()).await.unwrap();

        // Session rung without credential, retry rung with it, then software.
        assert_eq!(enclave.calls(), vec![false, true]);
        assert_eq!(vault.unlock_count(), 1);
        assert!(!result.signature.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_credential_surfaces_vault_code() {
        let vault = TestVault::new();
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(
            vault.clone(),
            Arc::new(InstantGate { allow: true }),
            Arc::new(InstantGate { allow: true }),
            sink.clone(),
        );

        let request = SignRequest::message(Layer::Bitcoin, 0, b"x".as_slice(), "Sign");
        let err = engine
            .request_signature(request, UnlockCredential::new("wrong"))
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::VaultUnlockFailed);
        assert_eq!(sink.failure_code(), Some(ErrorCode::VaultUnlockFailed));
    }

    #[tokio::test]
    async fn test_statechain_transfer_index_changes_signing_key() {
        let vault = TestVault::new();
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(
            vault.clone(),
            Arc::new(InstantGate { allow: true }),
            Arc::new(InstantGate { allow: true }),
            sink.clone(),
        );

        let base = SignRequest::event(Layer::Statechain, 0, b"attest".as_slice(), "Attest");
        let first = engine
            .request_signature(base, credential())
            .await
            .unwrap();

        let rotated = SignRequest::event(Layer::Statechain, 0, b"attest".as_slice(), "Attest")
            .with_transfer_index(crate::policy::TransferIndex::new(1).unwrap());
        let second = engine
            .request_signature(rotated, credential())
            .await
            .unwrap();

        assert_ne!(first.public_key, second.public_key);
    }

    #[tokio::test]
    async fn test_cache_clear_does_not_change_results() {
        let vault = TestVault::new();
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(
            vault.clone(),
            Arc::new(InstantGate { allow: true }),
            Arc::new(InstantGate { allow: true }),
            sink.clone(),
        );

        let before = engine
            .request_signature(
                SignRequest::message(Layer::Bitcoin, 0, b"same".as_slice(), "Sign"),
                credential(),
            )
            .await
            .unwrap();

        engine.clear_derivation_cache();
        assert_eq!(engine.cached_key_count(), 0);

        let after = engine
            .request_signature(
                SignRequest::message(Layer::Bitcoin, 0, b"same".as_slice(), "Sign"),
                credential(),
            )
            .await
            .unwrap();

        assert_eq!(before.signature, after.signature);
        assert_eq!(before.public_key, after.public_key);
    }

    #[test]
    fn test_software_path_wipes_secret_on_success() {
        let cache = DerivationCache::new();
        let mut secret = seed_from_recovery_phrase(TEST_PHRASE, "").unwrap();
        let path = policy::path_for(Layer::Taproot, 0).unwrap();

        let kind = RequestKind::Message {
            payload: b"ping".to_vec(),
            digest: None,
        };
        let outcome = sign_with_secret(&mut secret, &cache, &path, kind).unwrap();

        assert_eq!(outcome.signature.len(), 64);
        assert!(secret.is_wiped());
    }

    #[test]
    fn test_software_path_wipes_secret_on_error() {
        let cache = DerivationCache::new();
        let mut secret = seed_from_recovery_phrase(TEST_PHRASE, "").unwrap();
        let path = policy::path_for(Layer::Bitcoin, 0).unwrap();

        // A transaction with no inputs cannot be signed.
        let kind = RequestKind::Transaction {
            amount_sats: 1,
            transaction: TxBuilder::new(Network::Bitcoin),
        };
        let err = sign_with_secret(&mut secret, &cache, &path, kind).unwrap_err();

        assert_eq!(err.code, ErrorCode::SigningFailed);
        assert!(secret.is_wiped());
    }

    #[test]
    fn test_resolve_path_honors_transfer_index() {
        let plain = SignRequest::event(Layer::Statechain, 2, b"p".as_slice(), "d");
        let rotated = SignRequest::event(Layer::Statechain, 2, b"p".as_slice(), "d")
            .with_transfer_index(crate::policy::TransferIndex::new(7).unwrap());

        assert_eq!(resolve_path(&plain).unwrap().to_string(), "m/87'/0'/2'/0/0");
        assert_eq!(
            resolve_path(&rotated).unwrap().to_string(),
            "m/87'/0'/2'/0/7"
        );
    }
}
