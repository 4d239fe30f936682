//! MuSig2 Ceremony Layer
//!
//! BIP-327 two-round signature aggregation for statechain co-signing.
//! The musig2 crate supplies the protocol arithmetic; this layer adds
//! quorum validation, canonical participant ordering, session sealing,
//! and all-or-nothing partial verification.
//!
//! Round 1 exchanges public nonces. Round 2 produces partial signatures
//! and aggregates them into a single 64-byte signature that verifies like
//! any other Schnorr signature under the aggregated key.

use bitcoin::secp256k1::{PublicKey, SecretKey, XOnlyPublicKey};
use musig2::{AggNonce, KeyAggContext, LiftedSignature, PubNonce, SecNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::error::{ErrorCode, SignerError};

pub use musig2::PartialSignature;

/// Ceremonies below this size defeat the purpose of aggregation.
pub const MIN_PARTICIPANTS: usize = 2;
/// Serialized width of a two-point public nonce.
pub const PUBLIC_NONCE_BYTES: usize = 66;

/// Errors raised by ceremony setup and aggregation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MusigError {
    #[error("{0} participants supplied, at least {MIN_PARTICIPANTS} required")]
    InvalidQuorum(usize),

    #[error("a participant key appears more than once")]
    DuplicateParticipant,

    #[error("nonce or partial count does not match the participant set")]
    ParticipantMismatch,

    #[error("signer key is not a ceremony participant")]
    UnknownSigner,

    #[error("public nonce bytes are malformed")]
    MalformedNonce,

    #[error("a partial signature does not open against the sealed nonce")]
    NonceMismatch,

    #[error("key material could not be converted")]
    KeyConversion,

    #[error("key aggregation failed")]
    AggregationFailed,
}

impl From<MusigError> for SignerError {
    fn from(e: MusigError) -> Self {
        let code = match e {
            MusigError::InvalidQuorum(_) => ErrorCode::InvalidQuorum,
            MusigError::DuplicateParticipant => ErrorCode::DuplicateParticipant,
            MusigError::NonceMismatch => ErrorCode::NonceMismatch,
            MusigError::KeyConversion => ErrorCode::InvalidKey,
            MusigError::ParticipantMismatch
            | MusigError::UnknownSigner
            | MusigError::MalformedNonce
            | MusigError::AggregationFailed => ErrorCode::ProtocolMismatch,
        };
        SignerError::new(code, e.to_string())
    }
}

// MARK: - Type bridging

// The musig2 crate carries its own libsecp256k1 bindings; keys cross the
// boundary through their canonical serializations.

fn pubkey_to_musig(pk: &PublicKey) -> Result<musig2::secp256k1::PublicKey, MusigError> {
    musig2::secp256k1::PublicKey::from_slice(&pk.serialize())
        .map_err(|_| MusigError::KeyConversion)
}

fn seckey_to_musig(sk: &SecretKey) -> Result<musig2::secp256k1::SecretKey, MusigError> {
    musig2::secp256k1::SecretKey::from_slice(&sk.secret_bytes())
        .map_err(|_| MusigError::KeyConversion)
}

// MARK: - Key aggregation

/// Participant set with its aggregated key.
///
/// Participants are held in canonical (byte-lexicographic) order, so the
/// aggregated key is independent of the order keys were supplied in.
#[derive(Debug, Clone)]
pub struct AggregatedKey {
    ctx: KeyAggContext,
    participants: Vec<PublicKey>,
    x_only: XOnlyPublicKey,
}

impl AggregatedKey {
    /// The even-Y x-only aggregated key signatures verify under.
    pub fn x_only(&self) -> XOnlyPublicKey {
        self.x_only
    }

    /// Participant keys in canonical order. Nonces and partials are
    /// exchanged in this order.
    pub fn participants(&self) -> &[PublicKey] {
        &self.participants
    }
}

/// Aggregate a participant set with per-key coefficients (rogue-key safe).
///
/// Keys are sorted by compressed encoding first; fewer than two keys or a
/// repeated key is rejected.
pub fn aggregate_public_keys(keys: &[PublicKey]) -> Result<AggregatedKey, MusigError> {
    if keys.len() < MIN_PARTICIPANTS {
        return Err(MusigError::InvalidQuorum(keys.len()));
    }

    let mut participants = keys.to_vec();
    participants.sort_by_key(|k| k.serialize());
    for pair in participants.windows(2) {
        if pair[0] == pair[1] {
            return Err(MusigError::DuplicateParticipant);
        }
    }

    let converted: Vec<musig2::secp256k1::PublicKey> = participants
        .iter()
        .map(pubkey_to_musig)
        .collect::<Result<_, _>>()?;
    let ctx = KeyAggContext::new(converted).map_err(|_| MusigError::AggregationFailed)?;

    let agg: musig2::secp256k1::PublicKey = ctx.aggregated_pubkey();
    let (xonly_m, _parity) = agg.x_only_public_key();
    let x_only =
        XOnlyPublicKey::from_slice(&xonly_m.serialize()).map_err(|_| MusigError::KeyConversion)?;

    Ok(AggregatedKey {
        ctx,
        participants,
        x_only,
    })
}

// MARK: - Nonces

/// Secret half of a signing nonce. Move-only: partial signing consumes it,
/// so reuse across messages is unrepresentable.
pub struct SignerNonce {
    inner: SecNonce,
}

/// Public half of a signing nonce, exchanged between participants.
#[derive(Debug, Clone)]
pub struct PublicNonce {
    inner: PubNonce,
}

impl PublicNonce {
    pub fn serialize(&self) -> [u8; PUBLIC_NONCE_BYTES] {
        self.inner.serialize()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MusigError> {
        let inner = PubNonce::from_bytes(bytes).map_err(|_| MusigError::MalformedNonce)?;
        Ok(Self { inner })
    }
}

/// Generate a nonce pair for one signer in one session.
///
/// The secret nonce binds 32 bytes of OS entropy to the signer key, the
/// aggregated key, the message, and the session id, per the BIP-327
/// derivation. Each (signer, session) pair must use a fresh nonce.
pub fn generate_nonce(
    seckey: &SecretKey,
    aggregated: &AggregatedKey,
    message: &[u8; 32],
    session_id: u64,
) -> Result<(SignerNonce, PublicNonce), MusigError> {
    let sk_m = seckey_to_musig(seckey)?;
    let agg_pk: musig2::secp256k1::PublicKey = aggregated.ctx.aggregated_pubkey();

    let mut nonce_seed = [0u8; 32];
    OsRng.fill_bytes(&mut nonce_seed);

    let secret = SecNonce::build(nonce_seed)
        .with_seckey(sk_m)
        .with_aggregated_pubkey(agg_pk)
        .with_message(message)
        .with_extra_input(&session_id.to_be_bytes())
        .build();
    let public = secret.public_nonce();

    Ok((
        SignerNonce { inner: secret },
        PublicNonce { inner: public },
    ))
}

// MARK: - Ceremony

/// A sealed round-two session: participant set, message, and the
/// aggregated nonce are fixed at construction and cannot drift apart.
#[derive(Debug)]
pub struct SigningCeremony {
    aggregated: AggregatedKey,
    message: [u8; 32],
    public_nonces: Vec<PublicNonce>,
    aggregated_nonce: AggNonce,
}

impl SigningCeremony {
    /// Seal a session. `public_nonces` must line up with
    /// [`AggregatedKey::participants`] one-to-one.
    pub fn new(
        aggregated: AggregatedKey,
        message: [u8; 32],
        public_nonces: Vec<PublicNonce>,
    ) -> Result<Self, MusigError> {
        if public_nonces.len() != aggregated.participants().len() {
            return Err(MusigError::ParticipantMismatch);
        }
        let aggregated_nonce = AggNonce::sum(public_nonces.iter().map(|n| &n.inner));
        Ok(Self {
            aggregated,
            message,
            public_nonces,
            aggregated_nonce,
        })
    }

    pub fn message(&self) -> [u8; 32] {
        self.message
    }

    pub fn aggregated_key(&self) -> &AggregatedKey {
        &self.aggregated
    }

    /// Produce this signer's partial signature, consuming the secret nonce.
    pub fn partial_sign(
        &self,
        seckey: &SecretKey,
        nonce: SignerNonce,
    ) -> Result<PartialSignature, MusigError> {
        let sk_m = seckey_to_musig(seckey)?;
        let partial: PartialSignature = musig2::sign_partial(
            &self.aggregated.ctx,
            sk_m,
            nonce.inner,
            &self.aggregated_nonce,
            &self.message,
        )
        .map_err(|_| MusigError::UnknownSigner)?;
        Ok(partial)
    }

    /// Check one partial against its signer's key and public nonce.
    pub fn verify_partial(
        &self,
        partial: PartialSignature,
        signer: &PublicKey,
        signer_nonce: &PublicNonce,
    ) -> bool {
        let Ok(pk_m) = pubkey_to_musig(signer) else {
            return false;
        };
        musig2::verify_partial(
            &self.aggregated.ctx,
            partial,
            &self.aggregated_nonce,
            pk_m,
            &signer_nonce.inner,
            &self.message,
        )
        .is_ok()
    }

    /// Verify every partial and combine them into the final signature.
    ///
    /// Partials must line up with the participant order. One bad partial
    /// rejects the whole set; nothing is emitted from a tainted session.
    pub fn aggregate(self, partials: &[PartialSignature]) -> Result<[u8; 64], MusigError> {
        if partials.len() != self.aggregated.participants().len() {
            return Err(MusigError::ParticipantMismatch);
        }

        for ((key, nonce), partial) in self
            .aggregated
            .participants()
            .iter()
            .zip(&self.public_nonces)
            .zip(partials)
        {
            if !self.verify_partial(*partial, key, nonce) {
                return Err(MusigError::NonceMismatch);
            }
        }

        let signature: LiftedSignature = musig2::aggregate_partial_signatures(
            &self.aggregated.ctx,
            &self.aggregated_nonce,
            partials.iter().copied(),
            &self.message,
        )
        .map_err(|_| MusigError::NonceMismatch)?;

        Ok(signature.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SchnorrSigner;
    use bitcoin::secp256k1::Secp256k1;

    fn test_keypair(tag: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let mut bytes = [0u8; 32];
        bytes[0] = 0x01;
        bytes[31] = tag;
        let sk = SecretKey::from_slice(&bytes).unwrap();
        (sk, sk.public_key(&secp))
    }

    fn seckey_for(pk: &PublicKey, pool: &[(SecretKey, PublicKey)]) -> SecretKey {
        pool.iter().find(|(_, p)| p == pk).map(|(s, _)| *s).unwrap()
    }

    #[test]
    fn test_aggregation_is_order_independent() {
        let (_, a) = test_keypair(1);
        let (_, b) = test_keypair(2);
        let (_, c) = test_keypair(3);

        let forward = aggregate_public_keys(&[a, b, c]).unwrap();
        let shuffled = aggregate_public_keys(&[c, a, b]).unwrap();
        assert_eq!(forward.x_only(), shuffled.x_only());
        assert_eq!(forward.participants(), shuffled.participants());

        for pk in [a, b, c] {
            assert_ne!(forward.x_only(), pk.x_only_public_key().0);
        }
    }

    #[test]
    fn test_rejects_short_quorum() {
        let (_, a) = test_keypair(1);
        assert_eq!(aggregate_public_keys(&[]).unwrap_err(), MusigError::InvalidQuorum(0));
        assert_eq!(aggregate_public_keys(&[a]).unwrap_err(), MusigError::InvalidQuorum(1));
    }

    #[test]
    fn test_rejects_duplicate_participant() {
        let (_, a) = test_keypair(1);
        let (_, b) = test_keypair(2);
        assert_eq!(
            aggregate_public_keys(&[a, b, a]).unwrap_err(),
            MusigError::DuplicateParticipant
        );
    }

    #[test]
    fn test_public_nonce_is_66_bytes_and_round_trips() {
        let pool = [test_keypair(1), test_keypair(2)];
        let keys: Vec<PublicKey> = pool.iter().map(|(_, p)| *p).collect();
        let aggregated = aggregate_public_keys(&keys).unwrap();

        let (_, public) = generate_nonce(&pool[0].0, &aggregated, &[0x11; 32], 7).unwrap();
        let bytes = public.serialize();
        assert_eq!(bytes.len(), PUBLIC_NONCE_BYTES);
        let recovered = PublicNonce::from_bytes(&bytes).unwrap();
        assert_eq!(recovered.serialize(), bytes);
        assert!(PublicNonce::from_bytes(&bytes[..60]).is_err());
    }

    #[test]
    fn test_three_party_ceremony_produces_schnorr_signature() {
        let pool = [test_keypair(10), test_keypair(20), test_keypair(30)];
        let keys: Vec<PublicKey> = pool.iter().map(|(_, p)| *p).collect();
        let aggregated = aggregate_public_keys(&keys).unwrap();
        let message = [0xAB; 32];

        let mut secret_nonces = Vec::new();
        let mut public_nonces = Vec::new();
        for (session, participant) in aggregated.participants().to_vec().iter().enumerate() {
            let sk = seckey_for(participant, &pool);
            let (secret, public) =
                generate_nonce(&sk, &aggregated, &message, session as u64).unwrap();
            secret_nonces.push(secret);
            public_nonces.push(public);
        }

        let participants = aggregated.participants().to_vec();
        let ceremony = SigningCeremony::new(aggregated, message, public_nonces.clone()).unwrap();

        let mut partials = Vec::new();
        for (participant, secret) in participants.iter().zip(secret_nonces) {
            let sk = seckey_for(participant, &pool);
            let partial = ceremony.partial_sign(&sk, secret).unwrap();
            assert!(ceremony.verify_partial(
                partial,
                participant,
                &public_nonces[partials.len()]
            ));
            partials.push(partial);
        }

        let aggregated_key = ceremony.aggregated_key().x_only();
        let signature = ceremony.aggregate(&partials).unwrap();

        let signer = SchnorrSigner::new();
        assert!(signer.verify(&signature, &message, &aggregated_key));

        let mut tampered = signature;
        tampered[17] ^= 0x01;
        assert!(!signer.verify(&tampered, &message, &aggregated_key));
    }

    #[test]
    fn test_aggregate_rejects_partial_over_wrong_message() {
        let pool = [test_keypair(1), test_keypair(2)];
        let keys: Vec<PublicKey> = pool.iter().map(|(_, p)| *p).collect();
        let aggregated = aggregate_public_keys(&keys).unwrap();
        let message = [0x42; 32];

        let participants = aggregated.participants().to_vec();
        let mut nonce_pairs = Vec::new();
        for (session, participant) in participants.iter().enumerate() {
            let sk = seckey_for(participant, &pool);
            nonce_pairs.push((
                sk,
                generate_nonce(&sk, &aggregated, &message, session as u64).unwrap(),
            ));
        }
        let public_nonces: Vec<PublicNonce> =
            nonce_pairs.iter().map(|(_, (_, p))| p.clone()).collect();

        let honest = SigningCeremony::new(aggregated.clone(), message, public_nonces.clone())
            .unwrap();
        let forged = SigningCeremony::new(aggregated, [0xFF; 32], public_nonces).unwrap();

        let mut partials = Vec::new();
        let mut ceremonies = vec![&honest, &forged];
        for (sk, (secret, _)) in nonce_pairs {
            let ceremony = ceremonies.remove(0);
            partials.push(ceremony.partial_sign(&sk, secret).unwrap());
        }

        assert_eq!(honest.aggregate(&partials).unwrap_err(), MusigError::NonceMismatch);
    }

    #[test]
    fn test_verify_partial_catches_signer_substitution() {
        let pool = [test_keypair(5), test_keypair(6)];
        let keys: Vec<PublicKey> = pool.iter().map(|(_, p)| *p).collect();
        let aggregated = aggregate_public_keys(&keys).unwrap();
        let message = [0x99; 32];

        let participants = aggregated.participants().to_vec();
        let sk0 = seckey_for(&participants[0], &pool);
        let sk1 = seckey_for(&participants[1], &pool);
        let (secret0, public0) = generate_nonce(&sk0, &aggregated, &message, 0).unwrap();
        let (_secret1, public1) = generate_nonce(&sk1, &aggregated, &message, 1).unwrap();

        let ceremony =
            SigningCeremony::new(aggregated, message, vec![public0.clone(), public1]).unwrap();
        let partial = ceremony.partial_sign(&sk0, secret0).unwrap();

        assert!(ceremony.verify_partial(partial, &participants[0], &public0));
        assert!(!ceremony.verify_partial(partial, &participants[1], &public0));
    }

    #[test]
    fn test_ceremony_requires_one_nonce_per_participant() {
        let pool = [test_keypair(1), test_keypair(2), test_keypair(3)];
        let keys: Vec<PublicKey> = pool.iter().map(|(_, p)| *p).collect();
        let aggregated = aggregate_public_keys(&keys).unwrap();
        let message = [0x01; 32];

        let sk = seckey_for(&aggregated.participants()[0], &pool);
        let (_, only_nonce) = generate_nonce(&sk, &aggregated, &message, 0).unwrap();

        let err = SigningCeremony::new(aggregated, message, vec![only_nonce]).unwrap_err();
        assert_eq!(err, MusigError::ParticipantMismatch);
    }
}
