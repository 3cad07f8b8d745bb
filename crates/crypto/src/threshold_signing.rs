//! Two-party-over-threshold Schnorr signing (FROST-style) with optional
//! adaptor points.
//!
//! A leaf's verifying key is the sum of the owner's public key and the
//! operator group's key: `Y = P_user + sum(lambda_i * Y_i)`. The owner signs
//! with Lagrange weight 1; each operator in the signing set signs with its
//! Lagrange coefficient over that set. The aggregate is a BIP340 signature
//! under `Y`, or, when an adaptor point `T` is supplied, an adaptor signature
//! that becomes valid once `t` is applied.
//!
//! Round 1 produces a [`SigningNonce`] and its public [`SigningCommitment`].
//! The nonce is consumed by value in round 2, so it cannot be used twice.

use std::collections::BTreeMap;
use std::fmt;

use bitcoin::secp256k1::{PublicKey, SecretKey};
use k256::elliptic_curve::PrimeField;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{NonZeroScalar, ProjectivePoint, Scalar};
use rand_core::{CryptoRng, RngCore};

use crate::adaptor_signature::validate_adaptor_signature;
use crate::secp::{
    PointError, bip340_challenge, has_odd_y, point_from_public_key, point_from_sec1,
    scalar_from_digest, scalar_from_secret_key, tagged_hash, x_bytes,
};
use crate::verifiable_secret_sharing::{VssError, lagrange_coefficient};

const BINDING_TAG: &[u8] = b"spark/frost/binding";

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors returned by threshold signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThresholdError {
    /// A public key, commitment or adaptor point is not a valid curve point.
    InvalidPoint,
    /// A signature share does not decode to a scalar.
    InvalidSignatureShare,
    /// The signer is not part of the signing package.
    UnknownParticipant(Participant),
    /// The package names a signer that supplied no share or public key.
    MissingShare(Participant),
    /// The package has no operator commitments.
    EmptySigningSet,
    /// Lagrange weights could not be computed for the signing set.
    Lagrange(VssError),
    /// The group commitment is the identity.
    DegenerateCommitment,
    /// A share or the aggregate failed verification. `culprit` is set when a
    /// specific signature share was invalid.
    AggregationMismatch { culprit: Option<Participant> },
}

impl fmt::Display for ThresholdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPoint => write!(f, "invalid curve point"),
            Self::InvalidSignatureShare => write!(f, "invalid signature share encoding"),
            Self::UnknownParticipant(p) => write!(f, "{p} is not in the signing package"),
            Self::MissingShare(p) => write!(f, "missing signature share from {p}"),
            Self::EmptySigningSet => write!(f, "signing package has no operators"),
            Self::Lagrange(e) => write!(f, "lagrange coefficient: {e}"),
            Self::DegenerateCommitment => write!(f, "group commitment is the identity"),
            Self::AggregationMismatch { culprit: Some(p) } => {
                write!(f, "aggregation mismatch: invalid share from {p}")
            }
            Self::AggregationMismatch { culprit: None } => {
                write!(f, "aggregation mismatch: aggregate signature does not verify")
            }
        }
    }
}

impl std::error::Error for ThresholdError {}

impl From<PointError> for ThresholdError {
    fn from(_: PointError) -> Self {
        Self::InvalidPoint
    }
}

impl From<VssError> for ThresholdError {
    fn from(e: VssError) -> Self {
        Self::Lagrange(e)
    }
}

// ---------------------------------------------------------------------------
// Participants
// ---------------------------------------------------------------------------

/// Operator identifier. Equals the operator's zero-based index plus one, which
/// is also the x-coordinate of the operator's secret share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identifier(u32);

impl Identifier {
    pub fn from_operator_index(index: u32) -> Self {
        Self(index + 1)
    }

    /// Returns `None` for zero, which is the polynomial's constant term.
    pub fn new(value: u32) -> Option<Self> {
        (value != 0).then_some(Self(value))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn operator_index(self) -> u32 {
        self.0 - 1
    }

    pub fn to_scalar(self) -> Scalar {
        Scalar::from(u64::from(self.0))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operator {}", self.0)
    }
}

/// One side of a nested signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Participant {
    User,
    Operator(Identifier),
}

impl Participant {
    fn binding_id(self) -> [u8; 4] {
        match self {
            Self::User => [0; 4],
            Self::Operator(id) => id.0.to_be_bytes(),
        }
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Operator(id) => write!(f, "{id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Round 1
// ---------------------------------------------------------------------------

/// Secret hiding/binding nonce pair. Not `Clone`: signing consumes it.
pub struct SigningNonce {
    hiding: Scalar,
    binding: Scalar,
}

impl fmt::Debug for SigningNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningNonce(..)")
    }
}

impl SigningNonce {
    pub fn commitment(&self) -> SigningCommitment {
        SigningCommitment {
            hiding: ProjectivePoint::GENERATOR * self.hiding,
            binding: ProjectivePoint::GENERATOR * self.binding,
        }
    }
}

/// Public commitment `(D, E) = (d*G, e*G)` to a [`SigningNonce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningCommitment {
    hiding: ProjectivePoint,
    binding: ProjectivePoint,
}

impl SigningCommitment {
    /// `D || E`, both SEC1-compressed.
    pub fn to_bytes(&self) -> [u8; 66] {
        let mut out = [0u8; 66];
        out[..33].copy_from_slice(self.hiding.to_affine().to_encoded_point(true).as_bytes());
        out[33..].copy_from_slice(self.binding.to_affine().to_encoded_point(true).as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ThresholdError> {
        if bytes.len() != 66 {
            return Err(ThresholdError::InvalidPoint);
        }
        Ok(Self {
            hiding: point_from_sec1(&bytes[..33])?,
            binding: point_from_sec1(&bytes[33..])?,
        })
    }
}

pub fn generate_nonce<R: RngCore + CryptoRng>(rng: &mut R) -> (SigningNonce, SigningCommitment) {
    let nonce = SigningNonce {
        hiding: *NonZeroScalar::random(&mut *rng),
        binding: *NonZeroScalar::random(&mut *rng),
    };
    let commitment = nonce.commitment();
    (nonce, commitment)
}

// ---------------------------------------------------------------------------
// Signing package
// ---------------------------------------------------------------------------

/// Everything a signer needs to produce its share.
#[derive(Debug, Clone)]
pub struct SigningPackage {
    pub message: [u8; 32],
    pub verifying_key: PublicKey,
    pub user_commitment: SigningCommitment,
    pub operator_commitments: BTreeMap<Identifier, SigningCommitment>,
    pub adaptor_public_key: Option<PublicKey>,
}

/// A round-2 signature share `z_i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureShare(Scalar);

impl SignatureShare {
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_repr().into()
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, ThresholdError> {
        Option::from(Scalar::from_repr((*bytes).into()))
            .map(Self)
            .ok_or(ThresholdError::InvalidSignatureShare)
    }
}

/// Values every signer derives identically from the package.
struct SessionContext {
    binding_factors: BTreeMap<Participant, Scalar>,
    group_commitment_x: [u8; 32],
    negate_nonce: bool,
    negate_key: bool,
    challenge: Scalar,
    operator_ids: Vec<Scalar>,
}

impl SigningPackage {
    fn commitment(&self, participant: Participant) -> Result<&SigningCommitment, ThresholdError> {
        match participant {
            Participant::User => Ok(&self.user_commitment),
            Participant::Operator(id) => self
                .operator_commitments
                .get(&id)
                .ok_or(ThresholdError::UnknownParticipant(participant)),
        }
    }

    fn participants(&self) -> impl Iterator<Item = Participant> + '_ {
        std::iter::once(Participant::User).chain(
            self.operator_commitments
                .keys()
                .map(|id| Participant::Operator(*id)),
        )
    }

    fn context(&self) -> Result<SessionContext, ThresholdError> {
        if self.operator_commitments.is_empty() {
            return Err(ThresholdError::EmptySigningSet);
        }

        let verifying_point = point_from_public_key(&self.verifying_key)?.to_affine();
        let adaptor_point = self
            .adaptor_public_key
            .as_ref()
            .map(point_from_public_key)
            .transpose()?;

        // Every binding factor commits to the full commitment list.
        let mut encoded = Vec::with_capacity(70 * (self.operator_commitments.len() + 1));
        for participant in self.participants() {
            encoded.extend_from_slice(&participant.binding_id());
            encoded.extend_from_slice(&self.commitment(participant)?.to_bytes());
        }
        let commitment_list_hash = tagged_hash(BINDING_TAG, &[&encoded]);
        let verifying_key_bytes = self.verifying_key.serialize();
        let adaptor_bytes = self
            .adaptor_public_key
            .map(|pk| pk.serialize().to_vec())
            .unwrap_or_default();

        let mut binding_factors = BTreeMap::new();
        let mut group_commitment = ProjectivePoint::IDENTITY;
        for participant in self.participants() {
            let rho = scalar_from_digest(&tagged_hash(
                BINDING_TAG,
                &[
                    &participant.binding_id(),
                    &self.message,
                    &verifying_key_bytes,
                    &adaptor_bytes,
                    &commitment_list_hash,
                ],
            ));
            let commitment = self.commitment(participant)?;
            group_commitment += commitment.hiding + commitment.binding * rho;
            binding_factors.insert(participant, rho);
        }
        if let Some(adaptor) = adaptor_point {
            group_commitment += adaptor;
        }

        let group_commitment = group_commitment.to_affine();
        if group_commitment == k256::AffinePoint::IDENTITY {
            return Err(ThresholdError::DegenerateCommitment);
        }
        let group_commitment_x = x_bytes(&group_commitment);
        let challenge = bip340_challenge(
            &group_commitment_x,
            &x_bytes(&verifying_point),
            &self.message,
        );

        Ok(SessionContext {
            binding_factors,
            group_commitment_x,
            negate_nonce: has_odd_y(&group_commitment),
            negate_key: has_odd_y(&verifying_point),
            challenge,
            operator_ids: self
                .operator_commitments
                .keys()
                .map(|id| id.to_scalar())
                .collect(),
        })
    }
}

impl SessionContext {
    fn weight(&self, participant: Participant) -> Result<Scalar, ThresholdError> {
        match participant {
            Participant::User => Ok(Scalar::ONE),
            Participant::Operator(id) => Ok(lagrange_coefficient(&id.to_scalar(), &self.operator_ids)?),
        }
    }

    fn binding(&self, participant: Participant) -> Result<Scalar, ThresholdError> {
        self.binding_factors
            .get(&participant)
            .copied()
            .ok_or(ThresholdError::UnknownParticipant(participant))
    }
}

// ---------------------------------------------------------------------------
// Round 2
// ---------------------------------------------------------------------------

fn sign_share(
    package: &SigningPackage,
    participant: Participant,
    secret: &SecretKey,
    nonce: SigningNonce,
) -> Result<SignatureShare, ThresholdError> {
    if *package.commitment(participant)? != nonce.commitment() {
        return Err(ThresholdError::UnknownParticipant(participant));
    }
    let ctx = package.context()?;
    let rho = ctx.binding(participant)?;

    let mut k = nonce.hiding + nonce.binding * rho;
    if ctx.negate_nonce {
        k = -k;
    }
    let mut x = scalar_from_secret_key(secret);
    if ctx.negate_key {
        x = -x;
    }

    Ok(SignatureShare(k + ctx.challenge * ctx.weight(participant)? * x))
}

/// Produces the owner's share. The owner's key enters with weight 1.
///
/// # Errors
///
/// Returns [`ThresholdError::UnknownParticipant`] if `nonce` does not match
/// the package's user commitment.
pub fn sign_as_user(
    package: &SigningPackage,
    secret: &SecretKey,
    nonce: SigningNonce,
) -> Result<SignatureShare, ThresholdError> {
    sign_share(package, Participant::User, secret, nonce)
}

/// Produces an operator's share over its secret key share.
pub fn sign_as_operator(
    package: &SigningPackage,
    identifier: Identifier,
    key_share: &SecretKey,
    nonce: SigningNonce,
) -> Result<SignatureShare, ThresholdError> {
    sign_share(package, Participant::Operator(identifier), key_share, nonce)
}

fn verify_with_context(
    package: &SigningPackage,
    ctx: &SessionContext,
    participant: Participant,
    share: &SignatureShare,
    public_key: &PublicKey,
) -> Result<(), ThresholdError> {
    let commitment = package.commitment(participant)?;
    let rho = ctx.binding(participant)?;

    let mut r_i = commitment.hiding + commitment.binding * rho;
    if ctx.negate_nonce {
        r_i = -r_i;
    }
    let mut y_i = point_from_public_key(public_key)?;
    if ctx.negate_key {
        y_i = -y_i;
    }

    let lhs = ProjectivePoint::GENERATOR * share.0;
    let rhs = r_i + y_i * (ctx.challenge * ctx.weight(participant)?);
    if lhs == rhs {
        Ok(())
    } else {
        Err(ThresholdError::AggregationMismatch {
            culprit: Some(participant),
        })
    }
}

/// Checks one participant's share against its public key (the owner's public
/// key, or the operator's public key share).
pub fn verify_signature_share(
    package: &SigningPackage,
    participant: Participant,
    share: &SignatureShare,
    public_key: &PublicKey,
) -> Result<(), ThresholdError> {
    let ctx = package.context()?;
    verify_with_context(package, &ctx, participant, share, public_key)
}

/// Verifies every share, sums them and verifies the result.
///
/// Without an adaptor point the result is a BIP340 signature under the
/// package's verifying key. With one it is an adaptor signature: see
/// [`crate::adaptor_signature::apply_adaptor`].
///
/// # Errors
///
/// Returns [`ThresholdError::MissingShare`] if a committed operator supplied
/// no share or public key, and [`ThresholdError::AggregationMismatch`] if a
/// share or the final signature does not verify.
pub fn aggregate(
    package: &SigningPackage,
    user_share: &SignatureShare,
    user_public_key: &PublicKey,
    operator_shares: &BTreeMap<Identifier, SignatureShare>,
    operator_public_keys: &BTreeMap<Identifier, PublicKey>,
) -> Result<[u8; 64], ThresholdError> {
    let ctx = package.context()?;

    verify_with_context(package, &ctx, Participant::User, user_share, user_public_key)?;
    let mut s = user_share.0;

    for id in package.operator_commitments.keys() {
        let participant = Participant::Operator(*id);
        let share = operator_shares
            .get(id)
            .ok_or(ThresholdError::MissingShare(participant))?;
        let public_key = operator_public_keys
            .get(id)
            .ok_or(ThresholdError::MissingShare(participant))?;
        verify_with_context(package, &ctx, participant, share, public_key)?;
        s += share.0;
    }
    if let Some(extra) = operator_shares
        .keys()
        .find(|id| !package.operator_commitments.contains_key(id))
    {
        return Err(ThresholdError::UnknownParticipant(Participant::Operator(
            *extra,
        )));
    }

    let mut signature = [0u8; 64];
    signature[..32].copy_from_slice(&ctx.group_commitment_x);
    signature[32..].copy_from_slice(&s.to_repr());

    let verified = match &package.adaptor_public_key {
        Some(adaptor) => {
            validate_adaptor_signature(&package.verifying_key, &package.message, &signature, adaptor)
                .is_ok()
        }
        None => verify_schnorr(&package.verifying_key, &package.message, &signature),
    };
    if !verified {
        return Err(ThresholdError::AggregationMismatch { culprit: None });
    }
    Ok(signature)
}

/// BIP340 verification under the x-only form of `public_key`.
pub fn verify_schnorr(public_key: &PublicKey, message: &[u8; 32], signature: &[u8; 64]) -> bool {
    use bitcoin::secp256k1::{Message, Secp256k1, schnorr};

    let Ok(sig) = schnorr::Signature::from_slice(signature) else {
        return false;
    };
    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(
        &sig,
        &Message::from_digest(*message),
        &public_key.x_only_public_key().0,
    )
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor_signature::{apply_adaptor, extract_adaptor_secret};
    use crate::secp::secret_key_from_scalar;
    use crate::verifiable_secret_sharing::split_secret_with_proofs;
    use bitcoin::secp256k1::Secp256k1;

    struct Fixture {
        user_secret: SecretKey,
        user_public: PublicKey,
        shares: BTreeMap<Identifier, SecretKey>,
        public_shares: BTreeMap<Identifier, PublicKey>,
        verifying_key: PublicKey,
    }

    fn fixture(threshold: usize, n: usize) -> Fixture {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        let user_secret = SecretKey::new(&mut rng);
        let operator_secret = SecretKey::new(&mut rng);
        let split = split_secret_with_proofs(
            &scalar_from_secret_key(&operator_secret),
            threshold,
            n,
            &mut rng,
        )
        .unwrap();

        let mut shares = BTreeMap::new();
        let mut public_shares = BTreeMap::new();
        for (i, share) in split.iter().enumerate() {
            let id = Identifier::from_operator_index(i as u32);
            let sk = secret_key_from_scalar(&share.secret_share.share).unwrap();
            public_shares.insert(id, PublicKey::from_secret_key(&secp, &sk));
            shares.insert(id, sk);
        }

        let user_public = PublicKey::from_secret_key(&secp, &user_secret);
        let verifying_key = user_public
            .combine(&PublicKey::from_secret_key(&secp, &operator_secret))
            .unwrap();
        Fixture {
            user_secret,
            user_public,
            shares,
            public_shares,
            verifying_key,
        }
    }

    fn run(
        f: &Fixture,
        signers: &[u32],
        message: [u8; 32],
        adaptor: Option<PublicKey>,
    ) -> (SigningPackage, SignatureShare, BTreeMap<Identifier, SignatureShare>) {
        let mut rng = rand::thread_rng();
        let (user_nonce, user_commitment) = generate_nonce(&mut rng);
        let mut nonces = BTreeMap::new();
        let mut operator_commitments = BTreeMap::new();
        for &i in signers {
            let id = Identifier::from_operator_index(i);
            let (nonce, commitment) = generate_nonce(&mut rng);
            nonces.insert(id, nonce);
            operator_commitments.insert(id, commitment);
        }
        let package = SigningPackage {
            message,
            verifying_key: f.verifying_key,
            user_commitment,
            operator_commitments,
            adaptor_public_key: adaptor,
        };

        let operator_shares = nonces
            .into_iter()
            .map(|(id, nonce)| {
                let share = sign_as_operator(&package, id, &f.shares[&id], nonce).unwrap();
                (id, share)
            })
            .collect();
        let user_share = sign_as_user(&package, &f.user_secret, user_nonce).unwrap();
        (package, user_share, operator_shares)
    }

    #[test]
    fn aggregate_verifies_for_every_signing_set() {
        let f = fixture(3, 5);
        for signers in [[0u32, 1, 2], [0, 2, 3], [1, 2, 4], [2, 3, 4]] {
            let msg = [signers.iter().sum::<u32>() as u8; 32];
            let (package, user_share, shares) = run(&f, &signers, msg, None);
            let sig = aggregate(&package, &user_share, &f.user_public, &shares, &f.public_shares)
                .unwrap();
            assert!(verify_schnorr(&f.verifying_key, &msg, &sig));
        }
    }

    #[test]
    fn aggregate_with_more_than_threshold_signers() {
        let f = fixture(3, 5);
        let msg = [0x77; 32];
        let (package, user_share, shares) = run(&f, &[0, 1, 2, 3, 4], msg, None);
        let sig =
            aggregate(&package, &user_share, &f.user_public, &shares, &f.public_shares).unwrap();
        assert!(verify_schnorr(&f.verifying_key, &msg, &sig));
    }

    #[test]
    fn tampered_operator_share_is_named() {
        let f = fixture(2, 3);
        let (package, user_share, mut shares) = run(&f, &[0, 2], [0x01; 32], None);
        let victim = Identifier::from_operator_index(2);
        let bumped = SignatureShare(shares[&victim].0 + Scalar::ONE);
        shares.insert(victim, bumped);

        let err = aggregate(&package, &user_share, &f.user_public, &shares, &f.public_shares)
            .unwrap_err();
        assert_eq!(
            err,
            ThresholdError::AggregationMismatch {
                culprit: Some(Participant::Operator(victim))
            }
        );
    }

    #[test]
    fn tampered_user_share_is_named() {
        let f = fixture(2, 3);
        let (package, user_share, shares) = run(&f, &[0, 1], [0x02; 32], None);
        let bad = SignatureShare(user_share.0 + Scalar::ONE);
        let err =
            aggregate(&package, &bad, &f.user_public, &shares, &f.public_shares).unwrap_err();
        assert_eq!(
            err,
            ThresholdError::AggregationMismatch {
                culprit: Some(Participant::User)
            }
        );
    }

    #[test]
    fn missing_share_is_reported() {
        let f = fixture(2, 3);
        let (package, user_share, mut shares) = run(&f, &[0, 1], [0x03; 32], None);
        let dropped = Identifier::from_operator_index(1);
        shares.remove(&dropped);
        assert_eq!(
            aggregate(&package, &user_share, &f.user_public, &shares, &f.public_shares),
            Err(ThresholdError::MissingShare(Participant::Operator(dropped)))
        );
    }

    #[test]
    fn wrong_verifying_key_fails_aggregate() {
        let mut f = fixture(2, 3);
        let secp = Secp256k1::new();
        f.verifying_key = PublicKey::from_secret_key(&secp, &SecretKey::new(&mut rand::thread_rng()));
        let (package, user_share, shares) = run(&f, &[0, 1], [0x04; 32], None);
        assert!(matches!(
            aggregate(&package, &user_share, &f.user_public, &shares, &f.public_shares),
            Err(ThresholdError::AggregationMismatch { .. })
        ));
    }

    #[test]
    fn nonce_must_match_commitment() {
        let f = fixture(2, 3);
        let mut rng = rand::thread_rng();
        let (_, user_commitment) = generate_nonce(&mut rng);
        let (_, op_commitment) = generate_nonce(&mut rng);
        let id = Identifier::from_operator_index(0);
        let package = SigningPackage {
            message: [0; 32],
            verifying_key: f.verifying_key,
            user_commitment,
            operator_commitments: BTreeMap::from([(id, op_commitment)]),
            adaptor_public_key: None,
        };
        let (stranger, _) = generate_nonce(&mut rng);
        assert!(sign_as_operator(&package, id, &f.shares[&id], stranger).is_err());
    }

    #[test]
    fn adaptor_aggregate_completes_with_secret() {
        let f = fixture(3, 5);
        let secp = Secp256k1::new();
        let msg = [0x42; 32];

        // Several adaptors to cover both group-commitment parities.
        for _ in 0..6 {
            let t = SecretKey::new(&mut rand::thread_rng());
            let big_t = PublicKey::from_secret_key(&secp, &t);
            let (package, user_share, shares) = run(&f, &[1, 3, 4], msg, Some(big_t));
            let adaptor_sig =
                aggregate(&package, &user_share, &f.user_public, &shares, &f.public_shares)
                    .unwrap();
            assert!(!verify_schnorr(&f.verifying_key, &msg, &adaptor_sig));

            let completed = apply_adaptor(&f.verifying_key, &msg, &adaptor_sig, &t).unwrap();
            assert!(verify_schnorr(&f.verifying_key, &msg, &completed));
            assert_eq!(
                extract_adaptor_secret(&adaptor_sig, &completed, &big_t).unwrap(),
                t
            );
        }
    }

    #[test]
    fn commitment_bytes_roundtrip() {
        let (_, commitment) = generate_nonce(&mut rand::thread_rng());
        let decoded = SigningCommitment::from_bytes(&commitment.to_bytes()).unwrap();
        assert_eq!(decoded, commitment);
        assert!(SigningCommitment::from_bytes(&[0u8; 65]).is_err());
    }

    #[test]
    fn identifier_matches_share_index() {
        let id = Identifier::from_operator_index(2);
        assert_eq!(id.value(), 3);
        assert_eq!(id.operator_index(), 2);
        assert_eq!(id.to_scalar(), Scalar::from(3u64));
        assert!(Identifier::new(0).is_none());
    }
}
