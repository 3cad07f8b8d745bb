//! Adaptor signatures over secp256k1 (BIP340 Schnorr).
//!
//! An adaptor signature is a Schnorr signature "blinded" by an adaptor secret `t`.
//! The blinded signature can only be completed (made valid) by adding `t` back.
//! Conversely, once a completed signature is published, anyone with the adaptor
//! signature can extract `t`. Swaps and cooperative exits use this so that a
//! counter-party's refunds become valid exactly when the client reveals `t`.
//!
//! # Operations
//!
//! | Function | Input | Output |
//! |----------|-------|--------|
//! | [`generate_adaptor`] | Valid Schnorr sig `(r, s)` | Blinded sig `(r, s')`, secret `t`, point `T` |
//! | [`derive_from_existing_adaptor`] | Valid Schnorr sig, existing `t` | Blinded sig `(r, s')` |
//! | [`validate_adaptor_signature`] | Blinded sig, adaptor point `T` | Verification result |
//! | [`apply_adaptor`] | Blinded sig + secret `t` | Valid Schnorr sig (verified) |
//! | [`extract_adaptor_secret`] | Blinded sig + completed sig | Secret `t` (checked against `T`) |
//!
//! # Relationship between operations
//!
//! ```text
//! s' = s - t          (generate_adaptor / derive_from_existing_adaptor)
//! s  = s' + t         (apply_adaptor; s' - t when the nonce point was negated)
//! T  = t * G          (adaptor public point, derived from secret)
//! ```

use std::fmt;

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use k256::elliptic_curve::PrimeField;
use k256::{ProjectivePoint, Scalar};
use rand_core::{CryptoRng, RngCore};

use crate::secp::{
    bip340_challenge, has_odd_y, lift_x_even_y, point_from_public_key, scalar_from_repr,
    scalar_from_secret_key, secret_key_from_scalar, x_bytes,
};
use crate::threshold_signing::verify_schnorr;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors returned by adaptor signature operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptorError {
    /// Public key cannot be lifted to a valid secp256k1 point.
    InvalidPublicKey,
    /// Byte slice is not a valid secp256k1 scalar.
    InvalidScalar,
    /// Adaptor point cannot be parsed as a valid secp256k1 point.
    InvalidAdaptorPoint,
    /// Neither `s' + t` nor `s' - t` produced a valid Schnorr signature.
    VerificationFailed,
    /// Computed verification point is the identity (point at infinity).
    PointAtInfinity,
    /// Computed verification point has an odd y-coordinate.
    OddYCoordinate,
    /// Computed x-coordinate does not match the signature's `r` value.
    XCoordinateMismatch,
    /// The two signatures passed to extraction commit to different nonces.
    NonceMismatch,
    /// The extracted scalar does not match the adaptor point.
    SecretMismatch,
}

impl fmt::Display for AdaptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPublicKey => write!(f, "invalid public key"),
            Self::InvalidScalar => write!(f, "scalar out of range for secp256k1"),
            Self::InvalidAdaptorPoint => write!(f, "invalid adaptor point"),
            Self::VerificationFailed => write!(f, "adaptor signature verification failed"),
            Self::PointAtInfinity => write!(f, "computed point is at infinity"),
            Self::OddYCoordinate => write!(f, "computed point has odd y-coordinate"),
            Self::XCoordinateMismatch => write!(f, "x-coordinate does not match r"),
            Self::NonceMismatch => write!(f, "signatures have different nonces"),
            Self::SecretMismatch => write!(f, "extracted secret does not match adaptor point"),
        }
    }
}

impl std::error::Error for AdaptorError {}

// ---------------------------------------------------------------------------
// AdaptorPair
// ---------------------------------------------------------------------------

/// A blinded Schnorr signature together with the adaptor secret and point.
#[derive(Debug, Clone)]
pub struct AdaptorPair {
    /// Blinded signature `(r, s')`.
    pub signature: [u8; 64],
    /// Adaptor secret `t`.
    pub adaptor_secret: SecretKey,
    /// Adaptor point `T = t*G`.
    pub adaptor_public_key: PublicKey,
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn split_signature(sig: &[u8; 64]) -> ([u8; 32], [u8; 32]) {
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&sig[..32]);
    s.copy_from_slice(&sig[32..]);
    (r, s)
}

fn join_signature(r: &[u8; 32], s: &Scalar) -> [u8; 64] {
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(r);
    out[32..].copy_from_slice(&s.to_repr());
    out
}

fn parse_s(sig: &[u8; 64]) -> Result<([u8; 32], Scalar), AdaptorError> {
    let (r, s_bytes) = split_signature(sig);
    let s = scalar_from_repr(&s_bytes).map_err(|_| AdaptorError::InvalidScalar)?;
    Ok((r, s))
}

// ---------------------------------------------------------------------------
// Adaptor verification (BIP340 with adaptor point)
// ---------------------------------------------------------------------------

/// Checks one candidate nonce point against the BIP340 conditions:
/// not the identity, even y, x equal to `r`.
fn check_nonce_point(candidate: &ProjectivePoint, r: &[u8; 32]) -> Result<(), AdaptorError> {
    let affine = candidate.to_affine();
    if *candidate == ProjectivePoint::IDENTITY {
        return Err(AdaptorError::PointAtInfinity);
    }
    if has_odd_y(&affine) {
        return Err(AdaptorError::OddYCoordinate);
    }
    if x_bytes(&affine) != *r {
        return Err(AdaptorError::XCoordinateMismatch);
    }
    Ok(())
}

/// Verifies that a blinded signature is consistent with the signer's public
/// key, the message and the adaptor point `T`.
///
/// Computes `R' = s'*G - e*P` and accepts if `R' + T` or `R' - T` satisfies
/// the BIP340 nonce conditions. Both signs are needed: a threshold aggregate
/// whose group commitment had odd y carries `-R`.
pub fn validate_adaptor_signature(
    public_key: &PublicKey,
    message: &[u8; 32],
    signature: &[u8; 64],
    adaptor_public_key: &PublicKey,
) -> Result<(), AdaptorError> {
    let (r, s) = parse_s(signature)?;
    let pk_x = public_key.x_only_public_key().0.serialize();
    let pk_point = lift_x_even_y(&pk_x).map_err(|_| AdaptorError::InvalidPublicKey)?;
    let adaptor =
        point_from_public_key(adaptor_public_key).map_err(|_| AdaptorError::InvalidAdaptorPoint)?;
    let e = bip340_challenge(&r, &pk_x, message);

    let r_prime = ProjectivePoint::GENERATOR * s - pk_point * e;
    check_nonce_point(&(r_prime + adaptor), &r).or_else(|_| check_nonce_point(&(r_prime - adaptor), &r))
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Blinds a valid BIP340 signature with a fresh random adaptor secret.
pub fn generate_adaptor<R: RngCore + CryptoRng>(
    signature: &[u8; 64],
    rng: &mut R,
) -> Result<AdaptorPair, AdaptorError> {
    let adaptor_secret = SecretKey::new(rng);
    let blinded = derive_from_existing_adaptor(signature, &adaptor_secret)?;
    let secp = Secp256k1::signing_only();
    Ok(AdaptorPair {
        signature: blinded,
        adaptor_public_key: PublicKey::from_secret_key(&secp, &adaptor_secret),
        adaptor_secret,
    })
}

/// Blinds another signature with an adaptor secret that is already in use,
/// so that one reveal of `t` unlocks every signature in the set.
pub fn derive_from_existing_adaptor(
    signature: &[u8; 64],
    adaptor_secret: &SecretKey,
) -> Result<[u8; 64], AdaptorError> {
    let (r, s) = parse_s(signature)?;
    let t = scalar_from_secret_key(adaptor_secret);
    Ok(join_signature(&r, &(s - t)))
}

/// Completes an adaptor signature with the adaptor secret, with verification.
///
/// Tries `s = s' + t` first; if the resulting signature does not verify under
/// BIP340, tries `s = s' - t`. Returns the first candidate that verifies,
/// or [`AdaptorError::VerificationFailed`] if neither does.
pub fn apply_adaptor(
    public_key: &PublicKey,
    message: &[u8; 32],
    signature: &[u8; 64],
    adaptor_secret: &SecretKey,
) -> Result<[u8; 64], AdaptorError> {
    let (r, s) = parse_s(signature)?;
    let t = scalar_from_secret_key(adaptor_secret);

    for candidate in [s + t, s - t] {
        let completed = join_signature(&r, &candidate);
        if verify_schnorr(public_key, message, &completed) {
            return Ok(completed);
        }
    }
    Err(AdaptorError::VerificationFailed)
}

/// Recovers `t` from an adaptor signature and its published completion.
pub fn extract_adaptor_secret(
    adaptor_signature: &[u8; 64],
    completed_signature: &[u8; 64],
    adaptor_public_key: &PublicKey,
) -> Result<SecretKey, AdaptorError> {
    let (r_adaptor, s_adaptor) = parse_s(adaptor_signature)?;
    let (r_completed, s_completed) = parse_s(completed_signature)?;
    if r_adaptor != r_completed {
        return Err(AdaptorError::NonceMismatch);
    }
    let expected =
        point_from_public_key(adaptor_public_key).map_err(|_| AdaptorError::InvalidAdaptorPoint)?;

    let diff = s_completed - s_adaptor;
    for candidate in [diff, -diff] {
        if ProjectivePoint::GENERATOR * candidate == expected {
            return secret_key_from_scalar(&candidate).map_err(|_| AdaptorError::InvalidScalar);
        }
    }
    Err(AdaptorError::SecretMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Keypair, Message};

    const TEST_SK_BYTES: [u8; 32] = [0x11; 32];
    const TEST_MSG: [u8; 32] = [0xaa; 32];

    /// Keypair and a valid BIP340 Schnorr signature over `TEST_MSG`.
    fn setup() -> (PublicKey, [u8; 64]) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&TEST_SK_BYTES).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        let keypair = Keypair::from_secret_key(&secp, &sk);
        let msg = Message::from_digest(TEST_MSG);
        let sig = secp.sign_schnorr_no_aux_rand(&msg, &keypair);

        let mut sig_bytes = [0u8; 64];
        sig_bytes.copy_from_slice(sig.as_ref());
        assert!(verify_schnorr(&pk, &TEST_MSG, &sig_bytes));
        (pk, sig_bytes)
    }

    #[test]
    fn round_trip_generate_validate_complete() {
        let (pk, sig) = setup();
        let adaptor = generate_adaptor(&sig, &mut rand::thread_rng()).unwrap();

        assert!(!verify_schnorr(&pk, &TEST_MSG, &adaptor.signature));
        validate_adaptor_signature(&pk, &TEST_MSG, &adaptor.signature, &adaptor.adaptor_public_key)
            .unwrap();

        let completed = apply_adaptor(&pk, &TEST_MSG, &adaptor.signature, &adaptor.adaptor_secret)
            .unwrap();
        assert_eq!(completed, sig);
    }

    #[test]
    fn extraction_recovers_secret() {
        let (pk, sig) = setup();
        let adaptor = generate_adaptor(&sig, &mut rand::thread_rng()).unwrap();
        let completed = apply_adaptor(&pk, &TEST_MSG, &adaptor.signature, &adaptor.adaptor_secret)
            .unwrap();

        let extracted =
            extract_adaptor_secret(&adaptor.signature, &completed, &adaptor.adaptor_public_key)
                .unwrap();
        assert_eq!(extracted, adaptor.adaptor_secret);
    }

    #[test]
    fn derived_adaptors_share_one_secret() {
        let secp = Secp256k1::new();
        let (pk, first) = setup();
        let pair = generate_adaptor(&first, &mut rand::thread_rng()).unwrap();

        let other_sk = SecretKey::from_slice(&[0x22; 32]).unwrap();
        let other_pk = PublicKey::from_secret_key(&secp, &other_sk);
        let msg = Message::from_digest([0xbb; 32]);
        let other_sig = secp.sign_schnorr_no_aux_rand(&msg, &Keypair::from_secret_key(&secp, &other_sk));
        let mut other_bytes = [0u8; 64];
        other_bytes.copy_from_slice(other_sig.as_ref());

        let derived = derive_from_existing_adaptor(&other_bytes, &pair.adaptor_secret).unwrap();
        validate_adaptor_signature(&other_pk, &[0xbb; 32], &derived, &pair.adaptor_public_key)
            .unwrap();
        assert_eq!(
            apply_adaptor(&other_pk, &[0xbb; 32], &derived, &pair.adaptor_secret).unwrap(),
            other_bytes
        );
        validate_adaptor_signature(&pk, &TEST_MSG, &pair.signature, &pair.adaptor_public_key)
            .unwrap();
    }

    #[test]
    fn wrong_secret_does_not_complete() {
        let (pk, sig) = setup();
        let adaptor = generate_adaptor(&sig, &mut rand::thread_rng()).unwrap();
        let wrong = SecretKey::from_slice(&[0x33; 32]).unwrap();
        assert_eq!(
            apply_adaptor(&pk, &TEST_MSG, &adaptor.signature, &wrong),
            Err(AdaptorError::VerificationFailed)
        );
    }

    #[test]
    fn wrong_adaptor_point_fails_validation() {
        let secp = Secp256k1::new();
        let (pk, sig) = setup();
        let adaptor = generate_adaptor(&sig, &mut rand::thread_rng()).unwrap();
        let other = PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[0x44; 32]).unwrap());
        assert!(validate_adaptor_signature(&pk, &TEST_MSG, &adaptor.signature, &other).is_err());
    }

    #[test]
    fn wrong_message_fails_validation() {
        let (pk, sig) = setup();
        let adaptor = generate_adaptor(&sig, &mut rand::thread_rng()).unwrap();
        assert!(
            validate_adaptor_signature(&pk, &[0x00; 32], &adaptor.signature, &adaptor.adaptor_public_key)
                .is_err()
        );
    }

    #[test]
    fn extraction_rejects_foreign_signature() {
        let (_, sig) = setup();
        let adaptor = generate_adaptor(&sig, &mut rand::thread_rng()).unwrap();
        let mut other = sig;
        other[0] ^= 0x01;
        assert_eq!(
            extract_adaptor_secret(&adaptor.signature, &other, &adaptor.adaptor_public_key),
            Err(AdaptorError::NonceMismatch)
        );
    }

    #[test]
    fn out_of_range_s_is_rejected() {
        let mut sig = [0u8; 64];
        sig[32..].copy_from_slice(&[0xFF; 32]);
        let t = SecretKey::from_slice(&[0x01; 32]).unwrap();
        assert_eq!(
            derive_from_existing_adaptor(&sig, &t),
            Err(AdaptorError::InvalidScalar)
        );
    }
}
