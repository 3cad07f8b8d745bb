//! # SECP256k1
//!
//! Key arithmetic on `bitcoin::secp256k1` types, conversions to and from the
//! `k256` arithmetic types used by the sharing and signing modules, and the
//! BIP340 primitives (tagged challenge, even-y lifting) they share.
use std::fmt;

use bitcoin::hashes::{Hash, HashEngine, sha256};
use bitcoin::secp256k1::{Error as Secp256k1Error, PublicKey, Scalar, Secp256k1, SecretKey};
use k256::elliptic_curve::PrimeField;
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::point::{AffineCoordinates, DecompressPoint};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{AffinePoint, FieldBytes, ProjectivePoint, U256};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised when moving between encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointError {
    /// Bytes are not a valid SEC1 or x-only point.
    InvalidPoint,
    /// Point is the identity and has no SEC1 encoding.
    Identity,
    /// Bytes are zero or exceed the curve order.
    InvalidScalar,
}

impl fmt::Display for PointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPoint => write!(f, "invalid curve point"),
            Self::Identity => write!(f, "point at infinity"),
            Self::InvalidScalar => write!(f, "scalar out of range"),
        }
    }
}

impl std::error::Error for PointError {}

// ---------------------------------------------------------------------------
// Key arithmetic
// ---------------------------------------------------------------------------

/// Adds two public keys together (pk1 + pk2).
///
/// # Errors
/// - [`Secp256k1Error`] if the sum is the point at infinity.
///
/// # Examples
/// ```
/// use bitcoin::secp256k1::{PublicKey, SecretKey, Secp256k1};
/// use spark_crypto::secp::add_public_keys;
///
/// let secp = Secp256k1::new();
/// let pk1 = PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[0x01; 32]).unwrap());
/// let pk2 = PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[0x02; 32]).unwrap());
/// let result = add_public_keys(&pk1, &pk2).unwrap();
/// ```
pub fn add_public_keys(pk1: &PublicKey, pk2: &PublicKey) -> Result<PublicKey, Secp256k1Error> {
    pk1.combine(pk2)
}

/// Subtracts `pk2` from `pk1`.
pub fn subtract_public_keys(
    pk1: &PublicKey,
    pk2: &PublicKey,
) -> Result<PublicKey, Secp256k1Error> {
    let secp = Secp256k1::verification_only();
    pk1.combine(&pk2.negate(&secp))
}

/// Adds two secret keys together (sk1 + sk2).
///
/// # Errors
/// - [`Secp256k1Error`] if the sum is zero mod n.
pub fn add_secret_keys(sk1: &SecretKey, sk2: &SecretKey) -> Result<SecretKey, Secp256k1Error> {
    sk1.add_tweak(&Scalar::from(*sk2))
}

/// Subtracts `sk2` from `sk1`. This is the key-rotation delta sent to
/// operators when a leaf changes hands.
///
/// # Errors
/// - [`Secp256k1Error`] if both keys are equal (the delta would be zero).
pub fn subtract_secret_keys(
    sk1: &SecretKey,
    sk2: &SecretKey,
) -> Result<SecretKey, Secp256k1Error> {
    sk1.add_tweak(&sk2.negate().into())
}

// ---------------------------------------------------------------------------
// Conversions between bitcoin::secp256k1 and k256
// ---------------------------------------------------------------------------

pub fn scalar_from_secret_key(secret: &SecretKey) -> k256::Scalar {
    // A SecretKey is always a canonical non-zero scalar.
    <k256::Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(secret.secret_bytes()))
}

pub fn secret_key_from_scalar(scalar: &k256::Scalar) -> Result<SecretKey, PointError> {
    SecretKey::from_slice(&scalar.to_repr()).map_err(|_| PointError::InvalidScalar)
}

pub fn point_from_public_key(public_key: &PublicKey) -> Result<ProjectivePoint, PointError> {
    point_from_sec1(&public_key.serialize())
}

pub fn public_key_from_point(point: &ProjectivePoint) -> Result<PublicKey, PointError> {
    let encoded = point.to_affine().to_encoded_point(true);
    if encoded.is_identity() {
        return Err(PointError::Identity);
    }
    PublicKey::from_slice(encoded.as_bytes()).map_err(|_| PointError::InvalidPoint)
}

/// Parses a 33-byte SEC1-compressed point.
pub fn point_from_sec1(bytes: &[u8]) -> Result<ProjectivePoint, PointError> {
    k256::PublicKey::from_sec1_bytes(bytes)
        .map(|pk| pk.to_projective())
        .map_err(|_| PointError::InvalidPoint)
}

/// Parses 32 bytes as a canonical scalar (zero allowed).
pub fn scalar_from_repr(bytes: &[u8; 32]) -> Result<k256::Scalar, PointError> {
    Option::from(k256::Scalar::from_repr(FieldBytes::from(*bytes))).ok_or(PointError::InvalidScalar)
}

/// Reduces an arbitrary 32-byte digest mod n.
pub fn scalar_from_digest(digest: &[u8; 32]) -> k256::Scalar {
    <k256::Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(*digest))
}

// ---------------------------------------------------------------------------
// BIP340 primitives
// ---------------------------------------------------------------------------

/// Tagged hash `SHA256(SHA256(tag) || SHA256(tag) || parts...)`.
pub fn tagged_hash(tag: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let tag_hash = sha256::Hash::hash(tag);
    let tag = tag_hash.as_byte_array();

    let mut engine = sha256::Hash::engine();
    engine.input(tag);
    engine.input(tag);
    for part in parts {
        engine.input(part);
    }
    *sha256::Hash::from_engine(engine).as_byte_array()
}

/// BIP340 challenge scalar `e = H_challenge(r || P || m) mod n`.
pub fn bip340_challenge(r_x: &[u8; 32], pk_x: &[u8; 32], msg: &[u8; 32]) -> k256::Scalar {
    scalar_from_digest(&tagged_hash(b"BIP0340/challenge", &[r_x, pk_x, msg]))
}

/// x-coordinate of a point as 32 big-endian bytes.
pub fn x_bytes(point: &AffinePoint) -> [u8; 32] {
    point.x().into()
}

pub fn has_odd_y(point: &AffinePoint) -> bool {
    bool::from(point.y_is_odd())
}

/// Lifts a 32-byte x-only key to the point with even y.
pub fn lift_x_even_y(x: &[u8; 32]) -> Result<ProjectivePoint, PointError> {
    Option::<AffinePoint>::from(AffinePoint::decompress(&FieldBytes::from(*x), 0u8.into()))
        .map(ProjectivePoint::from)
        .ok_or(PointError::InvalidPoint)
}
