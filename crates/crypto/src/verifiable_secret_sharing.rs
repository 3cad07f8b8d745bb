//! Verifiable Secret Sharing (VSS) over secp256k1.
//!
//! Feldman-verifiable Shamir sharing modulo the secp256k1 group order. A
//! key-rotation delta is split into one share per operator; any `threshold`
//! of them reconstruct it and fewer reveal nothing. Each share carries the
//! generator multiples of every polynomial coefficient so that an operator
//! can check its share without learning the secret.
//!
//! # Example
//!
//! ```
//! use spark_crypto::verifiable_secret_sharing::*;
//!
//! let secret = scalar_from_bytes(&[0x42; 32]).unwrap();
//! let mut rng = rand_core::OsRng;
//! let shares = split_secret_with_proofs(&secret, 3, 5, &mut rng).unwrap();
//!
//! for share in &shares {
//!     validate_share(share).unwrap();
//! }
//!
//! let recovered = recover_secret(&shares[0..3]).unwrap();
//! assert_eq!(secret, recovered);
//! ```

use std::collections::HashSet;
use std::fmt;

use k256::{
    AffinePoint, FieldBytes, ProjectivePoint, PublicKey, Scalar, elliptic_curve::PrimeField,
};
use rand_core::{CryptoRng, RngCore};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors returned by VSS operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VssError {
    /// Threshold is zero or exceeds the number of shares.
    InvalidThreshold,
    /// Byte slice is not 32 bytes.
    InvalidByteLength { expected: usize, got: usize },
    /// Byte value exceeds the secp256k1 scalar field order.
    ScalarOutOfRange,
    /// Attempted division by zero in field arithmetic.
    DivisionByZero,
    /// Scalar has no multiplicative inverse (should only occur for zero).
    NotInvertible,
    /// Fewer shares provided than the threshold requires.
    InsufficientShares { required: usize, provided: usize },
    /// Two or more shares have the same index.
    DuplicateShareIndices,
    /// Proof vector length does not match the threshold.
    InvalidProofLength { expected: usize, got: usize },
    /// The share does not match the polynomial committed to by its proofs.
    InvalidShare,
    /// A coefficient or share evaluated to zero and has no public key.
    DegenerateScalar,
}

impl fmt::Display for VssError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidThreshold => write!(f, "invalid threshold"),
            Self::InvalidByteLength { expected, got } => {
                write!(f, "invalid byte length: expected {expected}, got {got}")
            }
            Self::ScalarOutOfRange => write!(f, "scalar out of range"),
            Self::DivisionByZero => write!(f, "division by zero"),
            Self::NotInvertible => write!(f, "element not invertible"),
            Self::InsufficientShares { required, provided } => {
                write!(f, "insufficient shares: need {required}, got {provided}")
            }
            Self::DuplicateShareIndices => write!(f, "duplicate share indices"),
            Self::InvalidProofLength { expected, got } => {
                write!(
                    f,
                    "invalid VSS proof length: expected {expected}, got {got}"
                )
            }
            Self::InvalidShare => write!(f, "share does not match its proofs"),
            Self::DegenerateScalar => write!(f, "zero scalar has no public key"),
        }
    }
}

impl std::error::Error for VssError {}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Trait for types that can participate in Lagrange interpolation.
pub trait LagrangeInterpolatable {
    /// The share index (x-coordinate on the polynomial).
    fn index(&self) -> &Scalar;
    /// The share value (y-coordinate on the polynomial).
    fn share(&self) -> &Scalar;
    /// The threshold required to reconstruct the secret.
    fn threshold(&self) -> usize;
}

/// A single share produced by Shamir's Secret Sharing.
#[derive(Debug, Clone)]
pub struct SecretShare {
    /// Minimum number of shares needed for reconstruction.
    pub threshold: usize,
    /// Index (x-coordinate) of this share.
    pub index: Scalar,
    /// Value (y-coordinate) of this share.
    pub share: Scalar,
}

impl LagrangeInterpolatable for SecretShare {
    fn index(&self) -> &Scalar {
        &self.index
    }
    fn share(&self) -> &Scalar {
        &self.share
    }
    fn threshold(&self) -> usize {
        self.threshold
    }
}

/// A verifiable secret share with cryptographic proofs.
#[derive(Debug, Clone)]
pub struct VerifiableSecretShare {
    /// The underlying secret share.
    pub secret_share: SecretShare,
    /// One proof (public key) per polynomial coefficient.
    pub proofs: Vec<PublicKey>,
}

impl LagrangeInterpolatable for VerifiableSecretShare {
    fn index(&self) -> &Scalar {
        &self.secret_share.index
    }
    fn share(&self) -> &Scalar {
        &self.secret_share.share
    }
    fn threshold(&self) -> usize {
        self.secret_share.threshold
    }
}

// ---------------------------------------------------------------------------
// Scalar helpers
// ---------------------------------------------------------------------------

/// Converts a 32-byte big-endian slice to a secp256k1 scalar.
///
/// # Errors
///
/// Returns [`VssError::InvalidByteLength`] if `bytes.len() != 32`, or
/// [`VssError::ScalarOutOfRange`] if the value exceeds the curve order.
pub fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar, VssError> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| VssError::InvalidByteLength {
        expected: 32,
        got: bytes.len(),
    })?;
    Scalar::from_repr_vartime(FieldBytes::from(arr)).ok_or(VssError::ScalarOutOfRange)
}

/// Serializes a scalar to a 32-byte big-endian array.
pub fn scalar_to_bytes(scalar: &Scalar) -> [u8; 32] {
    scalar.to_bytes().into()
}

fn scalar_to_pubkey(secret: &Scalar) -> Result<PublicKey, VssError> {
    let point = ProjectivePoint::GENERATOR * *secret;
    PublicKey::from_affine(AffinePoint::from(point)).map_err(|_| VssError::DegenerateScalar)
}

/// Public counterpart `share * G` of a share. Operators add it to their
/// public key share when the rotation is applied.
pub fn share_public_key(share: &VerifiableSecretShare) -> Result<PublicKey, VssError> {
    scalar_to_pubkey(&share.secret_share.share)
}

/// Computes `base ^ exp` in the scalar field via square-and-multiply.
fn scalar_modpow(base: &Scalar, exp: usize) -> Scalar {
    if exp == 0 {
        return Scalar::ONE;
    }
    let mut result = Scalar::ONE;
    let mut b = *base;
    let mut e = exp;
    while e > 0 {
        if e & 1 == 1 {
            result *= b;
        }
        b *= b;
        e >>= 1;
    }
    result
}

/// Divides `numerator` by `denominator` in the scalar field.
fn field_div(numerator: &Scalar, denominator: &Scalar) -> Result<Scalar, VssError> {
    if bool::from(denominator.is_zero()) {
        return Err(VssError::DivisionByZero);
    }
    let inverse = denominator
        .invert()
        .into_option()
        .ok_or(VssError::NotInvertible)?;
    Ok(*numerator * inverse)
}

// ---------------------------------------------------------------------------
// Polynomial (internal)
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Polynomial {
    coefficients: Vec<Scalar>,
    proofs: Vec<PublicKey>,
}

impl Polynomial {
    /// Evaluates the polynomial at `x`.
    fn evaluate(&self, x: &Scalar) -> Scalar {
        let mut result = Scalar::ZERO;
        let mut x_power = Scalar::ONE;
        for coeff in &self.coefficients {
            result += *coeff * x_power;
            x_power *= x;
        }
        result
    }
}

/// Generates a random polynomial with the given secret as the constant term.
fn generate_polynomial<R: RngCore + CryptoRng>(
    secret: &Scalar,
    threshold: usize,
    rng: &mut R,
) -> Result<Polynomial, VssError> {
    let mut coefficients = Vec::with_capacity(threshold);
    let mut proofs = Vec::with_capacity(threshold);

    coefficients.push(*secret);
    proofs.push(scalar_to_pubkey(secret)?);

    while coefficients.len() < threshold {
        let mut buf = [0u8; 32];
        rng.fill_bytes(&mut buf);
        // Out-of-range or zero draws are rejected and redrawn.
        let Ok(coeff) = scalar_from_bytes(&buf) else {
            continue;
        };
        if bool::from(coeff.is_zero()) {
            continue;
        }
        proofs.push(scalar_to_pubkey(&coeff)?);
        coefficients.push(coeff);
    }

    Ok(Polynomial {
        coefficients,
        proofs,
    })
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Computes the Lagrange basis coefficient L_j(0) for `index` over the
/// x-coordinates in `indices`. `index` itself may appear in `indices`.
///
/// # Errors
///
/// Returns [`VssError::DivisionByZero`] if `indices` repeats an x-coordinate
/// equal to `index` modulo the group order.
pub fn lagrange_coefficient(index: &Scalar, indices: &[Scalar]) -> Result<Scalar, VssError> {
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    let mut skipped_self = false;

    for other in indices {
        if other == index && !skipped_self {
            skipped_self = true;
            continue;
        }
        // L_j(0) = product_{i != j} (-x_i) / (x_j - x_i)
        numerator *= -(*other);
        denominator *= *index - *other;
    }

    field_div(&numerator, &denominator)
}

/// Splits a secret into `number_of_shares` verifiable shares.
///
/// Any `threshold` shares are sufficient to recover the original secret.
/// Each share includes cryptographic proofs that allow verification without
/// revealing the secret.
///
/// # Errors
///
/// Returns [`VssError::InvalidThreshold`] if `threshold` is 0 or exceeds
/// `number_of_shares`.
pub fn split_secret_with_proofs<R: RngCore + CryptoRng>(
    secret_scalar: &Scalar,
    threshold: usize,
    number_of_shares: usize,
    rng: &mut R,
) -> Result<Vec<VerifiableSecretShare>, VssError> {
    if threshold == 0 || threshold > number_of_shares {
        return Err(VssError::InvalidThreshold);
    }

    let polynomial = generate_polynomial(secret_scalar, threshold, rng)?;

    let shares = (1..=number_of_shares)
        .map(|i| {
            let index = Scalar::from(i as u64);
            let share = polynomial.evaluate(&index);
            VerifiableSecretShare {
                secret_share: SecretShare {
                    threshold,
                    index,
                    share,
                },
                proofs: polynomial.proofs.clone(),
            }
        })
        .collect();

    Ok(shares)
}

/// Recovers the secret from a set of shares via Lagrange interpolation.
///
/// # Errors
///
/// Returns [`VssError::InsufficientShares`] if fewer shares than the threshold
/// are provided (an empty slice included), or
/// [`VssError::DuplicateShareIndices`] if any two shares have the same index.
pub fn recover_secret<T: LagrangeInterpolatable>(shares: &[T]) -> Result<Scalar, VssError> {
    let Some(first) = shares.first() else {
        return Err(VssError::InsufficientShares {
            required: 1,
            provided: 0,
        });
    };
    let required = first.threshold();
    if shares.len() < required {
        return Err(VssError::InsufficientShares {
            required,
            provided: shares.len(),
        });
    }

    let mut seen: HashSet<[u8; 32]> = HashSet::with_capacity(shares.len());
    for s in shares {
        let idx_bytes: [u8; 32] = s.index().to_bytes().into();
        if !seen.insert(idx_bytes) {
            return Err(VssError::DuplicateShareIndices);
        }
    }

    let indices: Vec<Scalar> = shares.iter().map(|s| *s.index()).collect();
    let mut result = Scalar::ZERO;
    for s in shares {
        let coeff = lagrange_coefficient(s.index(), &indices)?;
        result += s.share() * &coeff;
    }
    Ok(result)
}

/// Validates a verifiable share against its cryptographic proofs.
///
/// Checks that `share * G == sum_k(proof_k * index^k)` which confirms the
/// share is consistent with the polynomial committed to by the proofs.
///
/// # Errors
///
/// Returns [`VssError::InvalidProofLength`] if the proof count does not match
/// the threshold, or [`VssError::InvalidShare`] if the check fails.
pub fn validate_share(share: &VerifiableSecretShare) -> Result<(), VssError> {
    let expected = share.secret_share.threshold;
    if share.proofs.len() != expected {
        return Err(VssError::InvalidProofLength {
            expected,
            got: share.proofs.len(),
        });
    }

    let target = ProjectivePoint::GENERATOR * share.secret_share.share;
    let mut accumulated = ProjectivePoint::IDENTITY;

    for (i, proof) in share.proofs.iter().enumerate() {
        let point = ProjectivePoint::from(proof.as_affine());
        let exp = scalar_modpow(&share.secret_share.index, i);
        accumulated += point * exp;
    }

    if accumulated == target {
        Ok(())
    } else {
        Err(VssError::InvalidShare)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use k256::elliptic_curve::sec1::ToEncodedPoint;

    fn test_rng() -> rand::rngs::ThreadRng {
        rand::thread_rng()
    }

    fn random_secret(rng: &mut impl RngCore) -> Scalar {
        loop {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            if let Ok(secret) = scalar_from_bytes(&bytes) {
                return secret;
            }
        }
    }

    /// All `k`-element subsets of `0..n`, as index vectors.
    fn subsets(n: usize, k: usize) -> Vec<Vec<usize>> {
        fn go(start: usize, n: usize, k: usize, acc: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
            if acc.len() == k {
                out.push(acc.clone());
                return;
            }
            for i in start..n {
                acc.push(i);
                go(i + 1, n, k, acc, out);
                acc.pop();
            }
        }
        let mut out = Vec::new();
        go(0, n, k, &mut Vec::new(), &mut out);
        out
    }

    fn pick(shares: &[VerifiableSecretShare], which: &[usize]) -> Vec<VerifiableSecretShare> {
        which.iter().map(|&i| shares[i].clone()).collect()
    }

    // -- scalar_from_bytes / scalar_to_bytes --

    #[test]
    fn scalar_roundtrip() {
        let bytes = [0x42; 32];
        let scalar = scalar_from_bytes(&bytes).unwrap();
        assert_eq!(bytes, scalar_to_bytes(&scalar));
    }

    #[test]
    fn scalar_from_bytes_wrong_length() {
        assert!(matches!(
            scalar_from_bytes(&[0u8; 31]),
            Err(VssError::InvalidByteLength {
                expected: 32,
                got: 31
            })
        ));
        assert!(matches!(
            scalar_from_bytes(&[0u8; 33]),
            Err(VssError::InvalidByteLength {
                expected: 32,
                got: 33
            })
        ));
    }

    #[test]
    fn scalar_from_bytes_out_of_range() {
        // All 0xFF exceeds the secp256k1 curve order
        assert!(matches!(
            scalar_from_bytes(&[0xFF; 32]),
            Err(VssError::ScalarOutOfRange)
        ));
    }

    // -- field helpers --

    #[test]
    fn modpow_small_values() {
        let x = Scalar::from(3u64);
        assert_eq!(scalar_modpow(&x, 0), Scalar::ONE);
        assert_eq!(scalar_modpow(&x, 1), x);
        // 3^4 = 81
        assert_eq!(scalar_modpow(&x, 4), Scalar::from(81u64));
    }

    #[test]
    fn field_div_by_zero() {
        assert!(matches!(
            field_div(&Scalar::ONE, &Scalar::ZERO),
            Err(VssError::DivisionByZero)
        ));
    }

    #[test]
    fn lagrange_coefficients_sum_to_one() {
        let indices: Vec<Scalar> = (1..=4u64).map(Scalar::from).collect();
        let sum = indices
            .iter()
            .map(|i| lagrange_coefficient(i, &indices).unwrap())
            .fold(Scalar::ZERO, |acc, c| acc + c);
        assert_eq!(sum, Scalar::ONE);
    }

    #[test]
    fn lagrange_rejects_repeated_index() {
        let indices = [Scalar::from(2u64), Scalar::from(2u64), Scalar::from(3u64)];
        assert!(matches!(
            lagrange_coefficient(&Scalar::from(2u64), &indices),
            Err(VssError::DivisionByZero)
        ));
    }

    // -- threshold validation --

    #[test]
    fn split_rejects_bad_thresholds() {
        let secret = scalar_from_bytes(&[0x11; 32]).unwrap();
        assert!(matches!(
            split_secret_with_proofs(&secret, 0, 5, &mut test_rng()),
            Err(VssError::InvalidThreshold)
        ));
        assert!(matches!(
            split_secret_with_proofs(&secret, 6, 5, &mut test_rng()),
            Err(VssError::InvalidThreshold)
        ));
    }

    // -- recovery --

    #[test]
    fn every_threshold_subset_recovers() {
        let mut rng = test_rng();
        let secret = random_secret(&mut rng);
        let shares = split_secret_with_proofs(&secret, 3, 5, &mut rng).unwrap();

        for subset in subsets(5, 3) {
            assert_eq!(recover_secret(&pick(&shares, &subset)).unwrap(), secret);
        }
        for subset in subsets(5, 4) {
            assert_eq!(recover_secret(&pick(&shares, &subset)).unwrap(), secret);
        }
    }

    #[test]
    fn every_sub_threshold_subset_is_rejected() {
        let mut rng = test_rng();
        let secret = random_secret(&mut rng);
        let shares = split_secret_with_proofs(&secret, 3, 5, &mut rng).unwrap();

        for subset in subsets(5, 2) {
            assert!(matches!(
                recover_secret(&pick(&shares, &subset)),
                Err(VssError::InsufficientShares {
                    required: 3,
                    provided: 2
                })
            ));
        }
    }

    #[test]
    fn sub_threshold_interpolation_misses_secret() {
        // Forcing interpolation over two points yields a line, not the secret.
        let mut rng = test_rng();
        let secret = random_secret(&mut rng);
        let shares = split_secret_with_proofs(&secret, 3, 5, &mut rng).unwrap();

        let lowered: Vec<SecretShare> = shares[..2]
            .iter()
            .map(|s| SecretShare {
                threshold: 2,
                ..s.secret_share.clone()
            })
            .collect();
        assert_ne!(recover_secret(&lowered).unwrap(), secret);
    }

    #[test]
    fn literal_three_of_five_recovery() {
        let mut secret_bytes = [0u8; 32];
        secret_bytes[31] = 42;
        let secret = scalar_from_bytes(&secret_bytes).unwrap();
        let shares = split_secret_with_proofs(&secret, 3, 5, &mut test_rng()).unwrap();

        assert_eq!(shares.len(), 5);
        for (i, share) in shares.iter().enumerate() {
            assert_eq!(share.secret_share.index, Scalar::from(i as u64 + 1));
            assert_eq!(share.proofs.len(), 3);
            validate_share(share).unwrap();
        }

        // Shares are 1-based: {1,3,4} and {2,3,5}.
        assert_eq!(recover_secret(&pick(&shares, &[0, 2, 3])).unwrap(), secret);
        assert_eq!(recover_secret(&pick(&shares, &[1, 2, 4])).unwrap(), secret);
    }

    #[test]
    fn recover_rejects_empty_input() {
        let empty: [SecretShare; 0] = [];
        assert!(matches!(
            recover_secret(&empty),
            Err(VssError::InsufficientShares { provided: 0, .. })
        ));
    }

    #[test]
    fn recover_rejects_duplicate_indices() {
        let secret = scalar_from_bytes(&[0x11; 32]).unwrap();
        let shares = split_secret_with_proofs(&secret, 2, 3, &mut test_rng()).unwrap();
        let duped = vec![shares[0].clone(), shares[0].clone()];
        assert!(matches!(
            recover_secret(&duped),
            Err(VssError::DuplicateShareIndices)
        ));
    }

    #[test]
    fn threshold_of_one_hands_out_the_secret() {
        let secret = scalar_from_bytes(&[0x05; 32]).unwrap();
        let shares = split_secret_with_proofs(&secret, 1, 3, &mut test_rng()).unwrap();
        for share in &shares {
            assert_eq!(share.secret_share.share, secret);
            validate_share(share).unwrap();
        }
    }

    // -- validation --

    #[test]
    fn share_public_key_matches_share() {
        let secret = scalar_from_bytes(&[0x21; 32]).unwrap();
        let shares = split_secret_with_proofs(&secret, 2, 3, &mut test_rng()).unwrap();
        let pk = share_public_key(&shares[1]).unwrap();
        assert_eq!(
            pk.to_projective(),
            ProjectivePoint::GENERATOR * shares[1].secret_share.share
        );
    }

    #[test]
    fn mutated_share_byte_is_caught() {
        let mut rng = test_rng();
        let secret = random_secret(&mut rng);
        let shares = split_secret_with_proofs(&secret, 3, 5, &mut rng).unwrap();

        for position in [0usize, 13, 31] {
            let mut share = shares[1].clone();
            let mut bytes = scalar_to_bytes(&share.secret_share.share);
            bytes[position] ^= 0x01;
            let Ok(mutated) = scalar_from_bytes(&bytes) else {
                continue;
            };
            share.secret_share.share = mutated;
            assert!(matches!(validate_share(&share), Err(VssError::InvalidShare)));
        }
    }

    #[test]
    fn mutated_proof_is_caught() {
        let mut rng = test_rng();
        let secret = random_secret(&mut rng);
        let mut shares = split_secret_with_proofs(&secret, 3, 5, &mut rng).unwrap();

        // Flip the parity byte of the last proof: same x, negated point.
        let mut proof_bytes = shares[0].proofs[2]
            .to_encoded_point(true)
            .as_bytes()
            .to_vec();
        proof_bytes[0] ^= 0x01;
        shares[0].proofs[2] = PublicKey::from_sec1_bytes(&proof_bytes).unwrap();
        assert!(matches!(
            validate_share(&shares[0]),
            Err(VssError::InvalidShare)
        ));
    }

    #[test]
    fn swapped_share_value_is_caught() {
        let mut rng = test_rng();
        let secret = random_secret(&mut rng);
        let mut shares = split_secret_with_proofs(&secret, 3, 5, &mut rng).unwrap();
        shares[2].secret_share.share = shares[3].secret_share.share;
        assert!(validate_share(&shares[2]).is_err());
    }

    #[test]
    fn catch_invalid_proof_length() {
        let mut rng = test_rng();
        let secret = random_secret(&mut rng);
        let mut shares = split_secret_with_proofs(&secret, 3, 5, &mut rng).unwrap();

        let extra = shares[0].proofs[0].clone();
        shares[0].proofs.push(extra);

        assert!(matches!(
            validate_share(&shares[0]),
            Err(VssError::InvalidProofLength {
                expected: 3,
                got: 4
            })
        ));
    }
}
