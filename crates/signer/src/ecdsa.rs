//! ECDSA signing and verification over secp256k1.
//!
//! Transfer packages are authenticated with compact (64-byte) ECDSA
//! signatures over a SHA256 digest, made with the sender's identity key.

use std::fmt;

use bitcoin::hashes::{Hash, HashEngine, sha256};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey, Signing, Verification};

/// Errors returned by ECDSA operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcdsaError {
    /// The signature does not verify against the given public key and digest.
    VerificationFailed,
    /// The provided bytes are not a valid compact (64-byte) ECDSA signature.
    InvalidCompact,
}

impl fmt::Display for EcdsaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VerificationFailed => write!(f, "ECDSA signature verification failed"),
            Self::InvalidCompact => write!(f, "invalid compact ECDSA signature"),
        }
    }
}

impl std::error::Error for EcdsaError {}

/// ECDSA-sign a 32-byte digest, returning the compact encoding.
pub fn sign_digest(
    secp: &Secp256k1<impl Signing>,
    secret_key: &SecretKey,
    digest: &[u8; 32],
) -> [u8; 64] {
    secp.sign_ecdsa(&Message::from_digest(*digest), secret_key)
        .serialize_compact()
}

/// Verify a compact ECDSA signature against a 32-byte digest.
///
/// # Errors
///
/// Returns [`EcdsaError::InvalidCompact`] for malformed bytes and
/// [`EcdsaError::VerificationFailed`] if the signature is invalid.
pub fn verify_digest(
    secp: &Secp256k1<impl Verification>,
    public_key: &PublicKey,
    digest: &[u8; 32],
    signature: &[u8],
) -> Result<(), EcdsaError> {
    let sig = Signature::from_compact(signature).map_err(|_| EcdsaError::InvalidCompact)?;
    secp.verify_ecdsa(&Message::from_digest(*digest), &sig, public_key)
        .map_err(|_| EcdsaError::VerificationFailed)
}

/// SHA256 over the concatenation of `parts`.
pub fn digest(parts: &[&[u8]]) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    for part in parts {
        engine.input(part);
    }
    *sha256::Hash::from_engine(engine).as_byte_array()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keypair(byte: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).expect("valid secret key");
        let pk = PublicKey::from_secret_key(&secp, &sk);
        (sk, pk)
    }

    #[test]
    fn sign_and_verify_digest() {
        let secp = Secp256k1::new();
        let (sk, pk) = test_keypair(0xcd);
        let d = digest(&[b"leaf", b"transfer", b"cipher"]);

        let sig = sign_digest(&secp, &sk, &d);
        verify_digest(&secp, &pk, &d, &sig).expect("should verify");
    }

    #[test]
    fn digest_is_concatenation() {
        assert_eq!(digest(&[b"ab", b"c"]), digest(&[b"a", b"bc"]));
        assert_eq!(
            digest(&[b"abc"]),
            *sha256::Hash::hash(b"abc").as_byte_array()
        );
    }

    #[test]
    fn wrong_digest_fails_verification() {
        let secp = Secp256k1::new();
        let (sk, pk) = test_keypair(0xcd);
        let sig = sign_digest(&secp, &sk, &[0x01; 32]);
        assert_eq!(
            verify_digest(&secp, &pk, &[0x02; 32], &sig),
            Err(EcdsaError::VerificationFailed)
        );
    }

    #[test]
    fn wrong_key_fails_verification() {
        let secp = Secp256k1::new();
        let (sk, _) = test_keypair(0xcd);
        let (_, other_pk) = test_keypair(0xef);
        let sig = sign_digest(&secp, &sk, &[0x01; 32]);
        assert_eq!(
            verify_digest(&secp, &other_pk, &[0x01; 32], &sig),
            Err(EcdsaError::VerificationFailed)
        );
    }

    #[test]
    fn malformed_signature_rejected() {
        let secp = Secp256k1::new();
        let (_, pk) = test_keypair(0xcd);
        assert_eq!(
            verify_digest(&secp, &pk, &[0x01; 32], &[0u8; 10]),
            Err(EcdsaError::InvalidCompact)
        );
    }
}
