//! Elliptic Curve Integrated Encryption Scheme (ECIES) for secp256k1.
//!
//! Used to hand a leaf's new signing key to the receiver: only the holder of
//! the receiver's identity key can open the cipher.
//!
//! Wire format: `ephemeral_pk(65, uncompressed) || nonce(16) || tag(16) || ciphertext`.
//! The symmetric key is HKDF-SHA256 (zero salt, empty info) over
//! `ephemeral_pk || shared_point`, both uncompressed; the cipher is
//! AES-256-GCM with a 16-byte nonce.
//!
//! # Example
//!
//! ```
//! use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
//! use spark_crypto::ecies;
//!
//! let secp = Secp256k1::new();
//! let sk = SecretKey::from_slice(&[0xcd; 32]).unwrap();
//! let pk = PublicKey::from_secret_key(&secp, &sk);
//!
//! let ciphertext = ecies::encrypt(&pk, b"hello world", &mut rand_core::OsRng).unwrap();
//! let plaintext = ecies::decrypt(&sk, &ciphertext).unwrap();
//! assert_eq!(plaintext, b"hello world");
//! ```

use std::fmt;

use aes_gcm::aead::AeadInPlace;
use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, KeyInit};
use bitcoin::hashes::{Hash, HashEngine, hmac, sha256};
use bitcoin::secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};
use rand_core::{CryptoRng, RngCore};

/// AES-256-GCM with 16-byte nonce.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

const NONCE_SIZE: usize = 16;
const TAG_SIZE: usize = 16;
const KEY_SIZE: usize = 65;
const HEADER_SIZE: usize = KEY_SIZE + NONCE_SIZE + TAG_SIZE;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors returned by ECIES operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EciesError {
    /// The ephemeral public key in the ciphertext is not a valid point.
    InvalidPublicKey,
    /// The ciphertext is shorter than its header.
    InvalidMessage,
    /// AES-256-GCM encryption failed.
    EncryptionFailed,
    /// AES-256-GCM decryption failed (wrong key or tampered ciphertext).
    DecryptionFailed,
}

impl fmt::Display for EciesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPublicKey => write!(f, "invalid public key"),
            Self::InvalidMessage => write!(f, "invalid message"),
            Self::EncryptionFailed => write!(f, "encryption failed"),
            Self::DecryptionFailed => write!(f, "decryption failed"),
        }
    }
}

impl std::error::Error for EciesError {}

// ---------------------------------------------------------------------------
// Key agreement
// ---------------------------------------------------------------------------

/// HKDF-SHA256 extract-then-expand with zero salt and empty info, one block.
fn hkdf_sha256(ikm: &[u8]) -> [u8; 32] {
    let salt = [0u8; 32];
    let mut extract = hmac::HmacEngine::<sha256::Hash>::new(&salt);
    extract.input(ikm);
    let prk = hmac::Hmac::from_engine(extract);

    let mut expand = hmac::HmacEngine::<sha256::Hash>::new(prk.as_byte_array());
    expand.input(&[1u8]);
    *hmac::Hmac::from_engine(expand).as_byte_array()
}

/// Symmetric key from ECDH between `secret` and `point`.
fn shared_key(
    ephemeral_pk: &PublicKey,
    point: &PublicKey,
    secret: &SecretKey,
) -> Result<[u8; 32], EciesError> {
    let secp = Secp256k1::verification_only();
    let shared = point
        .mul_tweak(&secp, &Scalar::from(*secret))
        .map_err(|_| EciesError::InvalidPublicKey)?;

    let mut ikm = [0u8; KEY_SIZE * 2];
    ikm[..KEY_SIZE].copy_from_slice(&ephemeral_pk.serialize_uncompressed());
    ikm[KEY_SIZE..].copy_from_slice(&shared.serialize_uncompressed());
    Ok(hkdf_sha256(&ikm))
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Encrypts `msg` to `receiver`.
#[allow(deprecated)]
pub fn encrypt<R: RngCore + CryptoRng>(
    receiver: &PublicKey,
    msg: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>, EciesError> {
    use aes_gcm::aead::generic_array::GenericArray;

    let secp = Secp256k1::signing_only();
    let ephemeral_sk = SecretKey::new(rng);
    let ephemeral_pk = PublicKey::from_secret_key(&secp, &ephemeral_sk);
    let key = shared_key(&ephemeral_pk, receiver, &ephemeral_sk)?;

    let mut nonce = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut nonce);

    let mut out = Vec::with_capacity(HEADER_SIZE + msg.len());
    out.extend_from_slice(&ephemeral_pk.serialize_uncompressed());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&[0u8; TAG_SIZE]);
    out.extend_from_slice(msg);

    let cipher = Aes256Gcm16::new(GenericArray::from_slice(&key));
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&nonce), &[], &mut out[HEADER_SIZE..])
        .map_err(|_| EciesError::EncryptionFailed)?;
    out[KEY_SIZE + NONCE_SIZE..HEADER_SIZE].copy_from_slice(tag.as_slice());
    Ok(out)
}

/// Decrypts a ciphertext produced by [`encrypt`] with the receiver's key.
#[allow(deprecated)]
pub fn decrypt(receiver: &SecretKey, ciphertext: &[u8]) -> Result<Vec<u8>, EciesError> {
    use aes_gcm::aead::generic_array::GenericArray;

    if ciphertext.len() < HEADER_SIZE {
        return Err(EciesError::InvalidMessage);
    }
    let ephemeral_pk = PublicKey::from_slice(&ciphertext[..KEY_SIZE])
        .map_err(|_| EciesError::InvalidPublicKey)?;
    let key = shared_key(&ephemeral_pk, &ephemeral_pk, receiver)?;

    let nonce = &ciphertext[KEY_SIZE..KEY_SIZE + NONCE_SIZE];
    let tag = &ciphertext[KEY_SIZE + NONCE_SIZE..HEADER_SIZE];
    let mut out = ciphertext[HEADER_SIZE..].to_vec();

    let cipher = Aes256Gcm16::new(GenericArray::from_slice(&key));
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            &[],
            &mut out,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| EciesError::DecryptionFailed)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair(byte: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        (sk, PublicKey::from_secret_key(&secp, &sk))
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (sk, pk) = keypair(0x21);
        let msg = [0x5a; 32];
        let ct = encrypt(&pk, &msg, &mut rand::thread_rng()).unwrap();
        assert_eq!(ct.len(), HEADER_SIZE + msg.len());
        assert_eq!(decrypt(&sk, &ct).unwrap(), msg);
    }

    #[test]
    fn empty_message() {
        let (sk, pk) = keypair(0x22);
        let ct = encrypt(&pk, &[], &mut rand::thread_rng()).unwrap();
        assert!(decrypt(&sk, &ct).unwrap().is_empty());
    }

    #[test]
    fn wrong_key_fails() {
        let (_, pk) = keypair(0x23);
        let (other, _) = keypair(0x24);
        let ct = encrypt(&pk, b"leaf key", &mut rand::thread_rng()).unwrap();
        assert_eq!(decrypt(&other, &ct), Err(EciesError::DecryptionFailed));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (sk, pk) = keypair(0x25);
        let mut ct = encrypt(&pk, b"leaf key", &mut rand::thread_rng()).unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert_eq!(decrypt(&sk, &ct), Err(EciesError::DecryptionFailed));
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let (sk, _) = keypair(0x26);
        assert_eq!(
            decrypt(&sk, &[0u8; HEADER_SIZE - 1]),
            Err(EciesError::InvalidMessage)
        );
    }
}
