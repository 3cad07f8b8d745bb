//! Key custody for the wallet.
//!
//! This crate provides:
//!
//! - [`KeyStore`] trait -- derive/get/put/remove of leaf signing keys, plus
//!   the two identity-key operations the transfer protocol needs
//! - [`InMemoryKeyStore`] -- BIP32-seeded implementation holding keys in memory
//! - [`ecdsa`] module -- ECDSA sign/verify primitives over secp256k1
//!
//! The SDK never reads ambient key material: every key it signs with comes
//! from the `KeyStore` it was constructed with, addressed by public key.

pub mod ecdsa;
mod memory;

pub use memory::InMemoryKeyStore;

use std::fmt;

use bitcoin::secp256k1::{PublicKey, SecretKey};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStoreError {
    /// No secret is held for the requested public key.
    KeyNotFound(PublicKey),
    /// BIP32 derivation failed.
    DerivationFailed,
    /// The identity key could not open an ECIES cipher.
    DecryptionFailed,
}

impl fmt::Display for KeyStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyNotFound(pk) => write!(f, "no secret key held for {pk}"),
            Self::DerivationFailed => write!(f, "key derivation failed"),
            Self::DecryptionFailed => write!(f, "identity decryption failed"),
        }
    }
}

impl std::error::Error for KeyStoreError {}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// How [`KeyStore::derive`] picks the new key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDerivation<'a> {
    /// Deterministic key for a leaf id. Re-deriving yields the same key, so an
    /// interrupted claim can resume.
    Leaf(&'a str),
    /// Fresh random key, used for the transient key a sender hands over.
    Random,
}

/// Custody of the wallet's secret keys.
///
/// Keys are addressed by their public key. `derive` and `put` register the
/// secret so that a later `get` finds it; `remove` forgets it once the leaf it
/// controlled has changed hands.
pub trait KeyStore: Send + Sync {
    /// The wallet's identity public key.
    fn identity_public_key(&self) -> PublicKey;

    /// Creates (or re-creates) a signing key and returns its public key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::DerivationFailed`] if the key path is invalid.
    fn derive(&self, derivation: KeyDerivation<'_>) -> Result<PublicKey, KeyStoreError>;

    /// Returns the secret for `public_key`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::KeyNotFound`] if the key was never derived or
    /// imported, or has been removed.
    fn get(&self, public_key: &PublicKey) -> Result<SecretKey, KeyStoreError>;

    /// Imports a secret received from elsewhere (a decrypted transfer key).
    fn put(&self, secret: SecretKey) -> PublicKey;

    /// Forgets a key. Returns whether it was held.
    fn remove(&self, public_key: &PublicKey) -> bool;

    /// Compact ECDSA signature over `digest` with the identity key.
    fn sign_identity_digest(&self, digest: &[u8; 32]) -> [u8; 64];

    /// Opens an ECIES cipher addressed to the identity key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::DecryptionFailed`] on a malformed or foreign
    /// cipher.
    fn decrypt_for_identity(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KeyStoreError>;
}
