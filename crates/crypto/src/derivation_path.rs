//! BIP32 key paths for wallet keys.
//!
//! Path format: `m/8797555'/account'/key_type'[/leaf_index']`
//!
//! | Type | Index | Purpose |
//! |------|-------|---------|
//! | Identity | 0' | Signs transfer packages, receives leaf-key ciphers |
//! | BaseSigning | 1' | Parent of the per-leaf signing keys |
//! | Deposit | 2' | Signs deposit transactions |
//!
//! Leaf keys hang off `BaseSigning` at a hardened index derived from the leaf
//! id, so a claim that was interrupted can re-derive the same key.

use std::fmt;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::hashes::{Hash, sha256};
use bitcoin::secp256k1::{Secp256k1, SecretKey, Signing};

pub const PURPOSE: u32 = 8797555;

/// Errors returned by derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivationError {
    /// The child index exceeds the valid BIP32 range (must be < 2^31).
    InvalidChildIndex(u32),
    /// BIP32 key derivation failed along the path.
    DerivationFailed,
}

impl fmt::Display for DerivationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidChildIndex(i) => write!(f, "child index {i} out of range"),
            Self::DerivationFailed => write!(f, "key derivation failed"),
        }
    }
}

impl std::error::Error for DerivationError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Identity,
    BaseSigning,
    Deposit,
}

impl KeyType {
    fn child_number(self) -> ChildNumber {
        let index = match self {
            Self::Identity => 0,
            Self::BaseSigning => 1,
            Self::Deposit => 2,
        };
        ChildNumber::Hardened { index }
    }
}

/// Maps a leaf id to a hardened child: first four bytes of `SHA-256(leaf_id)`
/// as a big-endian `u32`, reduced modulo `2^31`.
pub fn leaf_index(leaf_id: &str) -> ChildNumber {
    let hash = sha256::Hash::hash(leaf_id.as_bytes());
    let bytes = hash.as_byte_array();
    let index = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) % 0x8000_0000;
    ChildNumber::Hardened { index }
}

pub fn key_path(
    account: u32,
    key_type: KeyType,
    leaf_id: Option<&str>,
) -> Result<DerivationPath, DerivationError> {
    let account = ChildNumber::from_hardened_idx(account)
        .map_err(|_| DerivationError::InvalidChildIndex(account))?;
    let mut path = vec![
        ChildNumber::Hardened { index: PURPOSE },
        account,
        key_type.child_number(),
    ];
    if let Some(id) = leaf_id {
        path.push(leaf_index(id));
    }
    Ok(DerivationPath::from(path))
}

/// Derives the secret key at `key_path(account, key_type, leaf_id)` below `master`.
pub fn derive_key<C: Signing>(
    secp: &Secp256k1<C>,
    master: &Xpriv,
    account: u32,
    key_type: KeyType,
    leaf_id: Option<&str>,
) -> Result<SecretKey, DerivationError> {
    let path = key_path(account, key_type, leaf_id)?;
    master
        .derive_priv(secp, &path)
        .map(|xpriv| xpriv.private_key)
        .map_err(|_| DerivationError::DerivationFailed)
}
