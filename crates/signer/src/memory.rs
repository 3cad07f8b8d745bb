//! BIP32-seeded key store that keeps secrets in process memory.

use std::collections::HashMap;
use std::sync::RwLock;

use bitcoin::bip32::Xpriv;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use spark_crypto::derivation_path::{KeyType, derive_key};
use spark_crypto::ecies;

use crate::{KeyDerivation, KeyStore, KeyStoreError, ecdsa};

/// In-memory [`KeyStore`].
///
/// The identity key sits at `m/8797555'/account'/0'`; leaf keys at
/// `m/8797555'/account'/1'/leaf_index(leaf_id)'`.
pub struct InMemoryKeyStore {
    secp: Secp256k1<All>,
    master: Xpriv,
    account: u32,
    identity_sk: SecretKey,
    identity_pk: PublicKey,
    keys: RwLock<HashMap<PublicKey, SecretKey>>,
}

impl InMemoryKeyStore {
    /// Creates a key store from a BIP32 seed (typically 64 bytes from a
    /// BIP39 mnemonic).
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::DerivationFailed`] if the seed is invalid or
    /// the account index is out of range.
    pub fn from_seed(
        seed: &[u8],
        network: bitcoin::Network,
        account: u32,
    ) -> Result<Self, KeyStoreError> {
        let secp = Secp256k1::new();
        let master =
            Xpriv::new_master(network, seed).map_err(|_| KeyStoreError::DerivationFailed)?;
        let identity_sk = derive_key(&secp, &master, account, KeyType::Identity, None)
            .map_err(|_| KeyStoreError::DerivationFailed)?;
        let identity_pk = PublicKey::from_secret_key(&secp, &identity_sk);

        Ok(Self {
            secp,
            master,
            account,
            identity_sk,
            identity_pk,
            keys: RwLock::new(HashMap::new()),
        })
    }

    /// Number of signing keys currently held.
    pub fn len(&self) -> usize {
        self.keys.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, secret: SecretKey) -> PublicKey {
        let public = PublicKey::from_secret_key(&self.secp, &secret);
        self.keys.write().unwrap().insert(public, secret);
        public
    }
}

impl KeyStore for InMemoryKeyStore {
    fn identity_public_key(&self) -> PublicKey {
        self.identity_pk
    }

    fn derive(&self, derivation: KeyDerivation<'_>) -> Result<PublicKey, KeyStoreError> {
        let secret = match derivation {
            KeyDerivation::Leaf(leaf_id) => derive_key(
                &self.secp,
                &self.master,
                self.account,
                KeyType::BaseSigning,
                Some(leaf_id),
            )
            .map_err(|_| KeyStoreError::DerivationFailed)?,
            KeyDerivation::Random => SecretKey::new(&mut rand_core::OsRng),
        };
        Ok(self.insert(secret))
    }

    fn get(&self, public_key: &PublicKey) -> Result<SecretKey, KeyStoreError> {
        self.keys
            .read()
            .unwrap()
            .get(public_key)
            .copied()
            .ok_or(KeyStoreError::KeyNotFound(*public_key))
    }

    fn put(&self, secret: SecretKey) -> PublicKey {
        self.insert(secret)
    }

    fn remove(&self, public_key: &PublicKey) -> bool {
        self.keys.write().unwrap().remove(public_key).is_some()
    }

    fn sign_identity_digest(&self, digest: &[u8; 32]) -> [u8; 64] {
        ecdsa::sign_digest(&self.secp, &self.identity_sk, digest)
    }

    fn decrypt_for_identity(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        ecies::decrypt(&self.identity_sk, ciphertext).map_err(|_| KeyStoreError::DecryptionFailed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn store(seed_byte: u8) -> InMemoryKeyStore {
        InMemoryKeyStore::from_seed(&[seed_byte; 64], bitcoin::Network::Regtest, 0).unwrap()
    }

    #[test]
    fn leaf_derivation_is_deterministic() {
        let a = store(0x01);
        let b = store(0x01);
        let pk_a = a.derive(KeyDerivation::Leaf("leaf-1")).unwrap();
        let pk_b = b.derive(KeyDerivation::Leaf("leaf-1")).unwrap();
        assert_eq!(pk_a, pk_b);
        assert_ne!(pk_a, a.derive(KeyDerivation::Leaf("leaf-2")).unwrap());
        assert_ne!(pk_a, a.identity_public_key());
    }

    #[test]
    fn random_keys_are_registered() {
        let ks = store(0x02);
        let pk = ks.derive(KeyDerivation::Random).unwrap();
        let sk = ks.get(&pk).unwrap();
        assert_eq!(PublicKey::from_secret_key(&Secp256k1::new(), &sk), pk);
        assert_ne!(pk, ks.derive(KeyDerivation::Random).unwrap());
    }

    #[test]
    fn put_get_remove() {
        let ks = store(0x03);
        let sk = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let pk = ks.put(sk);
        assert_eq!(ks.get(&pk).unwrap(), sk);
        assert!(ks.remove(&pk));
        assert!(!ks.remove(&pk));
        assert_eq!(ks.get(&pk), Err(KeyStoreError::KeyNotFound(pk)));
        assert!(ks.is_empty());
    }

    #[test]
    fn identity_signature_verifies() {
        let ks = store(0x04);
        let digest = [0x11; 32];
        let sig = ks.sign_identity_digest(&digest);
        ecdsa::verify_digest(&Secp256k1::new(), &ks.identity_public_key(), &digest, &sig).unwrap();
    }

    #[test]
    fn identity_decrypts_ciphers_addressed_to_it() {
        let alice = store(0x05);
        let bob = store(0x06);
        let ct = ecies::encrypt(&alice.identity_public_key(), b"leaf secret", &mut rand::thread_rng())
            .unwrap();
        assert_eq!(alice.decrypt_for_identity(&ct).unwrap(), b"leaf secret");
        assert_eq!(
            bob.decrypt_for_identity(&ct),
            Err(KeyStoreError::DecryptionFailed)
        );
    }

    #[test]
    fn account_changes_identity() {
        let a = InMemoryKeyStore::from_seed(&[0x07; 64], bitcoin::Network::Regtest, 0).unwrap();
        let b = InMemoryKeyStore::from_seed(&[0x07; 64], bitcoin::Network::Regtest, 1).unwrap();
        assert_ne!(a.identity_public_key(), b.identity_public_key());
    }
}
