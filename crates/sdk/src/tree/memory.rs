//! In-memory tree store backed by `RwLock<HashMap>`.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use sdk_core::LeafStatus;

use crate::SdkError;

use super::store::{Leaf, LeafReservation, ReservationId, TreeStore};

// ---------------------------------------------------------------------------
// InMemoryTreeStore
// ---------------------------------------------------------------------------

/// In-memory tree store for development and testing.
///
/// Leaf status doubles as the reservation flag: reserved leaves are
/// `TransferLocked`. Reservations are tracked by an auto-incrementing
/// counter.
pub struct InMemoryTreeStore {
    leaves: RwLock<HashMap<String, Leaf>>,
    /// Active reservations: reservation ID -> leaf IDs.
    reservations: RwLock<HashMap<ReservationId, Vec<String>>>,
    next_reservation: AtomicU64,
}

impl InMemoryTreeStore {
    pub fn new() -> Self {
        Self {
            leaves: RwLock::new(HashMap::new()),
            reservations: RwLock::new(HashMap::new()),
            next_reservation: AtomicU64::new(1),
        }
    }

    /// Every stored leaf, reserved or not.
    pub fn all_leaves(&self) -> Vec<Leaf> {
        self.leaves.read().unwrap().values().cloned().collect()
    }
}

impl Default for InMemoryTreeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeStore for InMemoryTreeStore {
    fn insert_leaves(&self, leaves: &[Leaf]) -> Result<(), SdkError> {
        let mut map = self.leaves.write().unwrap();
        for leaf in leaves {
            let mut leaf = leaf.clone();
            if let Some(existing) = map.get(&leaf.id)
                && existing.status == LeafStatus::TransferLocked
            {
                leaf.status = LeafStatus::TransferLocked;
            }
            map.insert(leaf.id.clone(), leaf);
        }
        Ok(())
    }

    fn remove_leaves(&self, leaf_ids: &[&str]) -> Result<(), SdkError> {
        let mut map = self.leaves.write().unwrap();
        for id in leaf_ids {
            map.remove(*id);
        }
        Ok(())
    }

    fn get_available_leaves(&self) -> Result<Vec<Leaf>, SdkError> {
        let leaves = self.leaves.read().unwrap();
        Ok(leaves
            .values()
            .filter(|l| l.status == LeafStatus::Available)
            .cloned()
            .collect())
    }

    fn reserve_leaves(&self, leaf_ids: &[&str]) -> Result<LeafReservation, SdkError> {
        let mut leaves = self.leaves.write().unwrap();
        let mut reservations = self.reservations.write().unwrap();

        // Verify all leaves exist and are available before touching any.
        for id in leaf_ids {
            match leaves.get(*id) {
                Some(leaf) if leaf.status == LeafStatus::Available => {}
                _ => return Err(SdkError::InsufficientBalance),
            }
        }

        let rid = ReservationId(self.next_reservation.fetch_add(1, Ordering::Relaxed));
        let mut nodes = Vec::with_capacity(leaf_ids.len());
        for id in leaf_ids {
            if let Some(leaf) = leaves.get_mut(*id) {
                leaf.status = LeafStatus::TransferLocked;
                nodes.push(leaf.clone());
            }
        }
        reservations.insert(rid, leaf_ids.iter().map(|s| (*s).to_owned()).collect());

        Ok(LeafReservation {
            id: rid,
            leaves: nodes,
        })
    }

    fn finalize_reservation(
        &self,
        id: ReservationId,
        new_leaves: Option<&[Leaf]>,
    ) -> Result<(), SdkError> {
        let mut reservations = self.reservations.write().unwrap();
        let mut leaves = self.leaves.write().unwrap();

        let leaf_ids = reservations
            .remove(&id)
            .ok_or(SdkError::ReservationNotFound)?;
        for lid in &leaf_ids {
            leaves.remove(lid);
        }
        if let Some(new) = new_leaves {
            for leaf in new {
                leaves.insert(leaf.id.clone(), leaf.clone());
            }
        }
        Ok(())
    }

    fn cancel_reservation(&self, id: ReservationId) -> Result<(), SdkError> {
        let mut reservations = self.reservations.write().unwrap();
        let mut leaves = self.leaves.write().unwrap();

        let leaf_ids = reservations
            .remove(&id)
            .ok_or(SdkError::ReservationNotFound)?;
        for lid in &leaf_ids {
            if let Some(leaf) = leaves.get_mut(lid) {
                leaf.status = LeafStatus::Available;
            }
        }
        Ok(())
    }

    fn available_balance(&self) -> Result<u64, SdkError> {
        let leaves = self.leaves.read().unwrap();
        Ok(leaves
            .values()
            .filter(|l| l.status == LeafStatus::Available)
            .map(|l| l.value)
            .sum())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

    fn key(byte: u8) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::new(), &SecretKey::from_slice(&[byte; 32]).unwrap())
    }

    pub(crate) fn make_leaf(id: &str, value: u64) -> Leaf {
        Leaf {
            id: id.to_owned(),
            tree_id: "tree-1".to_owned(),
            value,
            parent_id: None,
            node_tx: vec![0x01],
            refund_tx: vec![0x02],
            vout: 0,
            verifying_public_key: key(2),
            owner_identity_public_key: key(3),
            owner_signing_public_key: key(5),
            status: LeafStatus::Available,
        }
    }

    #[test]
    fn insert_and_get_available() {
        let store = InMemoryTreeStore::new();
        store
            .insert_leaves(&[make_leaf("a", 100), make_leaf("b", 200)])
            .unwrap();

        assert_eq!(store.get_available_leaves().unwrap().len(), 2);
        assert_eq!(store.available_balance().unwrap(), 300);
    }

    #[test]
    fn reserve_locks_leaves() {
        let store = InMemoryTreeStore::new();
        store
            .insert_leaves(&[make_leaf("a", 100), make_leaf("b", 200)])
            .unwrap();

        let reservation = store.reserve_leaves(&["a"]).unwrap();
        assert_eq!(reservation.leaves.len(), 1);
        assert_eq!(reservation.leaves[0].status, LeafStatus::TransferLocked);

        let available = store.get_available_leaves().unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, "b");
        assert_eq!(store.available_balance().unwrap(), 200);
    }

    #[test]
    fn replacing_a_reserved_leaf_keeps_it_locked() {
        let store = InMemoryTreeStore::new();
        store.insert_leaves(&[make_leaf("a", 100)]).unwrap();
        let reservation = store.reserve_leaves(&["a"]).unwrap();

        let mut extended = make_leaf("a", 100);
        extended.refund_tx = vec![0x09];
        store.insert_leaves(&[extended]).unwrap();
        assert_eq!(store.available_balance().unwrap(), 0);

        store.cancel_reservation(reservation.id).unwrap();
        let available = store.get_available_leaves().unwrap();
        assert_eq!(available[0].refund_tx, vec![0x09]);
    }

    #[test]
    fn finalize_with_replacement_leaves() {
        let store = InMemoryTreeStore::new();
        store.insert_leaves(&[make_leaf("a", 100)]).unwrap();

        let reservation = store.reserve_leaves(&["a"]).unwrap();
        store
            .finalize_reservation(reservation.id, Some(&[make_leaf("c", 50)]))
            .unwrap();

        let available = store.get_available_leaves().unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, "c");
    }

    #[test]
    fn cancel_returns_leaves_to_available() {
        let store = InMemoryTreeStore::new();
        store.insert_leaves(&[make_leaf("a", 100)]).unwrap();

        let reservation = store.reserve_leaves(&["a"]).unwrap();
        assert_eq!(store.available_balance().unwrap(), 0);

        store.cancel_reservation(reservation.id).unwrap();
        assert_eq!(store.available_balance().unwrap(), 100);
    }

    #[test]
    fn double_reserve_fails() {
        let store = InMemoryTreeStore::new();
        store.insert_leaves(&[make_leaf("a", 100)]).unwrap();

        let _r = store.reserve_leaves(&["a"]).unwrap();
        assert_eq!(
            store.reserve_leaves(&["a"]).unwrap_err(),
            SdkError::InsufficientBalance
        );
    }

    #[test]
    fn failed_reserve_locks_nothing() {
        let store = InMemoryTreeStore::new();
        store.insert_leaves(&[make_leaf("a", 100)]).unwrap();
        assert!(store.reserve_leaves(&["a", "missing"]).is_err());
        assert_eq!(store.available_balance().unwrap(), 100);
    }

    #[test]
    fn finalize_unknown_reservation_fails() {
        let store = InMemoryTreeStore::new();
        assert_eq!(
            store.finalize_reservation(ReservationId(999), None),
            Err(SdkError::ReservationNotFound)
        );
    }
}
