//! Tree store trait and domain types.

use bitcoin::secp256k1::PublicKey;
use bitcoin::{OutPoint, Sequence, Transaction, TxOut};
use sdk_core::LeafStatus;

use crate::SdkError;
use crate::bitcoin_tx::parse_tx;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Unique identifier for a leaf reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationId(pub u64);

/// A leaf: one output of a node transaction, spendable by the owner and the
/// operators jointly, with a timelocked refund back to the owner.
///
/// The protocol never edits a leaf in place. A transfer or timelock
/// extension produces a replacement record with the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub id: String,
    pub tree_id: String,
    /// Value in satoshis.
    pub value: u64,
    pub parent_id: Option<String>,
    /// Serialized node transaction.
    pub node_tx: Vec<u8>,
    /// Serialized refund transaction spending `node_tx:vout`.
    pub refund_tx: Vec<u8>,
    /// Output index in the node transaction.
    pub vout: u32,
    /// Joint key: owner signing key plus the operators' group key.
    pub verifying_public_key: PublicKey,
    pub owner_identity_public_key: PublicKey,
    pub owner_signing_public_key: PublicKey,
    pub status: LeafStatus,
}

impl Leaf {
    pub fn parsed_node_tx(&self) -> Result<Transaction, SdkError> {
        parse_tx(&self.node_tx).map_err(|_| SdkError::InvalidTransaction)
    }

    pub fn parsed_refund_tx(&self) -> Result<Transaction, SdkError> {
        parse_tx(&self.refund_tx).map_err(|_| SdkError::InvalidTransaction)
    }

    /// The node output this leaf represents, with its outpoint.
    pub fn node_output(&self) -> Result<(OutPoint, TxOut), SdkError> {
        let node_tx = self.parsed_node_tx()?;
        let out = node_tx
            .output
            .get(self.vout as usize)
            .cloned()
            .ok_or(SdkError::InvalidTransaction)?;
        Ok((OutPoint::new(node_tx.compute_txid(), self.vout), out))
    }

    /// nSequence of the current refund's first input.
    pub fn refund_sequence(&self) -> Result<Sequence, SdkError> {
        self.parsed_refund_tx()?
            .input
            .first()
            .map(|i| i.sequence)
            .ok_or(SdkError::InvalidTransaction)
    }
}

/// A set of reserved leaves with their reservation ID.
#[derive(Debug)]
pub struct LeafReservation {
    pub id: ReservationId,
    pub leaves: Vec<Leaf>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Storage for the wallet's leaves.
///
/// Implementations manage the lifecycle of leaves: insertion when deposited
/// or claimed, reservation during transfers, and removal when spent.
pub trait TreeStore: Send + Sync {
    /// Insert leaves, replacing any stored leaf with the same id. A replaced
    /// leaf keeps its reservation.
    fn insert_leaves(&self, leaves: &[Leaf]) -> Result<(), SdkError>;

    /// Remove leaves by ID.
    fn remove_leaves(&self, leaf_ids: &[&str]) -> Result<(), SdkError>;

    /// All leaves with status `Available`.
    fn get_available_leaves(&self) -> Result<Vec<Leaf>, SdkError>;

    /// Reserve a set of leaves by ID for an operation.
    ///
    /// Reserved leaves are `TransferLocked` and excluded from balance and
    /// selection until the reservation is finalized or cancelled.
    fn reserve_leaves(&self, leaf_ids: &[&str]) -> Result<LeafReservation, SdkError>;

    /// Finalize a reservation: remove the reserved leaves and optionally
    /// insert replacement leaves.
    fn finalize_reservation(
        &self,
        id: ReservationId,
        new_leaves: Option<&[Leaf]>,
    ) -> Result<(), SdkError>;

    /// Cancel a reservation, returning leaves to `Available`.
    fn cancel_reservation(&self, id: ReservationId) -> Result<(), SdkError>;

    /// Total value of available leaves in satoshis.
    fn available_balance(&self) -> Result<u64, SdkError>;
}
