//! Request and response types exchanged with signing operators.
//!
//! These mirror the operator RPC messages but use typed keys and crypto
//! values instead of raw bytes. Raw transactions travel as [`Bytes`] so a
//! request can be cloned once per operator without copying.

use std::collections::BTreeMap;

use bitcoin::TxOut;
use bitcoin::secp256k1::PublicKey;
use bytes::Bytes;
use sdk_core::{SignatureIntent, TransferStatus, TransferType};
use spark_crypto::threshold_signing::{
    Identifier, SignatureShare, SigningCommitment,
};
use spark_crypto::verifiable_secret_sharing::VerifiableSecretShare;

use crate::tree::Leaf;

// ---------------------------------------------------------------------------
// Transfers
// ---------------------------------------------------------------------------

/// Operator-side record of a transfer.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: String,
    pub sender_identity_public_key: PublicKey,
    pub receiver_identity_public_key: PublicKey,
    pub status: TransferStatus,
    pub transfer_type: TransferType,
    pub total_value: u64,
    /// Unix seconds.
    pub expiry_time: u64,
    pub leaves: Vec<TransferLeaf>,
}

impl Transfer {
    pub fn leaf(&self, leaf_id: &str) -> Option<&TransferLeaf> {
        self.leaves.iter().find(|l| l.leaf.id == leaf_id)
    }
}

/// One leaf moving in a transfer.
///
/// `secret_cipher` and `signature` are empty until the sender's key tweak has
/// reached the operator.
#[derive(Debug, Clone)]
pub struct TransferLeaf {
    /// The leaf as it was when the transfer started.
    pub leaf: Leaf,
    /// The transient leaf key, ECIES-encrypted to the receiver's identity.
    pub secret_cipher: Bytes,
    /// Sender identity signature over `leaf_id || transfer_id || secret_cipher`.
    pub signature: Bytes,
    /// Refund paying to the transient key, signed during the send.
    pub intermediate_refund_tx: Bytes,
    /// Signature over the intermediate refund. For swaps and exits this is
    /// the adaptor signature until the counter-party completes it.
    pub intermediate_refund_signature: Option<[u8; 64]>,
}

/// Filter for [`super::OperatorClient::query_transfers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferQuery {
    Id(String),
    Sender(PublicKey),
    Receiver(PublicKey),
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// A transaction the user wants co-signed under a leaf's verifying key.
///
/// Operators recompute the BIP-341 sighash of input 0 from `raw_tx` and
/// `prev_outs`; they never sign a digest supplied by the client.
#[derive(Debug, Clone)]
pub struct SigningJob {
    pub leaf_id: String,
    /// The user's current signing key for the leaf.
    pub signing_public_key: PublicKey,
    pub raw_tx: Bytes,
    pub prev_outs: Vec<TxOut>,
    pub user_commitment: SigningCommitment,
}

/// The operators' half of a threshold signature over one [`SigningJob`].
#[derive(Debug, Clone)]
pub struct SigningResult {
    pub leaf_id: String,
    pub verifying_key: PublicKey,
    pub operator_commitments: BTreeMap<Identifier, SigningCommitment>,
    pub signature_shares: BTreeMap<Identifier, SignatureShare>,
    pub public_shares: BTreeMap<Identifier, PublicKey>,
}

#[derive(Debug, Clone)]
pub struct StartTransferRequest {
    pub transfer_id: String,
    pub transfer_type: TransferType,
    pub owner_identity_public_key: PublicKey,
    pub receiver_identity_public_key: PublicKey,
    pub expiry_time: u64,
    /// One refund signing job per leaf.
    pub signing_jobs: Vec<SigningJob>,
}

#[derive(Debug, Clone)]
pub struct StartTransferResponse {
    pub transfer: Transfer,
    pub signing_results: Vec<SigningResult>,
}

/// Starts a transfer whose refunds are signed under an adaptor point.
#[derive(Debug, Clone)]
pub struct LeafSwapRequest {
    pub transfer: StartTransferRequest,
    pub swap_id: String,
    pub adaptor_public_key: PublicKey,
}

/// Starts a transfer whose refunds also spend connector outputs of an exit
/// transaction.
#[derive(Debug, Clone)]
pub struct CooperativeExitRequest {
    pub transfer: StartTransferRequest,
    pub exit_id: String,
    pub exit_txid: bitcoin::Txid,
}

// ---------------------------------------------------------------------------
// Key tweaks
// ---------------------------------------------------------------------------

/// Per-operator data for one leaf of a sender key tweak.
#[derive(Debug, Clone)]
pub struct LeafTweakBundle {
    pub leaf_id: String,
    /// This operator's share of `sk_old - sk_new`, with Feldman proofs.
    pub secret_share_tweak: VerifiableSecretShare,
    /// `share_i * G` for every operator, keyed by operator index.
    pub pubkey_shares_tweak: BTreeMap<u32, PublicKey>,
    pub secret_cipher: Bytes,
    pub signature: Bytes,
    pub refund_signature: [u8; 64],
}

#[derive(Debug, Clone)]
pub struct CompleteSendTransferRequest {
    pub transfer_id: String,
    pub owner_identity_public_key: PublicKey,
    pub leaves: Vec<LeafTweakBundle>,
}

/// Per-operator data for one leaf of a receiver key tweak.
#[derive(Debug, Clone)]
pub struct ClaimLeafTweak {
    pub leaf_id: String,
    pub secret_share_tweak: VerifiableSecretShare,
    pub pubkey_shares_tweak: BTreeMap<u32, PublicKey>,
}

#[derive(Debug, Clone)]
pub struct ClaimTweakRequest {
    pub transfer_id: String,
    pub owner_identity_public_key: PublicKey,
    pub leaves: Vec<ClaimLeafTweak>,
}

#[derive(Debug, Clone)]
pub struct ClaimSignRequest {
    pub transfer_id: String,
    pub owner_identity_public_key: PublicKey,
    pub signing_jobs: Vec<SigningJob>,
}

// ---------------------------------------------------------------------------
// Finalization
// ---------------------------------------------------------------------------

/// Aggregated signatures for one leaf.
#[derive(Debug, Clone)]
pub struct NodeSignatures {
    pub leaf_id: String,
    /// Present when the node transaction itself was re-signed (extension).
    pub node_tx_signature: Option<[u8; 64]>,
    pub refund_tx_signature: [u8; 64],
}

#[derive(Debug, Clone)]
pub struct FinalizeNodeSignaturesRequest {
    pub intent: SignatureIntent,
    /// Required for `Transfer`.
    pub transfer_id: Option<String>,
    pub owner_identity_public_key: PublicKey,
    pub nodes: Vec<NodeSignatures>,
}

// ---------------------------------------------------------------------------
// Timelock extension, cancellation, preimages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExtendLeafRequest {
    pub leaf_id: String,
    pub owner_identity_public_key: PublicKey,
    pub node_tx_signing_job: SigningJob,
    pub refund_tx_signing_job: SigningJob,
}

#[derive(Debug, Clone)]
pub struct ExtendLeafResponse {
    pub leaf_id: String,
    pub node_tx_signing_result: SigningResult,
    pub refund_tx_signing_result: SigningResult,
}

#[derive(Debug, Clone)]
pub struct CancelTransferRequest {
    pub transfer_id: String,
    pub sender_identity_public_key: PublicKey,
}

#[derive(Debug, Clone)]
pub struct StorePreimageShareRequest {
    pub payment_hash: [u8; 32],
    pub preimage_share: VerifiableSecretShare,
    pub threshold: usize,
    pub invoice: String,
    pub user_identity_public_key: PublicKey,
}
