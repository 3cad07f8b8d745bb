//! Operator-side records and request handling for [`super::LocalNetwork`].
//!
//! One `State` holds the view of every operator. Key shares, staged tweaks
//! and committed receiver tweaks are kept per operator index so that each
//! operator only ever touches its own share.

use std::collections::{BTreeMap, HashMap, HashSet};

use bitcoin::hashes::{Hash, sha256};
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::{OutPoint, Transaction, TxOut, Txid};
use bytes::Bytes;
use config::NetworkConfig;
use k256::{ProjectivePoint, Scalar};
use rand_core::OsRng;
use sdk_core::{SignatureIntent, TransferStatus, TransferType};
use spark_crypto::secp;
use spark_crypto::threshold_signing::{self, Identifier, SigningPackage, verify_schnorr};
use spark_crypto::verifiable_secret_sharing::{
    SecretShare, VerifiableSecretShare, recover_secret, scalar_to_bytes, validate_share,
};
use tracing::{debug, info};

use crate::bitcoin_tx::{parse_tx, serialize_tx, taproot_sighash};
use crate::operator::{
    CancelTransferRequest, ClaimSignRequest, ClaimTweakRequest, CompleteSendTransferRequest,
    ExtendLeafRequest, ExtendLeafResponse, FinalizeNodeSignaturesRequest, OperatorError,
    OperatorRpc, SigningJob, SigningResult, StartTransferRequest, StartTransferResponse,
    StorePreimageShareRequest, Transfer, TransferLeaf, TransferQuery,
};
use crate::timelock::timelock_of;
use crate::tree::Leaf;
use crate::utils::{hex_encode, now_secs};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A leaf as the operators know it.
pub(super) struct LeafRecord {
    pub leaf: Leaf,
    /// Each operator's share of the operator half of the leaf key, by
    /// operator index.
    pub key_shares: BTreeMap<u32, Scalar>,
    /// The transfer holding the leaf, if any.
    pub locked_by: Option<String>,
    pending_extension: Option<PendingExtension>,
}

impl LeafRecord {
    pub fn new(leaf: Leaf, key_shares: BTreeMap<u32, Scalar>) -> Self {
        Self {
            leaf,
            key_shares,
            locked_by: None,
            pending_extension: None,
        }
    }
}

/// Node and refund transactions signed by `extend_leaf`, waiting for
/// finalization.
struct PendingExtension {
    node_tx: Transaction,
    refund_tx: Transaction,
    node_sighash: [u8; 32],
    refund_sighash: [u8; 32],
}

/// The receiver's refund for one claimed leaf.
struct ClaimRefund {
    tx: Transaction,
    sighash: [u8; 32],
    signing_public_key: PublicKey,
}

struct LeafInTransfer {
    /// Sighash of the intermediate refund signed at start.
    refund_sighash: [u8; 32],
    claim_refund: Option<ClaimRefund>,
}

pub(super) struct TransferRecord {
    pub transfer: Transfer,
    leaves: BTreeMap<String, LeafInTransfer>,
    /// Sender tweak shares received but not applied, by operator then leaf.
    pub staged: BTreeMap<u32, BTreeMap<String, Scalar>>,
    /// Receiver tweak shares applied, by operator then leaf.
    claimed: BTreeMap<u32, BTreeMap<String, Scalar>>,
}

/// The part of a leaf's key package to corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPackagePart {
    /// The sender's signature over the package.
    Signature,
    /// The encrypted transient key.
    Cipher,
}

/// Injected failures.
#[derive(Debug, Default)]
pub(super) struct Faults {
    pub failing: HashSet<(u32, OperatorRpc)>,
    pub offline: HashSet<u32>,
    pub corrupt: HashSet<u32>,
    /// Calls that take effect but whose response never arrives.
    pub lost_responses: HashSet<(u32, OperatorRpc)>,
    /// Operators that acknowledge a sender tweak without keeping the share.
    pub stale_echo: HashSet<u32>,
}

pub(super) struct State {
    pub config: NetworkConfig,
    pub leaves: HashMap<String, LeafRecord>,
    pub transfers: HashMap<String, TransferRecord>,
    pub preimages: HashMap<[u8; 32], BTreeMap<u32, VerifiableSecretShare>>,
    pub faults: Faults,
    pub extend_calls: usize,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn invalid(msg: impl Into<String>) -> OperatorError {
    OperatorError::InvalidArgument(msg.into())
}

fn precondition(msg: impl Into<String>) -> OperatorError {
    OperatorError::FailedPrecondition(msg.into())
}

fn internal(e: impl std::fmt::Display) -> OperatorError {
    OperatorError::Internal(e.to_string())
}

/// x-coordinate of an operator's share.
pub(super) fn share_index(operator: u32) -> Scalar {
    Scalar::from(u64::from(operator) + 1)
}

fn public_share(share: &Scalar) -> Result<PublicKey, OperatorError> {
    secp::public_key_from_point(&(ProjectivePoint::GENERATOR * *share)).map_err(internal)
}

/// The operators' joint public key, interpolated from their shares.
pub(super) fn group_public_key(
    shares: &BTreeMap<u32, Scalar>,
    threshold: usize,
) -> Result<PublicKey, OperatorError> {
    let shares: Vec<SecretShare> = shares
        .iter()
        .map(|(operator, share)| SecretShare {
            threshold,
            index: share_index(*operator),
            share: *share,
        })
        .collect();
    let secret = recover_secret(&shares).map_err(internal)?;
    public_share(&secret)
}

/// Input 0 of `tx` must spend `outpoint`, and the job must commit to its
/// real previous output.
fn check_spend(
    job: &SigningJob,
    tx: &Transaction,
    outpoint: OutPoint,
    output: &TxOut,
) -> Result<(), OperatorError> {
    if tx.input.first().map(|i| i.previous_output) != Some(outpoint)
        || job.prev_outs.first() != Some(output)
    {
        return Err(invalid(format!(
            "transaction for leaf {} does not spend its node output",
            job.leaf_id
        )));
    }
    Ok(())
}

/// Checks a tweak share addressed to `operator` and returns its value.
fn check_tweak_share(
    operator: u32,
    threshold: usize,
    share: &VerifiableSecretShare,
    public_shares: &BTreeMap<u32, PublicKey>,
) -> Result<Scalar, OperatorError> {
    if share.secret_share.index != share_index(operator) {
        return Err(invalid("share addressed to another operator"));
    }
    if share.secret_share.threshold != threshold {
        return Err(invalid("share threshold does not match the network"));
    }
    validate_share(share).map_err(|_| invalid("share fails its Feldman proofs"))?;
    if public_shares.get(&operator) != Some(&public_share(&share.secret_share.share)?) {
        return Err(invalid("public share does not match the secret share"));
    }
    Ok(share.secret_share.share)
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

impl State {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            leaves: HashMap::new(),
            transfers: HashMap::new(),
            preimages: HashMap::new(),
            faults: Faults::default(),
            extend_calls: 0,
        }
    }

    /// Applies injected faults to a call.
    pub fn check(&self, operator: u32, rpc: OperatorRpc) -> Result<(), OperatorError> {
        if !self.config.operators().iter().any(|op| op.index == operator) {
            return Err(invalid(format!("unknown operator {operator}")));
        }
        if self.faults.offline.contains(&operator) {
            return Err(OperatorError::Unavailable);
        }
        if self.faults.failing.contains(&(operator, rpc)) {
            return Err(OperatorError::Internal(format!("injected {rpc} failure")));
        }
        Ok(())
    }

    pub fn require_coordinator(&self, operator: u32) -> Result<(), OperatorError> {
        if operator != self.config.coordinator().index {
            return Err(precondition(format!("operator {operator} is not the coordinator")));
        }
        Ok(())
    }

    /// Expires transfers past their expiry that no operator committed yet.
    fn expire_stale(&mut self) {
        let now = now_secs();
        let expired: Vec<String> = self
            .transfers
            .values()
            .filter(|r| r.transfer.status.is_cancellable_by_sender() && r.transfer.expiry_time <= now)
            .map(|r| r.transfer.id.clone())
            .collect();
        for transfer_id in expired {
            self.release(&transfer_id, TransferStatus::Expired);
        }
    }

    /// Ends a transfer: drops staged tweaks and unlocks its leaves.
    fn release(&mut self, transfer_id: &str, status: TransferStatus) {
        if let Some(record) = self.transfers.get_mut(transfer_id) {
            record.transfer.status = status.clone();
            record.staged.clear();
        }
        for record in self.leaves.values_mut() {
            if record.locked_by.as_deref() == Some(transfer_id) {
                record.locked_by = None;
            }
        }
        debug!(transfer_id, status = %status, "transfer released");
    }

    /// Online operators that take part in signing.
    fn signers(&self) -> Result<Vec<u32>, OperatorError> {
        let online: Vec<u32> = self
            .config
            .operators()
            .iter()
            .map(|op| op.index)
            .filter(|index| !self.faults.offline.contains(index))
            .collect();
        if online.len() < self.config.threshold() {
            return Err(OperatorError::Unavailable);
        }
        Ok(online)
    }

    /// Threshold-signs input 0 of `job` with the leaf's current key shares.
    ///
    /// The job's signing key plus the operators' group key must equal the
    /// leaf's verifying key. Returns the result with the parsed transaction
    /// and its sighash.
    fn sign_job(
        &self,
        record: &LeafRecord,
        job: &SigningJob,
        adaptor_public_key: Option<PublicKey>,
    ) -> Result<(SigningResult, Transaction, [u8; 32]), OperatorError> {
        let tx = parse_tx(&job.raw_tx).map_err(|_| invalid("unparseable transaction"))?;
        let sighash = taproot_sighash(&tx, 0, &job.prev_outs)
            .map_err(|_| invalid("previous outputs do not match the transaction"))?;

        let verifying_key = record.leaf.verifying_public_key;
        let group = group_public_key(&record.key_shares, self.config.threshold())?;
        let joint = secp::add_public_keys(&job.signing_public_key, &group)
            .map_err(|_| invalid("degenerate signing key"))?;
        if joint != verifying_key {
            return Err(invalid(format!(
                "signing key does not control leaf {}",
                job.leaf_id
            )));
        }

        let mut nonces = Vec::new();
        let mut operator_commitments = BTreeMap::new();
        for operator in self.signers()? {
            let id = Identifier::from_operator_index(operator);
            let (nonce, commitment) = threshold_signing::generate_nonce(&mut OsRng);
            operator_commitments.insert(id, commitment);
            nonces.push((operator, id, nonce));
        }
        let package = SigningPackage {
            message: sighash,
            verifying_key,
            user_commitment: job.user_commitment,
            operator_commitments: operator_commitments.clone(),
            adaptor_public_key,
        };

        let mut signature_shares = BTreeMap::new();
        let mut public_shares = BTreeMap::new();
        for (operator, id, nonce) in nonces {
            let share = record
                .key_shares
                .get(&operator)
                .ok_or_else(|| internal(format!("no key share for operator {operator}")))?;
            let signing_share = if self.faults.corrupt.contains(&operator) {
                *share + Scalar::ONE
            } else {
                *share
            };
            let secret = secp::secret_key_from_scalar(&signing_share).map_err(internal)?;
            let z = threshold_signing::sign_as_operator(&package, id, &secret, nonce)
                .map_err(internal)?;
            signature_shares.insert(id, z);
            public_shares.insert(id, public_share(share)?);
        }

        let result = SigningResult {
            leaf_id: job.leaf_id.clone(),
            verifying_key,
            operator_commitments,
            signature_shares,
            public_shares,
        };
        Ok((result, tx, sighash))
    }

    // -----------------------------------------------------------------------
    // Sender side
    // -----------------------------------------------------------------------

    /// Records a transfer, locks its leaves and signs the intermediate
    /// refunds. `exit_txid` requires every refund to also spend a connector
    /// of that transaction.
    pub fn start_transfer(
        &mut self,
        request: StartTransferRequest,
        adaptor_public_key: Option<PublicKey>,
        exit_txid: Option<Txid>,
    ) -> Result<StartTransferResponse, OperatorError> {
        self.expire_stale();
        if self.transfers.contains_key(&request.transfer_id) {
            return Err(invalid("duplicate transfer id"));
        }
        if request.signing_jobs.is_empty() {
            return Err(invalid("transfer has no leaves"));
        }

        let mut seen = HashSet::new();
        let mut signing_results = Vec::with_capacity(request.signing_jobs.len());
        let mut transfer_leaves = Vec::with_capacity(request.signing_jobs.len());
        let mut leaf_states = BTreeMap::new();
        for job in &request.signing_jobs {
            if !seen.insert(job.leaf_id.clone()) {
                return Err(invalid(format!("leaf {} listed twice", job.leaf_id)));
            }
            let record = self.leaves.get(&job.leaf_id).ok_or(OperatorError::NotFound)?;
            if record.leaf.owner_identity_public_key != request.owner_identity_public_key {
                return Err(invalid(format!("leaf {} is not owned by the sender", job.leaf_id)));
            }
            if let Some(holder) = &record.locked_by {
                return Err(precondition(format!(
                    "leaf {} is locked by transfer {holder}",
                    job.leaf_id
                )));
            }

            let (outpoint, output) = record.leaf.node_output().map_err(internal)?;
            let current = record.leaf.refund_sequence().map_err(internal)?;
            let tx = parse_tx(&job.raw_tx).map_err(|_| invalid("unparseable transaction"))?;
            check_spend(job, &tx, outpoint, &output)?;
            let timelock = tx.input.first().map_or(u16::MAX, |i| timelock_of(i.sequence));
            if timelock >= timelock_of(current) {
                return Err(invalid(format!(
                    "refund for leaf {} does not lower the timelock",
                    job.leaf_id
                )));
            }
            if let Some(txid) = exit_txid
                && tx.input.get(1).map(|i| i.previous_output.txid) != Some(txid)
            {
                return Err(invalid(format!(
                    "refund for leaf {} does not spend an exit connector",
                    job.leaf_id
                )));
            }

            let (result, _, sighash) = self.sign_job(record, job, adaptor_public_key)?;
            signing_results.push(result);
            leaf_states.insert(
                job.leaf_id.clone(),
                LeafInTransfer {
                    refund_sighash: sighash,
                    claim_refund: None,
                },
            );
            transfer_leaves.push(TransferLeaf {
                leaf: record.leaf.clone(),
                secret_cipher: Bytes::new(),
                signature: Bytes::new(),
                intermediate_refund_tx: job.raw_tx.clone(),
                intermediate_refund_signature: None,
            });
        }

        for job in &request.signing_jobs {
            if let Some(record) = self.leaves.get_mut(&job.leaf_id) {
                record.locked_by = Some(request.transfer_id.clone());
            }
        }
        let transfer = Transfer {
            id: request.transfer_id.clone(),
            sender_identity_public_key: request.owner_identity_public_key,
            receiver_identity_public_key: request.receiver_identity_public_key,
            status: TransferStatus::SenderInitiated,
            transfer_type: request.transfer_type,
            total_value: transfer_leaves.iter().map(|l| l.leaf.value).sum(),
            expiry_time: request.expiry_time,
            leaves: transfer_leaves,
        };
        self.transfers.insert(
            transfer.id.clone(),
            TransferRecord {
                transfer: transfer.clone(),
                leaves: leaf_states,
                staged: BTreeMap::new(),
                claimed: BTreeMap::new(),
            },
        );
        debug!(
            transfer_id = %transfer.id,
            transfer_type = %transfer.transfer_type,
            leaves = transfer.leaves.len(),
            "transfer started"
        );
        Ok(StartTransferResponse {
            transfer,
            signing_results,
        })
    }

    /// Stages one operator's share of the sender tweak. Once every operator
    /// holds its share, the shares are applied and the transfer becomes
    /// claimable.
    pub fn complete_send_transfer(
        &mut self,
        operator: u32,
        request: CompleteSendTransferRequest,
    ) -> Result<Transfer, OperatorError> {
        self.expire_stale();
        let threshold = self.config.threshold();
        let operators = self.config.num_operators();
        let drops_share = self.faults.stale_echo.contains(&operator);
        let record = self
            .transfers
            .get_mut(&request.transfer_id)
            .ok_or(OperatorError::NotFound)?;
        if record.transfer.sender_identity_public_key != request.owner_identity_public_key {
            return Err(invalid("not the sender of this transfer"));
        }
        if !record.transfer.status.is_cancellable_by_sender() {
            return Err(precondition(format!("transfer is {}", record.transfer.status)));
        }
        if request.leaves.len() != record.transfer.leaves.len() {
            return Err(invalid("key tweak does not cover every leaf"));
        }
        if drops_share {
            return Ok(record.transfer.clone());
        }

        // Swap and exit refunds arrive adaptor-blinded.
        let verify_refunds = !matches!(
            record.transfer.transfer_type,
            TransferType::Swap | TransferType::CooperativeExit
        );
        let secp = Secp256k1::verification_only();
        let mut staged = BTreeMap::new();
        for bundle in &request.leaves {
            let leaf = record
                .transfer
                .leaf(&bundle.leaf_id)
                .ok_or_else(|| invalid(format!("leaf {} is not in the transfer", bundle.leaf_id)))?;
            let leaf_state = record
                .leaves
                .get(&bundle.leaf_id)
                .ok_or_else(|| internal("transfer leaf without state"))?;
            let share = check_tweak_share(
                operator,
                threshold,
                &bundle.secret_share_tweak,
                &bundle.pubkey_shares_tweak,
            )?;

            let digest = signer::ecdsa::digest(&[
                bundle.leaf_id.as_bytes(),
                request.transfer_id.as_bytes(),
                &bundle.secret_cipher[..],
            ]);
            signer::ecdsa::verify_digest(
                &secp,
                &request.owner_identity_public_key,
                &digest,
                &bundle.signature,
            )
            .map_err(|_| invalid("sender signature over the key package does not verify"))?;
            if verify_refunds
                && !verify_schnorr(
                    &leaf.leaf.verifying_public_key,
                    &leaf_state.refund_sighash,
                    &bundle.refund_signature,
                )
            {
                return Err(invalid(format!(
                    "refund signature for leaf {} does not verify",
                    bundle.leaf_id
                )));
            }
            staged.insert(bundle.leaf_id.clone(), share);
        }

        for bundle in request.leaves {
            if let Some(leaf) = record
                .transfer
                .leaves
                .iter_mut()
                .find(|l| l.leaf.id == bundle.leaf_id)
            {
                leaf.secret_cipher = bundle.secret_cipher;
                leaf.signature = bundle.signature;
                leaf.intermediate_refund_signature = Some(bundle.refund_signature);
            }
        }
        record.staged.insert(operator, staged);
        record.transfer.status = TransferStatus::SenderKeyTweakPending;

        if record.staged.len() == operators {
            for (op, shares) in std::mem::take(&mut record.staged) {
                for (leaf_id, delta) in shares {
                    if let Some(leaf) = self.leaves.get_mut(&leaf_id)
                        && let Some(key_share) = leaf.key_shares.get_mut(&op)
                    {
                        *key_share += delta;
                    }
                }
            }
            record.transfer.status = TransferStatus::SenderKeyTweaked;
            info!(transfer_id = %request.transfer_id, "sender key tweak applied by every operator");
        }

        // This operator holds its share, so in its view the tweak is done.
        let mut echo = record.transfer.clone();
        echo.status = TransferStatus::SenderKeyTweaked;
        Ok(echo)
    }

    /// Flips a byte of the cipher or signature the sender left on every leaf
    /// of a transfer. Returns whether the transfer exists.
    pub fn tamper_key_package(&mut self, transfer_id: &str, part: KeyPackagePart) -> bool {
        let Some(record) = self.transfers.get_mut(transfer_id) else {
            return false;
        };
        for leaf in &mut record.transfer.leaves {
            let field = match part {
                KeyPackagePart::Signature => &mut leaf.signature,
                KeyPackagePart::Cipher => &mut leaf.secret_cipher,
            };
            let mut bytes = field.to_vec();
            if let Some(last) = bytes.last_mut() {
                *last ^= 0x01;
            }
            *field = Bytes::from(bytes);
        }
        true
    }

    pub fn cancel_transfer(&mut self, request: CancelTransferRequest) -> Result<Transfer, OperatorError> {
        self.expire_stale();
        let record = self
            .transfers
            .get(&request.transfer_id)
            .ok_or(OperatorError::NotFound)?;
        if record.transfer.sender_identity_public_key != request.sender_identity_public_key {
            return Err(invalid("not the sender of this transfer"));
        }
        let status = record.transfer.status.clone();
        if status.is_cancellable_by_sender() {
            self.release(&request.transfer_id, TransferStatus::Cancelled);
        } else if !matches!(status, TransferStatus::Cancelled | TransferStatus::Expired) {
            return Err(OperatorError::AlreadyCommitted);
        }
        self.transfers
            .get(&request.transfer_id)
            .map(|r| r.transfer.clone())
            .ok_or(OperatorError::NotFound)
    }

    // -----------------------------------------------------------------------
    // Receiver side
    // -----------------------------------------------------------------------

    /// Applies one operator's share of the receiver tweak. A retry with the
    /// same shares succeeds; different shares are rejected.
    pub fn claim_transfer_tweak_keys(
        &mut self,
        operator: u32,
        request: ClaimTweakRequest,
    ) -> Result<(), OperatorError> {
        self.expire_stale();
        let threshold = self.config.threshold();
        let operators = self.config.num_operators();
        let record = self
            .transfers
            .get_mut(&request.transfer_id)
            .ok_or(OperatorError::NotFound)?;
        if record.transfer.receiver_identity_public_key != request.owner_identity_public_key {
            return Err(invalid("not the receiver of this transfer"));
        }
        if !matches!(
            record.transfer.status,
            TransferStatus::SenderKeyTweaked | TransferStatus::ReceiverKeyTweaked
        ) {
            return Err(precondition(format!("transfer is {}", record.transfer.status)));
        }
        if request.leaves.len() != record.transfer.leaves.len() {
            return Err(invalid("key tweak does not cover every leaf"));
        }

        let mut shares = BTreeMap::new();
        for tweak in &request.leaves {
            if record.transfer.leaf(&tweak.leaf_id).is_none() {
                return Err(invalid(format!("leaf {} is not in the transfer", tweak.leaf_id)));
            }
            let share = check_tweak_share(
                operator,
                threshold,
                &tweak.secret_share_tweak,
                &tweak.pubkey_shares_tweak,
            )?;
            shares.insert(tweak.leaf_id.clone(), share);
        }

        if let Some(applied) = record.claimed.get(&operator) {
            if *applied == shares {
                return Ok(());
            }
            return Err(precondition("a different receiver tweak is already applied"));
        }
        for (leaf_id, delta) in &shares {
            if let Some(leaf) = self.leaves.get_mut(leaf_id)
                && let Some(key_share) = leaf.key_shares.get_mut(&operator)
            {
                *key_share += *delta;
            }
        }
        record.claimed.insert(operator, shares);
        if record.claimed.len() == operators {
            record.transfer.status = TransferStatus::ReceiverKeyTweaked;
            info!(transfer_id = %request.transfer_id, "receiver key tweak applied by every operator");
        }
        Ok(())
    }

    /// Signs the receiver's refunds with the tweaked shares. May be repeated
    /// until the transfer is finalized.
    pub fn claim_transfer_sign_refunds(
        &mut self,
        request: ClaimSignRequest,
    ) -> Result<Vec<SigningResult>, OperatorError> {
        self.expire_stale();
        let record = self
            .transfers
            .get(&request.transfer_id)
            .ok_or(OperatorError::NotFound)?;
        if record.transfer.receiver_identity_public_key != request.owner_identity_public_key {
            return Err(invalid("not the receiver of this transfer"));
        }
        if !matches!(
            record.transfer.status,
            TransferStatus::ReceiverKeyTweaked | TransferStatus::ReceiverRefundSigned
        ) {
            return Err(precondition(format!("transfer is {}", record.transfer.status)));
        }
        if request.signing_jobs.len() != record.transfer.leaves.len() {
            return Err(invalid("refund signing does not cover every leaf"));
        }

        let mut results = Vec::with_capacity(request.signing_jobs.len());
        let mut refunds = Vec::with_capacity(request.signing_jobs.len());
        for job in &request.signing_jobs {
            if record.transfer.leaf(&job.leaf_id).is_none() {
                return Err(invalid(format!("leaf {} is not in the transfer", job.leaf_id)));
            }
            let leaf = self.leaves.get(&job.leaf_id).ok_or(OperatorError::NotFound)?;
            let (outpoint, output) = leaf.leaf.node_output().map_err(internal)?;
            let tx = parse_tx(&job.raw_tx).map_err(|_| invalid("unparseable transaction"))?;
            check_spend(job, &tx, outpoint, &output)?;
            let (result, tx, sighash) = self.sign_job(leaf, job, None)?;
            results.push(result);
            refunds.push((
                job.leaf_id.clone(),
                ClaimRefund {
                    tx,
                    sighash,
                    signing_public_key: job.signing_public_key,
                },
            ));
        }

        let record = self
            .transfers
            .get_mut(&request.transfer_id)
            .ok_or(OperatorError::NotFound)?;
        for (leaf_id, refund) in refunds {
            if let Some(leaf) = record.leaves.get_mut(&leaf_id) {
                leaf.claim_refund = Some(refund);
            }
        }
        record.transfer.status = TransferStatus::ReceiverRefundSigned;
        Ok(results)
    }

    pub fn finalize_node_signatures(
        &mut self,
        request: FinalizeNodeSignaturesRequest,
    ) -> Result<Vec<Leaf>, OperatorError> {
        match request.intent {
            SignatureIntent::Transfer => self.finalize_transfer(request),
            SignatureIntent::Extend => self.finalize_extension(request),
            other => Err(invalid(format!("unsupported signature intent {other}"))),
        }
    }

    /// Verifies the receiver's refund signatures and hands the leaves over.
    fn finalize_transfer(
        &mut self,
        request: FinalizeNodeSignaturesRequest,
    ) -> Result<Vec<Leaf>, OperatorError> {
        let transfer_id = request
            .transfer_id
            .as_deref()
            .ok_or_else(|| invalid("transfer finalization without a transfer id"))?;
        let record = self
            .transfers
            .get_mut(transfer_id)
            .ok_or(OperatorError::NotFound)?;
        let receiver = record.transfer.receiver_identity_public_key;
        if receiver != request.owner_identity_public_key {
            return Err(invalid("not the receiver of this transfer"));
        }
        if record.transfer.status != TransferStatus::ReceiverRefundSigned {
            return Err(precondition(format!("transfer is {}", record.transfer.status)));
        }
        if request.nodes.len() != record.transfer.leaves.len() {
            return Err(invalid("finalization does not cover every leaf"));
        }

        for node in &request.nodes {
            let refund = record
                .leaves
                .get(&node.leaf_id)
                .and_then(|l| l.claim_refund.as_ref())
                .ok_or_else(|| invalid(format!("no refund signed for leaf {}", node.leaf_id)))?;
            let leaf = self.leaves.get(&node.leaf_id).ok_or(OperatorError::NotFound)?;
            if !verify_schnorr(
                &leaf.leaf.verifying_public_key,
                &refund.sighash,
                &node.refund_tx_signature,
            ) {
                return Err(invalid(format!(
                    "refund signature for leaf {} does not verify",
                    node.leaf_id
                )));
            }
        }

        let mut leaves = Vec::with_capacity(request.nodes.len());
        for node in &request.nodes {
            let Some(refund) = record
                .leaves
                .get(&node.leaf_id)
                .and_then(|l| l.claim_refund.as_ref())
            else {
                continue;
            };
            if let Some(leaf) = self.leaves.get_mut(&node.leaf_id) {
                leaf.leaf.owner_identity_public_key = receiver;
                leaf.leaf.owner_signing_public_key = refund.signing_public_key;
                leaf.leaf.refund_tx = serialize_tx(&refund.tx);
                leaf.locked_by = None;
                leaves.push(leaf.leaf.clone());
            }
        }
        record.transfer.status = TransferStatus::Completed;
        info!(transfer_id, leaves = leaves.len(), "transfer completed");
        Ok(leaves)
    }

    // -----------------------------------------------------------------------
    // Timelock extension
    // -----------------------------------------------------------------------

    pub fn extend_leaf(&mut self, request: ExtendLeafRequest) -> Result<ExtendLeafResponse, OperatorError> {
        self.expire_stale();
        self.extend_calls += 1;
        let record = self
            .leaves
            .get(&request.leaf_id)
            .ok_or(OperatorError::NotFound)?;
        if record.leaf.owner_identity_public_key != request.owner_identity_public_key {
            return Err(invalid("not the owner of this leaf"));
        }
        if let Some(holder) = &record.locked_by {
            return Err(precondition(format!("leaf is locked by transfer {holder}")));
        }

        let (outpoint, output) = record.leaf.node_output().map_err(internal)?;
        let node_job = &request.node_tx_signing_job;
        let node_tx = parse_tx(&node_job.raw_tx).map_err(|_| invalid("unparseable transaction"))?;
        check_spend(node_job, &node_tx, outpoint, &output)?;
        if node_tx.output.first() != Some(&output) {
            return Err(invalid("extension must re-create the node output"));
        }
        let new_outpoint = OutPoint::new(node_tx.compute_txid(), 0);
        let refund_job = &request.refund_tx_signing_job;
        let refund_tx =
            parse_tx(&refund_job.raw_tx).map_err(|_| invalid("unparseable transaction"))?;
        check_spend(refund_job, &refund_tx, new_outpoint, &output)?;

        let (node_result, node_tx, node_sighash) = self.sign_job(record, node_job, None)?;
        let (refund_result, refund_tx, refund_sighash) = self.sign_job(record, refund_job, None)?;
        if let Some(record) = self.leaves.get_mut(&request.leaf_id) {
            record.pending_extension = Some(PendingExtension {
                node_tx,
                refund_tx,
                node_sighash,
                refund_sighash,
            });
        }
        Ok(ExtendLeafResponse {
            leaf_id: request.leaf_id,
            node_tx_signing_result: node_result,
            refund_tx_signing_result: refund_result,
        })
    }

    fn finalize_extension(
        &mut self,
        request: FinalizeNodeSignaturesRequest,
    ) -> Result<Vec<Leaf>, OperatorError> {
        let mut leaves = Vec::with_capacity(request.nodes.len());
        for node in &request.nodes {
            let record = self
                .leaves
                .get_mut(&node.leaf_id)
                .ok_or(OperatorError::NotFound)?;
            if record.leaf.owner_identity_public_key != request.owner_identity_public_key {
                return Err(invalid("not the owner of this leaf"));
            }
            let extension = record
                .pending_extension
                .as_ref()
                .ok_or_else(|| precondition(format!("no extension pending for {}", node.leaf_id)))?;
            let node_signature = node
                .node_tx_signature
                .ok_or_else(|| invalid("extension without a node signature"))?;
            let key = record.leaf.verifying_public_key;
            if !verify_schnorr(&key, &extension.node_sighash, &node_signature)
                || !verify_schnorr(&key, &extension.refund_sighash, &node.refund_tx_signature)
            {
                return Err(invalid(format!(
                    "extension signatures for leaf {} do not verify",
                    node.leaf_id
                )));
            }
            if let Some(extension) = record.pending_extension.take() {
                record.leaf.node_tx = serialize_tx(&extension.node_tx);
                record.leaf.refund_tx = serialize_tx(&extension.refund_tx);
                record.leaf.vout = 0;
            }
            leaves.push(record.leaf.clone());
        }
        Ok(leaves)
    }

    // -----------------------------------------------------------------------
    // Queries, preimages
    // -----------------------------------------------------------------------

    pub fn query_transfers(&mut self, query: &TransferQuery) -> Vec<Transfer> {
        self.expire_stale();
        let mut transfers: Vec<Transfer> = self
            .transfers
            .values()
            .filter(|r| match query {
                TransferQuery::Id(id) => &r.transfer.id == id,
                TransferQuery::Sender(pk) => &r.transfer.sender_identity_public_key == pk,
                TransferQuery::Receiver(pk) => &r.transfer.receiver_identity_public_key == pk,
            })
            .map(|r| r.transfer.clone())
            .collect();
        transfers.sort_by(|a, b| a.id.cmp(&b.id));
        transfers
    }

    pub fn store_preimage_share(
        &mut self,
        operator: u32,
        request: StorePreimageShareRequest,
    ) -> Result<(), OperatorError> {
        let share = &request.preimage_share;
        if share.secret_share.index != share_index(operator) {
            return Err(invalid("share addressed to another operator"));
        }
        if share.secret_share.threshold != request.threshold {
            return Err(invalid("share threshold does not match the request"));
        }
        validate_share(share).map_err(|_| invalid("share fails its Feldman proofs"))?;
        debug!(
            operator,
            payment_hash = %hex_encode(&request.payment_hash),
            "preimage share stored"
        );
        self.preimages
            .entry(request.payment_hash)
            .or_default()
            .insert(operator, request.preimage_share);
        Ok(())
    }

    /// Recombines the stored shares for `payment_hash`. `None` unless a
    /// threshold of shares is held and they hash to `payment_hash`.
    pub fn recover_preimage(&self, payment_hash: &[u8; 32]) -> Option<[u8; 32]> {
        let shares: Vec<VerifiableSecretShare> =
            self.preimages.get(payment_hash)?.values().cloned().collect();
        let preimage = scalar_to_bytes(&recover_secret(&shares).ok()?);
        (sha256::Hash::hash(&preimage).to_byte_array() == *payment_hash).then_some(preimage)
    }
}
