//! Claiming inbound transfers.
//!
//! # Claim Flow
//!
//! 1. **Verify and decrypt**: per leaf, check the sender's identity
//!    signature over `leaf_id || transfer_id || secret_cipher`, decrypt the
//!    transient key with the identity key and check that it is the key the
//!    intermediate refund pays to.
//! 2. **Key tweak**: `sk_transient - sk_final` is split over every operator,
//!    where `sk_final` is derived from the leaf id. Skipped when the
//!    operators already hold it (a resumed claim).
//! 3. **Refund signing**: new refunds one interval below the intermediate
//!    refund, paying to `sk_final`, are co-signed by the coordinator.
//! 4. **Finalize** the signatures and store the leaves.
//! 5. **Refresh** leaves whose new refund landed near the timelock floor.
//!
//! Every step is safe to repeat. The tweak split is seeded from the keys and
//! ids, so a retried tweak is byte-identical to the first attempt.

use std::collections::BTreeMap;
use std::time::Instant;

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use rand::SeedableRng;
use rand::rngs::StdRng;
use sdk_core::{SignatureIntent, TransferStatus};
use signer::{KeyDerivation, KeyStore};
use tracing::{debug, info, warn};

use crate::bitcoin_tx::{create_refund_tx, p2tr_script, parse_tx};
use crate::fanout::{FanOutPolicy, fan_out};
use crate::operations::tracking::{OperationError, OperationKind, Phase};
use crate::operations::transfer_core::PendingSignature;
use crate::operator::{
    ClaimLeafTweak, ClaimSignRequest, ClaimTweakRequest, FinalizeNodeSignaturesRequest,
    NodeSignatures, OperatorClient, OperatorRpc, Transfer, TransferLeaf, TransferQuery,
};
use crate::swap_provider::SwapProvider;
use crate::timelock::next_sequence;
use crate::tree::{Leaf, TreeStore};
use crate::{REQUEST_TIMEOUT, Sdk, SdkError};

/// A received leaf after its transient key checked out.
struct ReceivedLeaf<'a> {
    transfer_leaf: &'a TransferLeaf,
    transient_public_key: PublicKey,
    final_public_key: PublicKey,
}

/// Seed for the receiver tweak split of one leaf.
fn claim_tweak_seed(
    transient: &SecretKey,
    final_key: &SecretKey,
    transfer_id: &str,
    leaf_id: &str,
) -> [u8; 32] {
    signer::ecdsa::digest(&[
        b"claim-tweak",
        &transient.secret_bytes(),
        &final_key.secret_bytes(),
        transfer_id.as_bytes(),
        leaf_id.as_bytes(),
    ])
}

impl<K, T, C, P> Sdk<K, T, C, P>
where
    K: KeyStore,
    T: TreeStore,
    C: OperatorClient,
    P: SwapProvider,
{
    /// Inbound transfers that can be claimed now.
    pub async fn pending_transfers(&self) -> Result<Vec<Transfer>, SdkError> {
        let transfers = self
            .read_transfers(TransferQuery::Receiver(self.identity_public_key()))
            .await?;
        Ok(transfers
            .into_iter()
            .filter(|t| t.status.is_claimable())
            .collect())
    }

    /// Claims one inbound transfer. Returns the leaves now owned.
    pub async fn claim_transfer(&self, transfer: &Transfer) -> Result<Vec<Leaf>, OperationError> {
        let mut tracker = self.tracker(OperationKind::Claim);
        let op_id = tracker.id();

        if let Err(e) = self.check_cancelled() {
            return Err(tracker.fail(Phase::ClaimTransfer(transfer.id.clone()), e));
        }
        let _guard = self.inner.claim_lock.lock().await;

        tracker.link_transfer(&transfer.id);
        let t = Instant::now();
        match self.claim_inner(transfer).await {
            Ok(leaves) => {
                tracker.done(Phase::ClaimTransfer(transfer.id.clone()), t.elapsed());
                tracker.succeed();
                info!(op_id = %op_id, transfer_id = %transfer.id, leaves = leaves.len(), "transfer claimed");
                Ok(leaves)
            }
            Err(e) => Err(tracker.fail(Phase::ClaimTransfer(transfer.id.clone()), e)),
        }
    }

    /// Claims every pending inbound transfer.
    ///
    /// A failing transfer does not stop the others. If some succeed and some
    /// fail the operation ends partially completed with the first failure.
    pub async fn claim_pending_transfers(&self) -> Result<Vec<Leaf>, OperationError> {
        let mut tracker = self.tracker(OperationKind::Claim);
        let op_id = tracker.id();

        if let Err(e) = self.check_cancelled() {
            return Err(tracker.fail(Phase::ListPending, e));
        }
        let _guard = self.inner.claim_lock.lock().await;

        let t = Instant::now();
        let transfers = match self.pending_transfers().await {
            Ok(transfers) => transfers,
            Err(e) => return Err(tracker.fail(Phase::ListPending, e)),
        };
        tracker.done(Phase::ListPending, t.elapsed());

        let mut claimed = Vec::new();
        let mut first_failure = None;
        for transfer in &transfers {
            let step = Phase::ClaimTransfer(transfer.id.clone());
            tracker.link_transfer(&transfer.id);
            let t = Instant::now();
            match self.claim_inner(transfer).await {
                Ok(leaves) => {
                    tracker.done(step, t.elapsed());
                    claimed.extend(leaves);
                }
                Err(e) => {
                    warn!(transfer_id = %transfer.id, error = %e, "claim failed");
                    tracker.failed(step.clone(), e.clone(), t.elapsed());
                    first_failure.get_or_insert((step, e));
                }
            }
        }

        match first_failure {
            None => {
                tracker.succeed();
                info!(
                    op_id = %op_id,
                    transfers = transfers.len(),
                    leaves = claimed.len(),
                    "pending transfers claimed"
                );
                Ok(claimed)
            }
            Some((step, e)) if claimed.is_empty() => Err(tracker.fail(step, e)),
            Some((step, e)) => Err(tracker.partial(step, e)),
        }
    }

    /// Claim under the claim lock, for flows that hold no tracker.
    pub(crate) async fn claim_locked(&self, transfer: &Transfer) -> Result<Vec<Leaf>, SdkError> {
        let _guard = self.inner.claim_lock.lock().await;
        self.claim_inner(transfer).await
    }

    pub(crate) async fn claim_inner(&self, transfer: &Transfer) -> Result<Vec<Leaf>, SdkError> {
        self.check_cancelled()?;
        if transfer.receiver_identity_public_key != self.identity_public_key() {
            return Err(SdkError::InvalidRequest);
        }
        if !transfer.status.is_claimable() {
            return Err(SdkError::UnexpectedTransferStatus {
                transfer_id: transfer.id.clone(),
                status: transfer.status.clone(),
            });
        }

        let received = transfer
            .leaves
            .iter()
            .map(|leaf| self.open_transfer_leaf(transfer, leaf))
            .collect::<Result<Vec<_>, _>>()?;

        if transfer.status == TransferStatus::SenderKeyTweaked {
            self.send_claim_tweaks(transfer, &received).await?;
        } else {
            debug!(transfer_id = %transfer.id, status = %transfer.status, "receiver tweak already applied");
        }

        let leaves = self.sign_claimed_refunds(transfer, &received).await?;
        self.inner.tree_store.insert_leaves(&leaves)?;
        for leaf in &received {
            self.inner.key_store.remove(&leaf.transient_public_key);
        }
        info!(transfer_id = %transfer.id, leaves = leaves.len(), "claim finalized");
        Ok(self.refresh_received_leaves(leaves).await)
    }

    /// Verifies the sender's signature, decrypts the transient key and
    /// imports it.
    fn open_transfer_leaf<'a>(
        &self,
        transfer: &Transfer,
        leaf: &'a TransferLeaf,
    ) -> Result<ReceivedLeaf<'a>, SdkError> {
        let leaf_id = &leaf.leaf.id;
        let failed = || SdkError::ClaimVerificationFailed {
            transfer_id: transfer.id.clone(),
            leaf_id: leaf_id.clone(),
        };

        let digest = signer::ecdsa::digest(&[
            leaf_id.as_bytes(),
            transfer.id.as_bytes(),
            &leaf.secret_cipher,
        ]);
        signer::ecdsa::verify_digest(
            &Secp256k1::verification_only(),
            &transfer.sender_identity_public_key,
            &digest,
            &leaf.signature,
        )
        .map_err(|_| failed())?;

        let plaintext = self
            .inner
            .key_store
            .decrypt_for_identity(&leaf.secret_cipher)
            .map_err(|_| failed())?;
        let secret = SecretKey::from_slice(&plaintext).map_err(|_| failed())?;

        let refund = parse_tx(&leaf.intermediate_refund_tx).map_err(|_| failed())?;
        let keys = &self.inner.key_store;
        let transient_public_key = keys.put(secret);
        let expected = p2tr_script(&transient_public_key, self.bitcoin_network());
        if refund.output.first().map(|o| &o.script_pubkey) != Some(&expected) {
            keys.remove(&transient_public_key);
            return Err(failed());
        }

        let final_public_key = keys.derive(KeyDerivation::Leaf(leaf_id))?;
        Ok(ReceivedLeaf {
            transfer_leaf: leaf,
            transient_public_key,
            final_public_key,
        })
    }

    async fn send_claim_tweaks(
        &self,
        transfer: &Transfer,
        received: &[ReceivedLeaf<'_>],
    ) -> Result<(), SdkError> {
        let keys = &self.inner.key_store;
        let mut per_operator: BTreeMap<u32, Vec<ClaimLeafTweak>> = BTreeMap::new();
        for leaf in received {
            let leaf_id = &leaf.transfer_leaf.leaf.id;
            let transient = keys.get(&leaf.transient_public_key)?;
            let final_key = keys.get(&leaf.final_public_key)?;
            let mut rng = StdRng::from_seed(claim_tweak_seed(
                &transient,
                &final_key,
                &transfer.id,
                leaf_id,
            ));
            let split = self.split_key_tweak(&transient, &final_key, &mut rng)?;
            for (operator, share) in split.shares {
                per_operator.entry(operator).or_default().push(ClaimLeafTweak {
                    leaf_id: leaf_id.clone(),
                    secret_share_tweak: share,
                    pubkey_shares_tweak: split.public_shares.clone(),
                });
            }
        }

        let owner = self.identity_public_key();
        let client = &self.inner.operators;
        fan_out(
            OperatorRpc::ClaimTransferTweakKeys.as_str(),
            self.inner.config.network.operators(),
            FanOutPolicy::All,
            REQUEST_TIMEOUT,
            |operator| {
                let request = ClaimTweakRequest {
                    transfer_id: transfer.id.clone(),
                    owner_identity_public_key: owner,
                    leaves: per_operator.remove(&operator).unwrap_or_default(),
                };
                client.claim_transfer_tweak_keys(operator, request)
            },
        )
        .await?;
        info!(transfer_id = %transfer.id, "receiver key tweak acknowledged by all operators");
        Ok(())
    }

    async fn sign_claimed_refunds(
        &self,
        transfer: &Transfer,
        received: &[ReceivedLeaf<'_>],
    ) -> Result<Vec<Leaf>, SdkError> {
        let network = self.bitcoin_network();
        let pending = received
            .iter()
            .map(|r| {
                let leaf = &r.transfer_leaf.leaf;
                let intermediate = parse_tx(&r.transfer_leaf.intermediate_refund_tx)
                    .map_err(|_| SdkError::InvalidTransaction)?;
                let sequence = intermediate
                    .input
                    .first()
                    .map(|i| i.sequence)
                    .ok_or(SdkError::InvalidTransaction)?;
                let next = next_sequence(sequence, false)?;
                let (outpoint, output) = leaf.node_output()?;
                let tx = create_refund_tx(
                    outpoint,
                    output.value,
                    next.sequence,
                    &r.final_public_key,
                    network,
                );
                PendingSignature::new(
                    &leaf.id,
                    leaf.verifying_public_key,
                    r.final_public_key,
                    tx,
                    vec![output],
                )
            })
            .collect::<Result<Vec<_>, SdkError>>()?;

        let request = ClaimSignRequest {
            transfer_id: transfer.id.clone(),
            owner_identity_public_key: self.identity_public_key(),
            signing_jobs: pending.iter().map(PendingSignature::job).collect(),
        };
        let results = self
            .call_coordinator(
                OperatorRpc::ClaimTransferSignRefunds,
                self.inner
                    .operators
                    .claim_transfer_sign_refunds(self.coordinator(), request),
            )
            .await?;
        let signed = self.aggregate_all(pending, results, None)?;

        let request = FinalizeNodeSignaturesRequest {
            intent: SignatureIntent::Transfer,
            transfer_id: Some(transfer.id.clone()),
            owner_identity_public_key: self.identity_public_key(),
            nodes: signed
                .iter()
                .map(|s| NodeSignatures {
                    leaf_id: s.leaf_id.clone(),
                    node_tx_signature: None,
                    refund_tx_signature: s.signature,
                })
                .collect(),
        };
        let leaves = self
            .call_coordinator(
                OperatorRpc::FinalizeNodeSignatures,
                self.inner
                    .operators
                    .finalize_node_signatures(self.coordinator(), request),
            )
            .await?;

        for leaf in &leaves {
            let expected = received
                .iter()
                .find(|r| r.transfer_leaf.leaf.id == leaf.id)
                .ok_or(SdkError::InvalidOperatorResponse)?;
            if leaf.owner_signing_public_key != expected.final_public_key {
                return Err(SdkError::InvalidOperatorResponse);
            }
        }
        Ok(leaves)
    }
}
