//! The counter-party side of a leaf swap.
//!
//! A provider wallet answers a [`LeavesSwapRequest`] with a `CounterSwap`
//! transfer of its own leaves whose refunds are signed under the
//! requester's adaptor point `T`. It only tweaks that transfer once the
//! requester reveals `t` ([`Sdk::settle_leaves_swap`]), and then claims the
//! requester's transfer.

use std::time::Instant;

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use signer::KeyStore;
use spark_crypto::adaptor_signature::{apply_adaptor, validate_adaptor_signature};
use tracing::{info, warn};

use crate::operations::swap::sorted;
use crate::operations::tracking::{OperationError, OperationKind, Phase};
use crate::operations::transfer_core::{
    OutboundTransfer, StartKind, intermediate_refund_sighash,
};
use crate::operator::{OperatorClient, OperatorError};
use crate::swap_provider::{
    AdaptorLeafSignature, LeavesSwapRequest, LeavesSwapResponse, SwapProvider,
};
use crate::tree::{Leaf, ReservationId, TreeStore};
use crate::utils::{generate_uuid_v4, now_secs};
use crate::{Sdk, SdkError};

/// A counter transfer started and adaptor-signed, waiting for the
/// requester's adaptor secret.
#[derive(Debug)]
pub(crate) struct PendingSwap {
    pub reservation: ReservationId,
    pub outbound: OutboundTransfer,
    pub adaptor_public_key: PublicKey,
    pub requester_transfer_id: String,
}

impl<K, T, C, P> Sdk<K, T, C, P>
where
    K: KeyStore,
    T: TreeStore,
    C: OperatorClient,
    P: SwapProvider,
{
    /// Answers a swap request with the given leaves, whose values must match
    /// the requested targets.
    ///
    /// Validates the requester's transfer and adaptor signatures, then
    /// starts a counter transfer signed under the same adaptor point. The
    /// counter transfer is not tweaked until [`Sdk::settle_leaves_swap`].
    pub async fn respond_to_leaves_swap(
        &self,
        request: &LeavesSwapRequest,
        leaf_ids: &[&str],
    ) -> Result<LeavesSwapResponse, OperationError> {
        let mut tracker = self.tracker(OperationKind::CounterSwap);
        let op_id = tracker.id();

        if let Err(e) = self.check_cancelled() {
            return Err(tracker.fail(Phase::VerifySwap, e));
        }
        let _guard = self.inner.send_lock.lock().await;
        self.sweep_expired_swaps().await;

        tracker.link_transfer(&request.transfer_id);
        let t = Instant::now();
        if let Err(e) = self.validate_swap_request(request).await {
            return Err(tracker.fail(Phase::VerifySwap, e));
        }
        tracker.done(Phase::VerifySwap, t.elapsed());

        let t = Instant::now();
        let reservation = match self.inner.tree_store.reserve_leaves(leaf_ids) {
            Ok(r) => r,
            Err(e) => return Err(tracker.fail(Phase::ReserveLeaves, e)),
        };
        if sorted(reservation.leaves.iter().map(|l| l.value))
            != sorted(request.target_amounts.iter().copied())
        {
            self.release_reservation(reservation.id, &SdkError::InvalidRequest);
            return Err(tracker.fail(Phase::ReserveLeaves, SdkError::InvalidRequest));
        }
        tracker.done(Phase::ReserveLeaves, t.elapsed());

        let swap_id = generate_uuid_v4(&mut rand_core::OsRng);
        let t = Instant::now();
        let outbound = match self
            .start_counter_transfer(&reservation.leaves, request, &swap_id)
            .await
        {
            Ok(outbound) => outbound,
            Err(e) => {
                self.release_reservation(reservation.id, &e);
                return Err(tracker.fail(Phase::SignRefunds, e));
            }
        };
        tracker.done(Phase::SignRefunds, t.elapsed());
        tracker.link_transfer(&outbound.transfer.id);

        let response = LeavesSwapResponse {
            swap_id: swap_id.clone(),
            counter_transfer_id: outbound.transfer.id.clone(),
            leaves: outbound
                .refunds
                .iter()
                .map(|r| AdaptorLeafSignature {
                    leaf_id: r.leaf_id.clone(),
                    adaptor_signature: r.signature,
                })
                .collect(),
        };
        self.inner.pending_swaps.lock().unwrap().insert(
            swap_id.clone(),
            PendingSwap {
                reservation: reservation.id,
                outbound,
                adaptor_public_key: request.adaptor_public_key,
                requester_transfer_id: request.transfer_id.clone(),
            },
        );
        tracker.succeed();
        info!(
            op_id = %op_id,
            swap_id = %swap_id,
            counter_transfer_id = %response.counter_transfer_id,
            "swap counter transfer started"
        );
        Ok(response)
    }

    /// Releases counter transfers that expired before the requester settled.
    ///
    /// The operators expire such transfers on their own, so the leaves go
    /// back to the pool and the transient keys are dropped. Runs before
    /// every swap response, settlement and send; returns the number of
    /// swaps released.
    pub async fn release_expired_swaps(&self) -> usize {
        let _guard = self.inner.send_lock.lock().await;
        self.sweep_expired_swaps().await
    }

    /// [`Sdk::release_expired_swaps`] for callers holding the send lock.
    pub(crate) async fn sweep_expired_swaps(&self) -> usize {
        let now = now_secs();
        let expired: Vec<(String, PendingSwap)> = {
            let mut pending = self.inner.pending_swaps.lock().unwrap();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, swap)| swap.outbound.transfer.expiry_time <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove_entry(&id))
                .collect()
        };

        for (swap_id, swap) in &expired {
            let transfer_id = swap.outbound.transfer.id.clone();
            warn!(swap_id = %swap_id, counter_transfer_id = %transfer_id, "swap expired unsettled, releasing leaves");
            self.discard_transient_keys(&swap.outbound.tweaks);
            let outcome = match self.cancel_transfer_inner(&transfer_id).await {
                Err(SdkError::Operator(OperatorError::AlreadyCommitted)) => {
                    SdkError::TransferStuck { transfer_id }
                }
                _ => SdkError::TransferExpired { transfer_id },
            };
            self.release_reservation(swap.reservation, &outcome);
        }
        expired.len()
    }

    /// Checks the requester's outbound transfer and its adaptor signatures.
    async fn validate_swap_request(&self, request: &LeavesSwapRequest) -> Result<(), SdkError> {
        let transfer = self.query_transfer(&request.transfer_id).await?;
        if transfer.receiver_identity_public_key != self.identity_public_key()
            || transfer.sender_identity_public_key != request.user_identity_public_key
        {
            return Err(SdkError::InvalidRequest);
        }
        let target: u64 = request.target_amounts.iter().sum();
        if transfer.total_value != request.total_value || target != transfer.total_value {
            return Err(SdkError::InvalidRequest);
        }
        if !transfer.status.is_cancellable_by_sender() {
            return Err(SdkError::UnexpectedTransferStatus {
                transfer_id: transfer.id,
                status: transfer.status,
            });
        }

        for leaf in &transfer.leaves {
            let signature = request
                .leaves
                .iter()
                .find(|s| s.leaf_id == leaf.leaf.id)
                .ok_or(SdkError::AdaptorVerificationFailed)?;
            let sighash = intermediate_refund_sighash(leaf)?;
            validate_adaptor_signature(
                &leaf.leaf.verifying_public_key,
                &sighash,
                &signature.adaptor_signature,
                &request.adaptor_public_key,
            )
            .map_err(|_| SdkError::AdaptorVerificationFailed)?;
        }
        Ok(())
    }

    async fn start_counter_transfer(
        &self,
        leaves: &[Leaf],
        request: &LeavesSwapRequest,
        swap_id: &str,
    ) -> Result<OutboundTransfer, SdkError> {
        let leaves = self.refresh_leaf_timelocks(leaves).await?;
        let tweaks = self.prepare_leaf_key_tweaks(&leaves)?;
        let pending = self.refund_signing_jobs(&tweaks)?;
        self.start_outbound(
            tweaks,
            pending,
            request.user_identity_public_key,
            StartKind::LeafSwap {
                swap_id: swap_id.to_owned(),
                adaptor_public_key: request.adaptor_public_key,
            },
            self.inner.config.swap_expiry,
        )
        .await
    }

    /// Completes a swap once the requester revealed the adaptor secret:
    /// finishes and tweaks the counter transfer, then claims the requester's
    /// transfer. Returns the leaves received.
    pub async fn settle_leaves_swap(
        &self,
        swap_id: &str,
        adaptor_secret: SecretKey,
    ) -> Result<Vec<Leaf>, OperationError> {
        let mut tracker = self.tracker(OperationKind::CounterSwap);
        let op_id = tracker.id();

        if let Err(e) = self.check_cancelled() {
            return Err(tracker.fail(Phase::VerifySwap, e));
        }
        let _guard = self.inner.send_lock.lock().await;
        self.sweep_expired_swaps().await;

        let pending = self.inner.pending_swaps.lock().unwrap().remove(swap_id);
        let Some(mut pending) = pending else {
            return Err(tracker.fail(Phase::VerifySwap, SdkError::InvalidRequest));
        };
        tracker.link_transfer(&pending.outbound.transfer.id);
        tracker.link_transfer(&pending.requester_transfer_id);
        if adaptor_secret.public_key(&Secp256k1::signing_only()) != pending.adaptor_public_key {
            self.inner
                .pending_swaps
                .lock()
                .unwrap()
                .insert(swap_id.to_owned(), pending);
            return Err(tracker.fail(Phase::VerifySwap, SdkError::AdaptorVerificationFailed));
        }

        let t = Instant::now();
        for refund in &mut pending.outbound.refunds {
            match apply_adaptor(
                &refund.verifying_key,
                &refund.sighash,
                &refund.signature,
                &adaptor_secret,
            ) {
                Ok(signature) => refund.signature = signature,
                Err(_) => {
                    self.release_reservation(pending.reservation, &SdkError::AdaptorVerificationFailed);
                    return Err(tracker.fail(Phase::SignRefunds, SdkError::AdaptorVerificationFailed));
                }
            }
        }
        tracker.done(Phase::SignRefunds, t.elapsed());

        let t = Instant::now();
        if let Err(e) = self.complete_outbound(pending.outbound).await {
            self.release_reservation(pending.reservation, &e);
            return Err(tracker.fail(Phase::TweakKeys, e));
        }
        if let Err(e) = self
            .inner
            .tree_store
            .finalize_reservation(pending.reservation, None)
        {
            warn!(swap_id, error = %e, "failed to finalize swap reservation");
        }
        tracker.done(Phase::TweakKeys, t.elapsed());

        let t = Instant::now();
        let step = Phase::ClaimTransfer(pending.requester_transfer_id.clone());
        let claimed = match self.query_transfer(&pending.requester_transfer_id).await {
            Ok(inbound) => self.claim_locked(&inbound).await,
            Err(e) => Err(e),
        };
        match claimed {
            Ok(leaves) => {
                tracker.done(step, t.elapsed());
                tracker.succeed();
                info!(op_id = %op_id, swap_id, leaves = leaves.len(), "swap settled");
                Ok(leaves)
            }
            Err(e) => Err(tracker.partial(step, e)),
        }
    }
}
