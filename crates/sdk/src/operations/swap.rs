//! Leaf swaps with the swap provider.
//!
//! # Swap Flow
//!
//! 1. **Select** the smallest leaves covering the targets; any excess
//!    becomes an extra change target.
//! 2. **Start** a `Swap` transfer of those leaves to the provider and
//!    aggregate the refund signatures.
//! 3. **Blind** every refund signature with one adaptor secret `t` and ask
//!    the provider for the swap. The provider answers with its own
//!    `CounterSwap` transfer of the target amounts, signed under `T = t*G`.
//! 4. **Verify** the counter transfer: addressed to this wallet, the right
//!    amounts, and every adaptor signature completes with `t`.
//! 5. **Tweak** the outbound transfer and reveal `t` to the provider, which
//!    completes and tweaks its counter transfer.
//! 6. **Claim** the counter transfer once it is claimable.
//!
//! The wallet never reveals `t` before the provider's side is verifiable,
//! and the provider cannot claim the wallet's leaves without completing its
//! own transfer.

use std::time::Instant;

use bitcoin::secp256k1::SecretKey;
use sdk_core::TransferType;
use signer::KeyStore;
use spark_crypto::adaptor_signature::apply_adaptor;
use tracing::{debug, info, warn};

use crate::operations::tracking::{OperationError, OperationKind, Phase};
use crate::operations::transfer_core::{
    OutboundTransfer, StartKind, blind_signatures, intermediate_refund_sighash,
};
use crate::operator::{OperatorClient, Transfer};
use crate::swap_provider::{
    AdaptorLeafSignature, LeavesSwapRequest, LeavesSwapResponse, SwapProvider,
};
use crate::tree::{CoverSelector, Leaf, LeafSelector, TreeStore};
use crate::{Sdk, SdkError};

/// Sorted copy, for multiset comparison of amounts.
pub(crate) fn sorted(values: impl IntoIterator<Item = u64>) -> Vec<u64> {
    let mut v: Vec<u64> = values.into_iter().collect();
    v.sort_unstable();
    v
}

impl<K, T, C, P> Sdk<K, T, C, P>
where
    K: KeyStore,
    T: TreeStore,
    C: OperatorClient,
    P: SwapProvider,
{
    /// Swaps leaves with the provider for new leaves of `target_amounts`.
    ///
    /// If the covering leaves exceed the targets the excess comes back as an
    /// extra leaf. Returns the leaves received.
    pub async fn swap_leaves(&self, target_amounts: &[u64]) -> Result<Vec<Leaf>, OperationError> {
        let mut tracker = self.tracker(OperationKind::Swap);
        let op_id = tracker.id();

        if let Err(e) = self.check_cancelled() {
            return Err(tracker.fail(Phase::SwapLeaves, e));
        }
        let _guard = self.inner.send_lock.lock().await;

        let t = Instant::now();
        match self.swap_for_targets(target_amounts).await {
            Ok(leaves) => {
                tracker.done(Phase::SwapLeaves, t.elapsed());
                tracker.succeed();
                info!(op_id = %op_id, leaves = leaves.len(), "swap completed");
                Ok(leaves)
            }
            Err(e) => Err(tracker.fail(Phase::SwapLeaves, e)),
        }
    }

    /// Swap without tracking or locking; the caller holds the send lock.
    pub(crate) async fn swap_for_targets(&self, target_amounts: &[u64]) -> Result<Vec<Leaf>, SdkError> {
        let mut targets: Vec<u64> = target_amounts.iter().copied().filter(|&v| v > 0).collect();
        let target: u64 = targets.iter().sum();
        if target == 0 {
            return Err(SdkError::InvalidRequest);
        }

        let available = self.inner.tree_store.get_available_leaves()?;
        let (selected, total) = CoverSelector
            .select(&available, target)
            .ok_or(SdkError::InsufficientBalance)?;
        if total > target {
            targets.push(total - target);
        }
        let ids: Vec<&str> = selected.iter().map(|l| l.id.as_str()).collect();
        let reservation = self.inner.tree_store.reserve_leaves(&ids)?;
        debug!(leaves = ids.len(), total, targets = ?targets, "swapping leaves");

        let outbound = match self.swap_outbound(&reservation.leaves, &targets).await {
            Ok(outbound) => outbound,
            Err(e) => {
                self.release_reservation(reservation.id, &e);
                return Err(e);
            }
        };
        // The outbound leaves now belong to the provider.
        self.inner
            .tree_store
            .finalize_reservation(reservation.id, None)?;

        let (response, adaptor_secret) = outbound;
        self.inner
            .swap_provider
            .complete_leaves_swap(&response.swap_id, adaptor_secret)
            .await?;

        let inbound = self.wait_for_claimable(&response.counter_transfer_id).await?;
        let leaves = self.claim_locked(&inbound).await?;
        info!(
            swap_id = %response.swap_id,
            received = leaves.len(),
            "swap settled"
        );
        Ok(leaves)
    }

    /// Steps up to and including the outbound key tweak. Returns the
    /// provider's response and the adaptor secret to reveal.
    async fn swap_outbound(
        &self,
        leaves: &[Leaf],
        targets: &[u64],
    ) -> Result<(LeavesSwapResponse, SecretKey), SdkError> {
        let provider = self.inner.swap_provider.identity_public_key()?;
        let leaves = self.refresh_leaf_timelocks(leaves).await?;
        let tweaks = self.prepare_leaf_key_tweaks(&leaves)?;
        let pending = self.refund_signing_jobs(&tweaks)?;
        let mut outbound = self
            .start_outbound(
                tweaks,
                pending,
                provider,
                StartKind::Transfer(TransferType::Swap),
                self.inner.config.swap_expiry,
            )
            .await?;

        let exchanged = self.request_swap(&mut outbound, targets).await;
        let (response, adaptor_secret) = match exchanged {
            Ok(v) => v,
            Err(e) => {
                self.discard_transient_keys(&outbound.tweaks);
                return Err(self.cancel_after_failure(&outbound.transfer.id, e).await);
            }
        };

        self.complete_outbound(outbound).await?;
        Ok((response, adaptor_secret))
    }

    /// Blinds the outbound refunds, requests the swap and verifies the
    /// provider's counter transfer.
    async fn request_swap(
        &self,
        outbound: &mut OutboundTransfer,
        targets: &[u64],
    ) -> Result<(LeavesSwapResponse, SecretKey), SdkError> {
        let (adaptor_secret, adaptor_public_key) = blind_signatures(&mut outbound.refunds)?;
        let request = LeavesSwapRequest {
            transfer_id: outbound.transfer.id.clone(),
            user_identity_public_key: self.identity_public_key(),
            adaptor_public_key,
            total_value: outbound.transfer.total_value,
            target_amounts: targets.to_vec(),
            leaves: outbound
                .refunds
                .iter()
                .map(|r| AdaptorLeafSignature {
                    leaf_id: r.leaf_id.clone(),
                    adaptor_signature: r.signature,
                })
                .collect(),
        };
        let response = self.inner.swap_provider.request_leaves_swap(request).await?;
        self.verify_counter_transfer(&response, targets, &adaptor_secret)
            .await?;
        Ok((response, adaptor_secret))
    }

    async fn verify_counter_transfer(
        &self,
        response: &LeavesSwapResponse,
        targets: &[u64],
        adaptor_secret: &SecretKey,
    ) -> Result<(), SdkError> {
        let counter = self.query_transfer(&response.counter_transfer_id).await?;
        if counter.receiver_identity_public_key != self.identity_public_key()
            || counter.transfer_type != TransferType::CounterSwap
        {
            return Err(SdkError::SwapProvider(
                "counter transfer is not a swap to this wallet".to_owned(),
            ));
        }
        if sorted(counter.leaves.iter().map(|l| l.leaf.value)) != sorted(targets.iter().copied()) {
            return Err(SdkError::SwapProvider(
                "counter transfer does not match the requested amounts".to_owned(),
            ));
        }

        for leaf in &counter.leaves {
            let signature = response
                .leaves
                .iter()
                .find(|s| s.leaf_id == leaf.leaf.id)
                .ok_or(SdkError::AdaptorVerificationFailed)?;
            let sighash = intermediate_refund_sighash(leaf)?;
            apply_adaptor(
                &leaf.leaf.verifying_public_key,
                &sighash,
                &signature.adaptor_signature,
                adaptor_secret,
            )
            .map_err(|_| SdkError::AdaptorVerificationFailed)?;
        }
        Ok(())
    }

    /// Polls a transfer until it becomes claimable, following the retry
    /// policy.
    pub(crate) async fn wait_for_claimable(&self, transfer_id: &str) -> Result<Transfer, SdkError> {
        let policy = self.retry_policy().clone();
        for attempt in 0..policy.max_attempts {
            self.check_cancelled()?;
            match self.query_transfer(transfer_id).await {
                Ok(transfer) if transfer.status.is_claimable() => return Ok(transfer),
                Ok(transfer) if transfer.status.is_terminal() => {
                    return Err(SdkError::UnexpectedTransferStatus {
                        transfer_id: transfer.id,
                        status: transfer.status,
                    });
                }
                Ok(transfer) => {
                    debug!(transfer_id, attempt, status = %transfer.status, "transfer not claimable yet");
                }
                Err(e) if e.is_transient() => {
                    debug!(transfer_id, attempt, error = %e, "transient error while polling transfer");
                }
                Err(e) => return Err(e),
            }
            if attempt + 1 < policy.max_attempts {
                tokio::time::sleep(policy.backoff_for(attempt)).await;
            }
        }
        warn!(transfer_id, attempts = policy.max_attempts, "transfer never became claimable");
        Err(SdkError::RetriesExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_compares_as_multiset() {
        assert_eq!(sorted([3, 1, 2]), sorted([2, 3, 1]));
        assert_ne!(sorted([1, 1, 2]), sorted([1, 2, 2]));
    }
}
