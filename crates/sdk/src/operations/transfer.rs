//! Leaf transfers: send.
//!
//! # Send Flow
//!
//! A transfer is a **two-phase key rotation** through a transient key:
//!
//! 1. **Select** leaves summing exactly to the amount. When no exact set
//!    exists, swap once with the provider for `[amount, change]` and select
//!    again.
//! 2. **Reserve** the leaves and **refresh** any whose timelock is near the
//!    floor.
//! 3. **Start**: the coordinator co-signs one refund per leaf paying to a
//!    fresh transient key, one timelock interval below the current refund.
//! 4. **Key tweak**: `sk_old - sk_transient` is split over every operator,
//!    with the transient key ECIES-encrypted to the receiver.
//! 5. **Finalize** the reservation: the leaves left the wallet.
//!
//! Any failure after step 3 cancels the transfer; if an operator already
//! committed the tweak the send ends in [`SdkError::TransferStuck`].
//!
//! See [`crate::operations::claim`] for the receiving side.

use std::time::Instant;

use bitcoin::secp256k1::PublicKey;
use sdk_core::TransferType;
use signer::KeyStore;
use tracing::{debug, info, warn};

use crate::operations::tracking::{OperationError, OperationKind, OperationTracker, Phase};
use crate::operations::transfer_core::StartKind;
use crate::operator::{OperatorClient, Transfer};
use crate::swap_provider::SwapProvider;
use crate::tree::{LeafReservation, ReservationId, TreeStore};
use crate::{Sdk, SdkError};

impl<K, T, C, P> Sdk<K, T, C, P>
where
    K: KeyStore,
    T: TreeStore,
    C: OperatorClient,
    P: SwapProvider,
{
    /// Sends `amount_sats` to `receiver_identity_public_key`.
    ///
    /// Performs at most one swap when the wallet holds no exact leaf set for
    /// the amount. Sends are serialized per SDK instance.
    pub async fn send_transfer(
        &self,
        receiver_identity_public_key: PublicKey,
        amount_sats: u64,
    ) -> Result<Transfer, OperationError> {
        let mut tracker = self.tracker(OperationKind::Transfer);

        if let Err(e) = self.check_cancelled() {
            return Err(tracker.fail(Phase::SelectLeaves, e));
        }
        if amount_sats == 0 {
            return Err(tracker.fail(Phase::SelectLeaves, SdkError::InvalidRequest));
        }
        let _guard = self.inner.send_lock.lock().await;
        self.sweep_expired_swaps().await;

        let leaf_ids = match self.select_exact_leaves(amount_sats, &mut tracker).await {
            Ok(ids) => ids,
            Err((step, e)) => return Err(tracker.fail(step, e)),
        };
        let ids: Vec<&str> = leaf_ids.iter().map(String::as_str).collect();
        let t = Instant::now();
        let reservation = match self.inner.tree_store.reserve_leaves(&ids) {
            Ok(r) => r,
            Err(e) => return Err(tracker.fail(Phase::ReserveLeaves, e)),
        };
        tracker.done(Phase::ReserveLeaves, t.elapsed());

        self.transfer_reserved(tracker, reservation, receiver_identity_public_key)
            .await
    }

    /// Sends specific leaves, by id, to `receiver_identity_public_key`.
    pub async fn transfer_leaves(
        &self,
        leaf_ids: &[&str],
        receiver_identity_public_key: PublicKey,
    ) -> Result<Transfer, OperationError> {
        let mut tracker = self.tracker(OperationKind::Transfer);

        if let Err(e) = self.check_cancelled() {
            return Err(tracker.fail(Phase::ReserveLeaves, e));
        }
        if leaf_ids.is_empty() {
            return Err(tracker.fail(Phase::ReserveLeaves, SdkError::InvalidRequest));
        }
        let _guard = self.inner.send_lock.lock().await;
        self.sweep_expired_swaps().await;

        let t = Instant::now();
        let reservation = match self.inner.tree_store.reserve_leaves(leaf_ids) {
            Ok(r) => r,
            Err(e) => return Err(tracker.fail(Phase::ReserveLeaves, e)),
        };
        tracker.done(Phase::ReserveLeaves, t.elapsed());

        self.transfer_reserved(tracker, reservation, receiver_identity_public_key)
            .await
    }

    /// Refreshes, starts and tweaks a transfer of the reserved leaves, then
    /// settles the reservation. Completes `tracker`.
    async fn transfer_reserved(
        &self,
        mut tracker: OperationTracker,
        reservation: LeafReservation,
        receiver_identity_public_key: PublicKey,
    ) -> Result<Transfer, OperationError> {
        let op_id = tracker.id();

        let t = Instant::now();
        let leaves = match self.refresh_leaf_timelocks(&reservation.leaves).await {
            Ok(leaves) => leaves,
            Err(e) => {
                self.release_reservation(reservation.id, &e);
                return Err(tracker.fail(Phase::ExtendTimelocks, e));
            }
        };
        tracker.done(Phase::ExtendTimelocks, t.elapsed());

        let t = Instant::now();
        let started = match self.prepare_leaf_key_tweaks(&leaves).and_then(|tweaks| {
            let pending = self.refund_signing_jobs(&tweaks)?;
            Ok((tweaks, pending))
        }) {
            Ok((tweaks, pending)) => {
                self.start_outbound(
                    tweaks,
                    pending,
                    receiver_identity_public_key,
                    StartKind::Transfer(TransferType::Transfer),
                    self.inner.config.transfer_expiry,
                )
                .await
            }
            Err(e) => Err(e),
        };
        let outbound = match started {
            Ok(outbound) => outbound,
            Err(e) => {
                self.release_reservation(reservation.id, &e);
                return Err(tracker.fail(Phase::SignRefunds, e));
            }
        };
        tracker.done(Phase::SignRefunds, t.elapsed());

        let transfer_id = outbound.transfer.id.clone();
        tracker.link_transfer(&transfer_id);
        let t = Instant::now();
        let transfer = match self.complete_outbound(outbound).await {
            Ok(transfer) => transfer,
            Err(e) => {
                self.release_reservation(reservation.id, &e);
                return Err(tracker.fail(Phase::TweakKeys, e));
            }
        };
        tracker.done(Phase::TweakKeys, t.elapsed());

        let t = Instant::now();
        if let Err(e) = self
            .inner
            .tree_store
            .finalize_reservation(reservation.id, None)
        {
            return Err(tracker.partial(Phase::StoreLeaves, e));
        }
        tracker.done(Phase::StoreLeaves, t.elapsed());
        tracker.succeed();

        info!(
            op_id = %op_id,
            transfer_id = %transfer_id,
            amount_sats = transfer.total_value,
            leaves = transfer.leaves.len(),
            "transfer sent"
        );
        Ok(transfer)
    }

    /// Picks leaves summing exactly to `amount_sats` with the configured
    /// selector. When no exact set exists, swaps once for
    /// `[amount, change]` and selects again.
    pub(crate) async fn select_exact_leaves(
        &self,
        amount_sats: u64,
        tracker: &mut OperationTracker,
    ) -> Result<Vec<String>, (Phase, SdkError)> {
        let selection = |step: Phase| {
            let available = self
                .inner
                .tree_store
                .get_available_leaves()
                .map_err(|e| (step.clone(), e))?;
            let total: u64 = available.iter().map(|l| l.value).sum();
            if total < amount_sats {
                return Err((step, SdkError::InsufficientBalance));
            }
            Ok(self
                .leaf_selector()
                .select(&available, amount_sats)
                .map(|(selected, _)| selected.iter().map(|l| l.id.clone()).collect::<Vec<_>>()))
        };

        let t = Instant::now();
        if let Some(ids) = selection(Phase::SelectLeaves)? {
            tracker.done(Phase::SelectLeaves, t.elapsed());
            tracker.skipped(Phase::SwapLeaves);
            return Ok(ids);
        }
        tracker.done(Phase::SelectLeaves, t.elapsed());

        let t = Instant::now();
        debug!(amount_sats, "no exact leaf set, swapping for exact denominations");
        if let Err(e) = self.swap_for_targets(&[amount_sats]).await {
            return Err((Phase::SwapLeaves, e));
        }
        tracker.done(Phase::SwapLeaves, t.elapsed());

        selection(Phase::SelectLeaves)?
            .ok_or((Phase::SelectLeaves, SdkError::InsufficientBalance))
    }

    /// Settles a reservation after a failed outbound operation: leaves that
    /// may already belong to the receiver (stuck transfer) are dropped, all
    /// others return to the pool.
    pub(crate) fn release_reservation(&self, id: ReservationId, error: &SdkError) {
        let store = &self.inner.tree_store;
        let result = if matches!(error, SdkError::TransferStuck { .. }) {
            store.finalize_reservation(id, None)
        } else {
            store.cancel_reservation(id)
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to release leaf reservation");
        }
    }
}
