//! Cooperative exit: trade leaves for an on-chain payment.
//!
//! The provider builds an exit transaction with one small connector output
//! per leaf plus the withdrawal output. The wallet's refunds for the
//! outbound `CooperativeExit` transfer spend both the leaf's node output and
//! that leaf's connector, so they only become valid if the exit transaction
//! confirms. The refunds are blinded with an adaptor secret that the wallet
//! reveals after its key tweak, letting the provider claim the leaves.

use std::time::Instant;

use bitcoin::secp256k1::SecretKey;
use bitcoin::{OutPoint, ScriptBuf, Txid};
use signer::KeyStore;
use tracing::info;

use crate::bitcoin_tx::{create_connector_refund_tx, parse_tx};
use crate::operations::tracking::{OperationError, OperationKind, Phase};
use crate::operations::transfer_core::{
    LeafKeyTweak, OutboundTransfer, PendingSignature, StartKind, blind_signatures,
};
use crate::operator::{OperatorClient, Transfer};
use crate::swap_provider::{
    AdaptorLeafSignature, ConfirmCooperativeExitRequest, CooperativeExitQuoteRequest,
    SwapProvider,
};
use crate::timelock::next_sequence;
use crate::tree::{Leaf, TreeStore};
use crate::{Sdk, SdkError};

/// Outcome of a cooperative exit.
#[derive(Debug, Clone)]
pub struct CooperativeExitResult {
    pub exit_id: String,
    /// The provider's exit transaction paying the withdrawal script.
    pub exit_txid: Txid,
    /// The outbound transfer of the exited leaves.
    pub transfer: Transfer,
}

impl<K, T, C, P> Sdk<K, T, C, P>
where
    K: KeyStore,
    T: TreeStore,
    C: OperatorClient,
    P: SwapProvider,
{
    /// Exits `amount_sats` on-chain to `withdrawal_script` through the swap
    /// provider. Swaps once first when no exact leaf set exists.
    pub async fn cooperative_exit(
        &self,
        amount_sats: u64,
        withdrawal_script: ScriptBuf,
    ) -> Result<CooperativeExitResult, OperationError> {
        let mut tracker = self.tracker(OperationKind::CooperativeExit);
        let op_id = tracker.id();

        if let Err(e) = self.check_cancelled() {
            return Err(tracker.fail(Phase::SelectLeaves, e));
        }
        if amount_sats == 0 {
            return Err(tracker.fail(Phase::SelectLeaves, SdkError::InvalidRequest));
        }
        let _guard = self.inner.send_lock.lock().await;

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
        let (outbound, exit_id, exit_txid, adaptor_secret) =
            match self.start_exit(&leaves, withdrawal_script).await {
                Ok(v) => v,
                Err(e) => {
                    self.release_reservation(reservation.id, &e);
                    return Err(tracker.fail(Phase::SignRefunds, e));
                }
            };
        tracker.done(Phase::SignRefunds, t.elapsed());
        tracker.link_transfer(&outbound.transfer.id);

        let t = Instant::now();
        let transfer = match self.complete_outbound(outbound).await {
            Ok(transfer) => transfer,
            Err(e) => {
                self.release_reservation(reservation.id, &e);
                return Err(tracker.fail(Phase::TweakKeys, e));
            }
        };
        if let Err(e) = self
            .inner
            .tree_store
            .finalize_reservation(reservation.id, None)
        {
            return Err(tracker.partial(Phase::StoreLeaves, e));
        }
        tracker.done(Phase::TweakKeys, t.elapsed());

        let t = Instant::now();
        if let Err(e) = self
            .inner
            .swap_provider
            .complete_cooperative_exit(&exit_id, adaptor_secret)
            .await
        {
            return Err(tracker.partial(Phase::SettleWithProvider, e));
        }
        tracker.done(Phase::SettleWithProvider, t.elapsed());
        tracker.succeed();

        info!(
            op_id = %op_id,
            exit_id = %exit_id,
            exit_txid = %exit_txid,
            amount_sats,
            "cooperative exit completed"
        );
        Ok(CooperativeExitResult {
            exit_id,
            exit_txid,
            transfer,
        })
    }

    /// Quotes the exit, starts the transfer with connector refunds, blinds
    /// them and has the provider confirm.
    async fn start_exit(
        &self,
        leaves: &[Leaf],
        withdrawal_script: ScriptBuf,
    ) -> Result<(OutboundTransfer, String, Txid, SecretKey), SdkError> {
        let provider = self.inner.swap_provider.identity_public_key()?;
        let quote = self
            .inner
            .swap_provider
            .request_cooperative_exit(CooperativeExitQuoteRequest {
                user_identity_public_key: self.identity_public_key(),
                leaves: leaves.iter().map(|l| (l.id.clone(), l.value)).collect(),
                withdrawal_script,
            })
            .await?;
        let exit_tx = parse_tx(&quote.exit_tx).map_err(|_| SdkError::InvalidTransaction)?;
        if exit_tx.output.len() <= leaves.len() {
            return Err(SdkError::SwapProvider(
                "exit transaction lacks connector outputs".to_owned(),
            ));
        }
        let exit_txid = exit_tx.compute_txid();

        let tweaks = self.prepare_leaf_key_tweaks(leaves)?;
        let pending = self.connector_refund_jobs(&tweaks, exit_txid, &exit_tx.output)?;
        let mut outbound = self
            .start_outbound(
                tweaks,
                pending,
                provider,
                StartKind::CooperativeExit {
                    exit_id: quote.exit_id.clone(),
                    exit_txid,
                },
                self.inner.config.swap_expiry,
            )
            .await?;

        let confirmed = match blind_signatures(&mut outbound.refunds) {
            Ok((adaptor_secret, adaptor_public_key)) => {
                let request = ConfirmCooperativeExitRequest {
                    exit_id: quote.exit_id.clone(),
                    transfer_id: outbound.transfer.id.clone(),
                    adaptor_public_key,
                    leaves: outbound
                        .refunds
                        .iter()
                        .map(|r| AdaptorLeafSignature {
                            leaf_id: r.leaf_id.clone(),
                            adaptor_signature: r.signature,
                        })
                        .collect(),
                };
                self.inner
                    .swap_provider
                    .confirm_cooperative_exit(request)
                    .await
                    .map(|()| adaptor_secret)
            }
            Err(e) => Err(e),
        };
        match confirmed {
            Ok(adaptor_secret) => Ok((outbound, quote.exit_id, exit_txid, adaptor_secret)),
            Err(e) => {
                self.discard_transient_keys(&outbound.tweaks);
                Err(self.cancel_after_failure(&outbound.transfer.id, e).await)
            }
        }
    }

    /// Refunds spending each leaf's node output and its connector `i`.
    fn connector_refund_jobs(
        &self,
        tweaks: &[LeafKeyTweak],
        exit_txid: Txid,
        exit_outputs: &[bitcoin::TxOut],
    ) -> Result<Vec<PendingSignature>, SdkError> {
        let network = self.bitcoin_network();
        tweaks
            .iter()
            .enumerate()
            .map(|(i, tweak)| {
                let leaf = &tweak.leaf;
                let (node_outpoint, node_output) = leaf.node_output()?;
                let connector = exit_outputs.get(i).ok_or(SdkError::InvalidTransaction)?;
                let next = next_sequence(leaf.refund_sequence()?, false)?;
                let tx = create_connector_refund_tx(
                    node_outpoint,
                    OutPoint::new(exit_txid, i as u32),
                    node_output.value,
                    next.sequence,
                    &tweak.new_signing_public_key,
                    network,
                );
                PendingSignature::new(
                    &leaf.id,
                    leaf.verifying_public_key,
                    leaf.owner_signing_public_key,
                    tx,
                    vec![node_output, connector.clone()],
                )
            })
            .collect()
    }
}
