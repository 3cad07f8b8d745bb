//! Transfer cancellation.
//!
//! A sender may cancel an outbound transfer as long as no operator has
//! committed its key tweak (`SenderInitiated` or `SenderKeyTweakPending`).
//! The operators release the leaf locks and drop any staged tweak shares, so
//! the leaves are spendable again with the sender's unchanged key.

use std::collections::HashSet;
use std::time::Instant;

use signer::KeyStore;
use tracing::{error, info, warn};

use crate::operations::tracking::{OperationError, OperationKind, Phase};
use crate::operator::{CancelTransferRequest, OperatorClient, OperatorError, OperatorRpc, Transfer, TransferQuery};
use crate::swap_provider::SwapProvider;
use crate::tree::TreeStore;
use crate::{Sdk, SdkError};

impl<K, T, C, P> Sdk<K, T, C, P>
where
    K: KeyStore,
    T: TreeStore,
    C: OperatorClient,
    P: SwapProvider,
{
    /// Cancels an outbound transfer that no operator has committed.
    ///
    /// Cancelling a transfer that is already cancelled or expired succeeds.
    /// A committed transfer fails with
    /// [`OperatorError::AlreadyCommitted`].
    pub async fn cancel_transfer(&self, transfer_id: &str) -> Result<Transfer, OperationError> {
        let mut tracker = self.tracker(OperationKind::Cancel);
        let op_id = tracker.id();

        if let Err(e) = self.check_cancelled() {
            return Err(tracker.fail(Phase::CancelTransfer, e));
        }

        tracker.link_transfer(transfer_id);
        let t = Instant::now();
        match self.cancel_transfer_inner(transfer_id).await {
            Ok(transfer) => {
                tracker.done(Phase::CancelTransfer, t.elapsed());
                tracker.succeed();
                info!(op_id = %op_id, transfer_id, status = %transfer.status, "transfer cancelled");
                Ok(transfer)
            }
            Err(e) => Err(tracker.fail(Phase::CancelTransfer, e)),
        }
    }

    pub(crate) async fn cancel_transfer_inner(
        &self,
        transfer_id: &str,
    ) -> Result<Transfer, SdkError> {
        let request = CancelTransferRequest {
            transfer_id: transfer_id.to_owned(),
            sender_identity_public_key: self.identity_public_key(),
        };
        self.call_coordinator(
            OperatorRpc::CancelTransfer,
            self.inner
                .operators
                .cancel_transfer(self.coordinator(), request),
        )
        .await
    }

    /// Rolls back after an outbound transfer failed past its start.
    ///
    /// First cancels, best effort, every other outbound transfer of this
    /// wallet that is still cancellable, except counter transfers of swaps
    /// awaiting settlement. Then cancels the failed transfer itself and
    /// returns `error`, or [`SdkError::TransferStuck`] when an operator
    /// already committed its tweak.
    pub(crate) async fn cancel_after_failure(&self, transfer_id: &str, error: SdkError) -> SdkError {
        warn!(transfer_id, error = %error, "outbound transfer failed, cancelling");

        let awaiting_settlement: HashSet<String> = self
            .inner
            .pending_swaps
            .lock()
            .unwrap()
            .values()
            .map(|s| s.outbound.transfer.id.clone())
            .collect();

        let outbound = self
            .call_coordinator(
                OperatorRpc::QueryTransfers,
                self.inner.operators.query_transfers(
                    self.coordinator(),
                    TransferQuery::Sender(self.identity_public_key()),
                ),
            )
            .await;
        match outbound {
            Ok(transfers) => {
                for stale in transfers.iter().filter(|t| {
                    t.id != transfer_id
                        && t.status.is_cancellable_by_sender()
                        && !awaiting_settlement.contains(&t.id)
                }) {
                    if let Err(e) = self.cancel_transfer_inner(&stale.id).await {
                        warn!(transfer_id = %stale.id, error = %e, "best-effort cancellation failed");
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not list outbound transfers"),
        }

        match self.cancel_transfer_inner(transfer_id).await {
            Ok(transfer) => {
                info!(transfer_id, status = %transfer.status, "failed transfer rolled back");
                error
            }
            Err(SdkError::Operator(OperatorError::AlreadyCommitted)) => {
                error!(
                    transfer_id,
                    error = %error,
                    "transfer cannot be cancelled: key tweak already committed"
                );
                SdkError::TransferStuck {
                    transfer_id: transfer_id.to_owned(),
                }
            }
            Err(e) => {
                warn!(transfer_id, error = %e, "cancellation of failed transfer failed");
                error
            }
        }
    }
}
