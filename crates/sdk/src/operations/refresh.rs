//! Timelock refresh.
//!
//! Every transfer lowers a leaf's refund timelock by one interval. When the
//! timelock gets close to the floor the leaf is extended: a new node
//! transaction spends the old node output into an identical output, with a
//! decremented sequence, and a fresh refund at the initial timelock spends
//! the new node. Both are threshold-signed in one `extend_leaf` call and
//! submitted with `finalize_node_signatures(Extend)`.

use std::time::Instant;

use bitcoin::OutPoint;
use sdk_core::SignatureIntent;
use signer::KeyStore;
use tracing::{debug, info, warn};

use crate::bitcoin_tx::{create_extension_node_tx, create_refund_tx};
use crate::operations::tracking::{OperationError, OperationKind, Phase};
use crate::operations::transfer_core::PendingSignature;
use crate::operator::{
    ExtendLeafRequest, FinalizeNodeSignaturesRequest, NodeSignatures, OperatorClient, OperatorRpc,
};
use crate::swap_provider::SwapProvider;
use crate::timelock::{initial_sequence, needs_refresh, next_sequence, timelock_of};
use crate::tree::{Leaf, TreeStore};
use crate::{Sdk, SdkError};

impl<K, T, C, P> Sdk<K, T, C, P>
where
    K: KeyStore,
    T: TreeStore,
    C: OperatorClient,
    P: SwapProvider,
{
    /// Extends every available leaf whose refund timelock is near the floor.
    ///
    /// Returns the replacement leaves. Leaves that do not need a refresh are
    /// left alone.
    pub async fn refresh_timelocks(&self) -> Result<Vec<Leaf>, OperationError> {
        let mut tracker = self.tracker(OperationKind::TimelockRefresh);
        let op_id = tracker.id();

        if let Err(e) = self.check_cancelled() {
            return Err(tracker.fail(Phase::SelectLeaves, e));
        }
        let _guard = self.inner.send_lock.lock().await;

        let t = Instant::now();
        let due = match self.leaves_due_for_refresh() {
            Ok(due) => due,
            Err(e) => return Err(tracker.fail(Phase::SelectLeaves, e)),
        };
        tracker.done(Phase::SelectLeaves, t.elapsed());
        if due.is_empty() {
            tracker.skipped(Phase::ExtendTimelocks);
            tracker.succeed();
            debug!(op_id = %op_id, "no leaf needs a timelock refresh");
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = due.iter().map(|l| l.id.as_str()).collect();
        let reservation = match self.inner.tree_store.reserve_leaves(&ids) {
            Ok(r) => r,
            Err(e) => return Err(tracker.fail(Phase::ReserveLeaves, e)),
        };

        let t = Instant::now();
        let result = self.refresh_leaf_timelocks(&reservation.leaves).await;
        // Extended leaves were already written back; release them either way.
        if let Err(e) = self.inner.tree_store.cancel_reservation(reservation.id) {
            return Err(tracker.fail(Phase::ReserveLeaves, e));
        }
        match result {
            Ok(leaves) => {
                tracker.done(Phase::ExtendTimelocks, t.elapsed());
                tracker.succeed();
                info!(op_id = %op_id, leaves = leaves.len(), "timelocks refreshed");
                Ok(leaves)
            }
            Err(e) => Err(tracker.fail(Phase::ExtendTimelocks, e)),
        }
    }

    fn leaves_due_for_refresh(&self) -> Result<Vec<Leaf>, SdkError> {
        let mut due = Vec::new();
        for leaf in self.inner.tree_store.get_available_leaves()? {
            if needs_refresh(leaf.refund_sequence()?) {
                due.push(leaf);
            }
        }
        Ok(due)
    }

    /// Extends the leaves that need it and returns all of them, extended or
    /// not, in input order. Extended leaves are written to the tree store and
    /// keep any reservation they are under.
    pub(crate) async fn refresh_leaf_timelocks(
        &self,
        leaves: &[Leaf],
    ) -> Result<Vec<Leaf>, SdkError> {
        let mut out = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            self.check_cancelled()?;
            if needs_refresh(leaf.refund_sequence()?) {
                out.push(self.extend_leaf(leaf).await?);
            } else {
                out.push(leaf.clone());
            }
        }
        Ok(out)
    }

    /// Extends freshly claimed leaves that arrived near the floor and returns
    /// the claimed set with the extended versions swapped in.
    ///
    /// The claim already stands, so a failed extension only logs; the leaf
    /// stays due for [`Sdk::refresh_timelocks`].
    pub(crate) async fn refresh_received_leaves(&self, leaves: Vec<Leaf>) -> Vec<Leaf> {
        let due: Vec<&str> = leaves
            .iter()
            .filter(|l| l.refund_sequence().is_ok_and(needs_refresh))
            .map(|l| l.id.as_str())
            .collect();
        if due.is_empty() {
            return leaves;
        }
        let reservation = match self.inner.tree_store.reserve_leaves(&due) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "could not reserve claimed leaves for refresh");
                return leaves;
            }
        };

        let result = self.refresh_leaf_timelocks(&reservation.leaves).await;
        if let Err(e) = self.inner.tree_store.cancel_reservation(reservation.id) {
            warn!(error = %e, "failed to release claimed leaves after refresh");
        }
        match result {
            Ok(extended) => leaves
                .into_iter()
                .map(|leaf| {
                    extended
                        .iter()
                        .find(|e| e.id == leaf.id)
                        .cloned()
                        .unwrap_or(leaf)
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, leaves = due.len(), "claimed leaves left unrefreshed");
                leaves
            }
        }
    }

    async fn extend_leaf(&self, leaf: &Leaf) -> Result<Leaf, SdkError> {
        let (old_outpoint, old_output) = leaf.node_output()?;
        let next = next_sequence(leaf.refund_sequence()?, true)?;

        let node_tx = create_extension_node_tx(old_outpoint, &old_output, next.sequence);
        let new_outpoint = OutPoint::new(node_tx.compute_txid(), 0);
        let refund_tx = create_refund_tx(
            new_outpoint,
            old_output.value,
            initial_sequence(),
            &leaf.owner_signing_public_key,
            self.bitcoin_network(),
        );

        // The new node output equals the old one, so both sighashes commit to
        // the same previous output.
        let node = PendingSignature::new(
            &leaf.id,
            leaf.verifying_public_key,
            leaf.owner_signing_public_key,
            node_tx,
            vec![old_output.clone()],
        )?;
        let refund = PendingSignature::new(
            &leaf.id,
            leaf.verifying_public_key,
            leaf.owner_signing_public_key,
            refund_tx,
            vec![old_output],
        )?;

        let request = ExtendLeafRequest {
            leaf_id: leaf.id.clone(),
            owner_identity_public_key: self.identity_public_key(),
            node_tx_signing_job: node.job(),
            refund_tx_signing_job: refund.job(),
        };
        let response = self
            .call_coordinator(
                OperatorRpc::ExtendLeaf,
                self.inner.operators.extend_leaf(self.coordinator(), request),
            )
            .await?;
        if response.leaf_id != leaf.id {
            return Err(SdkError::InvalidOperatorResponse);
        }

        let node = self.aggregate_signature(node, &response.node_tx_signing_result, None)?;
        let refund = self.aggregate_signature(refund, &response.refund_tx_signing_result, None)?;

        let request = FinalizeNodeSignaturesRequest {
            intent: SignatureIntent::Extend,
            transfer_id: None,
            owner_identity_public_key: self.identity_public_key(),
            nodes: vec![NodeSignatures {
                leaf_id: leaf.id.clone(),
                node_tx_signature: Some(node.signature),
                refund_tx_signature: refund.signature,
            }],
        };
        let leaves = self
            .call_coordinator(
                OperatorRpc::FinalizeNodeSignatures,
                self.inner
                    .operators
                    .finalize_node_signatures(self.coordinator(), request),
            )
            .await?;
        let extended = leaves
            .into_iter()
            .find(|l| l.id == leaf.id)
            .ok_or(SdkError::InvalidOperatorResponse)?;

        self.inner
            .tree_store
            .insert_leaves(std::slice::from_ref(&extended))?;
        info!(
            leaf_id = %leaf.id,
            node_timelock = timelock_of(next.sequence),
            refund_timelock = timelock_of(extended.refund_sequence()?),
            "leaf timelock extended"
        );
        Ok(extended)
    }
}
