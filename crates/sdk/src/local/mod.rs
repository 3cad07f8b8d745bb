//! In-process operator network.
//!
//! [`LocalNetwork`] implements [`OperatorClient`] for every operator of a
//! [`NetworkConfig`] inside one process. Each operator holds its own share of
//! every leaf key and checks what it is sent the way a remote operator
//! would: Feldman proofs on tweak shares, the sender's signature over each
//! key package, refund signatures before handing leaves over.
//!
//! It also mints leaves ([`LocalNetwork::fund`]) and injects faults:
//! failing a single RPC on one operator, losing an RPC's response after it
//! took effect, taking an operator offline, corrupting an operator's
//! signature shares, an operator that drops sender tweak shares, and
//! tampering with the key package a sender left for the receiver.
//!
//! [`LocalSwapProvider`] is a swap provider backed by a wallet on the same
//! network.

mod provider;
mod state;

pub use provider::LocalSwapProvider;
pub use state::KeyPackagePart;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, OutPoint, Sequence};
use config::NetworkConfig;
use config::constants::{INITIAL_TIMELOCK, SPARK_SEQUENCE_FLAG};
use k256::{NonZeroScalar, ProjectivePoint, Scalar};
use rand_core::OsRng;
use sdk_core::LeafStatus;
use signer::{KeyDerivation, KeyStore};
use spark_crypto::secp;
use spark_crypto::verifiable_secret_sharing::split_secret_with_proofs;
use tracing::debug;

use crate::bitcoin_tx::{
    bitcoin_network, create_node_tx, create_refund_tx, serialize_tx, synthetic_outpoint,
};
use crate::operator::{
    CancelTransferRequest, ClaimSignRequest, ClaimTweakRequest, CompleteSendTransferRequest,
    CooperativeExitRequest, ExtendLeafRequest, ExtendLeafResponse, FinalizeNodeSignaturesRequest,
    LeafSwapRequest, OperatorClient, OperatorError, OperatorRpc, SigningResult,
    StartTransferRequest, StartTransferResponse, StorePreimageShareRequest, Transfer,
    TransferQuery,
};
use crate::swap_provider::SwapProvider;
use crate::tree::{Leaf, TreeStore};
use crate::utils::generate_uuid_v4;
use crate::{Sdk, SdkError};

use state::{LeafRecord, State, group_public_key, share_index};

/// Signing operators simulated in-process.
///
/// `Clone`-able: clones share the same operators.
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<Inner>,
}

struct Inner {
    config: NetworkConfig,
    state: Mutex<State>,
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("operators", &self.inner.config.num_operators())
            .field("threshold", &self.inner.config.threshold())
            .finish()
    }
}

impl LocalNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::new(config)),
            }),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Funding
    // -----------------------------------------------------------------------

    /// Mints one leaf per value for the wallet behind `sdk` and adds them to
    /// its tree store. Refunds start at the initial timelock.
    pub fn fund<K, T, C, P>(&self, sdk: &Sdk<K, T, C, P>, values: &[u64]) -> Result<Vec<Leaf>, SdkError>
    where
        K: KeyStore,
        T: TreeStore,
        C: OperatorClient,
        P: SwapProvider,
    {
        values
            .iter()
            .map(|value| self.fund_with_timelock(sdk, *value, INITIAL_TIMELOCK))
            .collect()
    }

    /// Mints a single leaf whose refund carries `timelock`.
    pub fn fund_with_timelock<K, T, C, P>(
        &self,
        sdk: &Sdk<K, T, C, P>,
        value: u64,
        timelock: u16,
    ) -> Result<Leaf, SdkError>
    where
        K: KeyStore,
        T: TreeStore,
        C: OperatorClient,
        P: SwapProvider,
    {
        if value == 0 {
            return Err(SdkError::InvalidRequest);
        }
        let config = &self.inner.config;
        let leaf_id = generate_uuid_v4(&mut OsRng);
        let owner_signing_public_key = sdk.key_store().derive(KeyDerivation::Leaf(&leaf_id))?;

        // Operator half of the leaf key, dealt t-of-n.
        let secret: Scalar = *NonZeroScalar::random(&mut OsRng);
        let shares = split_secret_with_proofs(
            &secret,
            config.threshold(),
            config.num_operators(),
            &mut OsRng,
        )
        .map_err(|_| SdkError::SigningFailed)?;
        let mut key_shares = BTreeMap::new();
        for op in config.operators() {
            let share = shares
                .iter()
                .find(|s| s.secret_share.index == share_index(op.index))
                .ok_or(SdkError::ShareNotFoundForOperator { operator: op.index })?;
            key_shares.insert(op.index, share.secret_share.share);
        }
        let operators_key = secp::public_key_from_point(&(ProjectivePoint::GENERATOR * secret))
            .map_err(|_| SdkError::SigningFailed)?;
        let verifying_public_key = secp::add_public_keys(&owner_signing_public_key, &operators_key)
            .map_err(|_| SdkError::SigningFailed)?;

        let network = bitcoin_network(config.network);
        let amount = Amount::from_sat(value);
        let node_tx = create_node_tx(
            synthetic_outpoint(&leaf_id),
            Sequence::ZERO,
            amount,
            &verifying_public_key,
            network,
        );
        let refund_tx = create_refund_tx(
            OutPoint::new(node_tx.compute_txid(), 0),
            amount,
            Sequence(SPARK_SEQUENCE_FLAG | u32::from(timelock)),
            &owner_signing_public_key,
            network,
        );
        let leaf = Leaf {
            id: leaf_id.clone(),
            tree_id: leaf_id.clone(),
            value,
            parent_id: None,
            node_tx: serialize_tx(&node_tx),
            refund_tx: serialize_tx(&refund_tx),
            vout: 0,
            verifying_public_key,
            owner_identity_public_key: sdk.identity_public_key(),
            owner_signing_public_key,
            status: LeafStatus::Available,
        };

        self.inner
            .state
            .lock()
            .unwrap()
            .leaves
            .insert(leaf_id.clone(), LeafRecord::new(leaf.clone(), key_shares));
        sdk.tree_store().insert_leaves(std::slice::from_ref(&leaf))?;
        debug!(leaf_id = %leaf_id, value, timelock, "leaf funded");
        Ok(leaf)
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// The transfer as the operators record it.
    pub fn transfer(&self, transfer_id: &str) -> Option<Transfer> {
        let state = self.inner.state.lock().unwrap();
        state.transfers.get(transfer_id).map(|r| r.transfer.clone())
    }

    /// Whether any operator holds a sender tweak share for the transfer that
    /// was not applied yet.
    pub fn has_staged_tweaks(&self, transfer_id: &str) -> bool {
        let state = self.inner.state.lock().unwrap();
        state
            .transfers
            .get(transfer_id)
            .is_some_and(|r| !r.staged.is_empty())
    }

    /// The leaf as the operators record it.
    pub fn leaf(&self, leaf_id: &str) -> Option<Leaf> {
        let state = self.inner.state.lock().unwrap();
        state.leaves.get(leaf_id).map(|r| r.leaf.clone())
    }

    /// The operators' joint public key for a leaf, interpolated from their
    /// current shares.
    pub fn group_public_key(&self, leaf_id: &str) -> Option<PublicKey> {
        let state = self.inner.state.lock().unwrap();
        let record = state.leaves.get(leaf_id)?;
        group_public_key(&record.key_shares, self.inner.config.threshold()).ok()
    }

    /// Number of `extend_leaf` calls received.
    pub fn extend_calls(&self) -> usize {
        self.inner.state.lock().unwrap().extend_calls
    }

    /// The preimage the operators can reconstruct for `payment_hash`.
    pub fn recover_preimage(&self, payment_hash: &[u8; 32]) -> Option<[u8; 32]> {
        self.inner.state.lock().unwrap().recover_preimage(payment_hash)
    }

    // -----------------------------------------------------------------------
    // Fault injection
    // -----------------------------------------------------------------------

    /// Makes `rpc` fail on `operator` until [`LocalNetwork::clear_faults`].
    pub fn fail_rpc(&self, operator: u32, rpc: OperatorRpc) {
        let mut state = self.inner.state.lock().unwrap();
        state.faults.failing.insert((operator, rpc));
    }

    pub fn set_offline(&self, operator: u32, offline: bool) {
        let mut state = self.inner.state.lock().unwrap();
        if offline {
            state.faults.offline.insert(operator);
        } else {
            state.faults.offline.remove(&operator);
        }
    }

    /// Makes `operator` sign with a wrong key share.
    pub fn corrupt_shares(&self, operator: u32) {
        let mut state = self.inner.state.lock().unwrap();
        state.faults.corrupt.insert(operator);
    }

    /// Makes `rpc` take effect on `operator` but answer with a timeout, as
    /// if the response were lost on the way back.
    pub fn lose_responses(&self, operator: u32, rpc: OperatorRpc) {
        let mut state = self.inner.state.lock().unwrap();
        state.faults.lost_responses.insert((operator, rpc));
    }

    /// Makes `operator` acknowledge sender key tweaks without keeping its
    /// share. Its echo shows the transfer as it stood before the call.
    pub fn drop_tweak_shares(&self, operator: u32) {
        let mut state = self.inner.state.lock().unwrap();
        state.faults.stale_echo.insert(operator);
    }

    /// Corrupts `part` of every leaf's key package in a transfer. Returns
    /// `false` for an unknown transfer.
    pub fn tamper_key_package(&self, transfer_id: &str, part: KeyPackagePart) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        state.tamper_key_package(transfer_id, part)
    }

    pub fn clear_faults(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.faults = Default::default();
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn call<R>(
        &self,
        operator: u32,
        rpc: OperatorRpc,
        f: impl FnOnce(&mut State) -> Result<R, OperatorError>,
    ) -> Result<R, OperatorError> {
        let mut state = self.inner.state.lock().unwrap();
        let result = state.check(operator, rpc).and_then(|()| f(&mut state));
        if let Err(e) = &result {
            debug!(operator, rpc = %rpc, error = %e, "operator rejected request");
        } else if state.faults.lost_responses.contains(&(operator, rpc)) {
            debug!(operator, rpc = %rpc, "operator response lost");
            return Err(OperatorError::Timeout);
        }
        result
    }

    fn coordinator_call<R>(
        &self,
        operator: u32,
        rpc: OperatorRpc,
        f: impl FnOnce(&mut State) -> Result<R, OperatorError>,
    ) -> Result<R, OperatorError> {
        self.call(operator, rpc, |state| {
            state.require_coordinator(operator)?;
            f(state)
        })
    }
}

// ---------------------------------------------------------------------------
// OperatorClient
// ---------------------------------------------------------------------------

impl OperatorClient for LocalNetwork {
    async fn start_send_transfer(
        &self,
        operator: u32,
        request: StartTransferRequest,
    ) -> Result<StartTransferResponse, OperatorError> {
        self.coordinator_call(operator, OperatorRpc::StartSendTransfer, |state| {
            state.start_transfer(request, None, None)
        })
    }

    async fn complete_send_transfer(
        &self,
        operator: u32,
        request: CompleteSendTransferRequest,
    ) -> Result<Transfer, OperatorError> {
        self.call(operator, OperatorRpc::CompleteSendTransfer, |state| {
            state.complete_send_transfer(operator, request)
        })
    }

    async fn claim_transfer_tweak_keys(
        &self,
        operator: u32,
        request: ClaimTweakRequest,
    ) -> Result<(), OperatorError> {
        self.call(operator, OperatorRpc::ClaimTransferTweakKeys, |state| {
            state.claim_transfer_tweak_keys(operator, request)
        })
    }

    async fn claim_transfer_sign_refunds(
        &self,
        operator: u32,
        request: ClaimSignRequest,
    ) -> Result<Vec<SigningResult>, OperatorError> {
        self.coordinator_call(operator, OperatorRpc::ClaimTransferSignRefunds, |state| {
            state.claim_transfer_sign_refunds(request)
        })
    }

    async fn finalize_node_signatures(
        &self,
        operator: u32,
        request: FinalizeNodeSignaturesRequest,
    ) -> Result<Vec<Leaf>, OperatorError> {
        self.coordinator_call(operator, OperatorRpc::FinalizeNodeSignatures, |state| {
            state.finalize_node_signatures(request)
        })
    }

    async fn cooperative_exit(
        &self,
        operator: u32,
        request: CooperativeExitRequest,
    ) -> Result<StartTransferResponse, OperatorError> {
        self.coordinator_call(operator, OperatorRpc::CooperativeExit, |state| {
            state.start_transfer(request.transfer, None, Some(request.exit_txid))
        })
    }

    async fn leaf_swap(
        &self,
        operator: u32,
        request: LeafSwapRequest,
    ) -> Result<StartTransferResponse, OperatorError> {
        self.coordinator_call(operator, OperatorRpc::LeafSwap, |state| {
            state.start_transfer(request.transfer, Some(request.adaptor_public_key), None)
        })
    }

    async fn query_transfers(
        &self,
        operator: u32,
        query: TransferQuery,
    ) -> Result<Vec<Transfer>, OperatorError> {
        self.call(operator, OperatorRpc::QueryTransfers, |state| {
            Ok(state.query_transfers(&query))
        })
    }

    async fn cancel_transfer(
        &self,
        operator: u32,
        request: CancelTransferRequest,
    ) -> Result<Transfer, OperatorError> {
        self.coordinator_call(operator, OperatorRpc::CancelTransfer, |state| {
            state.cancel_transfer(request)
        })
    }

    async fn extend_leaf(
        &self,
        operator: u32,
        request: ExtendLeafRequest,
    ) -> Result<ExtendLeafResponse, OperatorError> {
        self.coordinator_call(operator, OperatorRpc::ExtendLeaf, |state| {
            state.extend_leaf(request)
        })
    }

    async fn store_preimage_share(
        &self,
        operator: u32,
        request: StorePreimageShareRequest,
    ) -> Result<(), OperatorError> {
        self.call(operator, OperatorRpc::StorePreimageShare, |state| {
            state.store_preimage_share(operator, request)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
