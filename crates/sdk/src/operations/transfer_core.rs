//! Shared outbound machinery: refund signing, key tweak bundles, operator
//! echo checks and the coordinator call wrapper.
//!
//! An outbound transfer has two phases:
//!
//! 1. **Start**: the coordinator records the transfer and the operators
//!    co-sign one refund per leaf paying to a fresh transient key. The
//!    sender aggregates each refund signature with its current leaf key.
//! 2. **Key tweak**: per leaf, `sk_old - sk_transient` is split t-of-n and
//!    every operator receives its share together with the transient key
//!    encrypted to the receiver. The phase needs every operator.
//!
//! A failure after the start triggers a cancellation, see
//! [`Sdk::cancel_after_failure`].

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::{Transaction, TxOut};
use bytes::Bytes;
use config::OperatorInfo;
use k256::Scalar;
use rand_core::{CryptoRng, OsRng, RngCore};
use sdk_core::{TransferStatus, TransferType};
use signer::{KeyDerivation, KeyStore};
use spark_crypto::adaptor_signature::{derive_from_existing_adaptor, generate_adaptor};
use spark_crypto::threshold_signing::{
    self, Participant, SigningCommitment, SigningNonce, SigningPackage, ThresholdError,
};
use spark_crypto::verifiable_secret_sharing::{
    VerifiableSecretShare, share_public_key, split_secret_with_proofs,
};
use spark_crypto::{ecies, secp};
use tracing::{debug, info};

use crate::bitcoin_tx::{
    bitcoin_network, create_refund_tx, parse_tx, serialize_tx, taproot_sighash,
};
use crate::fanout::{FanOutPolicy, fan_out};
use crate::operator::{
    CompleteSendTransferRequest, CooperativeExitRequest, LeafSwapRequest, LeafTweakBundle,
    OperatorClient, OperatorError, OperatorRpc, SigningJob, SigningResult, StartTransferRequest,
    Transfer, TransferLeaf, TransferQuery,
};
use crate::swap_provider::SwapProvider;
use crate::timelock::next_sequence;
use crate::tree::{Leaf, TreeStore};
use crate::utils::{generate_uuid_v4, now_secs};
use crate::{REQUEST_TIMEOUT, Sdk, SdkError};

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// A transaction awaiting its threshold signature under a leaf's verifying
/// key. Holds the user's round-1 nonce, which aggregation consumes.
pub(crate) struct PendingSignature {
    pub leaf_id: String,
    pub verifying_key: PublicKey,
    /// The user's key for this signature (weight 1 in the aggregate).
    pub signing_public_key: PublicKey,
    pub tx: Transaction,
    pub prev_outs: Vec<TxOut>,
    pub sighash: [u8; 32],
    nonce: SigningNonce,
    commitment: SigningCommitment,
}

impl PendingSignature {
    pub fn new(
        leaf_id: &str,
        verifying_key: PublicKey,
        signing_public_key: PublicKey,
        tx: Transaction,
        prev_outs: Vec<TxOut>,
    ) -> Result<Self, SdkError> {
        let sighash =
            taproot_sighash(&tx, 0, &prev_outs).map_err(|_| SdkError::InvalidTransaction)?;
        let (nonce, commitment) = threshold_signing::generate_nonce(&mut OsRng);
        Ok(Self {
            leaf_id: leaf_id.to_owned(),
            verifying_key,
            signing_public_key,
            tx,
            prev_outs,
            sighash,
            nonce,
            commitment,
        })
    }

    /// The job sent to the operators for this signature.
    pub fn job(&self) -> SigningJob {
        SigningJob {
            leaf_id: self.leaf_id.clone(),
            signing_public_key: self.signing_public_key,
            raw_tx: Bytes::from(serialize_tx(&self.tx)),
            prev_outs: self.prev_outs.clone(),
            user_commitment: self.commitment,
        }
    }
}

/// A transaction with its aggregated (or adaptor-blinded) signature.
#[derive(Debug, Clone)]
pub(crate) struct SignedTransaction {
    pub leaf_id: String,
    pub verifying_key: PublicKey,
    pub tx: Transaction,
    pub sighash: [u8; 32],
    pub signature: [u8; 64],
}

fn signing_error(leaf_id: &str, e: ThresholdError) -> SdkError {
    match e {
        ThresholdError::AggregationMismatch { culprit } => SdkError::AggregationMismatch {
            leaf_id: leaf_id.to_owned(),
            culprit,
        },
        ThresholdError::MissingShare(p) => SdkError::AggregationMismatch {
            leaf_id: leaf_id.to_owned(),
            culprit: Some(p),
        },
        ThresholdError::UnknownParticipant(Participant::Operator(_)) => {
            SdkError::InvalidOperatorResponse
        }
        _ => SdkError::SigningFailed,
    }
}

/// Blinds every signature with one fresh adaptor secret. Returns `(t, T)`.
pub(crate) fn blind_signatures(
    signed: &mut [SignedTransaction],
) -> Result<(SecretKey, PublicKey), SdkError> {
    let (first, rest) = signed.split_first_mut().ok_or(SdkError::InvalidRequest)?;
    let pair = generate_adaptor(&first.signature, &mut OsRng)
        .map_err(|_| SdkError::AdaptorVerificationFailed)?;
    first.signature = pair.signature;
    for s in rest {
        s.signature = derive_from_existing_adaptor(&s.signature, &pair.adaptor_secret)
            .map_err(|_| SdkError::AdaptorVerificationFailed)?;
    }
    Ok((pair.adaptor_secret, pair.adaptor_public_key))
}

/// Sighash of the intermediate refund recorded for a transfer leaf. The
/// refund spends the leaf's node output.
pub(crate) fn intermediate_refund_sighash(leaf: &TransferLeaf) -> Result<[u8; 32], SdkError> {
    let refund = parse_tx(&leaf.intermediate_refund_tx).map_err(|_| SdkError::InvalidTransaction)?;
    let (_, node_output) = leaf.leaf.node_output()?;
    taproot_sighash(&refund, 0, &[node_output]).map_err(|_| SdkError::InvalidTransaction)
}

// ---------------------------------------------------------------------------
// Key tweaks
// ---------------------------------------------------------------------------

/// One leaf's key rotation from the owner's current signing key to a fresh
/// key handed to the receiver.
#[derive(Debug, Clone)]
pub(crate) struct LeafKeyTweak {
    pub leaf: Leaf,
    pub new_signing_public_key: PublicKey,
}

/// A key delta split over the operators.
#[derive(Debug)]
pub(crate) struct KeyTweakShares {
    /// Each operator's share, by operator index.
    pub shares: BTreeMap<u32, VerifiableSecretShare>,
    /// `share_i * G` for every operator, by operator index.
    pub public_shares: BTreeMap<u32, PublicKey>,
}

/// Splits `delta` t-of-n and assigns share `index + 1` to each operator.
pub(crate) fn split_key_delta<R: RngCore + CryptoRng>(
    delta: &Scalar,
    operators: &[OperatorInfo],
    threshold: usize,
    rng: &mut R,
) -> Result<KeyTweakShares, SdkError> {
    let split = split_secret_with_proofs(delta, threshold, operators.len(), rng)
        .map_err(|_| SdkError::SigningFailed)?;

    let mut shares = BTreeMap::new();
    let mut public_shares = BTreeMap::new();
    for op in operators {
        let index = Scalar::from(u64::from(op.index) + 1);
        let share = split
            .iter()
            .find(|s| s.secret_share.index == index)
            .ok_or(SdkError::ShareNotFoundForOperator { operator: op.index })?;
        let public = share_public_key(share).map_err(|_| SdkError::InvalidShare)?;
        let public = secp::public_key_from_point(&public.to_projective())
            .map_err(|_| SdkError::InvalidShare)?;
        shares.insert(op.index, share.clone());
        public_shares.insert(op.index, public);
    }
    Ok(KeyTweakShares {
        shares,
        public_shares,
    })
}

/// Fails with [`SdkError::TransferExpired`] once the expiry has passed.
pub(crate) fn ensure_not_expired(transfer: &Transfer) -> Result<(), SdkError> {
    if transfer.expiry_time <= now_secs() {
        return Err(SdkError::TransferExpired {
            transfer_id: transfer.id.clone(),
        });
    }
    Ok(())
}

/// Checks every operator's view of a transfer after the key tweak against
/// the transfer the coordinator started, and the echoes against each other.
pub(crate) fn check_echoes(started: &Transfer, echoes: &[(u32, Transfer)]) -> Result<(), SdkError> {
    let mut status: Option<&TransferStatus> = None;
    for (operator, echo) in echoes {
        let field = if echo.id != started.id {
            Some("id")
        } else if echo.sender_identity_public_key != started.sender_identity_public_key {
            Some("sender_identity_public_key")
        } else if echo.receiver_identity_public_key != started.receiver_identity_public_key {
            Some("receiver_identity_public_key")
        } else if echo.total_value != started.total_value {
            Some("total_value")
        } else if echo.expiry_time != started.expiry_time {
            Some("expiry_time")
        } else if echo.leaves.len() != started.leaves.len() {
            Some("leaves")
        } else {
            match status {
                Some(s) if *s != echo.status => Some("status"),
                _ => None,
            }
        };
        if let Some(field) = field {
            return Err(SdkError::InconsistentOperatorResponse {
                operator: *operator,
                field,
            });
        }
        status.get_or_insert(&echo.status);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Outbound transfers
// ---------------------------------------------------------------------------

/// How the coordinator is asked to start an outbound transfer.
pub(crate) enum StartKind {
    Transfer(TransferType),
    LeafSwap {
        swap_id: String,
        adaptor_public_key: PublicKey,
    },
    CooperativeExit {
        exit_id: String,
        exit_txid: bitcoin::Txid,
    },
}

/// An outbound transfer whose refunds are signed but whose key tweak has
/// not been sent.
#[derive(Debug)]
pub(crate) struct OutboundTransfer {
    pub transfer: Transfer,
    pub tweaks: Vec<LeafKeyTweak>,
    /// One per leaf, in `tweaks` order. Sent to the operators with the tweak.
    pub refunds: Vec<SignedTransaction>,
}

impl<K, T, C, P> Sdk<K, T, C, P>
where
    K: KeyStore,
    T: TreeStore,
    C: OperatorClient,
    P: SwapProvider,
{
    pub(crate) fn bitcoin_network(&self) -> bitcoin::Network {
        bitcoin_network(self.inner.config.network.network)
    }

    pub(crate) fn coordinator(&self) -> u32 {
        self.inner.config.network.coordinator().index
    }

    fn signing_policy(&self) -> FanOutPolicy {
        FanOutPolicy::Threshold(self.inner.config.network.threshold())
    }

    /// Runs one coordinator call under the request timeout.
    pub(crate) async fn call_coordinator<R, Fut>(
        &self,
        rpc: OperatorRpc,
        call: Fut,
    ) -> Result<R, SdkError>
    where
        Fut: Future<Output = Result<R, OperatorError>>,
    {
        let result = match tokio::time::timeout(REQUEST_TIMEOUT, call).await {
            Ok(result) => result,
            Err(_) => Err(OperatorError::Timeout),
        };
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!(rpc = %rpc, operator = self.coordinator(), error = %e, "coordinator call failed");
                Err(SdkError::Operator(e))
            }
        }
    }

    /// Lists transfers from whichever operators answer.
    ///
    /// Operators replicate transfer records, so one answer is enough. The
    /// coordinator's view wins when it is among them.
    pub(crate) async fn read_transfers(
        &self,
        query: TransferQuery,
    ) -> Result<Vec<Transfer>, SdkError> {
        let mut views = fan_out(
            OperatorRpc::QueryTransfers.as_str(),
            self.inner.config.network.operators(),
            FanOutPolicy::Any,
            REQUEST_TIMEOUT,
            |op| self.inner.operators.query_transfers(op, query.clone()),
        )
        .await?;
        let coordinator = self.coordinator();
        let pick = views
            .iter()
            .position(|(op, _)| *op == coordinator)
            .unwrap_or(0);
        Ok(views.swap_remove(pick).1)
    }

    /// Fetches one transfer from the coordinator.
    pub(crate) async fn query_transfer(&self, transfer_id: &str) -> Result<Transfer, SdkError> {
        let transfers = self
            .call_coordinator(
                OperatorRpc::QueryTransfers,
                self.inner
                    .operators
                    .query_transfers(self.coordinator(), TransferQuery::Id(transfer_id.to_owned())),
            )
            .await?;
        transfers
            .into_iter()
            .find(|t| t.id == transfer_id)
            .ok_or(SdkError::Operator(OperatorError::NotFound))
    }

    /// Rotates each leaf from its current key to a fresh random key.
    ///
    /// The leaf key must be the one the key store derives for the leaf id.
    pub(crate) fn prepare_leaf_key_tweaks(
        &self,
        leaves: &[Leaf],
    ) -> Result<Vec<LeafKeyTweak>, SdkError> {
        let keys = &self.inner.key_store;
        leaves
            .iter()
            .map(|leaf| {
                let current = keys.derive(KeyDerivation::Leaf(&leaf.id))?;
                if current != leaf.owner_signing_public_key {
                    return Err(SdkError::InvalidRequest);
                }
                let new_signing_public_key = keys.derive(KeyDerivation::Random)?;
                Ok(LeafKeyTweak {
                    leaf: leaf.clone(),
                    new_signing_public_key,
                })
            })
            .collect()
    }

    /// Refunds paying each leaf to its new key, one interval below the
    /// leaf's current refund.
    pub(crate) fn refund_signing_jobs(
        &self,
        tweaks: &[LeafKeyTweak],
    ) -> Result<Vec<PendingSignature>, SdkError> {
        let network = self.bitcoin_network();
        tweaks
            .iter()
            .map(|tweak| {
                let leaf = &tweak.leaf;
                let (outpoint, output) = leaf.node_output()?;
                let next = next_sequence(leaf.refund_sequence()?, false)?;
                let tx = create_refund_tx(
                    outpoint,
                    output.value,
                    next.sequence,
                    &tweak.new_signing_public_key,
                    network,
                );
                PendingSignature::new(
                    &leaf.id,
                    leaf.verifying_public_key,
                    leaf.owner_signing_public_key,
                    tx,
                    vec![output],
                )
            })
            .collect()
    }

    /// Combines the user's share with the operators' shares for one
    /// signature. `adaptor_public_key` must match the point the operators
    /// signed under.
    pub(crate) fn aggregate_signature(
        &self,
        pending: PendingSignature,
        result: &SigningResult,
        adaptor_public_key: Option<PublicKey>,
    ) -> Result<SignedTransaction, SdkError> {
        let PendingSignature {
            leaf_id,
            verifying_key,
            signing_public_key,
            tx,
            prev_outs: _,
            sighash,
            nonce,
            commitment,
        } = pending;

        self.signing_policy().require_shares(
            result.signature_shares.len(),
            self.inner.config.network.num_operators(),
        )?;
        if result.leaf_id != leaf_id || result.verifying_key != verifying_key {
            return Err(SdkError::InvalidOperatorResponse);
        }

        let secret = self.inner.key_store.get(&signing_public_key)?;
        let package = SigningPackage {
            message: sighash,
            verifying_key,
            user_commitment: commitment,
            operator_commitments: result.operator_commitments.clone(),
            adaptor_public_key,
        };
        let user_share = threshold_signing::sign_as_user(&package, &secret, nonce)
            .map_err(|e| signing_error(&leaf_id, e))?;
        let signature = threshold_signing::aggregate(
            &package,
            &user_share,
            &signing_public_key,
            &result.signature_shares,
            &result.public_shares,
        )
        .map_err(|e| signing_error(&leaf_id, e))?;

        Ok(SignedTransaction {
            leaf_id,
            verifying_key,
            tx,
            sighash,
            signature,
        })
    }

    /// Aggregates each pending signature with the result for the same leaf.
    pub(crate) fn aggregate_all(
        &self,
        pending: Vec<PendingSignature>,
        results: Vec<SigningResult>,
        adaptor_public_key: Option<PublicKey>,
    ) -> Result<Vec<SignedTransaction>, SdkError> {
        let mut by_leaf: HashMap<String, SigningResult> = results
            .into_iter()
            .map(|r| (r.leaf_id.clone(), r))
            .collect();
        pending
            .into_iter()
            .map(|p| {
                let result = by_leaf
                    .remove(&p.leaf_id)
                    .ok_or(SdkError::InvalidOperatorResponse)?;
                self.aggregate_signature(p, &result, adaptor_public_key)
            })
            .collect()
    }

    /// Splits `old - new` over the configured operators.
    pub(crate) fn split_key_tweak<R: RngCore + CryptoRng>(
        &self,
        old: &SecretKey,
        new: &SecretKey,
        rng: &mut R,
    ) -> Result<KeyTweakShares, SdkError> {
        let network = &self.inner.config.network;
        let delta = secp::scalar_from_secret_key(old) - secp::scalar_from_secret_key(new);
        split_key_delta(&delta, network.operators(), network.threshold(), rng)
    }

    /// Builds every operator's key tweak bundles for a started transfer.
    pub(crate) fn build_tweak_bundles(
        &self,
        transfer: &Transfer,
        tweaks: &[LeafKeyTweak],
        refunds: &[SignedTransaction],
    ) -> Result<BTreeMap<u32, Vec<LeafTweakBundle>>, SdkError> {
        let keys = &self.inner.key_store;
        let mut bundles: BTreeMap<u32, Vec<LeafTweakBundle>> = BTreeMap::new();

        for tweak in tweaks {
            let leaf_id = &tweak.leaf.id;
            let refund = refunds
                .iter()
                .find(|r| &r.leaf_id == leaf_id)
                .ok_or(SdkError::SigningFailed)?;
            let old = keys.get(&tweak.leaf.owner_signing_public_key)?;
            let new = keys.get(&tweak.new_signing_public_key)?;
            let split = self.split_key_tweak(&old, &new, &mut OsRng)?;

            let cipher = ecies::encrypt(
                &transfer.receiver_identity_public_key,
                &new.secret_bytes(),
                &mut OsRng,
            )
            .map_err(|_| SdkError::SigningFailed)?;
            let digest =
                signer::ecdsa::digest(&[leaf_id.as_bytes(), transfer.id.as_bytes(), &cipher]);
            let signature = Bytes::copy_from_slice(&keys.sign_identity_digest(&digest));
            let cipher = Bytes::from(cipher);

            for (operator, share) in split.shares {
                bundles.entry(operator).or_default().push(LeafTweakBundle {
                    leaf_id: leaf_id.clone(),
                    secret_share_tweak: share,
                    pubkey_shares_tweak: split.public_shares.clone(),
                    secret_cipher: cipher.clone(),
                    signature: signature.clone(),
                    refund_signature: refund.signature,
                });
            }
        }
        Ok(bundles)
    }

    /// Delivers the key tweak to every operator and checks their echoes.
    /// Returns the transfer as the first operator reports it.
    pub(crate) async fn send_key_tweaks(
        &self,
        transfer: &Transfer,
        mut bundles: BTreeMap<u32, Vec<LeafTweakBundle>>,
    ) -> Result<Transfer, SdkError> {
        let owner = self.identity_public_key();
        let client = &self.inner.operators;
        let echoes = fan_out(
            OperatorRpc::CompleteSendTransfer.as_str(),
            self.inner.config.network.operators(),
            FanOutPolicy::All,
            REQUEST_TIMEOUT,
            |operator| {
                let request = CompleteSendTransferRequest {
                    transfer_id: transfer.id.clone(),
                    owner_identity_public_key: owner,
                    leaves: bundles.remove(&operator).unwrap_or_default(),
                };
                client.complete_send_transfer(operator, request)
            },
        )
        .await?;

        check_echoes(transfer, &echoes)?;
        info!(
            transfer_id = %transfer.id,
            leaves = transfer.leaves.len(),
            "sender key tweak acknowledged by all operators"
        );
        Ok(echoes
            .into_iter()
            .next()
            .map(|(_, t)| t)
            .unwrap_or_else(|| transfer.clone()))
    }

    /// Starts an outbound transfer and aggregates its refund signatures.
    ///
    /// Once the coordinator may hold the transfer, any failure cancels it.
    /// That includes a start call that timed out.
    pub(crate) async fn start_outbound(
        &self,
        tweaks: Vec<LeafKeyTweak>,
        pending: Vec<PendingSignature>,
        receiver_identity_public_key: PublicKey,
        kind: StartKind,
        expiry: Duration,
    ) -> Result<OutboundTransfer, SdkError> {
        let transfer_type = match &kind {
            StartKind::Transfer(t) => t.clone(),
            StartKind::LeafSwap { .. } => TransferType::CounterSwap,
            StartKind::CooperativeExit { .. } => TransferType::CooperativeExit,
        };
        let request = StartTransferRequest {
            transfer_id: generate_uuid_v4(&mut OsRng),
            transfer_type,
            owner_identity_public_key: self.identity_public_key(),
            receiver_identity_public_key,
            expiry_time: now_secs() + expiry.as_secs(),
            signing_jobs: pending.iter().map(PendingSignature::job).collect(),
        };
        let transfer_id = request.transfer_id.clone();
        let coordinator = self.coordinator();
        let client = &self.inner.operators;

        let (response, adaptor_public_key) = match kind {
            StartKind::Transfer(_) => (
                self.call_coordinator(
                    OperatorRpc::StartSendTransfer,
                    client.start_send_transfer(coordinator, request),
                )
                .await,
                None,
            ),
            StartKind::LeafSwap {
                swap_id,
                adaptor_public_key,
            } => (
                self.call_coordinator(
                    OperatorRpc::LeafSwap,
                    client.leaf_swap(
                        coordinator,
                        LeafSwapRequest {
                            transfer: request,
                            swap_id,
                            adaptor_public_key,
                        },
                    ),
                )
                .await,
                Some(adaptor_public_key),
            ),
            StartKind::CooperativeExit { exit_id, exit_txid } => (
                self.call_coordinator(
                    OperatorRpc::CooperativeExit,
                    client.cooperative_exit(
                        coordinator,
                        CooperativeExitRequest {
                            transfer: request,
                            exit_id,
                            exit_txid,
                        },
                    ),
                )
                .await,
                None,
            ),
        };
        let response = match response {
            Ok(response) => response,
            // A timed-out or unanswered start may still have landed.
            Err(e) if e.is_transient() => {
                self.discard_transient_keys(&tweaks);
                return Err(self.cancel_after_failure(&transfer_id, e).await);
            }
            Err(e) => {
                self.discard_transient_keys(&tweaks);
                return Err(e);
            }
        };
        info!(transfer_id = %transfer_id, leaves = tweaks.len(), "transfer started");

        let signed = if response.transfer.id != transfer_id {
            Err(SdkError::InvalidOperatorResponse)
        } else {
            self.aggregate_all(pending, response.signing_results, adaptor_public_key)
        };
        match signed {
            Ok(refunds) => Ok(OutboundTransfer {
                transfer: response.transfer,
                tweaks,
                refunds,
            }),
            Err(e) => {
                self.discard_transient_keys(&tweaks);
                Err(self.cancel_after_failure(&transfer_id, e).await)
            }
        }
    }

    /// Sends the key tweak of a started transfer. On success the old and
    /// transient leaf keys are forgotten; on failure the transfer is
    /// cancelled.
    pub(crate) async fn complete_outbound(
        &self,
        outbound: OutboundTransfer,
    ) -> Result<Transfer, SdkError> {
        let result = match ensure_not_expired(&outbound.transfer).and_then(|()| {
            self.build_tweak_bundles(&outbound.transfer, &outbound.tweaks, &outbound.refunds)
        }) {
            Ok(bundles) => self.send_key_tweaks(&outbound.transfer, bundles).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(transfer) => {
                let keys = &self.inner.key_store;
                for tweak in &outbound.tweaks {
                    keys.remove(&tweak.leaf.owner_signing_public_key);
                    keys.remove(&tweak.new_signing_public_key);
                }
                Ok(transfer)
            }
            Err(e) => {
                let e = self.cancel_after_failure(&outbound.transfer.id, e).await;
                if !matches!(e, SdkError::TransferStuck { .. }) {
                    self.discard_transient_keys(&outbound.tweaks);
                }
                Err(e)
            }
        }
    }

    pub(crate) fn discard_transient_keys(&self, tweaks: &[LeafKeyTweak]) {
        for tweak in tweaks {
            self.inner.key_store.remove(&tweak.new_signing_public_key);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::Secp256k1;
    use config::NetworkConfig;
    use sdk_core::TransferType;
    use spark_crypto::verifiable_secret_sharing::{recover_secret, validate_share};

    fn key(byte: u8) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::new(), &SecretKey::from_slice(&[byte; 32]).unwrap())
    }

    fn transfer(status: TransferStatus) -> Transfer {
        Transfer {
            id: "t-1".to_owned(),
            sender_identity_public_key: key(1),
            receiver_identity_public_key: key(2),
            status,
            transfer_type: TransferType::Transfer,
            total_value: 1000,
            expiry_time: now_secs() + 60,
            leaves: Vec::new(),
        }
    }

    #[test]
    fn split_assigns_share_per_operator() {
        let network = NetworkConfig::REGTEST;
        let old = SecretKey::from_slice(&[3u8; 32]).unwrap();
        let new = SecretKey::from_slice(&[4u8; 32]).unwrap();
        let delta = secp::scalar_from_secret_key(&old) - secp::scalar_from_secret_key(&new);

        let split =
            split_key_delta(&delta, network.operators(), network.threshold(), &mut OsRng).unwrap();
        assert_eq!(split.shares.len(), network.num_operators());
        assert_eq!(split.public_shares.len(), network.num_operators());
        for (index, share) in &split.shares {
            assert_eq!(share.secret_share.index, Scalar::from(u64::from(*index) + 1));
            validate_share(share).unwrap();
        }

        let subset: Vec<_> = split.shares.values().take(network.threshold()).cloned().collect();
        assert_eq!(recover_secret(&subset).unwrap(), delta);
    }

    #[test]
    fn echo_check_accepts_matching_views() {
        let started = transfer(TransferStatus::SenderInitiated);
        let echoes = vec![
            (0, transfer(TransferStatus::SenderKeyTweaked)),
            (1, transfer(TransferStatus::SenderKeyTweaked)),
        ];
        check_echoes(&started, &echoes).unwrap();
    }

    #[test]
    fn echo_check_names_the_diverging_operator() {
        let started = transfer(TransferStatus::SenderInitiated);
        let mut off = transfer(TransferStatus::SenderKeyTweaked);
        off.total_value = 999;
        let echoes = vec![(0, transfer(TransferStatus::SenderKeyTweaked)), (3, off)];
        assert_eq!(
            check_echoes(&started, &echoes),
            Err(SdkError::InconsistentOperatorResponse {
                operator: 3,
                field: "total_value"
            })
        );

        let echoes = vec![
            (0, transfer(TransferStatus::SenderKeyTweaked)),
            (1, transfer(TransferStatus::SenderKeyTweakPending)),
        ];
        assert_eq!(
            check_echoes(&started, &echoes),
            Err(SdkError::InconsistentOperatorResponse {
                operator: 1,
                field: "status"
            })
        );
    }

    #[test]
    fn expired_transfer_is_rejected() {
        let mut t = transfer(TransferStatus::SenderInitiated);
        t.expiry_time = now_secs().saturating_sub(1);
        assert_eq!(
            ensure_not_expired(&t),
            Err(SdkError::TransferExpired {
                transfer_id: "t-1".to_owned()
            })
        );
    }
}
