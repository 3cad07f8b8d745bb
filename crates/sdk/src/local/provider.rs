//! A swap provider backed by a wallet on a [`LocalNetwork`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use bytes::Bytes;
use config::constants::CONNECTOR_OUTPUT_SATS;
use rand_core::OsRng;
use sdk_core::TransferType;
use signer::KeyStore;
use spark_crypto::adaptor_signature::validate_adaptor_signature;
use tracing::{debug, info};

use crate::bitcoin_tx::{
    bitcoin_network, p2tr_script, parse_tx, serialize_tx, synthetic_outpoint, taproot_sighash,
};
use crate::operator::TransferLeaf;
use crate::swap_provider::{
    ConfirmCooperativeExitRequest, CooperativeExitQuote, CooperativeExitQuoteRequest,
    LeavesSwapRequest, LeavesSwapResponse, SwapProvider,
};
use crate::tree::TreeStore;
use crate::utils::generate_uuid_v4;
use crate::{Sdk, SdkError};

use super::LocalNetwork;

/// Swap provider whose leaves live in an ordinary wallet.
///
/// Swaps are answered with leaves freshly minted on the network for the
/// requested amounts. Exits are quoted with a synthetic exit transaction;
/// once the wallet reveals the adaptor secret the provider claims the
/// exited leaves.
pub struct LocalSwapProvider<K, T> {
    inner: Arc<ProviderInner<K, T>>,
}

struct ProviderInner<K, T> {
    network: LocalNetwork,
    wallet: Sdk<K, T, LocalNetwork>,
    swap_requests: AtomicUsize,
    exits: Mutex<HashMap<String, PendingExit>>,
}

struct PendingExit {
    user_identity_public_key: PublicKey,
    leaf_ids: Vec<String>,
    exit_tx: Transaction,
    confirmed: Option<ConfirmedExit>,
}

struct ConfirmedExit {
    transfer_id: String,
    adaptor_public_key: PublicKey,
}

impl<K, T> Clone for LocalSwapProvider<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn provider_error(e: impl std::fmt::Display) -> SdkError {
    SdkError::SwapProvider(e.to_string())
}

/// Sighash of a connector refund: input 0 spends the leaf's node output,
/// input 1 a connector of `exit_tx`.
fn connector_refund_sighash(leaf: &TransferLeaf, exit_tx: &Transaction) -> Result<[u8; 32], SdkError> {
    let refund = parse_tx(&leaf.intermediate_refund_tx).map_err(|_| SdkError::InvalidTransaction)?;
    let (_, node_output) = leaf.leaf.node_output()?;
    let connector = refund
        .input
        .get(1)
        .filter(|input| input.previous_output.txid == exit_tx.compute_txid())
        .and_then(|input| exit_tx.output.get(input.previous_output.vout as usize))
        .ok_or_else(|| provider_error("refund does not spend an exit connector"))?;
    taproot_sighash(&refund, 0, &[node_output, connector.clone()])
        .map_err(|_| SdkError::InvalidTransaction)
}

impl<K, T> LocalSwapProvider<K, T>
where
    K: KeyStore,
    T: TreeStore,
{
    pub fn new(network: LocalNetwork, wallet: Sdk<K, T, LocalNetwork>) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                network,
                wallet,
                swap_requests: AtomicUsize::new(0),
                exits: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The provider's own wallet.
    pub fn wallet(&self) -> &Sdk<K, T, LocalNetwork> {
        &self.inner.wallet
    }

    /// Number of swap requests received.
    pub fn swap_requests(&self) -> usize {
        self.inner.swap_requests.load(Ordering::SeqCst)
    }
}

impl<K, T> SwapProvider for LocalSwapProvider<K, T>
where
    K: KeyStore,
    T: TreeStore,
{
    fn identity_public_key(&self) -> Result<PublicKey, SdkError> {
        Ok(self.inner.wallet.identity_public_key())
    }

    async fn request_leaves_swap(
        &self,
        request: LeavesSwapRequest,
    ) -> Result<LeavesSwapResponse, SdkError> {
        self.inner.swap_requests.fetch_add(1, Ordering::SeqCst);
        let wallet = &self.inner.wallet;
        let leaves = self.inner.network.fund(wallet, &request.target_amounts)?;
        let ids: Vec<&str> = leaves.iter().map(|l| l.id.as_str()).collect();
        debug!(
            transfer_id = %request.transfer_id,
            targets = ?request.target_amounts,
            "answering swap request"
        );
        Ok(wallet.respond_to_leaves_swap(&request, &ids).await?)
    }

    async fn complete_leaves_swap(
        &self,
        swap_id: &str,
        adaptor_secret: SecretKey,
    ) -> Result<(), SdkError> {
        self.inner
            .wallet
            .settle_leaves_swap(swap_id, adaptor_secret)
            .await?;
        Ok(())
    }

    async fn request_cooperative_exit(
        &self,
        request: CooperativeExitQuoteRequest,
    ) -> Result<CooperativeExitQuote, SdkError> {
        if request.leaves.is_empty() {
            return Err(SdkError::InvalidRequest);
        }
        let exit_id = generate_uuid_v4(&mut OsRng);
        let network = bitcoin_network(self.inner.network.config().network);
        let connector_script = p2tr_script(&self.inner.wallet.identity_public_key(), network);

        let mut output: Vec<TxOut> = request
            .leaves
            .iter()
            .map(|_| TxOut {
                value: Amount::from_sat(CONNECTOR_OUTPUT_SATS),
                script_pubkey: connector_script.clone(),
            })
            .collect();
        output.push(TxOut {
            value: Amount::from_sat(request.leaves.iter().map(|(_, value)| value).sum()),
            script_pubkey: request.withdrawal_script,
        });
        let exit_tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: synthetic_outpoint(&exit_id),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output,
        };

        let quote = CooperativeExitQuote {
            exit_id: exit_id.clone(),
            exit_tx: Bytes::from(serialize_tx(&exit_tx)),
        };
        self.inner.exits.lock().unwrap().insert(
            exit_id.clone(),
            PendingExit {
                user_identity_public_key: request.user_identity_public_key,
                leaf_ids: request.leaves.into_iter().map(|(id, _)| id).collect(),
                exit_tx,
                confirmed: None,
            },
        );
        debug!(exit_id = %exit_id, "cooperative exit quoted");
        Ok(quote)
    }

    async fn confirm_cooperative_exit(
        &self,
        request: ConfirmCooperativeExitRequest,
    ) -> Result<(), SdkError> {
        let (user, leaf_ids, exit_tx) = {
            let exits = self.inner.exits.lock().unwrap();
            let exit = exits
                .get(&request.exit_id)
                .ok_or_else(|| provider_error("unknown exit"))?;
            (
                exit.user_identity_public_key,
                exit.leaf_ids.clone(),
                exit.exit_tx.clone(),
            )
        };

        let transfer = self.inner.wallet.query_transfer(&request.transfer_id).await?;
        if transfer.receiver_identity_public_key != self.inner.wallet.identity_public_key()
            || transfer.sender_identity_public_key != user
            || transfer.transfer_type != TransferType::CooperativeExit
        {
            return Err(provider_error("transfer is not an exit to this provider"));
        }
        let mut transferred: Vec<&str> = transfer.leaves.iter().map(|l| l.leaf.id.as_str()).collect();
        let mut quoted: Vec<&str> = leaf_ids.iter().map(String::as_str).collect();
        transferred.sort_unstable();
        quoted.sort_unstable();
        if transferred != quoted {
            return Err(provider_error("transfer leaves differ from the quote"));
        }

        for leaf in &transfer.leaves {
            let signature = request
                .leaves
                .iter()
                .find(|s| s.leaf_id == leaf.leaf.id)
                .ok_or(SdkError::AdaptorVerificationFailed)?;
            let sighash = connector_refund_sighash(leaf, &exit_tx)?;
            validate_adaptor_signature(
                &leaf.leaf.verifying_public_key,
                &sighash,
                &signature.adaptor_signature,
                &request.adaptor_public_key,
            )
            .map_err(|_| SdkError::AdaptorVerificationFailed)?;
        }

        let mut exits = self.inner.exits.lock().unwrap();
        let exit = exits
            .get_mut(&request.exit_id)
            .ok_or_else(|| provider_error("unknown exit"))?;
        exit.confirmed = Some(ConfirmedExit {
            transfer_id: request.transfer_id,
            adaptor_public_key: request.adaptor_public_key,
        });
        info!(
            exit_id = %request.exit_id,
            exit_txid = %exit.exit_tx.compute_txid(),
            "exit transaction broadcast"
        );
        Ok(())
    }

    async fn complete_cooperative_exit(
        &self,
        exit_id: &str,
        adaptor_secret: SecretKey,
    ) -> Result<(), SdkError> {
        let (transfer_id, adaptor_public_key) = {
            let exits = self.inner.exits.lock().unwrap();
            let confirmed = exits
                .get(exit_id)
                .and_then(|exit| exit.confirmed.as_ref())
                .ok_or_else(|| provider_error("exit was not confirmed"))?;
            (confirmed.transfer_id.clone(), confirmed.adaptor_public_key)
        };
        if adaptor_secret.public_key(&Secp256k1::signing_only()) != adaptor_public_key {
            return Err(SdkError::AdaptorVerificationFailed);
        }

        let wallet = &self.inner.wallet;
        let transfer = wallet.wait_for_claimable(&transfer_id).await?;
        wallet.claim_transfer(&transfer).await?;
        self.inner.exits.lock().unwrap().remove(exit_id);
        info!(exit_id, transfer_id = %transfer_id, "exited leaves claimed");
        Ok(())
    }
}
