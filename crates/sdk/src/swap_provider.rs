//! Swap provider: the counter-party for leaf swaps and cooperative exits.
//!
//! The provider trades leaves for leaves of exact denominations, or for an
//! on-chain payment. Both trades are atomic through an adaptor signature:
//! the wallet blinds its refund signatures with a secret `t` and only
//! reveals `t` once the provider's side is locked in.
//!
//! Use [`NoSwapProvider`] when no provider is configured. Every call fails
//! with [`SdkError::SwapProviderUnavailable`].

use std::future::Future;

use bitcoin::ScriptBuf;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use bytes::Bytes;

use crate::SdkError;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// An adaptor signature over the intermediate refund of one leaf in a
/// transfer the operators already know about.
#[derive(Debug, Clone)]
pub struct AdaptorLeafSignature {
    pub leaf_id: String,
    pub adaptor_signature: [u8; 64],
}

/// Request to swap the leaves of `transfer_id` for new leaves of
/// `target_amounts`.
#[derive(Debug, Clone)]
pub struct LeavesSwapRequest {
    /// The wallet's outbound transfer to the provider (started, not tweaked).
    pub transfer_id: String,
    pub user_identity_public_key: PublicKey,
    pub adaptor_public_key: PublicKey,
    pub total_value: u64,
    pub target_amounts: Vec<u64>,
    pub leaves: Vec<AdaptorLeafSignature>,
}

#[derive(Debug, Clone)]
pub struct LeavesSwapResponse {
    pub swap_id: String,
    /// The provider's transfer back to the wallet, signed under the same
    /// adaptor point.
    pub counter_transfer_id: String,
    pub leaves: Vec<AdaptorLeafSignature>,
}

/// Request for an exit transaction paying the leaves' value on-chain.
#[derive(Debug, Clone)]
pub struct CooperativeExitQuoteRequest {
    pub user_identity_public_key: PublicKey,
    /// `(leaf_id, value)` in connector order.
    pub leaves: Vec<(String, u64)>,
    pub withdrawal_script: ScriptBuf,
}

/// The provider's exit transaction. Output `i` is the connector for leaf
/// `i` of the request; the withdrawal output follows the connectors.
#[derive(Debug, Clone)]
pub struct CooperativeExitQuote {
    pub exit_id: String,
    pub exit_tx: Bytes,
}

#[derive(Debug, Clone)]
pub struct ConfirmCooperativeExitRequest {
    pub exit_id: String,
    pub transfer_id: String,
    pub adaptor_public_key: PublicKey,
    pub leaves: Vec<AdaptorLeafSignature>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Counter-party for swaps and cooperative exits.
pub trait SwapProvider: Send + Sync {
    /// The provider's identity key, the receiver of the wallet's outbound
    /// transfers.
    fn identity_public_key(&self) -> Result<PublicKey, SdkError>;

    /// Starts a swap. The provider validates the wallet's adaptor
    /// signatures and answers with its own adaptor-signed counter transfer.
    fn request_leaves_swap(
        &self,
        request: LeavesSwapRequest,
    ) -> impl Future<Output = Result<LeavesSwapResponse, SdkError>> + Send;

    /// Reveals the adaptor secret once the wallet has tweaked its outbound
    /// transfer. The provider completes its counter transfer and claims.
    fn complete_leaves_swap(
        &self,
        swap_id: &str,
        adaptor_secret: SecretKey,
    ) -> impl Future<Output = Result<(), SdkError>> + Send;

    fn request_cooperative_exit(
        &self,
        request: CooperativeExitQuoteRequest,
    ) -> impl Future<Output = Result<CooperativeExitQuote, SdkError>> + Send;

    /// Validates the connector refund adaptor signatures and broadcasts the
    /// exit transaction.
    fn confirm_cooperative_exit(
        &self,
        request: ConfirmCooperativeExitRequest,
    ) -> impl Future<Output = Result<(), SdkError>> + Send;

    /// Reveals the adaptor secret after the wallet's key tweak. The provider
    /// claims the exited leaves.
    fn complete_cooperative_exit(
        &self,
        exit_id: &str,
        adaptor_secret: SecretKey,
    ) -> impl Future<Output = Result<(), SdkError>> + Send;
}

// ---------------------------------------------------------------------------
// NoSwapProvider
// ---------------------------------------------------------------------------

/// Placeholder for wallets without a swap provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSwapProvider;

impl SwapProvider for NoSwapProvider {
    fn identity_public_key(&self) -> Result<PublicKey, SdkError> {
        Err(SdkError::SwapProviderUnavailable)
    }

    async fn request_leaves_swap(
        &self,
        _request: LeavesSwapRequest,
    ) -> Result<LeavesSwapResponse, SdkError> {
        Err(SdkError::SwapProviderUnavailable)
    }

    async fn complete_leaves_swap(
        &self,
        _swap_id: &str,
        _adaptor_secret: SecretKey,
    ) -> Result<(), SdkError> {
        Err(SdkError::SwapProviderUnavailable)
    }

    async fn request_cooperative_exit(
        &self,
        _request: CooperativeExitQuoteRequest,
    ) -> Result<CooperativeExitQuote, SdkError> {
        Err(SdkError::SwapProviderUnavailable)
    }

    async fn confirm_cooperative_exit(
        &self,
        _request: ConfirmCooperativeExitRequest,
    ) -> Result<(), SdkError> {
        Err(SdkError::SwapProviderUnavailable)
    }

    async fn complete_cooperative_exit(
        &self,
        _exit_id: &str,
        _adaptor_secret: SecretKey,
    ) -> Result<(), SdkError> {
        Err(SdkError::SwapProviderUnavailable)
    }
}
