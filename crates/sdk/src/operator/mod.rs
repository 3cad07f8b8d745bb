//! Signing-operator RPC surface.
//!
//! [`OperatorClient`] is addressed per operator: every call names the
//! operator index it goes to. Coordinator-only calls (transfer start,
//! refund signing, finalization, cancellation, extension) are sent to the
//! configured coordinator; key tweaks and preimage shares are fanned out to
//! every operator by [`crate::fanout`].

mod types;

pub use types::{
    CancelTransferRequest, ClaimLeafTweak, ClaimSignRequest, ClaimTweakRequest,
    CompleteSendTransferRequest, CooperativeExitRequest, ExtendLeafRequest, ExtendLeafResponse,
    FinalizeNodeSignaturesRequest, LeafSwapRequest, LeafTweakBundle, NodeSignatures,
    SigningJob, SigningResult, StartTransferRequest, StartTransferResponse,
    StorePreimageShareRequest, Transfer, TransferLeaf, TransferQuery,
};

use std::fmt;
use std::future::Future;

use crate::tree::Leaf;

// ---------------------------------------------------------------------------
// OperatorRpc
// ---------------------------------------------------------------------------

/// Names of the operator RPCs, used for logging and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorRpc {
    StartSendTransfer,
    CompleteSendTransfer,
    ClaimTransferTweakKeys,
    ClaimTransferSignRefunds,
    FinalizeNodeSignatures,
    CooperativeExit,
    LeafSwap,
    QueryTransfers,
    CancelTransfer,
    ExtendLeaf,
    StorePreimageShare,
}

impl OperatorRpc {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartSendTransfer => "start_send_transfer",
            Self::CompleteSendTransfer => "complete_send_transfer",
            Self::ClaimTransferTweakKeys => "claim_transfer_tweak_keys",
            Self::ClaimTransferSignRefunds => "claim_transfer_sign_refunds",
            Self::FinalizeNodeSignatures => "finalize_node_signatures",
            Self::CooperativeExit => "cooperative_exit",
            Self::LeafSwap => "leaf_swap",
            Self::QueryTransfers => "query_transfers",
            Self::CancelTransfer => "cancel_transfer",
            Self::ExtendLeaf => "extend_leaf",
            Self::StorePreimageShare => "store_preimage_share",
        }
    }
}

impl fmt::Display for OperatorRpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OperatorError
// ---------------------------------------------------------------------------

/// Failure of a single operator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorError {
    /// The operator could not be reached.
    Unavailable,
    /// The call did not complete within the request timeout.
    Timeout,
    /// The referenced transfer or leaf does not exist.
    NotFound,
    /// The request was malformed or failed validation.
    InvalidArgument(String),
    /// The request is valid but the current state forbids it.
    FailedPrecondition(String),
    /// The transfer's key tweak is already held by the operators, so it can
    /// no longer be cancelled.
    AlreadyCommitted,
    /// The operator failed while processing the request.
    Internal(String),
}

impl OperatorError {
    /// Errors worth retrying with the same request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable | Self::Timeout)
    }
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "operator unavailable"),
            Self::Timeout => write!(f, "request timed out"),
            Self::NotFound => write!(f, "not found"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::FailedPrecondition(msg) => write!(f, "failed precondition: {msg}"),
            Self::AlreadyCommitted => write!(f, "key tweak already committed"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for OperatorError {}

// ---------------------------------------------------------------------------
// OperatorClient
// ---------------------------------------------------------------------------

/// RPC client for the signing operators.
///
/// Implementations own the transport. `operator` is the index from
/// [`config::OperatorInfo::index`].
pub trait OperatorClient: Send + Sync {
    /// Starts a transfer and returns the operators' refund signing shares.
    fn start_send_transfer(
        &self,
        operator: u32,
        request: StartTransferRequest,
    ) -> impl Future<Output = Result<StartTransferResponse, OperatorError>> + Send;

    /// Delivers this operator's share of the sender key tweak. Returns the
    /// operator's view of the transfer afterwards.
    fn complete_send_transfer(
        &self,
        operator: u32,
        request: CompleteSendTransferRequest,
    ) -> impl Future<Output = Result<Transfer, OperatorError>> + Send;

    /// Delivers this operator's share of the receiver key tweak.
    fn claim_transfer_tweak_keys(
        &self,
        operator: u32,
        request: ClaimTweakRequest,
    ) -> impl Future<Output = Result<(), OperatorError>> + Send;

    /// Signs the receiver's new refunds with the tweaked key shares.
    fn claim_transfer_sign_refunds(
        &self,
        operator: u32,
        request: ClaimSignRequest,
    ) -> impl Future<Output = Result<Vec<SigningResult>, OperatorError>> + Send;

    /// Submits aggregated signatures. Returns the leaves as the operators
    /// now record them.
    fn finalize_node_signatures(
        &self,
        operator: u32,
        request: FinalizeNodeSignaturesRequest,
    ) -> impl Future<Output = Result<Vec<Leaf>, OperatorError>> + Send;

    fn cooperative_exit(
        &self,
        operator: u32,
        request: CooperativeExitRequest,
    ) -> impl Future<Output = Result<StartTransferResponse, OperatorError>> + Send;

    fn leaf_swap(
        &self,
        operator: u32,
        request: LeafSwapRequest,
    ) -> impl Future<Output = Result<StartTransferResponse, OperatorError>> + Send;

    fn query_transfers(
        &self,
        operator: u32,
        query: TransferQuery,
    ) -> impl Future<Output = Result<Vec<Transfer>, OperatorError>> + Send;

    fn cancel_transfer(
        &self,
        operator: u32,
        request: CancelTransferRequest,
    ) -> impl Future<Output = Result<Transfer, OperatorError>> + Send;

    /// Signs a replacement node transaction and a fresh refund for a leaf
    /// whose refund timelock is running low.
    fn extend_leaf(
        &self,
        operator: u32,
        request: ExtendLeafRequest,
    ) -> impl Future<Output = Result<ExtendLeafResponse, OperatorError>> + Send;

    fn store_preimage_share(
        &self,
        operator: u32,
        request: StorePreimageShareRequest,
    ) -> impl Future<Output = Result<(), OperatorError>> + Send;
}
