//! SDK error types.
//!
//! [`SdkError`] is the unified error type for all SDK operations. Protocol
//! failures carry enough context (transfer id, leaf id, operator index) to
//! tell which part of a run went wrong; lower-level crate errors are mapped
//! at the boundary.

use std::fmt;

use sdk_core::TransferStatus;
use signer::KeyStoreError;
use spark_crypto::threshold_signing::Participant;

use crate::operator::OperatorError;

// ---------------------------------------------------------------------------
// SdkError
// ---------------------------------------------------------------------------

/// Errors from SDK operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdkError {
    /// The SDK has been shut down (cancellation token fired).
    Cancelled,

    /// Not enough available leaves to satisfy the requested amount.
    InsufficientBalance,

    /// Fewer secret or signature shares than the threshold requires.
    InsufficientShares { required: usize, provided: usize },

    /// A secret share failed Feldman validation.
    InvalidShare,

    /// Threshold aggregation of a leaf signature failed. `culprit` names the
    /// participant whose share did not verify, when one could be identified.
    AggregationMismatch {
        leaf_id: String,
        culprit: Option<Participant>,
    },

    /// Operators disagree about a transfer they just updated.
    InconsistentOperatorResponse { operator: u32, field: &'static str },

    /// The secret split produced no share for this operator.
    ShareNotFoundForOperator { operator: u32 },

    /// The transfer's expiry passed before the key tweak was submitted.
    TransferExpired { transfer_id: String },

    /// A received leaf's signature or decrypted key did not check out.
    ClaimVerificationFailed { transfer_id: String, leaf_id: String },

    /// The transfer is not in a state that allows the requested step.
    UnexpectedTransferStatus {
        transfer_id: String,
        status: TransferStatus,
    },

    /// A failed send could not be rolled back because at least one operator
    /// already holds the key tweak.
    TransferStuck { transfer_id: String },

    /// A fan-out phase did not meet its policy. Every failing operator is
    /// listed.
    OperatorFailures {
        phase: &'static str,
        failures: Vec<(u32, OperatorError)>,
    },

    /// A single coordinator call failed.
    Operator(OperatorError),

    /// An operator returned a response that does not match the request.
    InvalidOperatorResponse,

    /// The leaf's refund timelock cannot be decremented any further.
    TimelockExhausted,

    /// The key store rejected a request.
    KeyStore(KeyStoreError),

    /// A local signing, encryption or secret-sharing step failed.
    SigningFailed,

    /// A stored transaction could not be parsed or hashed.
    InvalidTransaction,

    /// An adaptor signature did not validate or complete.
    AdaptorVerificationFailed,

    /// The swap counter-party rejected or failed a request.
    SwapProvider(String),

    /// No swap counter-party is configured.
    SwapProviderUnavailable,

    /// The leaf reservation was not found or already finalized.
    ReservationNotFound,

    /// A waited-for transfer never reached a usable state.
    RetriesExhausted,

    /// The request parameters are invalid.
    InvalidRequest,
}

impl fmt::Display for SdkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::InsufficientBalance => write!(f, "insufficient balance"),
            Self::InsufficientShares { required, provided } => {
                write!(f, "insufficient shares: need {required}, got {provided}")
            }
            Self::InvalidShare => write!(f, "invalid secret share"),
            Self::AggregationMismatch { leaf_id, culprit } => match culprit {
                Some(p) => write!(f, "aggregation failed for leaf {leaf_id}: bad share from {p}"),
                None => write!(f, "aggregation failed for leaf {leaf_id}"),
            },
            Self::InconsistentOperatorResponse { operator, field } => {
                write!(f, "operator {operator} returned inconsistent {field}")
            }
            Self::ShareNotFoundForOperator { operator } => {
                write!(f, "no secret share for operator {operator}")
            }
            Self::TransferExpired { transfer_id } => write!(f, "transfer {transfer_id} expired"),
            Self::ClaimVerificationFailed {
                transfer_id,
                leaf_id,
            } => write!(
                f,
                "claim verification failed for leaf {leaf_id} of transfer {transfer_id}"
            ),
            Self::UnexpectedTransferStatus {
                transfer_id,
                status,
            } => write!(f, "transfer {transfer_id} is {status}"),
            Self::TransferStuck { transfer_id } => {
                write!(f, "transfer {transfer_id} is stuck after a partial key tweak")
            }
            Self::OperatorFailures { phase, failures } => {
                write!(f, "{phase} failed on {} operator(s):", failures.len())?;
                for (operator, err) in failures {
                    write!(f, " [{operator}: {err}]")?;
                }
                Ok(())
            }
            Self::Operator(e) => write!(f, "coordinator call failed: {e}"),
            Self::InvalidOperatorResponse => write!(f, "invalid operator response"),
            Self::TimelockExhausted => write!(f, "refund timelock exhausted"),
            Self::KeyStore(e) => write!(f, "key store: {e}"),
            Self::SigningFailed => write!(f, "signing operation failed"),
            Self::InvalidTransaction => write!(f, "invalid transaction"),
            Self::AdaptorVerificationFailed => write!(f, "adaptor signature verification failed"),
            Self::SwapProvider(msg) => write!(f, "swap provider: {msg}"),
            Self::SwapProviderUnavailable => write!(f, "no swap provider configured"),
            Self::ReservationNotFound => write!(f, "reservation not found"),
            Self::RetriesExhausted => write!(f, "retries exhausted"),
            Self::InvalidRequest => write!(f, "invalid request"),
        }
    }
}

impl std::error::Error for SdkError {}

impl SdkError {
    /// The transfer this error is about, if it names one.
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            Self::TransferExpired { transfer_id }
            | Self::ClaimVerificationFailed { transfer_id, .. }
            | Self::UnexpectedTransferStatus { transfer_id, .. }
            | Self::TransferStuck { transfer_id } => Some(transfer_id),
            _ => None,
        }
    }

    /// Whether the error came from unreachable or slow operators only, so
    /// the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Operator(e) => e.is_transient(),
            Self::OperatorFailures { failures, .. } => {
                !failures.is_empty() && failures.iter().all(|(_, e)| e.is_transient())
            }
            _ => false,
        }
    }
}

impl From<KeyStoreError> for SdkError {
    fn from(e: KeyStoreError) -> Self {
        Self::KeyStore(e)
    }
}

impl From<OperatorError> for SdkError {
    fn from(e: OperatorError) -> Self {
        Self::Operator(e)
    }
}
