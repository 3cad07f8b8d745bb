//! SDK operations: transfers, claims, swaps, exits, timelock refresh and
//! preimage distribution.
//!
//! Every public operation follows the same pattern:
//!
//! 1. Check the cancellation token
//! 2. Start an [`tracking::OperationTracker`] for the operation kind
//! 3. Take the send or claim lock when the operation moves leaves
//! 4. Execute the protocol flow (selection, signing, key tweaks, store
//!    updates), recording each [`tracking::Phase`] and the transfers it
//!    touches
//!
//! The shared outbound machinery lives in `transfer_core`.

pub mod cancel;
pub mod claim;
pub mod counter_swap;
pub mod exit;
pub mod preimage;
pub mod refresh;
pub mod swap;
pub mod tracking;
pub mod transfer;
pub(crate) mod transfer_core;
