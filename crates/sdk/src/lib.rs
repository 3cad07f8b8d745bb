//! Leaf-ownership transfer SDK.
//!
//! The SDK moves ownership of off-chain Bitcoin leaves between wallets. Each
//! leaf is controlled jointly by the owner's signing key and a threshold of
//! signing operators; a transfer rotates the owner's half of the key while
//! the operators adjust their shares so the joint key stays the same.
//!
//! The SDK orchestrates protocol operations by combining:
//! - **Operators** ([`operator::OperatorClient`]) for threshold signing and
//!   key tweaks
//! - **Keys** ([`signer::KeyStore`]) for every secret the wallet holds
//! - **Tree store** ([`tree::TreeStore`]) for leaf state
//! - **Swap provider** ([`swap_provider::SwapProvider`]) for exact
//!   denominations and cooperative exits
//!
//! # Usage
//!
//! ```no_run
//! use sdk::{Sdk, SdkConfig};
//! use sdk::local::LocalNetwork;
//! use sdk::swap_provider::NoSwapProvider;
//! use sdk::tree::InMemoryTreeStore;
//! use signer::InMemoryKeyStore;
//! use config::NetworkConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), sdk::SdkError> {
//! let network = LocalNetwork::new(NetworkConfig::REGTEST);
//! let keys = InMemoryKeyStore::from_seed(&[7u8; 64], bitcoin::Network::Regtest, 0)?;
//! let cancel = CancellationToken::new();
//!
//! let sdk = Sdk::new(
//!     SdkConfig::new(NetworkConfig::REGTEST),
//!     keys,
//!     InMemoryTreeStore::new(),
//!     network.clone(),
//!     NoSwapProvider,
//!     cancel.clone(),
//! );
//!
//! network.fund(&sdk, &[50_000])?;
//! assert_eq!(sdk.balance()?, 50_000);
//!
//! // Graceful shutdown.
//! sdk.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod bitcoin_tx;
pub mod error;
pub mod fanout;
pub mod local;
pub mod operations;
pub mod operator;
pub mod swap_provider;
pub mod timelock;
pub mod tree;
pub(crate) mod utils;

pub use error::SdkError;
pub use operations::tracking;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use config::NetworkConfig;
use config::constants::{
    DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_SWAP_EXPIRY_SECS, DEFAULT_TRANSFER_EXPIRY_SECS,
};
use signer::KeyStore;
use tokio_util::sync::CancellationToken;

use crate::operations::counter_swap::PendingSwap;
use crate::operations::tracking::{OperationLog, OperationStore, OperationTracker, RetryPolicy};
use crate::operator::OperatorClient;
use crate::swap_provider::SwapProvider;
use crate::tree::{ExactSelector, LeafSelector, TreeStore};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// SDK configuration.
#[derive(Debug, Clone)]
pub struct SdkConfig {
    /// Operator set, coordinator and threshold.
    pub network: NetworkConfig,
    /// Polling schedule while waiting for a counter-party's transfer.
    /// Defaults to 3 attempts with exponential backoff (500ms initial, 2x
    /// multiplier, 10s cap).
    pub retry_policy: RetryPolicy,
    /// Lifetime of an outbound transfer before it expires.
    pub transfer_expiry: Duration,
    /// Lifetime of swap and exit transfers.
    pub swap_expiry: Duration,
}

impl SdkConfig {
    pub fn new(network: NetworkConfig) -> Self {
        Self {
            network,
            retry_policy: RetryPolicy::default(),
            transfer_expiry: Duration::from_secs(DEFAULT_TRANSFER_EXPIRY_SECS),
            swap_expiry: Duration::from_secs(DEFAULT_SWAP_EXPIRY_SECS),
        }
    }
}

/// Per-call timeout applied to every operator request.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS);

// ---------------------------------------------------------------------------
// Sdk
// ---------------------------------------------------------------------------

/// Shared state across all SDK operations.
pub(crate) struct SdkInner<K, T, C, P> {
    pub config: SdkConfig,
    pub key_store: K,
    pub tree_store: T,
    pub operators: C,
    pub swap_provider: P,
    pub leaf_selector: RwLock<Arc<dyn LeafSelector>>,
    pub operation_store: RwLock<Arc<dyn OperationStore>>,
    /// Serializes sends, swaps and exits.
    pub send_lock: tokio::sync::Mutex<()>,
    /// Serializes claims.
    pub claim_lock: tokio::sync::Mutex<()>,
    /// Counter transfers started by [`Sdk::respond_to_leaves_swap`] and not
    /// yet settled, by swap id.
    pub pending_swaps: Mutex<HashMap<String, PendingSwap>>,
    pub cancel: CancellationToken,
}

/// The SDK entry point.
///
/// `Clone`-able (wraps an `Arc<SdkInner>`).
///
/// # Type Parameters
///
/// - `K`: key custody
/// - `T`: leaf storage (insert, reserve, finalize leaves)
/// - `C`: operator RPC client
/// - `P`: swap provider (use [`swap_provider::NoSwapProvider`] if unused)
pub struct Sdk<K, T, C, P = crate::swap_provider::NoSwapProvider> {
    pub(crate) inner: Arc<SdkInner<K, T, C, P>>,
}

// Manual Clone: we don't require K, T, C, P to be Clone.
impl<K, T, C, P> Clone for Sdk<K, T, C, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, T, C, P> std::fmt::Debug for Sdk<K, T, C, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sdk")
            .field("network", &self.inner.config.network.network)
            .finish()
    }
}

impl<K, T, C, P> Sdk<K, T, C, P>
where
    K: KeyStore,
    T: TreeStore,
    C: OperatorClient,
    P: SwapProvider,
{
    /// Creates a new SDK instance. No network I/O happens during
    /// construction.
    pub fn new(
        config: SdkConfig,
        key_store: K,
        tree_store: T,
        operators: C,
        swap_provider: P,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(SdkInner {
                config,
                key_store,
                tree_store,
                operators,
                swap_provider,
                leaf_selector: RwLock::new(Arc::new(ExactSelector)),
                operation_store: RwLock::new(Arc::new(OperationLog::default())),
                send_lock: tokio::sync::Mutex::new(()),
                claim_lock: tokio::sync::Mutex::new(()),
                pending_swaps: Mutex::new(HashMap::new()),
                cancel,
            }),
        }
    }

    pub fn config(&self) -> &SdkConfig {
        &self.inner.config
    }

    pub fn key_store(&self) -> &K {
        &self.inner.key_store
    }

    pub fn tree_store(&self) -> &T {
        &self.inner.tree_store
    }

    pub fn operators(&self) -> &C {
        &self.inner.operators
    }

    pub fn swap_provider(&self) -> &P {
        &self.inner.swap_provider
    }

    /// The wallet's identity public key.
    pub fn identity_public_key(&self) -> bitcoin::secp256k1::PublicKey {
        self.inner.key_store.identity_public_key()
    }

    /// Total value of available leaves in satoshis.
    pub fn balance(&self) -> Result<u64, SdkError> {
        self.inner.tree_store.available_balance()
    }

    /// Returns a reference to the cancellation token.
    pub fn cancel(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Graceful shutdown: signals cancellation and waits for in-flight
    /// operations to drain.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        // Allow a brief period for operations checking the token to exit.
        tokio::task::yield_now().await;
    }

    /// Checks whether the SDK has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Returns [`SdkError::Cancelled`] if the cancellation token has fired.
    pub(crate) fn check_cancelled(&self) -> Result<(), SdkError> {
        if self.inner.cancel.is_cancelled() {
            Err(SdkError::Cancelled)
        } else {
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Operation tracking
    // -----------------------------------------------------------------------

    /// Replace the operation store at runtime, e.g. with one that persists
    /// records. Defaults to an in-memory [`tracking::OperationLog`].
    pub fn set_operation_store(&self, store: Arc<dyn OperationStore>) {
        *self.inner.operation_store.write().unwrap() = store;
    }

    /// Get the current operation store (cheap `Arc` clone).
    pub fn operation_store(&self) -> Arc<dyn OperationStore> {
        self.inner.operation_store.read().unwrap().clone()
    }

    /// Start tracking a new operation.
    pub(crate) fn tracker(&self, kind: tracking::OperationKind) -> OperationTracker {
        OperationTracker::start(self.operation_store(), kind)
    }

    /// The configured retry policy.
    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.config.retry_policy
    }

    /// A recorded operation. `None` once the store has dropped it.
    pub fn query_operation(&self, id: tracking::OperationId) -> Option<tracking::Operation> {
        self.operation_store().get(id)
    }

    /// Operations that have not finished yet.
    pub fn active_operations(&self) -> Vec<tracking::Operation> {
        self.operation_store().running()
    }

    /// Operations that started, claimed or cancelled `transfer_id`.
    pub fn operations_for_transfer(&self, transfer_id: &str) -> Vec<tracking::Operation> {
        self.operation_store().for_transfer(transfer_id)
    }

    // -----------------------------------------------------------------------
    // Leaf selection
    // -----------------------------------------------------------------------

    /// Replace the send selection strategy at runtime.
    ///
    /// In-flight operations that already cloned the previous strategy
    /// will complete with the old one.
    pub fn set_leaf_selector(&self, selector: Arc<dyn LeafSelector>) {
        *self.inner.leaf_selector.write().unwrap() = selector;
    }

    /// Get the current leaf selector (cheap `Arc` clone).
    pub(crate) fn leaf_selector(&self) -> Arc<dyn LeafSelector> {
        self.inner.leaf_selector.read().unwrap().clone()
    }
}
