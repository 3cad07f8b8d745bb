//! Two wallets trading leaves on an in-process operator network.
//!
//! Alice is funded with two leaves and sends Bob an amount neither leaf
//! matches, which makes her swap once with a local provider first. Bob then
//! claims the transfer.
//!
//! # Configuration
//!
//! Set `ALICE_MNEMONIC` and `BOB_MNEMONIC` to use specific BIP39 mnemonics.
//! If unset, fresh 12-word mnemonics are generated on each run.
//!
//! ```bash
//! RUST_LOG=info,sdk=debug cargo run -p local-demo
//! ```

use bip39::Mnemonic;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use config::NetworkConfig;
use sdk::local::{LocalNetwork, LocalSwapProvider};
use sdk::operator::OperatorClient;
use sdk::swap_provider::{NoSwapProvider, SwapProvider};
use sdk::tree::InMemoryTreeStore;
use sdk::{Sdk, SdkConfig};
use signer::InMemoryKeyStore;

const NETWORK: NetworkConfig = NetworkConfig::REGTEST;
const ACCOUNT: u32 = 0;
const AMOUNT_SATS: u64 = 35_000;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(
        operators = NETWORK.num_operators(),
        threshold = NETWORK.threshold(),
        "local-demo starting"
    );

    // -----------------------------------------------------------------------
    // Network and wallets
    // -----------------------------------------------------------------------

    let network = LocalNetwork::new(NETWORK);
    let cancel = CancellationToken::new();

    let provider_wallet = Sdk::new(
        SdkConfig::new(NETWORK),
        key_store("PROVIDER_MNEMONIC"),
        InMemoryTreeStore::new(),
        network.clone(),
        NoSwapProvider,
        cancel.clone(),
    );
    let provider = LocalSwapProvider::new(network.clone(), provider_wallet);

    let alice = Sdk::new(
        SdkConfig::new(NETWORK),
        key_store("ALICE_MNEMONIC"),
        InMemoryTreeStore::new(),
        network.clone(),
        provider.clone(),
        cancel.clone(),
    );
    let bob = Sdk::new(
        SdkConfig::new(NETWORK),
        key_store("BOB_MNEMONIC"),
        InMemoryTreeStore::new(),
        network.clone(),
        NoSwapProvider,
        cancel.clone(),
    );

    network
        .fund(&alice, &[50_000, 20_000])
        .expect("fund alice");
    log_balances(&alice, &bob);

    // -----------------------------------------------------------------------
    // Send and claim
    // -----------------------------------------------------------------------

    let transfer = match alice.send_transfer(bob.identity_public_key(), AMOUNT_SATS).await {
        Ok(transfer) => transfer,
        Err(e) => {
            tracing::error!(error = %e, failed_phase = ?e.failed_phase, "send failed");
            std::process::exit(1);
        }
    };
    tracing::info!(
        transfer_id = %transfer.id,
        status = %transfer.status,
        amount_sats = transfer.total_value,
        "alice sent"
    );

    match bob.claim_pending_transfers().await {
        Ok(leaves) => tracing::info!(leaves = leaves.len(), "bob claimed"),
        Err(e) => {
            tracing::error!(error = %e, "claim failed");
            std::process::exit(1);
        }
    }
    log_balances(&alice, &bob);
    tracing::info!(
        balance_sats = provider.wallet().balance().unwrap_or_default(),
        "provider"
    );

    alice.shutdown().await;
    bob.shutdown().await;
}

/// Key store from the mnemonic in `env_key`, or from a fresh one.
fn key_store(env_key: &str) -> InMemoryKeyStore {
    let mnemonic = resolve_mnemonic(env_key);
    let seed = mnemonic.to_seed("");
    tracing::debug!(env_key, %mnemonic, "wallet mnemonic");
    InMemoryKeyStore::from_seed(&seed, bitcoin::Network::Regtest, ACCOUNT).expect("key store from seed")
}

fn resolve_mnemonic(env_key: &str) -> Mnemonic {
    if let Ok(phrase) = std::env::var(env_key) {
        phrase
            .parse::<Mnemonic>()
            .unwrap_or_else(|e| panic!("{env_key} is not a valid BIP39 mnemonic: {e}"))
    } else {
        let mut entropy = [0u8; 16];
        rand_core::RngCore::fill_bytes(&mut rand_core::OsRng, &mut entropy);
        Mnemonic::from_entropy(&entropy).expect("valid entropy")
    }
}

fn log_balances<C, P, Q>(
    alice: &Sdk<InMemoryKeyStore, InMemoryTreeStore, C, P>,
    bob: &Sdk<InMemoryKeyStore, InMemoryTreeStore, C, Q>,
) where
    C: OperatorClient,
    P: SwapProvider,
    Q: SwapProvider,
{
    tracing::info!(
        alice_sats = alice.balance().unwrap_or_default(),
        bob_sats = bob.balance().unwrap_or_default(),
        "balances"
    );
}
