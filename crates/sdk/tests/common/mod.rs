//! Shared fixtures: wallets on a [`LocalNetwork`].

#![allow(dead_code)]

use std::time::Duration;

use config::NetworkConfig;
use sdk::local::{LocalNetwork, LocalSwapProvider};
use sdk::swap_provider::NoSwapProvider;
use sdk::tracking::RetryPolicy;
use sdk::tree::InMemoryTreeStore;
use sdk::{Sdk, SdkConfig};
use signer::InMemoryKeyStore;
use tokio_util::sync::CancellationToken;

pub type Wallet = Sdk<InMemoryKeyStore, InMemoryTreeStore, LocalNetwork>;
pub type Provider = LocalSwapProvider<InMemoryKeyStore, InMemoryTreeStore>;
pub type SwapWallet = Sdk<InMemoryKeyStore, InMemoryTreeStore, LocalNetwork, Provider>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sdk=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn network() -> LocalNetwork {
    init_tracing();
    LocalNetwork::new(NetworkConfig::REGTEST)
}

pub fn keys(seed: u8) -> InMemoryKeyStore {
    InMemoryKeyStore::from_seed(&[seed; 64], bitcoin::Network::Regtest, 0).unwrap()
}

/// Fast polling so tests don't sleep for seconds.
pub fn config(network: &LocalNetwork) -> SdkConfig {
    let mut config = SdkConfig::new(*network.config());
    config.retry_policy = RetryPolicy {
        max_attempts: 5,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        backoff_multiplier: 2.0,
    };
    config
}

pub fn wallet_with_config(network: &LocalNetwork, seed: u8, config: SdkConfig) -> Wallet {
    Sdk::new(
        config,
        keys(seed),
        InMemoryTreeStore::new(),
        network.clone(),
        NoSwapProvider,
        CancellationToken::new(),
    )
}

pub fn wallet(network: &LocalNetwork, seed: u8) -> Wallet {
    wallet_with_config(network, seed, config(network))
}

/// A wallet whose swap provider is backed by its own wallet (seed
/// `provider_seed`) on the same network.
pub fn swap_wallet(network: &LocalNetwork, seed: u8, provider_seed: u8) -> (SwapWallet, Provider) {
    swap_wallet_with_provider_config(network, seed, provider_seed, config(network))
}

pub fn swap_wallet_with_provider_config(
    network: &LocalNetwork,
    seed: u8,
    provider_seed: u8,
    provider_config: SdkConfig,
) -> (SwapWallet, Provider) {
    let provider_wallet = wallet_with_config(network, provider_seed, provider_config);
    let provider = LocalSwapProvider::new(network.clone(), provider_wallet);
    let sdk = Sdk::new(
        config(network),
        keys(seed),
        InMemoryTreeStore::new(),
        network.clone(),
        provider.clone(),
        CancellationToken::new(),
    );
    (sdk, provider)
}

/// Some operator other than the coordinator.
pub fn non_coordinator(network: &LocalNetwork) -> u32 {
    let coordinator = network.config().coordinator().index;
    network
        .config()
        .operators()
        .iter()
        .map(|op| op.index)
        .find(|index| *index != coordinator)
        .unwrap()
}
