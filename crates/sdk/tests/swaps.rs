mod common;

use std::time::Duration;

use bitcoin::ScriptBuf;
use config::constants::INITIAL_TIMELOCK;
use sdk::SdkError;
use sdk::bitcoin_tx::parse_tx;
use sdk::operator::OperatorRpc;
use sdk::timelock::timelock_of;
use sdk_core::{TransferStatus, TransferType};

use common::*;

fn sorted_values(leaves: &[sdk::tree::Leaf]) -> Vec<u64> {
    let mut values: Vec<u64> = leaves.iter().map(|l| l.value).collect();
    values.sort_unstable();
    values
}

#[tokio::test]
async fn swap_returns_requested_denominations() {
    let network = network();
    let (alice, provider) = swap_wallet(&network, 1, 9);
    network.fund(&alice, &[50_000]).unwrap();

    let leaves = alice.swap_leaves(&[20_000, 30_000]).await.unwrap();
    assert_eq!(sorted_values(&leaves), vec![20_000, 30_000]);
    assert_eq!(alice.balance().unwrap(), 50_000);
    assert_eq!(provider.swap_requests(), 1);
    // The provider ends up with the leaf it swapped for.
    assert_eq!(provider.wallet().balance().unwrap(), 50_000);
}

#[tokio::test]
async fn swap_excess_comes_back_as_change() {
    let network = network();
    let (alice, provider) = swap_wallet(&network, 1, 9);
    network.fund(&alice, &[25_000]).unwrap();

    let leaves = alice.swap_leaves(&[10_000]).await.unwrap();
    assert_eq!(sorted_values(&leaves), vec![10_000, 15_000]);
    assert_eq!(alice.balance().unwrap(), 25_000);
    assert_eq!(provider.swap_requests(), 1);
}

#[tokio::test]
async fn send_without_exact_leaves_swaps_exactly_once() {
    let network = network();
    let (alice, provider) = swap_wallet(&network, 1, 9);
    let bob = wallet(&network, 2);
    network.fund(&alice, &[100_000]).unwrap();

    let sent = alice
        .send_transfer(bob.identity_public_key(), 60_000)
        .await
        .unwrap();
    assert_eq!(sent.total_value, 60_000);
    assert_eq!(provider.swap_requests(), 1);
    assert_eq!(alice.balance().unwrap(), 40_000);

    bob.claim_pending_transfers().await.unwrap();
    assert_eq!(bob.balance().unwrap(), 60_000);
    assert_eq!(provider.wallet().balance().unwrap(), 100_000);
}

#[tokio::test]
async fn cooperative_exit_hands_leaves_to_the_provider() {
    let network = network();
    let (alice, provider) = swap_wallet(&network, 1, 9);
    network.fund(&alice, &[30_000]).unwrap();
    let withdrawal = ScriptBuf::from_bytes(vec![0x51, 0x20, 0x01]);

    let result = alice.cooperative_exit(30_000, withdrawal).await.unwrap();
    assert_eq!(result.transfer.transfer_type, TransferType::CooperativeExit);
    assert_eq!(result.transfer.total_value, 30_000);
    assert_eq!(alice.balance().unwrap(), 0);
    assert_eq!(provider.wallet().balance().unwrap(), 30_000);
    assert_eq!(
        network.transfer(&result.transfer.id).unwrap().status,
        TransferStatus::Completed
    );

    // Every refund also spends a connector of the exit transaction.
    for leaf in &result.transfer.leaves {
        let refund = parse_tx(&leaf.intermediate_refund_tx).unwrap();
        assert_eq!(refund.input[1].previous_output.txid, result.exit_txid);
    }
}

#[tokio::test]
async fn exit_without_provider_fails_cleanly() {
    let network = network();
    let alice = wallet(&network, 1);
    network.fund(&alice, &[30_000]).unwrap();

    let err = alice
        .cooperative_exit(30_000, ScriptBuf::new())
        .await
        .unwrap_err();
    assert!(matches!(err.error, SdkError::SwapProviderUnavailable));
    assert_eq!(alice.balance().unwrap(), 30_000);
}

#[tokio::test]
async fn low_timelock_is_refreshed_before_sending() {
    let network = network();
    let alice = wallet(&network, 1);
    let bob = wallet(&network, 2);
    network.fund_with_timelock(&alice, 12_000, 200).unwrap();

    let sent = alice.send_transfer(bob.identity_public_key(), 12_000).await.unwrap();
    assert_eq!(network.extend_calls(), 1);
    let refund = parse_tx(&sent.leaves[0].intermediate_refund_tx).unwrap();
    assert_eq!(timelock_of(refund.input[0].sequence), INITIAL_TIMELOCK - 100);

    bob.claim_pending_transfers().await.unwrap();
    assert_eq!(bob.balance().unwrap(), 12_000);
}

#[tokio::test]
async fn refresh_signs_with_an_operator_offline() {
    let network = network();
    let alice = wallet(&network, 1);
    let funded = network.fund_with_timelock(&alice, 9_000, 200).unwrap();
    network.fund(&alice, &[1_000]).unwrap();
    network.set_offline(non_coordinator(&network), true);

    let refreshed = alice.refresh_timelocks().await.unwrap();
    assert_eq!(refreshed.len(), 1);
    assert_eq!(refreshed[0].id, funded.id);
    assert_eq!(
        timelock_of(refreshed[0].refund_sequence().unwrap()),
        INITIAL_TIMELOCK
    );
    assert_eq!(network.extend_calls(), 1);
    assert_eq!(alice.balance().unwrap(), 10_000);

    // Nothing left to refresh.
    assert!(alice.refresh_timelocks().await.unwrap().is_empty());
    assert_eq!(network.extend_calls(), 1);
}

#[tokio::test]
async fn key_tweak_needs_every_operator() {
    let network = network();
    let alice = wallet(&network, 1);
    let bob = wallet(&network, 2);
    network.fund(&alice, &[4_000]).unwrap();
    network.set_offline(non_coordinator(&network), true);

    let err = alice
        .send_transfer(bob.identity_public_key(), 4_000)
        .await
        .unwrap_err();
    assert!(matches!(err.error, SdkError::OperatorFailures { .. }));
    assert_eq!(alice.balance().unwrap(), 4_000);
}

#[tokio::test]
async fn unsettled_swap_frees_the_provider_leaves_once_expired() {
    let network = network();
    let mut provider_config = config(&network);
    provider_config.swap_expiry = Duration::ZERO;
    let (alice, provider) = swap_wallet_with_provider_config(&network, 1, 9, provider_config);
    let carol = wallet(&network, 3);
    network.fund(&alice, &[20_000]).unwrap();

    // Alice's own key tweak fails, so she never reveals the adaptor secret.
    network.fail_rpc(non_coordinator(&network), OperatorRpc::CompleteSendTransfer);
    let err = alice.swap_leaves(&[5_000]).await.unwrap_err();
    assert!(matches!(err.error, SdkError::OperatorFailures { .. }));
    assert_eq!(alice.balance().unwrap(), 20_000);
    assert_eq!(provider.swap_requests(), 1);
    assert_eq!(provider.wallet().balance().unwrap(), 0);
    network.clear_faults();

    assert_eq!(provider.wallet().release_expired_swaps().await, 1);
    assert_eq!(provider.wallet().balance().unwrap(), 20_000);
    assert_eq!(provider.wallet().release_expired_swaps().await, 0);

    provider
        .wallet()
        .send_transfer(carol.identity_public_key(), 20_000)
        .await
        .unwrap();
    carol.claim_pending_transfers().await.unwrap();
    assert_eq!(carol.balance().unwrap(), 20_000);
}
