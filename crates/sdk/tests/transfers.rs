mod common;

use std::time::Duration;

use bitcoin::hashes::{Hash, sha256};
use config::constants::INITIAL_TIMELOCK;
use sdk::SdkError;
use sdk::bitcoin_tx::parse_tx;
use sdk::local::KeyPackagePart;
use sdk::operator::{OperatorClient, OperatorError, OperatorRpc, TransferQuery};
use sdk::timelock::timelock_of;
use sdk::tracking::{OperationKind, OperationStatus, Phase};
use sdk::tree::TreeStore;
use sdk_core::{TransferStatus, TransferType};
use spark_crypto::threshold_signing::{Identifier, Participant};

use common::*;

#[tokio::test]
async fn send_and_claim_moves_the_leaf() {
    let network = network();
    let alice = wallet(&network, 1);
    let bob = wallet(&network, 2);
    let funded = network.fund(&alice, &[50_000]).unwrap();

    let sent = alice
        .send_transfer(bob.identity_public_key(), 50_000)
        .await
        .unwrap();
    assert_eq!(sent.total_value, 50_000);
    assert_eq!(sent.transfer_type, TransferType::Transfer);
    assert_eq!(sent.status, TransferStatus::SenderKeyTweaked);
    assert_eq!(alice.balance().unwrap(), 0);

    let pending = bob.pending_transfers().await.unwrap();
    assert_eq!(pending.len(), 1);
    let claimed = bob.claim_transfer(&pending[0]).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(bob.balance().unwrap(), 50_000);

    let leaf = network.leaf(&funded[0].id).unwrap();
    assert_eq!(leaf.owner_identity_public_key, bob.identity_public_key());
    assert_eq!(leaf.verifying_public_key, funded[0].verifying_public_key);
    assert_eq!(network.transfer(&sent.id).unwrap().status, TransferStatus::Completed);
    assert!(bob.pending_transfers().await.unwrap().is_empty());
}

#[tokio::test]
async fn claimed_leaf_can_be_sent_on() {
    let network = network();
    let alice = wallet(&network, 1);
    let bob = wallet(&network, 2);
    let carol = wallet(&network, 3);
    network.fund(&alice, &[20_000, 5_000]).unwrap();

    alice.send_transfer(bob.identity_public_key(), 20_000).await.unwrap();
    bob.claim_pending_transfers().await.unwrap();
    assert_eq!(alice.balance().unwrap(), 5_000);

    let onward = bob.send_transfer(carol.identity_public_key(), 20_000).await.unwrap();
    let leaves = carol.claim_pending_transfers().await.unwrap();
    assert_eq!(leaves.iter().map(|l| l.value).sum::<u64>(), 20_000);
    assert_eq!(bob.balance().unwrap(), 0);

    // Each hop lowers the refund timelock by one interval: 1900, 1800 for
    // Bob, then 1700 for Carol's intermediate refund.
    let refund = parse_tx(&onward.leaves[0].intermediate_refund_tx).unwrap();
    assert_eq!(timelock_of(refund.input[0].sequence), INITIAL_TIMELOCK - 300);
}

#[tokio::test]
async fn insufficient_balance_is_rejected_without_a_transfer() {
    let network = network();
    let alice = wallet(&network, 1);
    let bob = wallet(&network, 2);
    network.fund(&alice, &[1_000]).unwrap();

    let err = alice
        .send_transfer(bob.identity_public_key(), 5_000)
        .await
        .unwrap_err();
    assert!(matches!(err.error, SdkError::InsufficientBalance));
    assert_eq!(alice.balance().unwrap(), 1_000);
}

#[tokio::test]
async fn send_without_exact_leaves_and_no_provider_fails() {
    let network = network();
    let alice = wallet(&network, 1);
    let bob = wallet(&network, 2);
    network.fund(&alice, &[10_000]).unwrap();

    let err = alice
        .send_transfer(bob.identity_public_key(), 4_000)
        .await
        .unwrap_err();
    assert!(matches!(err.error, SdkError::SwapProviderUnavailable));
    assert_eq!(alice.balance().unwrap(), 10_000);
}

#[tokio::test]
async fn failed_key_tweak_cancels_and_retry_succeeds() {
    let network = network();
    let alice = wallet(&network, 1);
    let bob = wallet(&network, 2);
    network.fund(&alice, &[50_000]).unwrap();
    let failing = non_coordinator(&network);

    network.fail_rpc(failing, OperatorRpc::CompleteSendTransfer);
    let err = alice
        .send_transfer(bob.identity_public_key(), 50_000)
        .await
        .unwrap_err();
    match &err.error {
        SdkError::OperatorFailures { failures, .. } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].0, failing);
        }
        other => panic!("unexpected error: {other}"),
    }

    let coordinator = network.config().coordinator().index;
    let outbound = network
        .query_transfers(coordinator, TransferQuery::Sender(alice.identity_public_key()))
        .await
        .unwrap();
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].status, TransferStatus::Cancelled);
    assert!(!network.has_staged_tweaks(&outbound[0].id));
    assert_eq!(alice.balance().unwrap(), 50_000);
    assert!(bob.pending_transfers().await.unwrap().is_empty());

    network.clear_faults();
    alice.send_transfer(bob.identity_public_key(), 50_000).await.unwrap();
    bob.claim_pending_transfers().await.unwrap();
    assert_eq!(bob.balance().unwrap(), 50_000);
}

#[tokio::test]
async fn expired_transfer_is_not_tweaked() {
    let network = network();
    let mut config = config(&network);
    config.transfer_expiry = Duration::ZERO;
    let alice = wallet_with_config(&network, 1, config);
    let bob = wallet(&network, 2);
    network.fund(&alice, &[8_000]).unwrap();

    let err = alice
        .send_transfer(bob.identity_public_key(), 8_000)
        .await
        .unwrap_err();
    let SdkError::TransferExpired { transfer_id } = &err.error else {
        panic!("unexpected error: {}", err.error);
    };
    assert_eq!(network.transfer(transfer_id).unwrap().status, TransferStatus::Expired);
    assert!(!network.has_staged_tweaks(transfer_id));
    assert_eq!(alice.balance().unwrap(), 8_000);
}

#[tokio::test]
async fn corrupted_operator_share_is_named() {
    let network = network();
    let alice = wallet(&network, 1);
    let bob = wallet(&network, 2);
    network.fund(&alice, &[3_000]).unwrap();
    let corrupt = non_coordinator(&network);

    network.corrupt_shares(corrupt);
    let err = alice
        .send_transfer(bob.identity_public_key(), 3_000)
        .await
        .unwrap_err();
    match err.error {
        SdkError::AggregationMismatch { culprit, .. } => {
            assert_eq!(
                culprit,
                Some(Participant::Operator(Identifier::from_operator_index(corrupt)))
            );
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(alice.balance().unwrap(), 3_000);
}

#[tokio::test]
async fn sender_can_cancel_before_the_tweak_only() {
    let network = network();
    let alice = wallet(&network, 1);
    let bob = wallet(&network, 2);
    network.fund(&alice, &[7_000]).unwrap();

    let sent = alice.send_transfer(bob.identity_public_key(), 7_000).await.unwrap();
    let err = alice.cancel_transfer(&sent.id).await.unwrap_err();
    assert!(matches!(
        err.error,
        SdkError::Operator(OperatorError::AlreadyCommitted)
    ));
    assert_eq!(network.transfer(&sent.id).unwrap().status, TransferStatus::SenderKeyTweaked);
}

#[tokio::test]
async fn preimage_shares_reconstruct_at_the_operators() {
    let network = network();
    let alice = wallet(&network, 1);
    let preimage = [0x2a; 32];
    let payment_hash = sha256::Hash::hash(&preimage).to_byte_array();

    alice
        .distribute_preimage_shares(payment_hash, preimage, "lnbcrt10u1test")
        .await
        .unwrap();
    assert_eq!(network.recover_preimage(&payment_hash), Some(preimage));

    let err = alice
        .distribute_preimage_shares([0u8; 32], preimage, "lnbcrt10u1test")
        .await
        .unwrap_err();
    assert!(matches!(err.error, SdkError::InvalidRequest));
}

#[tokio::test]
async fn preimage_distribution_needs_every_operator() {
    let network = network();
    let alice = wallet(&network, 1);
    let preimage = [0x11; 32];
    let payment_hash = sha256::Hash::hash(&preimage).to_byte_array();
    network.set_offline(non_coordinator(&network), true);

    let err = alice
        .distribute_preimage_shares(payment_hash, preimage, "lnbcrt10u1test")
        .await
        .unwrap_err();
    assert!(matches!(err.error, SdkError::OperatorFailures { .. }));
}

#[tokio::test]
async fn pending_transfers_are_listed_while_the_coordinator_is_down() {
    let network = network();
    let alice = wallet(&network, 1);
    let bob = wallet(&network, 2);
    network.fund(&alice, &[2_000]).unwrap();
    let sent = alice.send_transfer(bob.identity_public_key(), 2_000).await.unwrap();

    let coordinator = network.config().coordinator().index;
    network.set_offline(coordinator, true);
    let pending = bob.pending_transfers().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, sent.id);

    network.set_offline(coordinator, false);
    bob.claim_transfer(&pending[0]).await.unwrap();
    assert_eq!(bob.balance().unwrap(), 2_000);
}

#[tokio::test]
async fn claimed_leaf_near_the_floor_is_refreshed() {
    let network = network();
    let alice = wallet(&network, 1);
    let bob = wallet(&network, 2);
    network.fund_with_timelock(&alice, 11_000, 400).unwrap();

    let sent = alice.send_transfer(bob.identity_public_key(), 11_000).await.unwrap();
    assert_eq!(network.extend_calls(), 0);
    let refund = parse_tx(&sent.leaves[0].intermediate_refund_tx).unwrap();
    assert_eq!(timelock_of(refund.input[0].sequence), 300);

    // Bob's refund lands at 200, at the refresh threshold.
    let claimed = bob.claim_pending_transfers().await.unwrap();
    assert_eq!(network.extend_calls(), 1);
    assert_eq!(timelock_of(claimed[0].refund_sequence().unwrap()), INITIAL_TIMELOCK);

    let stored = bob.tree_store().get_available_leaves().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(timelock_of(stored[0].refund_sequence().unwrap()), INITIAL_TIMELOCK);
    assert_eq!(bob.balance().unwrap(), 11_000);
}

async fn tampered_key_package_is_not_claimed(part: KeyPackagePart) {
    let network = network();
    let alice = wallet(&network, 1);
    let bob = wallet(&network, 2);
    let funded = network.fund(&alice, &[9_000]).unwrap();
    let sent = alice.send_transfer(bob.identity_public_key(), 9_000).await.unwrap();
    assert!(network.tamper_key_package(&sent.id, part));

    let pending = bob.pending_transfers().await.unwrap();
    let err = bob.claim_transfer(&pending[0]).await.unwrap_err();
    assert_eq!(
        err.error,
        SdkError::ClaimVerificationFailed {
            transfer_id: sent.id.clone(),
            leaf_id: funded[0].id.clone(),
        }
    );
    assert_eq!(bob.balance().unwrap(), 0);
    assert_eq!(network.transfer(&sent.id).unwrap().status, TransferStatus::SenderKeyTweaked);
    assert_eq!(bob.pending_transfers().await.unwrap().len(), 1);
}

#[tokio::test]
async fn tampered_sender_signature_fails_claim_verification() {
    tampered_key_package_is_not_claimed(KeyPackagePart::Signature).await;
}

#[tokio::test]
async fn tampered_key_cipher_fails_claim_verification() {
    tampered_key_package_is_not_claimed(KeyPackagePart::Cipher).await;
}

#[tokio::test]
async fn lost_tweak_response_after_commit_leaves_the_transfer_stuck() {
    let network = network();
    let alice = wallet(&network, 1);
    let bob = wallet(&network, 2);
    network.fund(&alice, &[6_000]).unwrap();
    network.lose_responses(non_coordinator(&network), OperatorRpc::CompleteSendTransfer);

    let err = alice
        .send_transfer(bob.identity_public_key(), 6_000)
        .await
        .unwrap_err();
    let SdkError::TransferStuck { transfer_id } = &err.error else {
        panic!("unexpected error: {}", err.error);
    };
    assert_eq!(err.failed_phase, Phase::TweakKeys);
    assert_eq!(network.transfer(transfer_id).unwrap().status, TransferStatus::SenderKeyTweaked);

    // Every operator applied the tweak, so the leaves stay gone.
    assert_eq!(alice.balance().unwrap(), 0);
    assert!(alice.tree_store().get_available_leaves().unwrap().is_empty());

    let ops = alice.operations_for_transfer(transfer_id);
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind, OperationKind::Transfer);
    assert_eq!(ops[0].status, OperationStatus::Failed);

    network.clear_faults();
    bob.claim_pending_transfers().await.unwrap();
    assert_eq!(bob.balance().unwrap(), 6_000);
}

#[tokio::test]
async fn stale_tweak_echo_is_named_and_rolled_back() {
    let network = network();
    let alice = wallet(&network, 1);
    let bob = wallet(&network, 2);
    network.fund(&alice, &[6_000]).unwrap();
    let divergent = non_coordinator(&network);
    network.drop_tweak_shares(divergent);

    let err = alice
        .send_transfer(bob.identity_public_key(), 6_000)
        .await
        .unwrap_err();
    assert_eq!(
        err.error,
        SdkError::InconsistentOperatorResponse {
            operator: divergent,
            field: "status",
        }
    );

    let coordinator = network.config().coordinator().index;
    let outbound = network
        .query_transfers(coordinator, TransferQuery::Sender(alice.identity_public_key()))
        .await
        .unwrap();
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].status, TransferStatus::Cancelled);
    assert!(!network.has_staged_tweaks(&outbound[0].id));
    assert_eq!(alice.balance().unwrap(), 6_000);
}

#[tokio::test]
async fn timed_out_start_is_cancelled_at_the_coordinator() {
    let network = network();
    let alice = wallet(&network, 1);
    let bob = wallet(&network, 2);
    network.fund(&alice, &[5_000]).unwrap();
    let coordinator = network.config().coordinator().index;
    network.lose_responses(coordinator, OperatorRpc::StartSendTransfer);

    let err = alice
        .send_transfer(bob.identity_public_key(), 5_000)
        .await
        .unwrap_err();
    assert_eq!(err.error, SdkError::Operator(OperatorError::Timeout));
    assert_eq!(err.failed_phase, Phase::SignRefunds);

    let outbound = network
        .query_transfers(coordinator, TransferQuery::Sender(alice.identity_public_key()))
        .await
        .unwrap();
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].status, TransferStatus::Cancelled);
    assert_eq!(alice.balance().unwrap(), 5_000);

    network.clear_faults();
    alice.send_transfer(bob.identity_public_key(), 5_000).await.unwrap();
    bob.claim_pending_transfers().await.unwrap();
    assert_eq!(bob.balance().unwrap(), 5_000);
}
