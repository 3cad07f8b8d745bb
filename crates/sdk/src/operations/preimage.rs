//! Preimage share distribution for Lightning receives.
//!
//! The wallet splits a payment preimage t-of-n and gives each operator one
//! share, so that a threshold of operators can reveal the preimage to the
//! paying side once the matching leaves were transferred.

use std::collections::BTreeMap;
use std::time::Instant;

use bitcoin::hashes::{Hash, sha256};
use k256::Scalar;
use rand_core::OsRng;
use signer::KeyStore;
use spark_crypto::verifiable_secret_sharing::{scalar_from_bytes, split_secret_with_proofs};
use tracing::info;

use crate::fanout::{FanOutPolicy, fan_out};
use crate::operations::tracking::{OperationError, OperationKind, Phase};
use crate::operator::{OperatorClient, OperatorError, OperatorRpc, StorePreimageShareRequest};
use crate::swap_provider::SwapProvider;
use crate::tree::TreeStore;
use crate::{REQUEST_TIMEOUT, Sdk, SdkError};

impl<K, T, C, P> Sdk<K, T, C, P>
where
    K: KeyStore,
    T: TreeStore,
    C: OperatorClient,
    P: SwapProvider,
{
    /// Splits `preimage` over the operators and stores one share with each.
    ///
    /// Fails with [`SdkError::InvalidRequest`] if `preimage` does not hash to
    /// `payment_hash`. Every operator must accept its share.
    pub async fn distribute_preimage_shares(
        &self,
        payment_hash: [u8; 32],
        preimage: [u8; 32],
        invoice: &str,
    ) -> Result<(), OperationError> {
        let mut tracker = self.tracker(OperationKind::PreimageDistribution);
        let op_id = tracker.id();

        if let Err(e) = self.check_cancelled() {
            return Err(tracker.fail(Phase::DistributePreimage, e));
        }
        if sha256::Hash::hash(&preimage).to_byte_array() != payment_hash {
            return Err(tracker.fail(Phase::DistributePreimage, SdkError::InvalidRequest));
        }
        let secret = match scalar_from_bytes(&preimage) {
            Ok(secret) => secret,
            Err(_) => {
                return Err(tracker.fail(Phase::DistributePreimage, SdkError::InvalidRequest));
            }
        };

        let t = Instant::now();
        match self
            .store_preimage_shares(&secret, payment_hash, invoice)
            .await
        {
            Ok(()) => {
                tracker.done(Phase::DistributePreimage, t.elapsed());
                tracker.succeed();
                info!(
                    op_id = %op_id,
                    operators = self.inner.config.network.num_operators(),
                    "preimage shares distributed"
                );
                Ok(())
            }
            Err(e) => Err(tracker.fail(Phase::DistributePreimage, e)),
        }
    }

    async fn store_preimage_shares(
        &self,
        secret: &Scalar,
        payment_hash: [u8; 32],
        invoice: &str,
    ) -> Result<(), SdkError> {
        let network = &self.inner.config.network;
        let threshold = network.threshold();
        let split = split_secret_with_proofs(secret, threshold, network.num_operators(), &mut OsRng)
            .map_err(|_| SdkError::SigningFailed)?;
        let mut shares = BTreeMap::new();
        for op in network.operators() {
            let index = Scalar::from(u64::from(op.index) + 1);
            let share = split
                .iter()
                .find(|s| s.secret_share.index == index)
                .ok_or(SdkError::ShareNotFoundForOperator { operator: op.index })?;
            shares.insert(op.index, share.clone());
        }

        let owner = self.identity_public_key();
        let client = &self.inner.operators;
        fan_out(
            OperatorRpc::StorePreimageShare.as_str(),
            network.operators(),
            FanOutPolicy::All,
            REQUEST_TIMEOUT,
            |operator| {
                let share = shares.remove(&operator);
                async move {
                    let preimage_share = share.ok_or(OperatorError::InvalidArgument(
                        "no preimage share for operator".to_owned(),
                    ))?;
                    let request = StorePreimageShareRequest {
                        payment_hash,
                        preimage_share,
                        threshold,
                        invoice: invoice.to_owned(),
                        user_identity_public_key: owner,
                    };
                    client.store_preimage_share(operator, request).await
                }
            },
        )
        .await?;
        Ok(())
    }
}
