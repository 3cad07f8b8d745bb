//! Concurrent per-operator calls under an explicit success policy.
//!
//! A phase calls every operator at once, waits for all of them (each call is
//! bounded by the request timeout) and only then decides, so the caller
//! always sees the complete list of failures rather than the first one.

use std::future::Future;
use std::time::Duration;

use config::OperatorInfo;
use futures::future::join_all;

use crate::SdkError;
use crate::operator::OperatorError;

/// How many operators must succeed for a phase to pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutPolicy {
    /// Every operator. Used for key tweaks and preimage shares, where a
    /// missing operator would leave the key split inconsistent.
    All,
    /// At least `t` operators. Used for signature shares.
    Threshold(usize),
    /// At least one operator. Used for reads.
    Any,
}

impl FanOutPolicy {
    /// Number of successes needed out of `total`.
    pub fn required(self, total: usize) -> usize {
        match self {
            Self::All => total,
            Self::Threshold(t) => t,
            Self::Any => 1,
        }
    }

    pub fn is_satisfied(self, succeeded: usize, total: usize) -> bool {
        succeeded >= self.required(total)
    }

    /// Checks a share count, e.g. the operator signature shares in a
    /// signing result.
    pub fn require_shares(self, provided: usize, total: usize) -> Result<(), SdkError> {
        let required = self.required(total);
        if provided < required {
            return Err(SdkError::InsufficientShares { required, provided });
        }
        Ok(())
    }
}

/// Calls `call` for every operator concurrently and applies `policy`.
///
/// On success returns the successful results in operator order. On failure
/// returns [`SdkError::OperatorFailures`] listing every operator that
/// failed, including those that timed out.
pub async fn fan_out<T, F, Fut>(
    phase: &'static str,
    operators: &[OperatorInfo],
    policy: FanOutPolicy,
    timeout: Duration,
    mut call: F,
) -> Result<Vec<(u32, T)>, SdkError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, OperatorError>>,
{
    let calls = operators.iter().map(|op| {
        let index = op.index;
        let fut = call(index);
        async move {
            let result = match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(OperatorError::Timeout),
            };
            (index, result)
        }
    });
    let results = join_all(calls).await;
    evaluate(phase, policy, results)
}

/// Splits collected results and decides the phase.
pub fn evaluate<T>(
    phase: &'static str,
    policy: FanOutPolicy,
    results: Vec<(u32, Result<T, OperatorError>)>,
) -> Result<Vec<(u32, T)>, SdkError> {
    let total = results.len();
    let mut succeeded = Vec::with_capacity(total);
    let mut failures = Vec::new();

    for (operator, result) in results {
        match result {
            Ok(value) => {
                tracing::debug!(phase, operator, "operator call succeeded");
                succeeded.push((operator, value));
            }
            Err(e) => {
                tracing::debug!(phase, operator, error = %e, "operator call failed");
                failures.push((operator, e));
            }
        }
    }

    if policy.is_satisfied(succeeded.len(), total) {
        if !failures.is_empty() {
            tracing::warn!(
                phase,
                failed = failures.len(),
                total,
                "phase passed with operator failures"
            );
        }
        Ok(succeeded)
    } else {
        Err(SdkError::OperatorFailures { phase, failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(fail: &[u32], total: u32) -> Vec<(u32, Result<u32, OperatorError>)> {
        (0..total)
            .map(|i| {
                if fail.contains(&i) {
                    (i, Err(OperatorError::Unavailable))
                } else {
                    (i, Ok(i * 10))
                }
            })
            .collect()
    }

    #[test]
    fn all_requires_every_operator() {
        assert_eq!(evaluate("tweak", FanOutPolicy::All, results(&[], 5)).unwrap().len(), 5);

        let err = evaluate("tweak", FanOutPolicy::All, results(&[3], 5)).unwrap_err();
        assert_eq!(
            err,
            SdkError::OperatorFailures {
                phase: "tweak",
                failures: vec![(3, OperatorError::Unavailable)],
            }
        );
    }

    #[test]
    fn threshold_tolerates_minority_failures() {
        let ok = evaluate("sign", FanOutPolicy::Threshold(3), results(&[0, 4], 5)).unwrap();
        assert_eq!(ok, vec![(1, 10), (2, 20), (3, 30)]);

        let err = evaluate("sign", FanOutPolicy::Threshold(3), results(&[0, 1, 4], 5)).unwrap_err();
        match err {
            SdkError::OperatorFailures { failures, .. } => {
                let ops: Vec<u32> = failures.iter().map(|(op, _)| *op).collect();
                assert_eq!(ops, vec![0, 1, 4]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn any_needs_one_success() {
        assert_eq!(
            evaluate("query", FanOutPolicy::Any, results(&[0, 1, 2, 3], 5)).unwrap(),
            vec![(4, 40)]
        );
        assert!(evaluate("query", FanOutPolicy::Any, results(&[0, 1, 2], 3)).is_err());
    }

    #[test]
    fn share_counts() {
        assert!(FanOutPolicy::Threshold(3).require_shares(3, 5).is_ok());
        assert_eq!(
            FanOutPolicy::Threshold(3).require_shares(2, 5),
            Err(SdkError::InsufficientShares {
                required: 3,
                provided: 2
            })
        );
    }

    #[tokio::test]
    async fn fan_out_collects_every_result() {
        let ops = config::NetworkConfig::REGTEST.operators();
        let err = fan_out("tweak", ops, FanOutPolicy::All, Duration::from_secs(1), |i| async move {
            if i % 2 == 0 {
                Err(OperatorError::Internal("boom".into()))
            } else {
                Ok(i)
            }
        })
        .await
        .unwrap_err();

        match err {
            SdkError::OperatorFailures { failures, .. } => assert_eq!(failures.len(), 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn slow_operators_time_out() {
        let ops = config::NetworkConfig::REGTEST.operators();
        let ok = fan_out(
            "sign",
            ops,
            FanOutPolicy::Threshold(3),
            Duration::from_millis(20),
            |i| async move {
                if i == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok::<_, OperatorError>(i)
            },
        )
        .await
        .unwrap();
        assert_eq!(ok.len(), 4);
    }
}
