//! Network configuration.
//!
//! - [`NetworkConfig`] -- operators, coordinator and signing threshold for a network
//! - [`OperatorInfo`] -- information about a single signing operator
//! - [`constants`] -- protocol parameters (timelocks, sequence flags, expiries)
//!
//! Built-in configurations are compile-time constants and `Copy`.
//! `config` depends only on [`sdk_core::Network`].

pub mod constants;
pub mod operators;

pub use operators::OperatorInfo;

use operators::{MAINNET_OPERATORS, REGTEST_OPERATORS};
use sdk_core::Network;

// ---------------------------------------------------------------------------
// NetworkConfig
// ---------------------------------------------------------------------------

/// Network-specific operator set.
///
/// The coordinator is identified by index into the operators slice,
/// guaranteeing exactly one coordinator at the type level.
#[derive(Debug, Clone, Copy)]
pub struct NetworkConfig {
    /// The network this configuration is for.
    pub network: Network,

    /// Signing operators for this network.
    operators: &'static [OperatorInfo],

    /// Index into `operators` identifying the coordinator.
    coordinator_index: usize,

    /// Signing threshold (t of n).
    threshold: usize,
}

impl NetworkConfig {
    /// Get the configuration for a specific network.
    pub const fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::MAINNET,
            Network::Regtest => Self::REGTEST,
        }
    }

    /// Builds a configuration for a custom operator set.
    ///
    /// Returns `None` if the set is empty, the coordinator index is out of
    /// range, or the threshold is zero or larger than the set.
    pub const fn custom(
        network: Network,
        operators: &'static [OperatorInfo],
        coordinator_index: usize,
        threshold: usize,
    ) -> Option<Self> {
        if operators.is_empty()
            || coordinator_index >= operators.len()
            || threshold == 0
            || threshold > operators.len()
        {
            return None;
        }
        Some(Self {
            network,
            operators,
            coordinator_index,
            threshold,
        })
    }

    /// Returns the list of operators.
    pub const fn operators(&self) -> &'static [OperatorInfo] {
        self.operators
    }

    /// Returns the number of operators.
    pub const fn num_operators(&self) -> usize {
        self.operators.len()
    }

    /// Returns the coordinator operator. O(1) index lookup.
    pub const fn coordinator(&self) -> &'static OperatorInfo {
        &self.operators[self.coordinator_index]
    }

    /// Minimum number of operators that must sign.
    pub const fn threshold(&self) -> usize {
        self.threshold
    }

    // -----------------------------------------------------------------------
    // Built-in network configurations
    // -----------------------------------------------------------------------

    /// Production mainnet configuration.
    pub const MAINNET: Self = Self {
        network: Network::Mainnet,
        operators: &MAINNET_OPERATORS,
        coordinator_index: 0,
        threshold: 2,
    };

    /// Local regtest configuration.
    pub const REGTEST: Self = Self {
        network: Network::Regtest,
        operators: &REGTEST_OPERATORS,
        coordinator_index: 0,
        threshold: 3,
    };
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_config() {
        let config = NetworkConfig::for_network(Network::Mainnet);
        assert_eq!(config.num_operators(), 3);
        assert_eq!(config.threshold(), 2);
        assert_eq!(config.coordinator().index, 0);
    }

    #[test]
    fn regtest_config() {
        let config = NetworkConfig::for_network(Network::Regtest);
        assert_eq!(config.num_operators(), 5);
        assert_eq!(config.threshold(), 3);
    }

    #[test]
    fn coordinator_is_in_operators_slice() {
        for config in [NetworkConfig::MAINNET, NetworkConfig::REGTEST] {
            let coord = config.coordinator();
            assert!(
                config.operators().contains(coord),
                "{:?} coordinator must be in operators slice",
                config.network
            );
        }
    }

    #[test]
    fn operator_indices_are_dense() {
        for config in [NetworkConfig::MAINNET, NetworkConfig::REGTEST] {
            for (i, op) in config.operators().iter().enumerate() {
                assert_eq!(op.index as usize, i);
            }
        }
    }

    #[test]
    fn custom_config_validation() {
        static OPS: [OperatorInfo; 2] = [REGTEST_OPERATORS[0], REGTEST_OPERATORS[1]];
        assert!(NetworkConfig::custom(Network::Regtest, &OPS, 1, 2).is_some());
        assert!(NetworkConfig::custom(Network::Regtest, &OPS, 2, 2).is_none());
        assert!(NetworkConfig::custom(Network::Regtest, &OPS, 0, 3).is_none());
        assert!(NetworkConfig::custom(Network::Regtest, &OPS, 0, 0).is_none());
        assert!(NetworkConfig::custom(Network::Regtest, &[], 0, 1).is_none());
    }

    #[test]
    fn custom_set_from_operator_set() {
        static OPS: [OperatorInfo; 4] = operators::operator_set();
        let config = NetworkConfig::custom(Network::Regtest, &OPS, 3, 3).unwrap();
        assert_eq!(config.coordinator(), &OperatorInfo::new(3));
        assert_eq!(config.num_operators(), 4);
    }

    #[test]
    fn const_fn_works_at_compile_time() {
        const CONFIG: NetworkConfig = NetworkConfig::for_network(Network::Mainnet);
        assert_eq!(CONFIG.num_operators(), 3);
    }
}
