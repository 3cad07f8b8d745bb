//! Operator definitions and per-network operator sets.
//!
//! Operators jointly hold every leaf's key: each keeps one share of the
//! operator half and they sign refunds with a threshold of those shares.

/// A single signing operator.
///
/// Whether an operator is the coordinator is a network-level property,
/// not an operator-level one -- see [`crate::NetworkConfig::coordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorInfo {
    /// Numeric index of the operator (0-based). The operator's secret share
    /// of a split is the one with x-coordinate `index + 1`.
    pub index: u32,
}

impl OperatorInfo {
    pub const fn new(index: u32) -> Self {
        Self { index }
    }
}

/// `N` operators indexed `0..N`.
pub const fn operator_set<const N: usize>() -> [OperatorInfo; N] {
    let mut set = [OperatorInfo::new(0); N];
    let mut i = 0;
    while i < N {
        set[i] = OperatorInfo::new(i as u32);
        i += 1;
    }
    set
}

pub(crate) const MAINNET_OPERATORS: [OperatorInfo; 3] = operator_set();

pub(crate) const REGTEST_OPERATORS: [OperatorInfo; 5] = operator_set();
