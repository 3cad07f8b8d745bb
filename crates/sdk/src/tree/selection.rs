//! Leaf selection strategies.
//!
//! [`LeafSelector`] is the trait all selection algorithms implement. The SDK
//! stores the send strategy as `Arc<dyn LeafSelector>`; it can be swapped at
//! runtime via [`crate::Sdk::set_leaf_selector`].
//!
//! # Built-in strategies
//!
//! - [`ExactSelector`]: largest-first pick that only succeeds on an exact
//!   total (default for sends).
//! - [`CoverSelector`]: smallest-first pick until the target is covered
//!   (used to choose swap inputs).

use super::store::Leaf;

// ---------------------------------------------------------------------------
// LeafSelector trait
// ---------------------------------------------------------------------------

/// Strategy for selecting leaves for a target amount.
///
/// Implementations receive the available leaves and the target in
/// satoshis, and return the selected subset and its total, or `None` when
/// the strategy cannot meet the target.
pub trait LeafSelector: Send + Sync {
    fn select<'a>(&self, available: &'a [Leaf], target_sats: u64)
    -> Option<(Vec<&'a Leaf>, u64)>;
}

// ---------------------------------------------------------------------------
// ExactSelector
// ---------------------------------------------------------------------------

/// Largest-first greedy pick that skips any leaf that would overshoot.
///
/// Returns `None` unless the picked leaves sum to exactly the target; the
/// caller then swaps for exact denominations.
pub struct ExactSelector;

impl LeafSelector for ExactSelector {
    fn select<'a>(
        &self,
        available: &'a [Leaf],
        target_sats: u64,
    ) -> Option<(Vec<&'a Leaf>, u64)> {
        if target_sats == 0 {
            return None;
        }

        let mut sorted: Vec<&Leaf> = available.iter().collect();
        sorted.sort_unstable_by(|a, b| b.value.cmp(&a.value));

        let mut selected = Vec::new();
        let mut total = 0u64;
        for leaf in sorted {
            if target_sats - total >= leaf.value {
                total += leaf.value;
                selected.push(leaf);
            }
        }

        (total == target_sats).then_some((selected, total))
    }
}

// ---------------------------------------------------------------------------
// CoverSelector
// ---------------------------------------------------------------------------

/// Smallest-first accumulation until the total reaches the target.
pub struct CoverSelector;

impl LeafSelector for CoverSelector {
    fn select<'a>(
        &self,
        available: &'a [Leaf],
        target_sats: u64,
    ) -> Option<(Vec<&'a Leaf>, u64)> {
        if target_sats == 0 {
            return None;
        }

        let mut sorted: Vec<&Leaf> = available.iter().collect();
        sorted.sort_unstable_by_key(|l| l.value);

        let mut selected = Vec::new();
        let mut total = 0u64;
        for leaf in sorted {
            if total >= target_sats {
                break;
            }
            total += leaf.value;
            selected.push(leaf);
        }

        (total >= target_sats).then_some((selected, total))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
