//! Relative timelock arithmetic for refund sequences.
//!
//! Each time a leaf changes hands the new refund's relative timelock is one
//! interval lower than the previous one, so the most recent owner can always
//! broadcast first. The low 16 bits of `nSequence` hold the timelock; bit 30
//! marks the sequence as protocol-managed.

use bitcoin::Sequence;
use config::constants::{
    INITIAL_TIMELOCK, SPARK_SEQUENCE_FLAG, TIMELOCK_INTERVAL, TIMELOCK_MASK,
    TIMELOCK_REFRESH_FLOOR,
};

use crate::SdkError;

/// Result of decrementing a refund sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextSequence {
    pub sequence: Sequence,
    /// The new timelock is at or below the refresh floor; the leaf should be
    /// extended before it is transferred again.
    pub needs_refresh: bool,
}

/// Sequence for the first refund of a freshly created or extended node.
pub fn initial_sequence() -> Sequence {
    Sequence::from_consensus(SPARK_SEQUENCE_FLAG | u32::from(INITIAL_TIMELOCK))
}

/// The timelock in blocks encoded in `sequence`.
pub fn timelock_of(sequence: Sequence) -> u16 {
    (sequence.to_consensus_u32() & TIMELOCK_MASK) as u16
}

/// Decrements the timelock of `current` by one interval.
///
/// For ordinary transfers a result at or below zero is
/// [`SdkError::TimelockExhausted`]. With `for_refresh` the sequence may drop
/// to the floor (clamped at zero) as long as the current timelock is
/// positive, since the refreshed leaf is immediately re-anchored.
pub fn next_sequence(current: Sequence, for_refresh: bool) -> Result<NextSequence, SdkError> {
    let timelock = i32::from(timelock_of(current));
    let next = timelock - i32::from(TIMELOCK_INTERVAL);
    let floor = i32::from(TIMELOCK_REFRESH_FLOOR);

    if for_refresh && next <= floor && timelock > 0 {
        return Ok(NextSequence {
            sequence: with_flag(next.max(0) as u32),
            needs_refresh: true,
        });
    }
    if next <= 0 {
        return Err(SdkError::TimelockExhausted);
    }
    Ok(NextSequence {
        sequence: with_flag(next as u32),
        needs_refresh: next <= floor,
    })
}

/// Whether a leaf with this refund sequence must be extended before its
/// next transfer.
pub fn needs_refresh(refund_sequence: Sequence) -> bool {
    timelock_of(refund_sequence) <= TIMELOCK_REFRESH_FLOOR + TIMELOCK_INTERVAL
}

fn with_flag(timelock: u32) -> Sequence {
    Sequence::from_consensus(SPARK_SEQUENCE_FLAG | timelock)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(timelock: u32) -> Sequence {
        with_flag(timelock)
    }

    #[test]
    fn initial_sequence_carries_flag() {
        let s = initial_sequence();
        assert_eq!(timelock_of(s), 2000);
        assert_ne!(s.to_consensus_u32() & SPARK_SEQUENCE_FLAG, 0);
    }

    #[test]
    fn decrements_by_one_interval() {
        let next = next_sequence(seq(2000), false).unwrap();
        assert_eq!(timelock_of(next.sequence), 1900);
        assert!(!next.needs_refresh);
        assert_ne!(next.sequence.to_consensus_u32() & SPARK_SEQUENCE_FLAG, 0);
    }

    #[test]
    fn flags_refresh_near_floor() {
        let next = next_sequence(seq(200), false).unwrap();
        assert_eq!(timelock_of(next.sequence), 100);
        assert!(next.needs_refresh);
    }

    #[test]
    fn exhausted_without_refresh() {
        assert_eq!(next_sequence(seq(100), false), Err(SdkError::TimelockExhausted));
        assert_eq!(next_sequence(seq(0), false), Err(SdkError::TimelockExhausted));
    }

    #[test]
    fn refresh_clamps_at_zero() {
        let next = next_sequence(seq(50), true).unwrap();
        assert_eq!(timelock_of(next.sequence), 0);
        assert!(next.needs_refresh);

        assert_eq!(next_sequence(seq(0), true), Err(SdkError::TimelockExhausted));
    }

    #[test]
    fn refresh_threshold() {
        assert!(needs_refresh(seq(200)));
        assert!(!needs_refresh(seq(300)));
    }
}
