//! Protocol constants.
//!
//! Timelocks are relative block heights carried in the low 16 bits of a
//! transaction input's sequence number.

/// Initial timelock for new leaves and freshly extended refunds (in blocks).
pub const INITIAL_TIMELOCK: u16 = 2000;

/// Timelock decrement interval (in blocks).
///
/// Each ownership change lowers the refund timelock by this amount so the
/// newest owner's refund always confirms first.
pub const TIMELOCK_INTERVAL: u16 = 100;

/// A refund whose next timelock would be at or below this height must be
/// extended before the leaf is transferred again.
pub const TIMELOCK_REFRESH_FLOOR: u16 = 100;

/// Sequence flag (bit 30) that marks protocol transactions.
pub const SPARK_SEQUENCE_FLAG: u32 = 1 << 30;

/// Mask for extracting the timelock value from a sequence number.
pub const TIMELOCK_MASK: u32 = 0x0000_FFFF;

/// How long a sender's transfer stays claimable before operators expire it.
pub const DEFAULT_TRANSFER_EXPIRY_SECS: u64 = 60 * 60;

/// Expiry for the sender side of a leaves swap.
pub const DEFAULT_SWAP_EXPIRY_SECS: u64 = 2 * 60;

/// Default per-operator request timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Value of the connector output that each cooperative-exit refund spends.
pub const CONNECTOR_OUTPUT_SATS: u64 = 354;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timelock_math() {
        // 18 ownership changes fit before the next one would hit the refresh floor.
        let mut timelock = INITIAL_TIMELOCK;
        let mut transfers = 0;
        while timelock - TIMELOCK_INTERVAL > TIMELOCK_REFRESH_FLOOR {
            timelock -= TIMELOCK_INTERVAL;
            transfers += 1;
        }
        assert_eq!(transfers, 18);
        assert_eq!(timelock, 200);
    }

    #[test]
    fn test_spark_sequence_flag() {
        assert_eq!(SPARK_SEQUENCE_FLAG, 0x4000_0000);
        assert_eq!(SPARK_SEQUENCE_FLAG & TIMELOCK_MASK, 0);
    }
}
