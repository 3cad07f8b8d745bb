//! Closed protocol enums shared by every crate.
//!
//! Each enum carries an `Unknown(String)` arm so that a value added by a newer
//! operator deployment decodes instead of failing; callers treat it as
//! "not actionable". Serialization uses the SCREAMING_SNAKE wire names.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $wire:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
            /// A value this build does not know about.
            Unknown(String),
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                match self {
                    $( Self::$variant => $wire, )+
                    Self::Unknown(s) => s,
                }
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                match s.as_str() {
                    $( $wire => Self::$variant, )+
                    _ => Self::Unknown(s),
                }
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::from(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> String {
                v.as_str().to_owned()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// ---------------------------------------------------------------------------
// TransferStatus
// ---------------------------------------------------------------------------

wire_enum! {
    /// Operator-side state of a transfer.
    ///
    /// ```text
    /// SenderInitiated -> SenderKeyTweakPending -> SenderKeyTweaked
    ///   -> ReceiverKeyTweaked -> ReceiverRefundSigned -> Completed
    /// ```
    ///
    /// `Cancelled` is reachable from the first two states; `Expired` from any
    /// non-terminal state before the receiver commits.
    pub enum TransferStatus {
        SenderInitiated => "SENDER_INITIATED",
        SenderKeyTweakPending => "SENDER_KEY_TWEAK_PENDING",
        SenderKeyTweaked => "SENDER_KEY_TWEAKED",
        ReceiverKeyTweaked => "RECEIVER_KEY_TWEAKED",
        ReceiverRefundSigned => "RECEIVER_REFUND_SIGNED",
        Completed => "COMPLETED",
        Cancelled => "CANCELLED",
        Expired => "EXPIRED",
    }
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Expired)
    }

    /// No operator has committed the sender's key tweak yet.
    pub fn is_cancellable_by_sender(&self) -> bool {
        matches!(self, Self::SenderInitiated | Self::SenderKeyTweakPending)
    }

    /// The receiver may run (or resume) a claim.
    pub fn is_claimable(&self) -> bool {
        matches!(
            self,
            Self::SenderKeyTweaked | Self::ReceiverKeyTweaked | Self::ReceiverRefundSigned
        )
    }

    fn rank(&self) -> Option<u8> {
        Some(match self {
            Self::SenderInitiated => 0,
            Self::SenderKeyTweakPending => 1,
            Self::SenderKeyTweaked => 2,
            Self::ReceiverKeyTweaked => 3,
            Self::ReceiverRefundSigned => 4,
            Self::Completed => 5,
            _ => return None,
        })
    }

    /// Whether the state machine permits `self -> next`.
    ///
    /// Forward moves along the main path may skip steps (an operator that
    /// missed an intermediate call still converges). Repeating the current
    /// state is allowed so that retried calls are idempotent.
    pub fn can_transition_to(&self, next: &TransferStatus) -> bool {
        if self == next {
            return !matches!(self, Self::Unknown(_));
        }
        match next {
            Self::Cancelled => self.is_cancellable_by_sender(),
            Self::Expired => !self.is_terminal() && !matches!(self, Self::Unknown(_)),
            _ => match (self.rank(), next.rank()) {
                (Some(from), Some(to)) => to > from,
                _ => false,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// TransferType
// ---------------------------------------------------------------------------

wire_enum! {
    pub enum TransferType {
        Transfer => "TRANSFER",
        Swap => "SWAP",
        CounterSwap => "COUNTER_SWAP",
        CooperativeExit => "COOPERATIVE_EXIT",
        PreimageSwap => "PREIMAGE_SWAP",
    }
}

// ---------------------------------------------------------------------------
// LeafStatus
// ---------------------------------------------------------------------------

wire_enum! {
    /// Local availability of a leaf.
    pub enum LeafStatus {
        Available => "AVAILABLE",
        TransferLocked => "TRANSFER_LOCKED",
        Spent => "SPENT",
    }
}

// ---------------------------------------------------------------------------
// SignatureIntent
// ---------------------------------------------------------------------------

wire_enum! {
    /// Why node signatures are being finalized.
    pub enum SignatureIntent {
        Creation => "CREATION",
        Transfer => "TRANSFER",
        Extend => "EXTEND",
        Refresh => "REFRESH",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_roundtrip_through_serde() {
        let json = serde_json::to_string(&TransferStatus::SenderKeyTweakPending).unwrap();
        assert_eq!(json, "\"SENDER_KEY_TWEAK_PENDING\"");
        let back: TransferStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TransferStatus::SenderKeyTweakPending);
    }

    #[test]
    fn unknown_values_are_preserved() {
        let status: TransferStatus = serde_json::from_str("\"RETURNED\"").unwrap();
        assert_eq!(status, TransferStatus::Unknown("RETURNED".into()));
        assert_eq!(serde_json::to_string(&status).unwrap(), "\"RETURNED\"");
        assert!(!status.is_claimable());
        assert!(!status.is_cancellable_by_sender());
        assert!(!status.can_transition_to(&TransferStatus::Completed));

        let kind = TransferType::from("UTXO_SWAP");
        assert_eq!(kind.as_str(), "UTXO_SWAP");
    }

    #[test]
    fn main_path_moves_forward_only() {
        use TransferStatus::*;
        assert!(SenderInitiated.can_transition_to(&SenderKeyTweakPending));
        assert!(SenderKeyTweakPending.can_transition_to(&SenderKeyTweaked));
        assert!(SenderKeyTweaked.can_transition_to(&ReceiverKeyTweaked));
        assert!(ReceiverKeyTweaked.can_transition_to(&ReceiverRefundSigned));
        assert!(ReceiverRefundSigned.can_transition_to(&Completed));
        assert!(!SenderKeyTweaked.can_transition_to(&SenderInitiated));
        assert!(!Completed.can_transition_to(&ReceiverKeyTweaked));
    }

    #[test]
    fn cancellation_only_before_tweak_commit() {
        use TransferStatus::*;
        assert!(SenderInitiated.can_transition_to(&Cancelled));
        assert!(SenderKeyTweakPending.can_transition_to(&Cancelled));
        assert!(!SenderKeyTweaked.can_transition_to(&Cancelled));
        assert!(!ReceiverKeyTweaked.can_transition_to(&Cancelled));
        assert!(!Completed.can_transition_to(&Cancelled));
    }

    #[test]
    fn expiry_from_pending_states() {
        use TransferStatus::*;
        assert!(SenderKeyTweaked.can_transition_to(&Expired));
        assert!(!Completed.can_transition_to(&Expired));
        assert!(!Cancelled.can_transition_to(&Expired));
    }

    #[test]
    fn claimable_states() {
        use TransferStatus::*;
        assert!(SenderKeyTweaked.is_claimable());
        assert!(ReceiverKeyTweaked.is_claimable());
        assert!(ReceiverRefundSigned.is_claimable());
        assert!(!SenderKeyTweakPending.is_claimable());
        assert!(!Completed.is_claimable());
    }
}
