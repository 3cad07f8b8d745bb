//! Core types shared across the workspace.
//!
//! - [`Network`] -- network identifier (Mainnet, Regtest)
//! - [`types`] -- transfer, leaf and signing enums with forward-compatible
//!   `Unknown` arms

pub mod types;

pub use types::{LeafStatus, SignatureIntent, TransferStatus, TransferType};

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Network identifier. Selects the operator set the wallet talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    /// Mainnet.
    Mainnet,

    /// Regtest.
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Regtest => "regtest",
        }
    }
}
