//! Bitcoin transaction utilities for leaf operations.
//!
//! Builds the node and refund transactions the operators co-sign and
//! computes their Taproot key-spend sighashes. Nothing here is broadcast;
//! the transactions only have to be fixed so the signed message is.

use bitcoin::consensus::{deserialize, serialize};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::{
    Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    DeserializeFailed,
    SighashFailed,
    MissingData,
}

impl core::fmt::Display for TxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::DeserializeFailed => write!(f, "transaction deserialization failed"),
            Self::SighashFailed => write!(f, "sighash computation failed"),
            Self::MissingData => write!(f, "transaction missing required data"),
        }
    }
}

impl std::error::Error for TxError {}

// ---------------------------------------------------------------------------
// Parse / Serialize
// ---------------------------------------------------------------------------

pub fn parse_tx(raw: &[u8]) -> Result<Transaction, TxError> {
    deserialize(raw).map_err(|_| TxError::DeserializeFailed)
}

pub fn serialize_tx(tx: &Transaction) -> Vec<u8> {
    serialize(tx)
}

pub fn bitcoin_network(network: sdk_core::Network) -> bitcoin::Network {
    match network {
        sdk_core::Network::Mainnet => bitcoin::Network::Bitcoin,
        sdk_core::Network::Regtest => bitcoin::Network::Regtest,
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Key-path-only P2TR output script for `key`.
pub fn p2tr_script(key: &PublicKey, network: bitcoin::Network) -> ScriptBuf {
    let secp = Secp256k1::verification_only();
    Address::p2tr(&secp, key.x_only_public_key().0, None, network).script_pubkey()
}

/// BIP-431 ephemeral anchor: OP_1 OP_PUSHBYTES_2 0x4e73.
pub fn anchor_output() -> TxOut {
    TxOut {
        value: Amount::ZERO,
        script_pubkey: ScriptBuf::from_bytes(vec![0x51, 0x02, 0x4e, 0x73]),
    }
}

fn v3_tx(input: Vec<TxIn>, output: Vec<TxOut>) -> Transaction {
    Transaction {
        version: bitcoin::transaction::Version::non_standard(3),
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input,
        output,
    }
}

fn spend(previous_output: OutPoint, sequence: Sequence) -> TxIn {
    TxIn {
        previous_output,
        script_sig: ScriptBuf::new(),
        sequence,
        witness: Witness::default(),
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Node transaction paying `value` to the leaf's verifying key.
pub fn create_node_tx(
    prev: OutPoint,
    sequence: Sequence,
    value: Amount,
    verifying_key: &PublicKey,
    network: bitcoin::Network,
) -> Transaction {
    v3_tx(
        vec![spend(prev, sequence)],
        vec![
            TxOut {
                value,
                script_pubkey: p2tr_script(verifying_key, network),
            },
            anchor_output(),
        ],
    )
}

/// Refund spending a node output back to `receiver` after the relative
/// timelock in `sequence`.
pub fn create_refund_tx(
    node_outpoint: OutPoint,
    value: Amount,
    sequence: Sequence,
    receiver: &PublicKey,
    network: bitcoin::Network,
) -> Transaction {
    v3_tx(
        vec![spend(node_outpoint, sequence)],
        vec![
            TxOut {
                value,
                script_pubkey: p2tr_script(receiver, network),
            },
            anchor_output(),
        ],
    )
}

/// Replacement node transaction for a timelock extension: spends the old
/// node output and re-creates it unchanged.
pub fn create_extension_node_tx(
    old_node_outpoint: OutPoint,
    old_node_output: &TxOut,
    sequence: Sequence,
) -> Transaction {
    v3_tx(
        vec![spend(old_node_outpoint, sequence)],
        vec![old_node_output.clone(), anchor_output()],
    )
}

/// Refund for a cooperative exit: spends the node output and one connector
/// output of the exit transaction, so it is only valid if the exit never
/// confirms.
pub fn create_connector_refund_tx(
    node_outpoint: OutPoint,
    connector_outpoint: OutPoint,
    value: Amount,
    sequence: Sequence,
    receiver: &PublicKey,
    network: bitcoin::Network,
) -> Transaction {
    v3_tx(
        vec![
            spend(node_outpoint, sequence),
            spend(connector_outpoint, Sequence::ZERO),
        ],
        vec![TxOut {
            value,
            script_pubkey: p2tr_script(receiver, network),
        }],
    )
}

// ---------------------------------------------------------------------------
// Taproot Sighash
// ---------------------------------------------------------------------------

/// BIP-341 key-spend sighash (`SIGHASH_DEFAULT`) for `input_idx`.
pub fn taproot_sighash(
    tx: &Transaction,
    input_idx: usize,
    prev_outs: &[TxOut],
) -> Result<[u8; 32], TxError> {
    if prev_outs.len() != tx.input.len() {
        return Err(TxError::MissingData);
    }
    let mut cache = SighashCache::new(tx);
    let hash = cache
        .taproot_key_spend_signature_hash(
            input_idx,
            &Prevouts::All(prev_outs),
            TapSighashType::Default,
        )
        .map_err(|_| TxError::SighashFailed)?;
    Ok(hash.to_byte_array())
}

/// Placeholder funding outpoint for leaves minted without an on-chain
/// deposit, derived from a label so it is stable.
pub fn synthetic_outpoint(label: &str) -> OutPoint {
    let hash = bitcoin::hashes::sha256d::Hash::hash(label.as_bytes());
    OutPoint::new(Txid::from_raw_hash(hash), 0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::SecretKey;

    fn key(byte: u8) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::new(), &SecretKey::from_slice(&[byte; 32]).unwrap())
    }

    #[test]
    fn refund_tx_has_output_and_anchor() {
        let prev = OutPoint::new(Txid::from_byte_array([0xAA; 32]), 0);
        let tx = create_refund_tx(
            prev,
            Amount::from_sat(1000),
            Sequence::from_consensus(1800),
            &key(1),
            bitcoin::Network::Regtest,
        );

        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].sequence.to_consensus_u32(), 1800);
        assert_eq!(tx.output[0].value, Amount::from_sat(1000));
        assert!(tx.output[0].script_pubkey.is_p2tr());
        assert_eq!(tx.output[1], anchor_output());

        let recovered = parse_tx(&serialize_tx(&tx)).unwrap();
        assert_eq!(recovered.compute_txid(), tx.compute_txid());
    }

    #[test]
    fn extension_spends_old_node_output() {
        let node = create_node_tx(
            synthetic_outpoint("deposit"),
            Sequence::ZERO,
            Amount::from_sat(5000),
            &key(2),
            bitcoin::Network::Regtest,
        );
        let outpoint = OutPoint::new(node.compute_txid(), 0);
        let ext = create_extension_node_tx(outpoint, &node.output[0], Sequence::from_consensus(7));

        assert_eq!(ext.input[0].previous_output, outpoint);
        assert_eq!(ext.output[0], node.output[0]);
        assert_ne!(ext.compute_txid(), node.compute_txid());
    }

    #[test]
    fn connector_refund_has_two_inputs() {
        let node_out = OutPoint::new(Txid::from_byte_array([0x01; 32]), 0);
        let connector = OutPoint::new(Txid::from_byte_array([0x02; 32]), 3);
        let tx = create_connector_refund_tx(
            node_out,
            connector,
            Amount::from_sat(900),
            Sequence::from_consensus(1900),
            &key(3),
            bitcoin::Network::Regtest,
        );
        assert_eq!(tx.input.len(), 2);
        assert_eq!(tx.input[1].previous_output, connector);
        assert_eq!(tx.output.len(), 1);
    }

    #[test]
    fn sighash_depends_on_prevouts() {
        let tx = create_refund_tx(
            synthetic_outpoint("x"),
            Amount::from_sat(1000),
            Sequence::from_consensus(1900),
            &key(4),
            bitcoin::Network::Regtest,
        );
        let a = TxOut {
            value: Amount::from_sat(1000),
            script_pubkey: p2tr_script(&key(5), bitcoin::Network::Regtest),
        };
        let mut b = a.clone();
        b.value = Amount::from_sat(1001);

        let ha = taproot_sighash(&tx, 0, &[a.clone()]).unwrap();
        let hb = taproot_sighash(&tx, 0, &[b]).unwrap();
        assert_ne!(ha, hb);
        assert_eq!(ha, taproot_sighash(&tx, 0, &[a]).unwrap());
        assert_eq!(taproot_sighash(&tx, 0, &[]), Err(TxError::MissingData));
    }

    #[test]
    fn synthetic_outpoints_are_stable() {
        assert_eq!(synthetic_outpoint("a"), synthetic_outpoint("a"));
        assert_ne!(synthetic_outpoint("a"), synthetic_outpoint("b"));
    }
}
