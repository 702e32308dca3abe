//! Shared test helpers for `mixtrail-core` unit tests.
//!
//! Consolidates builder functions for domain transactions (uniform
//! CoinJoin shapes, ordinary payments, traced descendants) so that tests
//! across modules share a single source of truth for dummy data
//! construction. Input prevouts are derived deterministically from the
//! owning txid, so registering a transaction in the mock explorer never
//! accidentally marks another test transaction's outputs as spent.

use bitcoin::hashes::Hash;
use bitcoin::{Amount, OutPoint, Txid};

use crate::config::ClassifierConfig;
use crate::detect::Classifier;
use crate::types::{Transaction, TxInput, TxOutput, Verdict};

// ==============================================================================
// Txid Helpers
// ==============================================================================

/// Create a deterministic `Txid` from a single distinguishing byte.
/// Useful for building small test graphs where txids only need to be
/// unique.
pub fn txid_from_byte(b: u8) -> Txid {
    let mut bytes = [0u8; 32];
    bytes[0] = b;
    Txid::from_byte_array(bytes)
}

/// A synthetic funding txid for input `index` of `owner`, distinct from
/// every `txid_from_byte` value and from other owners' funding txids.
fn funding_txid(owner: Txid, index: u8) -> Txid {
    let mut bytes = owner.to_byte_array();
    bytes[30] = 0xEE;
    bytes[31] = index.wrapping_add(1);
    Txid::from_byte_array(bytes)
}

fn address_for(owner: Txid, side: &str, index: usize) -> String {
    let hex = owner.to_string();
    format!("bc1q{}{side}{index}", &hex[..8])
}

// ==============================================================================
// Transaction Builders
// ==============================================================================

/// Build a transaction with explicit inputs and outputs. Fee and size get
/// shape-derived defaults.
pub fn tx_with(txid: Txid, inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Transaction {
    let size = 100 + 70 * (inputs.len() + outputs.len()) as u64;
    Transaction {
        txid,
        inputs,
        outputs,
        fee: Amount::from_sat(10_000),
        size,
    }
}

/// An n-in m-out transaction where every output carries `denom_sats` and
/// every input has its own address.
pub fn equal_output_tx(txid: Txid, inputs: usize, outputs: usize, denom_sats: u64) -> Transaction {
    let inputs = (0..inputs)
        .map(|i| TxInput {
            prevout: Some(OutPoint::new(funding_txid(txid, i as u8), 0)),
            address: Some(address_for(txid, "i", i)),
            value: Some(Amount::from_sat(denom_sats + 20_000)),
        })
        .collect();
    let outputs = (0..outputs)
        .map(|o| TxOutput {
            address: Some(address_for(txid, "o", o)),
            value: Amount::from_sat(denom_sats),
        })
        .collect();
    tx_with(txid, inputs, outputs)
}

/// A Whirlpool-shaped CoinJoin: n-in n-out, one denomination. With the
/// default classifier configuration this classifies positive via the
/// Samourai pattern when `denom_sats` is a configured pool size.
pub fn whirlpool_tx(txid: Txid, participants: usize, denom_sats: u64) -> Transaction {
    equal_output_tx(txid, participants, participants, denom_sats)
}

/// A positive descendant whose first input spends `parent:vout`. The
/// remaining shape is a default Whirlpool mix, so it classifies positive.
pub fn coinjoin_descendant(txid: Txid, parent: Txid, vout: u32) -> Transaction {
    let mut tx = whirlpool_tx(txid, 5, 1_000_000);
    tx.inputs[0].prevout = Some(OutPoint::new(parent, vout));
    tx
}

/// An ordinary 1-in 2-out payment spending `prev:0`, with unequal
/// outputs. Classifies negative under the default configuration.
pub fn payment_tx(txid: Txid, prev: Txid, from: &str, to: &str, sats: u64) -> Transaction {
    let inputs = vec![TxInput {
        prevout: Some(OutPoint::new(prev, 0)),
        address: Some(from.to_owned()),
        value: Some(Amount::from_sat(sats + sats / 3 + 10_000)),
    }];
    let outputs = vec![
        TxOutput {
            address: Some(to.to_owned()),
            value: Amount::from_sat(sats),
        },
        TxOutput {
            address: Some(from.to_owned()),
            value: Amount::from_sat(sats / 3 + 1),
        },
    ];
    tx_with(txid, inputs, outputs)
}

// ==============================================================================
// Classification Helpers
// ==============================================================================

/// Classify with the default heuristic-only configuration.
pub fn classify_default(tx: &Transaction) -> Verdict {
    Classifier::new(ClassifierConfig::default(), None).classify(tx)
}
