//! Mock [`Explorer`] implementation for unit tests.
//!
//! Uses a builder pattern (`MockExplorer::builder()`) to register canned
//! transactions before the mock is consumed. The outputs-spent-by relation
//! is derived from the registered transactions' inputs, so a test only has
//! to describe the transaction graph once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::Txid;

use crate::error::ExplorerError;
use crate::types::{AddressPage, Transaction};

use super::Explorer;

pub struct MockExplorer {
    transactions: HashMap<Txid, Transaction>,
    /// Outpoint -> spending txid, derived from registered inputs.
    spends: HashMap<(Txid, u32), Txid>,
    address_txs: HashMap<String, Vec<Txid>>,
    /// Successive mempool snapshots; the last one repeats once drained.
    mempool_snapshots: Mutex<VecDeque<HashSet<Txid>>>,
    /// Txids whose body fetch fails with a transient error.
    unavailable: HashSet<Txid>,
}

impl MockExplorer {
    pub fn builder() -> MockExplorerBuilder {
        MockExplorerBuilder {
            transactions: HashMap::new(),
            address_txs: HashMap::new(),
            mempool_snapshots: VecDeque::new(),
            unavailable: HashSet::new(),
            extra_spends: Vec::new(),
        }
    }
}

/// Builder for configuring a [`MockExplorer`] with canned data.
pub struct MockExplorerBuilder {
    transactions: HashMap<Txid, Transaction>,
    address_txs: HashMap<String, Vec<Txid>>,
    mempool_snapshots: VecDeque<HashSet<Txid>>,
    unavailable: HashSet<Txid>,
    extra_spends: Vec<((Txid, u32), Txid)>,
}

impl MockExplorerBuilder {
    /// Register a transaction, keyed by its `txid`. Its inputs also
    /// register the corresponding outspend entries.
    pub fn with_tx(mut self, tx: Transaction) -> Self {
        self.transactions.insert(tx.txid, tx);
        self
    }

    /// Register the first history page for an address.
    pub fn with_address_txs(mut self, address: &str, txids: Vec<Txid>) -> Self {
        self.address_txs.insert(address.to_owned(), txids);
        self
    }

    /// Queue a mempool snapshot. Snapshots are served in order; the last
    /// one keeps being served once the queue is drained.
    pub fn with_mempool_snapshot(mut self, txids: impl IntoIterator<Item = Txid>) -> Self {
        self.mempool_snapshots.push_back(txids.into_iter().collect());
        self
    }

    /// Make body fetches for `txid` fail with a transient error.
    pub fn with_unavailable_tx(mut self, txid: Txid) -> Self {
        self.unavailable.insert(txid);
        self
    }

    /// Register an outspend entry directly, without registering the
    /// spender's body. Useful for simulating a spender the explorer knows
    /// about but cannot serve.
    pub fn with_outspend(mut self, prev_txid: Txid, vout: u32, spender: Txid) -> Self {
        self.extra_spends.push(((prev_txid, vout), spender));
        self
    }

    /// Consume the builder and produce a [`MockExplorer`].
    pub fn build(self) -> MockExplorer {
        let mut spends = HashMap::new();
        for tx in self.transactions.values() {
            for input in &tx.inputs {
                if let Some(outpoint) = input.prevout {
                    spends.insert((outpoint.txid, outpoint.vout), tx.txid);
                }
            }
        }
        spends.extend(self.extra_spends);

        MockExplorer {
            transactions: self.transactions,
            spends,
            address_txs: self.address_txs,
            mempool_snapshots: Mutex::new(self.mempool_snapshots),
            unavailable: self.unavailable,
        }
    }
}

#[async_trait]
impl Explorer for MockExplorer {
    async fn get_mempool_txids(&self) -> Result<HashSet<Txid>, ExplorerError> {
        let mut snapshots = self.mempool_snapshots.lock().expect("mock lock");
        match snapshots.len() {
            0 => Ok(HashSet::new()),
            1 => Ok(snapshots.front().cloned().expect("non-empty queue")),
            _ => Ok(snapshots.pop_front().expect("non-empty queue")),
        }
    }

    async fn get_tx(&self, txid: &Txid) -> Result<Transaction, ExplorerError> {
        if self.unavailable.contains(txid) {
            return Err(ExplorerError::Unavailable(503));
        }
        self.transactions
            .get(txid)
            .cloned()
            .ok_or(ExplorerError::NotFound)
    }

    async fn get_address_txs(
        &self,
        address: &str,
        cursor: Option<Txid>,
    ) -> Result<AddressPage, ExplorerError> {
        let txids = self
            .address_txs
            .get(address)
            .cloned()
            .ok_or(ExplorerError::NotFound)?;

        // Single-page mock: a cursor past the registered list is empty.
        let txids = match cursor {
            None => txids,
            Some(_) => Vec::new(),
        };
        Ok(AddressPage {
            next_cursor: txids.last().copied(),
            txids,
        })
    }

    async fn get_spending_tx(
        &self,
        prev_txid: &Txid,
        vout: u32,
    ) -> Result<Option<Txid>, ExplorerError> {
        Ok(self.spends.get(&(*prev_txid, vout)).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{payment_tx, txid_from_byte};

    #[tokio::test]
    async fn spends_are_derived_from_registered_inputs() {
        let parent = txid_from_byte(1);
        let child = payment_tx(txid_from_byte(2), parent, "a1", "a2", 5_000);
        let explorer = MockExplorer::builder().with_tx(child).build();

        let spender = explorer
            .get_spending_tx(&parent, 0)
            .await
            .expect("mock never fails outspend");
        assert_eq!(spender, Some(txid_from_byte(2)));
        assert_eq!(
            explorer.get_spending_tx(&parent, 7).await.unwrap(),
            None,
            "unregistered outpoint is unspent"
        );
    }

    #[tokio::test]
    async fn mempool_snapshots_serve_in_order_and_repeat() {
        let a = txid_from_byte(1);
        let b = txid_from_byte(2);
        let explorer = MockExplorer::builder()
            .with_mempool_snapshot([a])
            .with_mempool_snapshot([a, b])
            .build();

        assert_eq!(explorer.get_mempool_txids().await.unwrap().len(), 1);
        assert_eq!(explorer.get_mempool_txids().await.unwrap().len(), 2);
        // Last snapshot repeats.
        assert_eq!(explorer.get_mempool_txids().await.unwrap().len(), 2);
    }
}
