//! In-memory [`GraphStore`] implementation for unit tests.
//!
//! Records every merge so tests can assert idempotence, monotone tag
//! promotion, and edge uniqueness without a running store. A failure flag
//! simulates an unreachable store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::Txid;

use crate::error::StoreError;
use crate::types::{AddressTag, Transaction, Verdict};

use super::{GraphStore, StoreHealth};

#[derive(Debug, Clone)]
pub struct StoredTx {
    pub is_coinjoin: bool,
    pub detection_method: String,
    pub score: f64,
    /// How many times this node has been merged.
    pub merges: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Edge {
    InputTo(String, Txid),
    OutputTo(Txid, String),
    RelatedTo(String, Txid),
}

#[derive(Default)]
struct Inner {
    transactions: HashMap<Txid, StoredTx>,
    addresses: HashMap<String, AddressTag>,
    edges: HashSet<Edge>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every write fails as if the store were unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Server {
                code: "Mock.Unavailable".to_owned(),
                message: "store marked failing".to_owned(),
            });
        }
        Ok(())
    }

    pub fn tx_count(&self) -> usize {
        self.inner.lock().expect("mock lock").transactions.len()
    }

    pub fn stored_tx(&self, txid: &Txid) -> Option<StoredTx> {
        self.inner
            .lock()
            .expect("mock lock")
            .transactions
            .get(txid)
            .cloned()
    }

    pub fn tag_of(&self, address: &str) -> Option<AddressTag> {
        self.inner
            .lock()
            .expect("mock lock")
            .addresses
            .get(address)
            .copied()
    }

    pub fn has_edge(&self, edge: &Edge) -> bool {
        self.inner.lock().expect("mock lock").edges.contains(edge)
    }

    pub fn edge_count(&self) -> usize {
        self.inner.lock().expect("mock lock").edges.len()
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn merge_transaction(
        &self,
        tx: &Transaction,
        verdict: &Verdict,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().expect("mock lock");
        let entry = inner
            .transactions
            .entry(tx.txid)
            .or_insert_with(|| StoredTx {
                is_coinjoin: false,
                detection_method: String::new(),
                score: 0.0,
                merges: 0,
            });
        entry.is_coinjoin = verdict.is_coinjoin;
        entry.detection_method = verdict.detection_method.to_string();
        entry.score = verdict.score;
        entry.merges += 1;
        Ok(())
    }

    async fn merge_address(&self, address: &str, tag: AddressTag) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().expect("mock lock");
        inner
            .addresses
            .entry(address.to_owned())
            .and_modify(|existing| *existing = (*existing).max(tag))
            .or_insert(tag);
        Ok(())
    }

    async fn link_input(&self, address: &str, txid: &Txid) -> Result<(), StoreError> {
        self.check_available()?;
        self.inner
            .lock()
            .expect("mock lock")
            .edges
            .insert(Edge::InputTo(address.to_owned(), *txid));
        Ok(())
    }

    async fn link_output(&self, txid: &Txid, address: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.inner
            .lock()
            .expect("mock lock")
            .edges
            .insert(Edge::OutputTo(*txid, address.to_owned()));
        Ok(())
    }

    async fn link_related(&self, address: &str, txid: &Txid) -> Result<(), StoreError> {
        self.check_available()?;
        self.inner
            .lock()
            .expect("mock lock")
            .edges
            .insert(Edge::RelatedTo(address.to_owned(), *txid));
        Ok(())
    }

    async fn health(&self) -> StoreHealth {
        if self.failing.load(Ordering::SeqCst) {
            return StoreHealth::disconnected();
        }
        let inner = self.inner.lock().expect("mock lock");
        StoreHealth {
            connected: true,
            transaction_count: inner.transactions.len() as u64,
            address_count: inner.addresses.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::persist_with_addresses;
    use crate::test_util::{classify_default, equal_output_tx, payment_tx, txid_from_byte};

    #[tokio::test]
    async fn merges_are_idempotent() {
        let store = MemoryStore::new();
        let tx = equal_output_tx(txid_from_byte(1), 8, 8, 10_000_000);
        let verdict = classify_default(&tx);

        for _ in 0..3 {
            persist_with_addresses(&store, &tx, &verdict, AddressTag::Coinjoin, None)
                .await
                .expect("persist");
        }

        assert_eq!(store.tx_count(), 1);
        let stored = store.stored_tx(&tx.txid).expect("stored");
        assert_eq!(stored.merges, 3);
        assert!(stored.is_coinjoin);
        // 8 input + 8 output addresses, one edge each.
        assert_eq!(store.edge_count(), 16);
    }

    #[tokio::test]
    async fn tags_never_downgrade() {
        let store = MemoryStore::new();
        store
            .merge_address("bc1qmixer", AddressTag::Coinjoin)
            .await
            .expect("merge");
        store
            .merge_address("bc1qmixer", AddressTag::Related)
            .await
            .expect("merge");

        assert_eq!(store.tag_of("bc1qmixer"), Some(AddressTag::Coinjoin));
    }

    #[tokio::test]
    async fn tags_promote_from_related() {
        let store = MemoryStore::new();
        store
            .merge_address("bc1qpeer", AddressTag::Related)
            .await
            .expect("merge");
        store
            .merge_address("bc1qpeer", AddressTag::Coinjoin)
            .await
            .expect("merge");

        assert_eq!(store.tag_of("bc1qpeer"), Some(AddressTag::Coinjoin));
    }

    #[tokio::test]
    async fn related_links_point_at_the_seed() {
        let store = MemoryStore::new();
        let seed = txid_from_byte(1);
        let tx = payment_tx(txid_from_byte(2), seed, "bc1qfrom", "bc1qto", 5_000);
        let verdict = classify_default(&tx);

        persist_with_addresses(&store, &tx, &verdict, AddressTag::Related, Some(&seed))
            .await
            .expect("persist");

        assert!(store.has_edge(&Edge::RelatedTo("bc1qfrom".to_owned(), seed)));
        assert!(store.has_edge(&Edge::RelatedTo("bc1qto".to_owned(), seed)));
        assert!(store.has_edge(&Edge::InputTo("bc1qfrom".to_owned(), tx.txid)));
        assert_eq!(store.tag_of("bc1qto"), Some(AddressTag::Related));
    }

    #[tokio::test]
    async fn failing_store_rejects_writes() {
        let store = MemoryStore::new();
        store.set_failing(true);
        let err = store
            .merge_address("bc1qany", AddressTag::Related)
            .await
            .expect_err("failing store rejects");
        assert!(matches!(err, StoreError::Server { .. }));
        assert!(!store.health().await.connected);
    }
}
