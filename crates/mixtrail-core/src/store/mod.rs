//! Property-graph store abstraction layer.
//!
//! Defines the [`GraphStore`] trait and provides a Cypher-over-HTTP
//! implementation ([`CypherHttpStore`]) plus a test mock
//! (`mock::MemoryStore`). Every write is idempotent: nodes merge by key,
//! edges are created only if absent, and address tags only ever promote.

mod http;
#[cfg(test)]
pub mod mock;

pub use http::CypherHttpStore;

use async_trait::async_trait;
use bitcoin::Txid;
use serde::Serialize;

use crate::error::StoreError;
use crate::types::{AddressTag, Transaction, Verdict};

/// Store connectivity and basic node counts.
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub connected: bool,
    pub transaction_count: u64,
    pub address_count: u64,
}

impl StoreHealth {
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            transaction_count: 0,
            address_count: 0,
        }
    }
}

/// Operations against the labelled-property graph store.
///
/// Each write is one transaction against the store; failures bubble to
/// the caller as [`StoreError`]. Implementations are thread-safe at the
/// operation level.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Create or update the Transaction node keyed by `txid`.
    async fn merge_transaction(
        &self,
        tx: &Transaction,
        verdict: &Verdict,
    ) -> Result<(), StoreError>;

    /// Create or update the Address node keyed by `address`, monotonically
    /// promoting the tag (`related` -> `coinjoin`, never the reverse).
    async fn merge_address(&self, address: &str, tag: AddressTag) -> Result<(), StoreError>;

    /// `(Address)-[:INPUT_TO]->(Transaction)`, created only if absent.
    async fn link_input(&self, address: &str, txid: &Txid) -> Result<(), StoreError>;

    /// `(Transaction)-[:OUTPUT_TO]->(Address)`, created only if absent.
    async fn link_output(&self, txid: &Txid, address: &str) -> Result<(), StoreError>;

    /// `(Address)-[:RELATED_TO]->(Transaction)`, created only if absent.
    async fn link_related(&self, address: &str, txid: &Txid) -> Result<(), StoreError>;

    /// Connectivity plus node counts. Never fails; a store that cannot be
    /// reached reports `connected: false`.
    async fn health(&self) -> StoreHealth;
}

/// Merge a transaction together with its participating addresses.
///
/// `tag` is applied to every input and output address. When `related_to`
/// is set, each address is additionally linked to that (seed) transaction
/// with a `RELATED_TO` edge, marking it as discovered via tracing rather
/// than direct participation in the seed.
pub async fn persist_with_addresses(
    store: &dyn GraphStore,
    tx: &Transaction,
    verdict: &Verdict,
    tag: AddressTag,
    related_to: Option<&Txid>,
) -> Result<(), StoreError> {
    store.merge_transaction(tx, verdict).await?;

    for input in &tx.inputs {
        if let Some(address) = &input.address {
            store.merge_address(address, tag).await?;
            store.link_input(address, &tx.txid).await?;
            if let Some(seed) = related_to {
                store.link_related(address, seed).await?;
            }
        }
    }
    for output in &tx.outputs {
        if let Some(address) = &output.address {
            store.merge_address(address, tag).await?;
            store.link_output(&tx.txid, address).await?;
            if let Some(seed) = related_to {
                store.link_related(address, seed).await?;
            }
        }
    }
    Ok(())
}
