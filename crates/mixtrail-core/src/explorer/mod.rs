//! Block-explorer abstraction layer.
//!
//! Defines the [`Explorer`] trait and provides an esplora-compatible HTTP
//! implementation ([`EsploraClient`]) plus a test mock (`mock::MockExplorer`).

mod esplora;
#[cfg(test)]
pub mod mock;

pub use esplora::EsploraClient;

use std::collections::HashSet;

use async_trait::async_trait;
use bitcoin::Txid;

use crate::error::ExplorerError;
use crate::types::{AddressPage, Transaction};

/// Minimal trait covering the explorer operations the engine needs.
///
/// Implementations are expected to handle rate limiting, retries for
/// transient failures, and response deserialization internally; they are
/// stateless beyond that.
#[async_trait]
pub trait Explorer: Send + Sync {
    /// Fetch the current mempool transaction-id set.
    async fn get_mempool_txids(&self) -> Result<HashSet<Txid>, ExplorerError>;

    /// Fetch a transaction body by txid.
    async fn get_tx(&self, txid: &Txid) -> Result<Transaction, ExplorerError>;

    /// Fetch one page of an address's transaction history. `cursor` is the
    /// last txid of the previous page, or `None` for the first page.
    async fn get_address_txs(
        &self,
        address: &str,
        cursor: Option<Txid>,
    ) -> Result<AddressPage, ExplorerError>;

    /// Resolve the transaction spending output `vout` of `prev_txid`.
    /// Returns `None` while the output is unspent.
    async fn get_spending_tx(
        &self,
        prev_txid: &Txid,
        vout: u32,
    ) -> Result<Option<Txid>, ExplorerError>;
}
