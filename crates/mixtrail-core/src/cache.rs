//! In-memory LRU + TTL cache for transaction bodies and address-history
//! pages.
//!
//! The cache is shared across the monitor, the tracer, and the server via
//! `Arc<TxCache>`. Lookups mutate LRU recency state, so both operations
//! require mutable access. A value is evicted when it outlives its TTL
//! (checked lazily on access and during explicit cleanup) or when its
//! namespace exceeds capacity and it is the least-recently used entry.
//! Eviction never affects correctness, only latency.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bitcoin::Txid;
use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::CacheConfig;
use crate::types::{AddressPage, Transaction};

// ==============================================================================
// Defaults
// ==============================================================================

/// Default maximum number of cached transaction bodies.
const DEFAULT_TX_CAPACITY: usize = 10_000;

/// Default maximum number of cached address-history pages.
const DEFAULT_ADDRESS_CAPACITY: usize = 1_000;

/// Default time-to-live for both namespaces.
const DEFAULT_TTL: Duration = Duration::from_secs(600);

// ==============================================================================
// Cache
// ==============================================================================

struct Entry<T> {
    value: T,
    inserted: Instant,
}

/// Bounded LRU + TTL cache with two logical namespaces: transaction
/// bodies keyed by txid and address-history pages keyed by address.
///
/// Uses `tokio::sync::Mutex` for async-friendly concurrent access.
/// Mutex and not RwLock is needed since LRU reads update recency tracking.
pub struct TxCache {
    transactions: Mutex<LruCache<Txid, Entry<Transaction>>>,
    address_pages: Mutex<LruCache<String, Entry<AddressPage>>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
}

/// Point-in-time cache statistics for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub tx_entries: usize,
    pub tx_capacity: usize,
    pub address_entries: usize,
    pub address_capacity: usize,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub hit_rate: f64,
}

impl TxCache {
    /// Create a cache with the default capacities and TTL.
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_TX_CAPACITY, DEFAULT_ADDRESS_CAPACITY, DEFAULT_TTL)
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::with_settings(
            config.tx_capacity,
            config.address_capacity,
            Duration::from_secs(config.ttl_secs),
        )
    }

    /// Create a cache with explicit settings. Capacities must be > 0.
    pub fn with_settings(tx_cap: usize, address_cap: usize, ttl: Duration) -> Self {
        Self {
            transactions: Mutex::new(LruCache::new(
                NonZeroUsize::new(tx_cap).expect("tx capacity must be > 0"),
            )),
            address_pages: Mutex::new(LruCache::new(
                NonZeroUsize::new(address_cap).expect("address capacity must be > 0"),
            )),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Look up a cached transaction body. Entries past their TTL are
    /// removed on access and reported as misses.
    pub async fn get_tx(&self, txid: &Txid) -> Option<Transaction> {
        let mut guard = self.transactions.lock().await;
        // Outer None: absent. Inner None: present but past its TTL.
        let lookup = guard
            .get(txid)
            .map(|entry| (entry.inserted.elapsed() < self.ttl).then(|| entry.value.clone()));
        match lookup {
            Some(Some(tx)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(tx)
            }
            Some(None) => {
                guard.pop(txid);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn insert_tx(&self, tx: Transaction) {
        self.transactions.lock().await.put(
            tx.txid,
            Entry {
                value: tx,
                inserted: Instant::now(),
            },
        );
    }

    /// Look up the cached first history page for an address.
    pub async fn get_address_page(&self, address: &str) -> Option<AddressPage> {
        let mut guard = self.address_pages.lock().await;
        let lookup = guard
            .get(address)
            .map(|entry| (entry.inserted.elapsed() < self.ttl).then(|| entry.value.clone()));
        match lookup {
            Some(Some(page)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(page)
            }
            Some(None) => {
                guard.pop(address);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn insert_address_page(&self, address: String, page: AddressPage) {
        self.address_pages.lock().await.put(
            address,
            Entry {
                value: page,
                inserted: Instant::now(),
            },
        );
    }

    /// Sweep both namespaces, removing every entry past its TTL.
    /// Returns the number of entries removed.
    pub async fn cleanup(&self) -> usize {
        let mut removed = 0;

        {
            let mut guard = self.transactions.lock().await;
            let expired: Vec<Txid> = guard
                .iter()
                .filter(|(_, entry)| entry.inserted.elapsed() >= self.ttl)
                .map(|(txid, _)| *txid)
                .collect();
            for txid in expired {
                guard.pop(&txid);
                removed += 1;
            }
        }

        {
            let mut guard = self.address_pages.lock().await;
            let expired: Vec<String> = guard
                .iter()
                .filter(|(_, entry)| entry.inserted.elapsed() >= self.ttl)
                .map(|(address, _)| address.clone())
                .collect();
            for address in expired {
                guard.pop(&address);
                removed += 1;
            }
        }

        self.expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop every entry in both namespaces. Counters are kept.
    pub async fn clear(&self) {
        self.transactions.lock().await.clear();
        self.address_pages.lock().await.clear();
    }

    pub async fn status(&self) -> CacheStatus {
        let tx_guard = self.transactions.lock().await;
        let address_guard = self.address_pages.lock().await;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStatus {
            tx_entries: tx_guard.len(),
            tx_capacity: tx_guard.cap().get(),
            address_entries: address_guard.len(),
            address_capacity: address_guard.cap().get(),
            ttl_secs: self.ttl.as_secs(),
            hits,
            misses,
            expirations: self.expirations.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

impl Default for TxCache {
    fn default() -> Self {
        Self::new()
    }
}

// ==============================================================================
// Tests
// ==============================================================================
