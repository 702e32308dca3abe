//! Engine facade for on-demand investigations.
//!
//! Owns the long-lived collaborators (explorer, cache, classifier, graph
//! store) and enforces the per-process cap on concurrent investigations.
//! This is the only component that sees per-request overrides; the
//! globally-configured defaults apply otherwise.

use std::sync::Arc;

use bitcoin::Txid;
use serde::Serialize;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::info;

use crate::cache::TxCache;
use crate::config::{ServerConfig, TracerConfig};
use crate::detect::Classifier;
use crate::error::CoreError;
use crate::explorer::Explorer;
use crate::store::GraphStore;
use crate::trace::Tracer;
use crate::types::{Investigation, TraceLimits, TraceNode, Verdict};

// ==============================================================================
// Hard Ceilings
// ==============================================================================
//
// These caps protect server resources regardless of configuration or
// per-request overrides.

pub const HARD_MAX_DEPTH: usize = 100;
pub const HARD_MAX_NODES: usize = 10_000;

// ==============================================================================
// Engine
// ==============================================================================

/// Result of a txid-seeded investigation: the seed's verdict plus the
/// traced tree and metadata.
#[derive(Debug, Clone, Serialize)]
pub struct TxInvestigation {
    pub verdict: Verdict,
    #[serde(flatten)]
    pub investigation: Investigation,
}

pub struct Engine {
    explorer: Arc<dyn Explorer>,
    cache: Arc<TxCache>,
    classifier: Arc<Classifier>,
    store: Arc<dyn GraphStore>,
    default_limits: TraceLimits,
    fetch_concurrency: usize,
    investigations: Semaphore,
    reject_when_busy: bool,
}

impl Engine {
    pub fn new(
        explorer: Arc<dyn Explorer>,
        cache: Arc<TxCache>,
        classifier: Arc<Classifier>,
        store: Arc<dyn GraphStore>,
        tracer_config: &TracerConfig,
        server_config: &ServerConfig,
    ) -> Self {
        Self {
            explorer,
            cache,
            classifier,
            store,
            default_limits: tracer_config.limits(),
            fetch_concurrency: tracer_config.fetch_concurrency,
            investigations: Semaphore::new(server_config.max_concurrent_investigations),
            reject_when_busy: server_config.reject_when_busy,
        }
    }

    /// Investigate a specific transaction: classify it, trace its forward
    /// spending tree, and persist the discovered subgraph.
    pub async fn investigate_tx(
        &self,
        txid: Txid,
        max_depth: Option<usize>,
    ) -> Result<TxInvestigation, CoreError> {
        let _permit = self.admit().await?;
        let limits = self.limits_for(max_depth);
        info!(%txid, max_depth = limits.max_depth, "investigating transaction");

        let tracer = self.tracer(limits);
        let investigation = tracer.trace_tx(txid).await?;

        let verdict = match investigation.roots.first() {
            Some(TraceNode::Expanded { verdict, .. }) => verdict.clone(),
            _ => unreachable!("a successful txid trace always has an expanded root"),
        };
        Ok(TxInvestigation {
            verdict,
            investigation,
        })
    }

    /// Investigate an address: expand its recent transactions as virtual
    /// roots and trace each forward.
    pub async fn investigate_address(
        &self,
        address: &str,
        max_depth: Option<usize>,
    ) -> Result<Investigation, CoreError> {
        let _permit = self.admit().await?;
        let limits = self.limits_for(max_depth);
        info!(address, max_depth = limits.max_depth, "investigating address");

        self.tracer(limits).trace_address(address).await
    }

    pub fn cache(&self) -> &Arc<TxCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn ml_available(&self) -> bool {
        self.classifier.ml_available()
    }

    fn tracer(&self, limits: TraceLimits) -> Tracer<'_> {
        Tracer::new(
            self.explorer.as_ref(),
            &self.cache,
            &self.classifier,
            self.store.as_ref(),
            limits,
            self.fetch_concurrency,
        )
    }

    /// Admission control: reject with `Busy` or queue for a slot,
    /// depending on configuration.
    async fn admit(&self) -> Result<SemaphorePermit<'_>, CoreError> {
        if self.reject_when_busy {
            self.investigations
                .try_acquire()
                .map_err(|_| CoreError::Busy)
        } else {
            self.investigations
                .acquire()
                .await
                .map_err(|_| CoreError::Busy)
        }
    }

    /// Apply a per-request depth override and clamp against the hard
    /// ceilings.
    fn limits_for(&self, max_depth: Option<usize>) -> TraceLimits {
        let mut limits = self.default_limits.clone();
        if let Some(depth) = max_depth {
            limits.max_depth = depth;
        }
        limits.max_depth = limits.max_depth.min(HARD_MAX_DEPTH);
        limits.max_total_nodes = limits.max_total_nodes.min(HARD_MAX_NODES);
        limits
    }
}

// ==============================================================================
// Tests
// ==============================================================================
