//! Mempool ingestion loop.
//!
//! A single long-running task polls the explorer's mempool id-set, diffs
//! it against the previous snapshot, and pushes new candidates through a
//! bounded worker pool: fetch body, classify, and on a positive verdict
//! run the forward tracer. When the pool is saturated, candidates are
//! dropped and counted; correctness is unaffected because an id keeps
//! re-appearing in mempool snapshots until it confirms or is evicted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitcoin::Txid;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::TxCache;
use crate::config::MonitorConfig;
use crate::detect::Classifier;
use crate::explorer::Explorer;
use crate::store::GraphStore;
use crate::trace::Tracer;
use crate::types::TraceLimits;

// ==============================================================================
// Status
// ==============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub processed: u64,
    pub positive: u64,
    pub dropped: u64,
    pub upstream_failures: u64,
    pub last_tick_unix_ms: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct MonitorStats {
    running: AtomicBool,
    processed: AtomicU64,
    positive: AtomicU64,
    dropped: AtomicU64,
    upstream_failures: AtomicU64,
    /// Milliseconds since the epoch; 0 means no tick has completed yet.
    last_tick_unix_ms: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl MonitorStats {
    fn record_error(&self, message: String) {
        *self.last_error.lock().expect("stats lock") = Some(message);
    }
}

// ==============================================================================
// Monitor
// ==============================================================================

struct Inner {
    explorer: Arc<dyn Explorer>,
    cache: Arc<TxCache>,
    classifier: Arc<Classifier>,
    store: Arc<dyn GraphStore>,
    trace_limits: TraceLimits,
    fetch_concurrency: usize,
    tick_interval: Duration,
    workers: Arc<Semaphore>,
    stats: MonitorStats,
}

/// Background mempool monitor with `start` / `stop` / `status`.
///
/// `last_seen` is owned by the loop task and mutated only there; the
/// worker pool drains asynchronously while the loop moves on to the next
/// tick.
pub struct MempoolMonitor {
    inner: Arc<Inner>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl MempoolMonitor {
    pub fn new(
        explorer: Arc<dyn Explorer>,
        cache: Arc<TxCache>,
        classifier: Arc<Classifier>,
        store: Arc<dyn GraphStore>,
        trace_limits: TraceLimits,
        fetch_concurrency: usize,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                explorer,
                cache,
                classifier,
                store,
                trace_limits,
                fetch_concurrency,
                tick_interval: Duration::from_millis(config.tick_interval_ms),
                workers: Arc::new(Semaphore::new(config.workers)),
                stats: MonitorStats::default(),
            }),
            stop_tx: Mutex::new(None),
        }
    }

    /// Spawn the loop. Returns `false` when it is already running.
    pub fn start(&self) -> bool {
        let mut guard = self.stop_tx.lock().expect("monitor lock");
        if guard.is_some() {
            return false;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        *guard = Some(stop_tx);
        self.inner.stats.running.store(true, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(run_loop(inner, stop_rx));
        true
    }

    /// Signal the loop to stop between ticks. In-flight workers drain.
    /// Returns `false` when it was not running.
    pub fn stop(&self) -> bool {
        let mut guard = self.stop_tx.lock().expect("monitor lock");
        match guard.take() {
            Some(stop_tx) => {
                let _ = stop_tx.send(true);
                // Reflect intent immediately; a restart may overlap the
                // old loop's unwinding otherwise.
                self.inner.stats.running.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> MonitorStatus {
        let stats = &self.inner.stats;
        let last_tick = stats.last_tick_unix_ms.load(Ordering::Relaxed);
        MonitorStatus {
            running: stats.running.load(Ordering::SeqCst),
            processed: stats.processed.load(Ordering::Relaxed),
            positive: stats.positive.load(Ordering::Relaxed),
            dropped: stats.dropped.load(Ordering::Relaxed),
            upstream_failures: stats.upstream_failures.load(Ordering::Relaxed),
            last_tick_unix_ms: (last_tick > 0).then_some(last_tick),
            last_error: stats.last_error.lock().expect("stats lock").clone(),
        }
    }
}

// ==============================================================================
// Loop
// ==============================================================================

async fn run_loop(inner: Arc<Inner>, mut stop_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(inner.tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen: HashSet<Txid> = HashSet::new();
    info!(tick_ms = inner.tick_interval.as_millis() as u64, "mempool monitor started");

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                tick(&inner, &mut last_seen).await;
            }
        }
    }

    info!("mempool monitor stopped");
}

async fn tick(inner: &Arc<Inner>, last_seen: &mut HashSet<Txid>) {
    let current = match inner.explorer.get_mempool_txids().await {
        Ok(current) => current,
        Err(err) => {
            warn!(error = %err, "mempool snapshot failed");
            inner.stats.upstream_failures.fetch_add(1, Ordering::Relaxed);
            inner.stats.record_error(err.to_string());
            return;
        }
    };

    let new_txids: Vec<Txid> = current.difference(last_seen).copied().collect();
    debug!(
        mempool = current.len(),
        new = new_txids.len(),
        "mempool tick"
    );

    for txid in new_txids {
        match Arc::clone(&inner.workers).try_acquire_owned() {
            Ok(permit) => {
                let inner = Arc::clone(inner);
                tokio::spawn(async move {
                    process_candidate(&inner, txid).await;
                    drop(permit);
                });
            }
            Err(_) => {
                // Pool saturated: drop and count. The id re-appears in the
                // next snapshot as long as it stays unconfirmed.
                inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // The snapshot is replaced once this tick's submissions are
    // dispatched; the pool drains on its own.
    *last_seen = current;
    inner.stats.last_tick_unix_ms.store(unix_ms(), Ordering::Relaxed);
}

async fn process_candidate(inner: &Inner, txid: Txid) {
    let tx = if let Some(tx) = inner.cache.get_tx(&txid).await {
        tx
    } else {
        match inner.explorer.get_tx(&txid).await {
            Ok(tx) => {
                inner.cache.insert_tx(tx.clone()).await;
                tx
            }
            Err(err) => {
                // Mempool churn makes vanishing candidates routine.
                debug!(%txid, error = %err, "candidate body fetch failed");
                inner.stats.upstream_failures.fetch_add(1, Ordering::Relaxed);
                inner.stats.record_error(err.to_string());
                return;
            }
        }
    };

    let verdict = inner.classifier.classify(&tx);
    inner.stats.processed.fetch_add(1, Ordering::Relaxed);
    if !verdict.is_coinjoin {
        return;
    }

    inner.stats.positive.fetch_add(1, Ordering::Relaxed);
    info!(
        %txid,
        method = %verdict.detection_method,
        score = verdict.score,
        "coinjoin detected in mempool"
    );

    let tracer = Tracer::new(
        inner.explorer.as_ref(),
        &inner.cache,
        &inner.classifier,
        inner.store.as_ref(),
        inner.trace_limits.clone(),
        inner.fetch_concurrency,
    );
    match tracer.trace_tx(txid).await {
        Ok(investigation) => {
            debug!(
                %txid,
                nodes = investigation.meta.node_count,
                termination = ?investigation.meta.termination,
                "trace complete"
            );
        }
        Err(err) => {
            // A failed trace never stops the monitor.
            warn!(%txid, error = %err, "trace failed");
            inner.stats.record_error(err.to_string());
        }
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ==============================================================================
// Tests
// ==============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassifierConfig;
    use crate::explorer::mock::MockExplorer;
    use crate::store::mock::MemoryStore;
    use crate::test_util::{payment_tx, txid_from_byte, whirlpool_tx};

    fn monitor_with(explorer: MockExplorer, config: &MonitorConfig) -> MempoolMonitor {
        MempoolMonitor::new(
            Arc::new(explorer),
            Arc::new(TxCache::new()),
            Arc::new(Classifier::new(ClassifierConfig::default(), None)),
            Arc::new(MemoryStore::new()),
            TraceLimits::default(),
            2,
            config,
        )
    }

    async fn drain_ticks(ticks: u32, interval_ms: u64) {
        tokio::time::sleep(Duration::from_millis(interval_ms * u64::from(ticks) + 5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn diffs_successive_snapshots() {
        let cj = whirlpool_tx(txid_from_byte(1), 5, 1_000_000);
        let payment = payment_tx(txid_from_byte(2), txid_from_byte(9), "bc1qa", "bc1qb", 10_000);
        let explorer = MockExplorer::builder()
            .with_tx(cj)
            .with_tx(payment)
            .with_mempool_snapshot([txid_from_byte(1)])
            .with_mempool_snapshot([txid_from_byte(1), txid_from_byte(2)])
            .build();
        let config = MonitorConfig {
            tick_interval_ms: 50,
            workers: 4,
        };
        let monitor = monitor_with(explorer, &config);

        assert!(monitor.start());
        drain_ticks(5, 50).await;
        monitor.stop();
        drain_ticks(2, 50).await;

        let status = monitor.status();
        // txid 1 is new on the first tick, txid 2 on the second; neither
        // is reprocessed on later ticks.
        assert_eq!(status.processed, 2);
        assert_eq!(status.positive, 1);
        assert_eq!(status.dropped, 0);
        assert!(status.last_tick_unix_ms.is_some());
        assert!(!status.running);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_stop_reports_state() {
        let explorer = MockExplorer::builder().build();
        let config = MonitorConfig {
            tick_interval_ms: 50,
            workers: 1,
        };
        let monitor = monitor_with(explorer, &config);

        assert!(!monitor.stop(), "stop before start is a no-op");
        assert!(monitor.start());
        assert!(!monitor.start(), "second start is rejected");
        assert!(monitor.status().running);

        assert!(monitor.stop());
        drain_ticks(2, 50).await;
        assert!(!monitor.status().running);

        // A stopped monitor can be started again.
        assert!(monitor.start());
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_pool_drops_and_counts() {
        let explorer = MockExplorer::builder()
            .with_mempool_snapshot([txid_from_byte(1), txid_from_byte(2), txid_from_byte(3)])
            .build();
        let config = MonitorConfig {
            tick_interval_ms: 50,
            // No capacity at all: every candidate is dropped.
            workers: 0,
        };
        let monitor = monitor_with(explorer, &config);

        assert!(monitor.start());
        drain_ticks(2, 50).await;
        monitor.stop();
        drain_ticks(1, 50).await;

        let status = monitor.status();
        assert_eq!(status.processed, 0);
        assert_eq!(status.dropped, 3, "each new id is dropped exactly once");
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_failure_is_counted_not_fatal() {
        // No snapshots registered: the mock returns an empty set, so use
        // an unavailable body instead to exercise the failure counters.
        let explorer = MockExplorer::builder()
            .with_mempool_snapshot([txid_from_byte(7)])
            .with_unavailable_tx(txid_from_byte(7))
            .build();
        let config = MonitorConfig {
            tick_interval_ms: 50,
            workers: 2,
        };
        let monitor = monitor_with(explorer, &config);

        assert!(monitor.start());
        drain_ticks(3, 50).await;
        monitor.stop();
        drain_ticks(1, 50).await;

        let status = monitor.status();
        assert_eq!(status.processed, 0);
        assert!(status.upstream_failures >= 1);
        assert!(status.last_error.is_some());
        // The loop survived the failure and kept ticking.
        assert!(status.last_tick_unix_ms.is_some());
    }
}
