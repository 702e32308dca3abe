//! Forward-tracing DFS engine.
//!
//! Given a confirmed or suspected CoinJoin, the tracer walks the
//! outputs-are-spent-by relation forward, building a bounded tree of
//! descendant transactions. Each node is classified on the way down;
//! positive descendants are persisted together with their addresses.
//!
//! The walk is depth-first with per-path state (the non-CoinJoin streak
//! lives on the DFS path), while child spending lookups and body fetches
//! within one node fan out concurrently, bounded by a semaphore. The
//! output stays a tree: a txid reached a second time within a run becomes
//! a reference leaf and is never re-expanded.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use bitcoin::Txid;
use futures::future::{join_all, BoxFuture};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::cache::TxCache;
use crate::detect::Classifier;
use crate::error::{CoreError, ExplorerError};
use crate::explorer::Explorer;
use crate::store::{persist_with_addresses, GraphStore};
use crate::types::{
    AddressTag, Investigation, TerminationReason, TraceLimits, TraceMeta, TraceNode, TraceRoot,
    Transaction, Verdict,
};

// ==============================================================================
// Tracer
// ==============================================================================

pub struct Tracer<'a> {
    explorer: &'a dyn Explorer,
    cache: &'a TxCache,
    classifier: &'a Classifier,
    store: &'a dyn GraphStore,
    limits: TraceLimits,
    fetch_concurrency: usize,
}

/// Mutable per-run state. Never shared across runs; the visited set and
/// verdict memo die with the investigation.
struct RunState {
    visited: HashSet<Txid>,
    verdicts: HashMap<Txid, Verdict>,
    node_count: usize,
    max_depth_reached: usize,
    started: Instant,
    deadline: Instant,
    /// Global stop (node budget or wall clock), once triggered.
    stop: Option<TerminationReason>,
    depth_pruned: bool,
    streak_tripped: bool,
    last_streak: usize,
}

impl RunState {
    fn new(limits: &TraceLimits) -> Self {
        let started = Instant::now();
        let deadline = started
            .checked_add(limits.max_wall_clock)
            .unwrap_or_else(|| started + Duration::from_secs(86_400));
        Self {
            visited: HashSet::new(),
            verdicts: HashMap::new(),
            node_count: 0,
            max_depth_reached: 0,
            started,
            deadline,
            stop: None,
            depth_pruned: false,
            streak_tripped: false,
            last_streak: 0,
        }
    }

    /// The stopping condition that ended the run. Global stops win; a
    /// tripped streak beats depth pruning; otherwise the frontier simply
    /// ran out.
    fn termination(&self) -> TerminationReason {
        self.stop.unwrap_or(if self.streak_tripped {
            TerminationReason::NonCoinjoinStreak
        } else if self.depth_pruned {
            TerminationReason::Depth
        } else {
            TerminationReason::Exhausted
        })
    }
}

/// A resolved child awaiting branch selection.
enum Candidate {
    /// Body fetched and preliminarily classified.
    Fetched { tx: Transaction, verdict: Verdict },
    /// Already expanded in this run; becomes a reference leaf.
    Visited { txid: Txid, score: f64, positive: bool },
    /// Body could not be fetched; becomes an unavailable leaf.
    Failed { txid: Txid, reason: String },
}

impl Candidate {
    fn txid(&self) -> Txid {
        match self {
            Self::Fetched { tx, .. } => tx.txid,
            Self::Visited { txid, .. } | Self::Failed { txid, .. } => *txid,
        }
    }

    fn positive(&self) -> bool {
        match self {
            Self::Fetched { verdict, .. } => verdict.is_coinjoin,
            Self::Visited { positive, .. } => *positive,
            Self::Failed { .. } => false,
        }
    }

    fn score(&self) -> f64 {
        match self {
            Self::Fetched { verdict, .. } => verdict.score,
            Self::Visited { score, .. } => *score,
            Self::Failed { .. } => -1.0,
        }
    }
}

impl<'a> Tracer<'a> {
    pub fn new(
        explorer: &'a dyn Explorer,
        cache: &'a TxCache,
        classifier: &'a Classifier,
        store: &'a dyn GraphStore,
        limits: TraceLimits,
        fetch_concurrency: usize,
    ) -> Self {
        Self {
            explorer,
            cache,
            classifier,
            store,
            limits,
            fetch_concurrency: fetch_concurrency.max(1),
        }
    }

    /// Trace forward from a seed transaction.
    ///
    /// The seed is fetched, classified, and persisted before any
    /// descendant is expanded. A seed that cannot be fetched fails the
    /// whole investigation; nothing is persisted in that case.
    pub async fn trace_tx(&self, seed: Txid) -> Result<Investigation, CoreError> {
        let mut state = RunState::new(&self.limits);

        let tx = self
            .fetch_tx(&seed)
            .await
            .map_err(|err| CoreError::from_fetch(seed, err))?;
        let verdict = self.classify_memo(&mut state, &tx);
        debug!(txid = %seed, is_coinjoin = verdict.is_coinjoin, method = %verdict.detection_method, "seed classified");

        let tag = if verdict.is_coinjoin {
            AddressTag::Coinjoin
        } else {
            AddressTag::Related
        };
        persist_with_addresses(self.store, &tx, &verdict, tag, None).await?;

        state.visited.insert(seed);
        let streak = usize::from(!verdict.is_coinjoin);
        let root = self.expand(&mut state, tx, verdict, 0, streak, seed).await?;

        let meta = self.finalize(&state, TraceRoot::Tx(seed));
        Ok(Investigation {
            roots: vec![root],
            meta,
        })
    }

    /// Address-seed mode: the address's recent transactions, bounded by
    /// `max_txs_per_address`, are expanded as virtual roots sharing one
    /// budget.
    pub async fn trace_address(&self, address: &str) -> Result<Investigation, CoreError> {
        let page = match self.cache.get_address_page(address).await {
            Some(page) => page,
            None => {
                let page = match self.explorer.get_address_txs(address, None).await {
                    Ok(page) => page,
                    // An address without history is an empty investigation,
                    // not a failure.
                    Err(ExplorerError::NotFound) => {
                        return Ok(Investigation {
                            roots: Vec::new(),
                            meta: self.finalize(
                                &RunState::new(&self.limits),
                                TraceRoot::Address(address.to_owned()),
                            ),
                        });
                    }
                    Err(err) => return Err(CoreError::UpstreamUnavailable(err)),
                };
                self.cache
                    .insert_address_page(address.to_owned(), page.clone())
                    .await;
                page
            }
        };

        let mut state = RunState::new(&self.limits);
        let mut roots = Vec::new();

        for txid in page.txids.iter().take(self.limits.max_txs_per_address) {
            self.check_global(&mut state);
            if state.stop.is_some() {
                break;
            }
            if state.visited.contains(txid) {
                roots.push(TraceNode::Reference { txid: *txid });
                continue;
            }

            let tx = match self.fetch_tx(txid).await {
                Ok(tx) => tx,
                Err(err) => {
                    // Per-root failures never abort the fan-out.
                    warn!(txid = %txid, error = %err, "virtual root unavailable");
                    roots.push(TraceNode::Unavailable {
                        txid: *txid,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            let verdict = self.classify_memo(&mut state, &tx);
            let tag = if verdict.is_coinjoin {
                AddressTag::Coinjoin
            } else {
                AddressTag::Related
            };
            persist_with_addresses(self.store, &tx, &verdict, tag, None).await?;

            state.visited.insert(*txid);
            let streak = usize::from(!verdict.is_coinjoin);
            let root = self.expand(&mut state, tx, verdict, 0, streak, *txid).await?;
            roots.push(root);
        }

        let meta = self.finalize(&state, TraceRoot::Address(address.to_owned()));
        Ok(Investigation { roots, meta })
    }

    // --------------------------------------------------------------------------
    // Expansion
    // --------------------------------------------------------------------------

    /// Depth-first expansion of one node. `streak` is the run of
    /// consecutive non-CoinJoin verdicts on the path, including this node.
    fn expand<'s>(
        &'s self,
        state: &'s mut RunState,
        tx: Transaction,
        verdict: Verdict,
        depth: usize,
        streak: usize,
        seed: Txid,
    ) -> BoxFuture<'s, Result<TraceNode, CoreError>> {
        Box::pin(async move {
            state.node_count += 1;
            state.max_depth_reached = state.max_depth_reached.max(depth);
            state.last_streak = streak;

            // Path-local stops: the node itself stays in the tree.
            if streak >= self.limits.consecutive_non_coinjoin_limit {
                state.streak_tripped = true;
                return Ok(leaf(tx, verdict, depth));
            }

            self.check_global(state);
            if state.stop.is_some() {
                return Ok(leaf(tx, verdict, depth));
            }
            if depth >= self.limits.max_depth {
                state.depth_pruned = true;
                return Ok(leaf(tx, verdict, depth));
            }

            let spender_txids = self.resolve_spenders(&tx, state.deadline).await;
            let mut candidates = self.collect_candidates(state, spender_txids).await;

            // Branch selection: positive verdicts first, then higher score,
            // ties broken by ascending txid for determinism.
            candidates.sort_by(|a, b| {
                b.positive()
                    .cmp(&a.positive())
                    .then_with(|| b.score().total_cmp(&a.score()))
                    .then_with(|| a.txid().cmp(&b.txid()))
            });
            candidates.truncate(self.limits.max_branches_per_node);

            let mut children = Vec::with_capacity(candidates.len());
            for candidate in candidates {
                if state.stop.is_some() {
                    break;
                }
                match candidate {
                    Candidate::Visited { txid, .. } => {
                        children.push(TraceNode::Reference { txid });
                    }
                    Candidate::Failed { txid, reason } => {
                        children.push(TraceNode::Unavailable { txid, reason });
                    }
                    Candidate::Fetched {
                        tx: child_tx,
                        verdict: child_verdict,
                    } => {
                        state.visited.insert(child_tx.txid);

                        // Positive descendants are persisted before their
                        // own children are scheduled, so a crash cannot
                        // leave a child in the store without its parent.
                        let child_streak = if child_verdict.is_coinjoin {
                            persist_with_addresses(
                                self.store,
                                &child_tx,
                                &child_verdict,
                                AddressTag::Related,
                                Some(&seed),
                            )
                            .await?;
                            0
                        } else {
                            streak + 1
                        };

                        let node = self
                            .expand(
                                &mut *state,
                                child_tx,
                                child_verdict,
                                depth + 1,
                                child_streak,
                                seed,
                            )
                            .await?;
                        children.push(node);
                    }
                }
            }

            Ok(TraceNode::Expanded {
                tx,
                verdict,
                depth,
                children,
            })
        })
    }

    /// Resolve which transactions spend this node's outputs, up to
    /// `max_outputs_per_tx` outputs, concurrently but bounded. Lookup
    /// failures leave the output unresolved; the deadline is checked
    /// before each explorer call.
    async fn resolve_spenders(&self, tx: &Transaction, deadline: Instant) -> Vec<Txid> {
        let semaphore = Semaphore::new(self.fetch_concurrency);
        let lookups = tx
            .outputs
            .iter()
            .enumerate()
            .take(self.limits.max_outputs_per_tx)
            .map(|(vout, _)| {
                let semaphore = &semaphore;
                let txid = tx.txid;
                async move {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .expect("semaphore is never closed");
                    if Instant::now() >= deadline {
                        return None;
                    }
                    match self.explorer.get_spending_tx(&txid, vout as u32).await {
                        Ok(spender) => spender,
                        Err(err) => {
                            warn!(%txid, vout, error = %err, "outspend lookup failed");
                            None
                        }
                    }
                }
            });

        // Dedupe while preserving output order: one child may sweep
        // several outputs of the same parent.
        let mut seen = HashSet::new();
        let mut spenders = Vec::new();
        for txid in join_all(lookups).await.into_iter().flatten() {
            if seen.insert(txid) {
                spenders.push(txid);
            }
        }
        spenders
    }

    /// Fetch candidate bodies (bounded concurrency), then classify them
    /// sequentially through the per-run memo.
    async fn collect_candidates(
        &self,
        state: &mut RunState,
        spender_txids: Vec<Txid>,
    ) -> Vec<Candidate> {
        let mut candidates = Vec::with_capacity(spender_txids.len());
        let mut to_fetch = Vec::new();

        for txid in spender_txids {
            if state.visited.contains(&txid) {
                // Verdicts are memoised at first classification, so a
                // visited txid always has one.
                let verdict = &state.verdicts[&txid];
                candidates.push(Candidate::Visited {
                    txid,
                    score: verdict.score,
                    positive: verdict.is_coinjoin,
                });
            } else {
                to_fetch.push(txid);
            }
        }

        let semaphore = Semaphore::new(self.fetch_concurrency);
        let deadline = state.deadline;
        let fetches = to_fetch.iter().map(|txid| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .expect("semaphore is never closed");
                if Instant::now() >= deadline {
                    return None;
                }
                Some((*txid, self.fetch_tx(txid).await))
            }
        });

        for fetched in join_all(fetches).await.into_iter().flatten() {
            match fetched {
                (_, Ok(tx)) => {
                    let verdict = self.classify_memo(state, &tx);
                    candidates.push(Candidate::Fetched { tx, verdict });
                }
                (txid, Err(err)) => {
                    // Permanent or exhausted-retry failures become
                    // terminal leaves; they never abort the tree.
                    debug!(%txid, error = %err, "child body unavailable");
                    candidates.push(Candidate::Failed {
                        txid,
                        reason: err.to_string(),
                    });
                }
            }
        }

        candidates
    }

    // --------------------------------------------------------------------------
    // Shared plumbing
    // --------------------------------------------------------------------------

    async fn fetch_tx(&self, txid: &Txid) -> Result<Transaction, ExplorerError> {
        if let Some(tx) = self.cache.get_tx(txid).await {
            return Ok(tx);
        }
        let tx = self.explorer.get_tx(txid).await?;
        self.cache.insert_tx(tx.clone()).await;
        Ok(tx)
    }

    fn classify_memo(&self, state: &mut RunState, tx: &Transaction) -> Verdict {
        if let Some(verdict) = state.verdicts.get(&tx.txid) {
            return verdict.clone();
        }
        let verdict = self.classifier.classify(tx);
        state.verdicts.insert(tx.txid, verdict.clone());
        verdict
    }

    fn check_global(&self, state: &mut RunState) {
        if state.stop.is_some() {
            return;
        }
        if state.node_count >= self.limits.max_total_nodes {
            state.stop = Some(TerminationReason::NodeBudget);
        } else if Instant::now() >= state.deadline {
            state.stop = Some(TerminationReason::Timeout);
        }
    }

    fn finalize(&self, state: &RunState, root: TraceRoot) -> TraceMeta {
        TraceMeta {
            root,
            limits: self.limits.clone(),
            max_depth_reached: state.max_depth_reached,
            node_count: state.node_count,
            non_coinjoin_streak: state.last_streak,
            elapsed: state.started.elapsed(),
            termination: state.termination(),
        }
    }
}

fn leaf(tx: Transaction, verdict: Verdict, depth: usize) -> TraceNode {
    TraceNode::Expanded {
        tx,
        verdict,
        depth,
        children: Vec::new(),
    }
}

// ==============================================================================
// Tests
// ==============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassifierConfig;
    use crate::explorer::mock::MockExplorer;
    use crate::store::mock::{Edge, MemoryStore};
    use crate::test_util::{
        coinjoin_descendant, payment_tx, txid_from_byte, whirlpool_tx,
    };
    use crate::types::AddressTag;
    use std::time::Duration;

    fn classifier() -> Classifier {
        Classifier::new(ClassifierConfig::default(), None)
    }

    fn limits() -> TraceLimits {
        TraceLimits::default()
    }

    /// Depth of an investigation tree, counting edges from the root.
    fn tree_depth(node: &TraceNode) -> usize {
        node.children()
            .iter()
            .map(|child| 1 + tree_depth(child))
            .max()
            .unwrap_or(0)
    }

    fn count_expanded(node: &TraceNode) -> usize {
        match node {
            TraceNode::Expanded { children, .. } => {
                1 + children.iter().map(count_expanded).sum::<usize>()
            }
            _ => 0,
        }
    }

    #[tokio::test]
    async fn seed_with_no_spent_outputs_exhausts() {
        let seed = whirlpool_tx(txid_from_byte(1), 5, 1_000_000);
        let explorer = MockExplorer::builder().with_tx(seed).build();
        let cache = TxCache::new();
        let classifier = classifier();
        let store = MemoryStore::new();
        let tracer = Tracer::new(&explorer, &cache, &classifier, &store, limits(), 4);

        let investigation = tracer.trace_tx(txid_from_byte(1)).await.expect("trace");
        assert_eq!(investigation.roots.len(), 1);
        assert_eq!(investigation.meta.node_count, 1);
        assert_eq!(
            investigation.meta.termination,
            TerminationReason::Exhausted
        );
        assert!(investigation.roots[0].children().is_empty());
    }

    #[tokio::test]
    async fn depth_cap_prunes_an_endless_chain() {
        // seed -> d1 -> d2 -> d3 -> d4, every hop a positive CoinJoin.
        let seed = whirlpool_tx(txid_from_byte(1), 5, 1_000_000);
        let mut txs = vec![seed];
        for level in 0..4u8 {
            let parent = txs[level as usize].txid;
            txs.push(coinjoin_descendant(txid_from_byte(10 + level), parent, 0));
        }

        let mut builder = MockExplorer::builder();
        for tx in txs {
            builder = builder.with_tx(tx);
        }
        let explorer = builder.build();
        let cache = TxCache::new();
        let classifier = classifier();
        let store = MemoryStore::new();
        let tracer = Tracer::new(
            &explorer,
            &cache,
            &classifier,
            &store,
            TraceLimits {
                max_depth: 3,
                ..limits()
            },
            4,
        );

        let investigation = tracer.trace_tx(txid_from_byte(1)).await.expect("trace");
        assert_eq!(investigation.meta.termination, TerminationReason::Depth);
        assert_eq!(tree_depth(&investigation.roots[0]), 3);
        assert_eq!(investigation.meta.max_depth_reached, 3);
    }

    #[tokio::test]
    async fn cycle_becomes_a_reference_leaf() {
        // a and b spend each other's first output.
        let a = coinjoin_descendant(txid_from_byte(1), txid_from_byte(2), 0);
        let b = coinjoin_descendant(txid_from_byte(2), txid_from_byte(1), 0);
        let explorer = MockExplorer::builder().with_tx(a).with_tx(b).build();
        let cache = TxCache::new();
        let classifier = classifier();
        let store = MemoryStore::new();
        let tracer = Tracer::new(&explorer, &cache, &classifier, &store, limits(), 4);

        let investigation = tracer.trace_tx(txid_from_byte(1)).await.expect("trace");
        let root = &investigation.roots[0];
        assert_eq!(root.children().len(), 1);
        let child = &root.children()[0];
        assert_eq!(child.txid(), txid_from_byte(2));
        assert!(matches!(
            child.children()[0],
            TraceNode::Reference { txid } if txid == txid_from_byte(1)
        ));
        // The seed is expanded exactly once.
        assert_eq!(count_expanded(root), 2);
    }

    #[tokio::test]
    async fn non_coinjoin_streak_stops_the_path() {
        // Positive seed, then a chain of ordinary payments.
        let seed = whirlpool_tx(txid_from_byte(1), 5, 1_000_000);
        let p1 = payment_tx(txid_from_byte(10), seed.txid, "bc1qa", "bc1qb", 900_000);
        let p2 = payment_tx(txid_from_byte(11), p1.txid, "bc1qc", "bc1qd", 800_000);
        let p3 = payment_tx(txid_from_byte(12), p2.txid, "bc1qe", "bc1qf", 700_000);
        let explorer = MockExplorer::builder()
            .with_tx(seed)
            .with_tx(p1)
            .with_tx(p2)
            .with_tx(p3)
            .build();
        let cache = TxCache::new();
        let classifier = classifier();
        let store = MemoryStore::new();
        let tracer = Tracer::new(
            &explorer,
            &cache,
            &classifier,
            &store,
            TraceLimits {
                consecutive_non_coinjoin_limit: 2,
                ..limits()
            },
            4,
        );

        let investigation = tracer.trace_tx(txid_from_byte(1)).await.expect("trace");
        assert_eq!(
            investigation.meta.termination,
            TerminationReason::NonCoinjoinStreak
        );
        assert_eq!(investigation.meta.non_coinjoin_streak, 2);

        // The node that tipped the counter (p2) is still in the tree,
        // unexpanded; p3 is not.
        let root = &investigation.roots[0];
        let p1_node = &root.children()[0];
        let p2_node = &p1_node.children()[0];
        assert_eq!(p2_node.txid(), txid_from_byte(11));
        assert!(p2_node.children().is_empty());
    }

    #[tokio::test]
    async fn node_budget_caps_the_run() {
        let seed = whirlpool_tx(txid_from_byte(1), 5, 1_000_000);
        let mut builder = MockExplorer::builder();
        let mut parent = seed.txid;
        builder = builder.with_tx(seed);
        for level in 0..10u8 {
            let tx = coinjoin_descendant(txid_from_byte(10 + level), parent, 0);
            parent = tx.txid;
            builder = builder.with_tx(tx);
        }
        let explorer = builder.build();
        let cache = TxCache::new();
        let classifier = classifier();
        let store = MemoryStore::new();
        let tracer = Tracer::new(
            &explorer,
            &cache,
            &classifier,
            &store,
            TraceLimits {
                max_total_nodes: 4,
                ..limits()
            },
            4,
        );

        let investigation = tracer.trace_tx(txid_from_byte(1)).await.expect("trace");
        assert_eq!(investigation.meta.termination, TerminationReason::NodeBudget);
        assert_eq!(investigation.meta.node_count, 4);
    }

    #[tokio::test]
    async fn zero_wall_clock_times_out_immediately() {
        let seed = whirlpool_tx(txid_from_byte(1), 5, 1_000_000);
        let child = coinjoin_descendant(txid_from_byte(2), txid_from_byte(1), 0);
        let explorer = MockExplorer::builder().with_tx(seed).with_tx(child).build();
        let cache = TxCache::new();
        let classifier = classifier();
        let store = MemoryStore::new();
        let tracer = Tracer::new(
            &explorer,
            &cache,
            &classifier,
            &store,
            TraceLimits {
                max_wall_clock: Duration::ZERO,
                ..limits()
            },
            4,
        );

        let investigation = tracer.trace_tx(txid_from_byte(1)).await.expect("trace");
        assert_eq!(investigation.meta.termination, TerminationReason::Timeout);
        assert_eq!(investigation.meta.node_count, 1);
    }

    #[tokio::test]
    async fn branch_selection_puts_positives_first() {
        // Seed with three spent outputs: one positive child, two payments.
        let seed = whirlpool_tx(txid_from_byte(1), 5, 1_000_000);
        let positive = coinjoin_descendant(txid_from_byte(0x30), seed.txid, 2);
        let negative_a = payment_tx(txid_from_byte(0x10), seed.txid, "bc1qa", "bc1qb", 900_000);
        let negative_b = {
            // Spend output 1 instead of 0.
            let mut tx = payment_tx(txid_from_byte(0x20), seed.txid, "bc1qc", "bc1qd", 850_000);
            tx.inputs[0].prevout = Some(bitcoin::OutPoint::new(seed.txid, 1));
            tx
        };

        let explorer = MockExplorer::builder()
            .with_tx(seed)
            .with_tx(positive)
            .with_tx(negative_a)
            .with_tx(negative_b)
            .build();
        let cache = TxCache::new();
        let classifier = classifier();
        let store = MemoryStore::new();
        let tracer = Tracer::new(&explorer, &cache, &classifier, &store, limits(), 4);

        let investigation = tracer.trace_tx(txid_from_byte(1)).await.expect("trace");
        let children = investigation.roots[0].children();
        assert_eq!(children.len(), 3);
        assert_eq!(children[0].txid(), txid_from_byte(0x30), "positive first");

        // The two equal-score negatives are ordered by ascending txid.
        let mut expected = vec![txid_from_byte(0x10), txid_from_byte(0x20)];
        expected.sort_unstable();
        assert_eq!(children[1].txid(), expected[0]);
        assert_eq!(children[2].txid(), expected[1]);
    }

    #[tokio::test]
    async fn branch_cap_limits_children() {
        let seed = whirlpool_tx(txid_from_byte(1), 5, 1_000_000);
        let mut builder = MockExplorer::builder().with_tx(seed.clone());
        for vout in 0..5u8 {
            builder = builder.with_tx(coinjoin_descendant(
                txid_from_byte(0x40 + vout),
                seed.txid,
                vout as u32,
            ));
        }
        let explorer = builder.build();
        let cache = TxCache::new();
        let classifier = classifier();
        let store = MemoryStore::new();
        let tracer = Tracer::new(
            &explorer,
            &cache,
            &classifier,
            &store,
            TraceLimits {
                max_branches_per_node: 2,
                max_depth: 1,
                ..limits()
            },
            4,
        );

        let investigation = tracer.trace_tx(txid_from_byte(1)).await.expect("trace");
        assert_eq!(investigation.roots[0].children().len(), 2);
    }

    #[tokio::test]
    async fn unavailable_seed_fails_without_partial_persistence() {
        let explorer = MockExplorer::builder()
            .with_unavailable_tx(txid_from_byte(1))
            .build();
        let cache = TxCache::new();
        let classifier = classifier();
        let store = MemoryStore::new();
        let tracer = Tracer::new(&explorer, &cache, &classifier, &store, limits(), 4);

        let err = tracer
            .trace_tx(txid_from_byte(1))
            .await
            .expect_err("unavailable seed fails");
        assert!(matches!(err, CoreError::UpstreamUnavailable(_)));
        assert_eq!(store.tx_count(), 0);
    }

    #[tokio::test]
    async fn missing_seed_is_not_found() {
        let explorer = MockExplorer::builder().build();
        let cache = TxCache::new();
        let classifier = classifier();
        let store = MemoryStore::new();
        let tracer = Tracer::new(&explorer, &cache, &classifier, &store, limits(), 4);

        let err = tracer
            .trace_tx(txid_from_byte(1))
            .await
            .expect_err("missing seed fails");
        assert!(matches!(err, CoreError::TxNotFound(txid) if txid == txid_from_byte(1)));
    }

    #[tokio::test]
    async fn unfetchable_child_becomes_terminal_leaf() {
        let seed = whirlpool_tx(txid_from_byte(1), 5, 1_000_000);
        let ghost = txid_from_byte(0x66);
        let explorer = MockExplorer::builder()
            .with_tx(seed)
            .with_outspend(txid_from_byte(1), 0, ghost)
            .build();
        let cache = TxCache::new();
        let classifier = classifier();
        let store = MemoryStore::new();
        let tracer = Tracer::new(&explorer, &cache, &classifier, &store, limits(), 4);

        let investigation = tracer.trace_tx(txid_from_byte(1)).await.expect("trace");
        let children = investigation.roots[0].children();
        assert_eq!(children.len(), 1);
        assert!(matches!(
            &children[0],
            TraceNode::Unavailable { txid, .. } if *txid == ghost
        ));
        assert_eq!(
            investigation.meta.termination,
            TerminationReason::Exhausted
        );
    }

    #[tokio::test]
    async fn positive_descendants_are_persisted_and_related_to_seed() {
        let seed = whirlpool_tx(txid_from_byte(1), 5, 1_000_000);
        let child = coinjoin_descendant(txid_from_byte(2), seed.txid, 0);
        let child_input_address = child.inputs[0]
            .address
            .clone()
            .expect("descendant input has an address");
        let seed_input_address = seed.inputs[0]
            .address
            .clone()
            .expect("seed input has an address");

        let explorer = MockExplorer::builder().with_tx(seed).with_tx(child).build();
        let cache = TxCache::new();
        let classifier = classifier();
        let store = MemoryStore::new();
        let tracer = Tracer::new(&explorer, &cache, &classifier, &store, limits(), 4);

        tracer.trace_tx(txid_from_byte(1)).await.expect("trace");

        assert_eq!(store.tx_count(), 2);
        assert_eq!(
            store.tag_of(&seed_input_address),
            Some(AddressTag::Coinjoin),
            "seed participants are tagged coinjoin"
        );
        assert_eq!(
            store.tag_of(&child_input_address),
            Some(AddressTag::Related),
            "traced descendants start as related"
        );
        assert!(store.has_edge(&Edge::RelatedTo(
            child_input_address,
            txid_from_byte(1)
        )));
    }

    #[tokio::test]
    async fn negative_descendants_are_not_persisted() {
        let seed = whirlpool_tx(txid_from_byte(1), 5, 1_000_000);
        let payment = payment_tx(txid_from_byte(2), seed.txid, "bc1qa", "bc1qb", 900_000);
        let explorer = MockExplorer::builder().with_tx(seed).with_tx(payment).build();
        let cache = TxCache::new();
        let classifier = classifier();
        let store = MemoryStore::new();
        let tracer = Tracer::new(&explorer, &cache, &classifier, &store, limits(), 4);

        tracer.trace_tx(txid_from_byte(1)).await.expect("trace");
        assert_eq!(store.tx_count(), 1, "only the seed is persisted");
        assert!(store.tag_of("bc1qa").is_none());
    }

    #[tokio::test]
    async fn store_failure_aborts_the_investigation() {
        let seed = whirlpool_tx(txid_from_byte(1), 5, 1_000_000);
        let explorer = MockExplorer::builder().with_tx(seed).build();
        let cache = TxCache::new();
        let classifier = classifier();
        let store = MemoryStore::new();
        store.set_failing(true);
        let tracer = Tracer::new(&explorer, &cache, &classifier, &store, limits(), 4);

        let err = tracer
            .trace_tx(txid_from_byte(1))
            .await
            .expect_err("failing store aborts");
        assert!(matches!(err, CoreError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn address_seed_fans_out_virtual_roots() {
        let cj = whirlpool_tx(txid_from_byte(1), 5, 1_000_000);
        let payment = payment_tx(txid_from_byte(2), txid_from_byte(9), "bc1qa", "bc1qb", 50_000);
        let explorer = MockExplorer::builder()
            .with_tx(cj)
            .with_tx(payment)
            .with_address_txs("bc1qseed", vec![txid_from_byte(1), txid_from_byte(2)])
            .build();
        let cache = TxCache::new();
        let classifier = classifier();
        let store = MemoryStore::new();
        let tracer = Tracer::new(&explorer, &cache, &classifier, &store, limits(), 4);

        let investigation = tracer.trace_address("bc1qseed").await.expect("trace");
        assert_eq!(investigation.roots.len(), 2);
        assert!(matches!(
            investigation.meta.root,
            TraceRoot::Address(ref address) if address == "bc1qseed"
        ));
        // Both virtual roots are persisted seed-style.
        assert_eq!(store.tx_count(), 2);
    }

    #[tokio::test]
    async fn address_seed_respects_tx_cap() {
        let mut builder = MockExplorer::builder();
        let mut txids = Vec::new();
        for byte in 1..=6u8 {
            let tx = payment_tx(
                txid_from_byte(byte),
                txid_from_byte(100 + byte),
                "bc1qa",
                "bc1qb",
                10_000,
            );
            txids.push(tx.txid);
            builder = builder.with_tx(tx);
        }
        let explorer = builder.with_address_txs("bc1qbusy", txids).build();
        let cache = TxCache::new();
        let classifier = classifier();
        let store = MemoryStore::new();
        let tracer = Tracer::new(
            &explorer,
            &cache,
            &classifier,
            &store,
            TraceLimits {
                max_txs_per_address: 3,
                ..limits()
            },
            4,
        );

        let investigation = tracer.trace_address("bc1qbusy").await.expect("trace");
        assert_eq!(investigation.roots.len(), 3);
    }

    #[tokio::test]
    async fn unknown_address_yields_empty_investigation() {
        let explorer = MockExplorer::builder().build();
        let cache = TxCache::new();
        let classifier = classifier();
        let store = MemoryStore::new();
        let tracer = Tracer::new(&explorer, &cache, &classifier, &store, limits(), 4);

        let investigation = tracer.trace_address("bc1qnowhere").await.expect("trace");
        assert!(investigation.roots.is_empty());
        assert_eq!(
            investigation.meta.termination,
            TerminationReason::Exhausted
        );
    }

    #[tokio::test]
    async fn caps_hold_under_default_limits() {
        // A two-level fan-out of positive descendants.
        let seed = whirlpool_tx(txid_from_byte(1), 5, 1_000_000);
        let mut builder = MockExplorer::builder().with_tx(seed.clone());
        for vout in 0..3u8 {
            let child = coinjoin_descendant(txid_from_byte(0x10 + vout), seed.txid, vout as u32);
            for grand_vout in 0..2u8 {
                builder = builder.with_tx(coinjoin_descendant(
                    txid_from_byte(0x80 + vout * 4 + grand_vout),
                    child.txid,
                    grand_vout as u32,
                ));
            }
            builder = builder.with_tx(child);
        }
        let explorer = builder.build();
        let cache = TxCache::new();
        let classifier = classifier();
        let store = MemoryStore::new();
        let the_limits = limits();
        let tracer = Tracer::new(&explorer, &cache, &classifier, &store, the_limits.clone(), 4);

        let investigation = tracer.trace_tx(txid_from_byte(1)).await.expect("trace");
        assert!(investigation.meta.node_count <= the_limits.max_total_nodes);
        assert!(investigation.meta.max_depth_reached <= the_limits.max_depth);
        fn assert_branch_cap(node: &TraceNode, cap: usize) {
            assert!(node.children().len() <= cap);
            for child in node.children() {
                assert_branch_cap(child, cap);
            }
        }
        assert_branch_cap(&investigation.roots[0], the_limits.max_branches_per_node);
    }
}
