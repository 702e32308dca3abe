//! Domain types for mixtrail's detection and tracing model.
//!
//! Contains the explorer-shaped transaction types (`Transaction`, `TxInput`,
//! `TxOutput`), classification verdicts (`Verdict`, `Indicators`), the
//! investigation tree (`TraceNode`, `TraceMeta`, `Investigation`), address
//! tagging, and the tracer's limit set.

use std::time::Duration;

use bitcoin::{Amount, OutPoint, Txid};
use serde::{Deserialize, Serialize};

// ==============================================================================
// Transaction Types
// ==============================================================================

/// A transaction as observed through the explorer. Immutable once fetched;
/// the txid is the identity and two bodies with the same txid are
/// interchangeable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: Txid,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub fee: Amount,
    /// Serialized size in bytes.
    pub size: u64,
}

impl Transaction {
    /// Distinct addresses appearing on the input side.
    pub fn unique_input_addresses(&self) -> usize {
        let mut seen: Vec<&str> = self
            .inputs
            .iter()
            .filter_map(|input| input.address.as_deref())
            .collect();
        seen.sort_unstable();
        seen.dedup();
        seen.len()
    }

    /// Distinct addresses appearing on the output side.
    pub fn unique_output_addresses(&self) -> usize {
        let mut seen: Vec<&str> = self
            .outputs
            .iter()
            .filter_map(|output| output.address.as_deref())
            .collect();
        seen.sort_unstable();
        seen.dedup();
        seen.len()
    }

    /// Number of distinct output values.
    pub fn distinct_output_values(&self) -> usize {
        let mut values: Vec<Amount> = self.outputs.iter().map(|output| output.value).collect();
        values.sort_unstable();
        values.dedup();
        values.len()
    }
}

/// A transaction input carrying the spent outpoint and the resolved
/// funding address and value. `prevout` is `None` for coinbase inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxInput {
    pub prevout: Option<OutPoint>,
    /// Canonical string form of the funding address, when the funding
    /// script has one.
    pub address: Option<String>,
    pub value: Option<Amount>,
}

/// A transaction output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxOutput {
    /// Canonical string form; `None` for outputs without an address form
    /// (e.g. op_return).
    pub address: Option<String>,
    pub value: Amount,
}

/// One page of an address's transaction history plus the cursor for the
/// next page, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressPage {
    pub txids: Vec<Txid>,
    pub next_cursor: Option<Txid>,
}

// ==============================================================================
// Classification Verdict
// ==============================================================================

/// Which detector produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Heuristic,
    Ml,
    Combined,
    Wasabi,
    Samourai,
}

impl std::fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Heuristic => write!(f, "heuristic"),
            Self::Ml => write!(f, "ml"),
            Self::Combined => write!(f, "combined"),
            Self::Wasabi => write!(f, "wasabi"),
            Self::Samourai => write!(f, "samourai"),
        }
    }
}

/// Coarse size bucket used as a structural indicator and ML feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    pub fn from_bytes(size: u64) -> Self {
        match size {
            0..=249 => Self::Small,
            250..=999 => Self::Medium,
            _ => Self::Large,
        }
    }
}

/// Structural indicators computed from a transaction body alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Indicators {
    pub input_count: usize,
    pub output_count: usize,
    pub unique_input_addresses: usize,
    pub unique_output_addresses: usize,
    pub distinct_output_values: usize,
    /// Degree to which output values cluster, in [0, 1].
    pub output_uniformity: f64,
    /// Unique input addresses relative to input count, in [0, 1].
    pub input_diversity: f64,
    pub size_class: SizeClass,
}

/// The ML detector's contribution to a verdict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MlAssessment {
    /// Model output in [0, 1].
    pub probability: f64,
    /// Threshold the probability was compared against.
    pub threshold: f64,
}

/// A classification verdict for a single transaction.
///
/// `ml` is present exactly when the ML detector ran, which is the case
/// whenever `detection_method` is `ml` or `combined`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub is_coinjoin: bool,
    pub detection_method: DetectionMethod,
    pub score: f64,
    /// Human-readable contributing indicators, in accumulation order.
    pub reasons: Vec<String>,
    pub indicators: Indicators,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ml: Option<MlAssessment>,
}

// ==============================================================================
// Address Tagging
// ==============================================================================

/// Classification tag attached to an Address node in the graph store.
///
/// The derived ordering makes promotion a `max`: `related < coinjoin`, and
/// an address once tagged `coinjoin` is never downgraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressTag {
    Related,
    Coinjoin,
}

impl AddressTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Related => "related",
            Self::Coinjoin => "coinjoin",
        }
    }
}

impl std::fmt::Display for AddressTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==============================================================================
// Investigation Tree
// ==============================================================================

/// A node in an investigation tree.
///
/// The tree is a tree, not a DAG: a txid reached a second time within a
/// run appears as a `Reference` leaf and is never re-expanded. Descendants
/// whose bodies could not be fetched for a permanent reason appear as
/// `Unavailable` leaves with the reason recorded.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceNode {
    Expanded {
        tx: Transaction,
        verdict: Verdict,
        depth: usize,
        children: Vec<TraceNode>,
    },
    Reference {
        txid: Txid,
    },
    Unavailable {
        txid: Txid,
        reason: String,
    },
}

impl TraceNode {
    pub fn txid(&self) -> Txid {
        match self {
            Self::Expanded { tx, .. } => tx.txid,
            Self::Reference { txid } | Self::Unavailable { txid, .. } => *txid,
        }
    }

    /// Children of an expanded node; empty for leaves.
    pub fn children(&self) -> &[TraceNode] {
        match self {
            Self::Expanded { children, .. } => children,
            _ => &[],
        }
    }
}

/// What the investigation was seeded with.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceRoot {
    Tx(Txid),
    Address(String),
}

/// Why an investigation stopped expanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// No more unspent-output frontiers to follow.
    Exhausted,
    /// The depth cap pruned at least one frontier.
    Depth,
    /// The total-node budget was reached.
    NodeBudget,
    /// The wall-clock deadline passed.
    Timeout,
    /// A DFS path accumulated the configured run of non-CoinJoin verdicts.
    NonCoinjoinStreak,
}

/// Per-run investigation metadata.
#[derive(Debug, Clone, Serialize)]
pub struct TraceMeta {
    pub root: TraceRoot,
    pub limits: TraceLimits,
    pub max_depth_reached: usize,
    /// Expanded nodes in the tree (references and unavailable leaves are
    /// not counted against the node budget).
    pub node_count: usize,
    /// Value of the consecutive-non-CoinJoin counter at termination.
    pub non_coinjoin_streak: usize,
    pub elapsed: Duration,
    pub termination: TerminationReason,
}

/// A completed investigation: the tree (one root for txid seeds, up to
/// `max_txs_per_address` virtual roots for address seeds) plus metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Investigation {
    pub roots: Vec<TraceNode>,
    pub meta: TraceMeta,
}

// ==============================================================================
// Tracer Limits
// ==============================================================================

/// Configurable stopping policy for an investigation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceLimits {
    pub max_depth: usize,
    pub max_branches_per_node: usize,
    pub max_total_nodes: usize,
    pub max_wall_clock: Duration,
    pub consecutive_non_coinjoin_limit: usize,
    pub max_outputs_per_tx: usize,
    pub max_txs_per_address: usize,
}

impl Default for TraceLimits {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_branches_per_node: 5,
            max_total_nodes: 200,
            max_wall_clock: Duration::from_secs(60),
            consecutive_non_coinjoin_limit: 3,
            max_outputs_per_tx: 20,
            max_txs_per_address: 10,
        }
    }
}
