//! The structured configuration document.
//!
//! One section per subsystem, loaded from a TOML file. Every field has a
//! documented default; a missing file yields the all-defaults
//! configuration, and unknown keys are rejected at load time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::CoreError;
use crate::types::TraceLimits;

// ==============================================================================
// Top-Level Document
// ==============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub explorer: ExplorerConfig,
    pub classifier: ClassifierConfig,
    pub tracer: TracerConfig,
    pub monitor: MonitorConfig,
    pub cache: CacheConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Load a configuration document from a TOML file.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| {
            CoreError::InvalidConfig(format!("{}: {e}", path.display()))
        })
    }
}

// ==============================================================================
// Explorer Section
// ==============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExplorerConfig {
    /// Base URL of the esplora-compatible HTTP API.
    pub base_url: String,
    /// Minimum interval between outbound requests. 0 disables pacing.
    pub min_request_interval_ms: u64,
    /// Maximum concurrent in-flight requests.
    pub max_in_flight: usize,
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Attempts per call for transient failures (including the first).
    pub retry_attempts: u32,
    /// Base delay of the capped exponential backoff.
    pub retry_base_delay_ms: u64,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://blockstream.info/api".to_owned(),
            min_request_interval_ms: 100,
            max_in_flight: 8,
            timeout_secs: 30,
            retry_attempts: 3,
            retry_base_delay_ms: 200,
        }
    }
}

// ==============================================================================
// Classifier Section
// ==============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierConfig {
    /// Base score above which the heuristic verdict is positive.
    pub score_threshold: f64,
    pub weights: IndicatorWeights,
    /// Inputs at or above this count set the "many inputs" indicator.
    pub min_inputs: usize,
    /// Outputs at or above this count set the "many outputs" indicator.
    pub min_outputs: usize,
    /// At most this many distinct output values sets the uniformity
    /// indicator.
    pub max_distinct_output_values: usize,
    /// More unique input addresses than this sets the diversity indicator.
    pub min_unique_input_addresses: usize,
    /// vin + vout strictly above this sets the "large transaction"
    /// indicator.
    pub large_tx_total: usize,
    /// Equal-value outputs required for the Wasabi pattern.
    pub wasabi_min_equal_outputs: usize,
    /// Canonical Wasabi denomination (0.1 BTC); round multiples also match.
    pub wasabi_base_denomination_sat: u64,
    /// Absolute distance from a round multiple still considered "close".
    pub wasabi_denomination_tolerance_sat: u64,
    /// Known Whirlpool pool denominations. Deployment-specific.
    pub whirlpool_denominations_sat: Vec<u64>,
    /// Weights file for the ML detector; absent means heuristic-only.
    pub ml_model_path: Option<PathBuf>,
    /// Probability at or above which the ML detector is positive.
    pub ml_threshold: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.6,
            weights: IndicatorWeights::default(),
            min_inputs: 5,
            min_outputs: 5,
            max_distinct_output_values: 3,
            min_unique_input_addresses: 3,
            large_tx_total: 10,
            wasabi_min_equal_outputs: 5,
            wasabi_base_denomination_sat: 10_000_000,
            wasabi_denomination_tolerance_sat: 50_000,
            whirlpool_denominations_sat: vec![100_000, 1_000_000, 5_000_000, 50_000_000],
            ml_model_path: None,
            ml_threshold: 0.5,
        }
    }
}

/// Score contribution of each indicator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndicatorWeights {
    pub many_inputs: f64,
    pub many_outputs: f64,
    pub output_uniformity: f64,
    pub input_diversity: f64,
    pub large_transaction: f64,
    /// Added when the Wasabi pattern fires.
    pub wasabi_pattern: f64,
    /// Added when the Samourai/Whirlpool pattern fires.
    pub samourai_pattern: f64,
}

impl Default for IndicatorWeights {
    fn default() -> Self {
        Self {
            many_inputs: 0.20,
            many_outputs: 0.20,
            output_uniformity: 0.30,
            input_diversity: 0.20,
            large_transaction: 0.10,
            wasabi_pattern: 0.50,
            samourai_pattern: 0.50,
        }
    }
}

// ==============================================================================
// Tracer Section
// ==============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TracerConfig {
    pub max_depth: usize,
    pub max_branches_per_node: usize,
    pub max_total_nodes: usize,
    pub max_wall_clock_secs: u64,
    pub consecutive_non_coinjoin_limit: usize,
    pub max_outputs_per_tx: usize,
    pub max_txs_per_address: usize,
    /// Concurrent child-body fetches per investigation.
    pub fetch_concurrency: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        let limits = TraceLimits::default();
        Self {
            max_depth: limits.max_depth,
            max_branches_per_node: limits.max_branches_per_node,
            max_total_nodes: limits.max_total_nodes,
            max_wall_clock_secs: limits.max_wall_clock.as_secs(),
            consecutive_non_coinjoin_limit: limits.consecutive_non_coinjoin_limit,
            max_outputs_per_tx: limits.max_outputs_per_tx,
            max_txs_per_address: limits.max_txs_per_address,
            fetch_concurrency: 4,
        }
    }
}

impl TracerConfig {
    pub fn limits(&self) -> TraceLimits {
        TraceLimits {
            max_depth: self.max_depth,
            max_branches_per_node: self.max_branches_per_node,
            max_total_nodes: self.max_total_nodes,
            max_wall_clock: Duration::from_secs(self.max_wall_clock_secs),
            consecutive_non_coinjoin_limit: self.consecutive_non_coinjoin_limit,
            max_outputs_per_tx: self.max_outputs_per_tx,
            max_txs_per_address: self.max_txs_per_address,
        }
    }
}

// ==============================================================================
// Monitor Section
// ==============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub tick_interval_ms: u64,
    /// Bounded worker-pool size for per-tick candidate processing.
    pub workers: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            workers: 8,
        }
    }
}

// ==============================================================================
// Cache Section
// ==============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub tx_capacity: usize,
    pub address_capacity: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tx_capacity: 10_000,
            address_capacity: 1_000,
            ttl_secs: 600,
        }
    }
}

// ==============================================================================
// Store Section
// ==============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Base URL of the graph store's HTTP endpoint.
    pub uri: String,
    pub database: String,
    pub user: Option<String>,
    pub pass: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: "http://127.0.0.1:7474".to_owned(),
            database: "neo4j".to_owned(),
            user: None,
            pass: None,
        }
    }
}

// ==============================================================================
// Server Section
// ==============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Per-process cap on concurrent investigations.
    pub max_concurrent_investigations: usize,
    /// When true, requests beyond the cap are rejected with Busy instead
    /// of waiting for a slot.
    pub reject_when_busy: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_owned(),
            port: 3090,
            max_concurrent_investigations: 4,
            reject_when_busy: true,
        }
    }
}

// ==============================================================================
// Tests
// ==============================================================================
