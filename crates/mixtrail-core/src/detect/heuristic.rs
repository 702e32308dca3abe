//! Heuristic CoinJoin detector.
//!
//! Pure and deterministic: a transaction body goes in, a verdict comes
//! out. No I/O happens here. Structural indicators accumulate a weighted
//! score; two specialised pattern detectors (Wasabi, Samourai/Whirlpool)
//! run on top and force a positive verdict when they fire.

use bitcoin::Amount;

use crate::config::ClassifierConfig;
use crate::types::{DetectionMethod, Indicators, SizeClass, Transaction, Verdict};

pub struct HeuristicDetector {
    config: ClassifierConfig,
}

impl HeuristicDetector {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Classify a transaction body. Reasons name every contributing
    /// indicator in accumulation order.
    #[must_use]
    pub fn classify(&self, tx: &Transaction) -> Verdict {
        let config = &self.config;
        let weights = &config.weights;
        let indicators = compute_indicators(tx);

        let mut score = 0.0;
        let mut reasons = Vec::new();

        if indicators.input_count >= config.min_inputs {
            score += weights.many_inputs;
            reasons.push(format!(
                "many inputs ({} >= {})",
                indicators.input_count, config.min_inputs
            ));
        }
        if indicators.output_count >= config.min_outputs {
            score += weights.many_outputs;
            reasons.push(format!(
                "many outputs ({} >= {})",
                indicators.output_count, config.min_outputs
            ));
        }
        if indicators.distinct_output_values <= config.max_distinct_output_values {
            score += weights.output_uniformity;
            reasons.push(format!(
                "output uniformity ({} distinct values)",
                indicators.distinct_output_values
            ));
        }
        if indicators.unique_input_addresses > config.min_unique_input_addresses {
            score += weights.input_diversity;
            reasons.push(format!(
                "input diversity ({} unique addresses)",
                indicators.unique_input_addresses
            ));
        }
        if indicators.input_count + indicators.output_count > config.large_tx_total {
            score += weights.large_transaction;
            reasons.push(format!(
                "large transaction ({} inputs + outputs)",
                indicators.input_count + indicators.output_count
            ));
        }

        // Specialised detectors. Whirlpool is the more specific shape, so
        // it takes precedence when both would match.
        let mut method = DetectionMethod::Heuristic;
        if let Some(denomination) = self.samourai_pattern(tx, &indicators) {
            score += weights.samourai_pattern;
            reasons.push(format!(
                "samourai whirlpool pattern ({}-in {}-out at {} sat)",
                indicators.input_count,
                indicators.output_count,
                denomination.to_sat()
            ));
            method = DetectionMethod::Samourai;
        } else if let Some((denomination, count)) = self.wasabi_pattern(tx) {
            score += weights.wasabi_pattern;
            reasons.push(format!(
                "wasabi denomination pattern ({count} outputs near {} sat)",
                denomination.to_sat()
            ));
            method = DetectionMethod::Wasabi;
        }

        let is_coinjoin =
            !matches!(method, DetectionMethod::Heuristic) || score > config.score_threshold;

        Verdict {
            is_coinjoin,
            detection_method: method,
            score,
            reasons,
            indicators,
            ml: None,
        }
    }

    /// Wasabi fingerprint: a dominant denomination close to a round
    /// multiple of 0.1 BTC, represented by at least the configured number
    /// of equal outputs, alongside at least one change output. A
    /// transaction whose outputs are *all* one value is Whirlpool-shaped,
    /// not Wasabi-shaped.
    fn wasabi_pattern(&self, tx: &Transaction) -> Option<(Amount, usize)> {
        let config = &self.config;
        let mut counts: Vec<(Amount, usize)> = Vec::new();
        for output in &tx.outputs {
            match counts.iter_mut().find(|(value, _)| *value == output.value) {
                Some((_, count)) => *count += 1,
                None => counts.push((output.value, 1)),
            }
        }

        counts
            .into_iter()
            .filter(|(value, count)| {
                *count >= config.wasabi_min_equal_outputs
                    && *count < tx.outputs.len()
                    && is_near_round_multiple(
                        value.to_sat(),
                        config.wasabi_base_denomination_sat,
                        config.wasabi_denomination_tolerance_sat,
                    )
            })
            .max_by_key(|(_, count)| *count)
    }

    /// Whirlpool fingerprint: equal input and output counts, a single
    /// output value, and that value is one of the known pool
    /// denominations.
    fn samourai_pattern(&self, tx: &Transaction, indicators: &Indicators) -> Option<Amount> {
        if indicators.input_count == 0
            || indicators.input_count != indicators.output_count
            || indicators.distinct_output_values != 1
        {
            return None;
        }

        let value = tx.outputs.first()?.value;
        self.config
            .whirlpool_denominations_sat
            .contains(&value.to_sat())
            .then_some(value)
    }
}

/// Whether `value` lies within `tolerance` of `k * base` for some k >= 1.
fn is_near_round_multiple(value: u64, base: u64, tolerance: u64) -> bool {
    if base == 0 || value + tolerance < base {
        return false;
    }
    let k = ((value + base / 2) / base).max(1);
    let multiple = k.saturating_mul(base);
    value.abs_diff(multiple) <= tolerance
}

/// Compute the structural indicators for a transaction body.
#[must_use]
pub fn compute_indicators(tx: &Transaction) -> Indicators {
    let input_count = tx.inputs.len();
    let output_count = tx.outputs.len();
    let unique_input_addresses = tx.unique_input_addresses();
    let unique_output_addresses = tx.unique_output_addresses();
    let distinct_output_values = tx.distinct_output_values();

    let output_uniformity = if output_count > 1 {
        (output_count - distinct_output_values) as f64 / (output_count - 1) as f64
    } else {
        0.0
    };
    let input_diversity = if input_count > 0 {
        unique_input_addresses as f64 / input_count as f64
    } else {
        0.0
    };

    Indicators {
        input_count,
        output_count,
        unique_input_addresses,
        unique_output_addresses,
        distinct_output_values,
        output_uniformity,
        input_diversity,
        size_class: SizeClass::from_bytes(tx.size),
    }
}

// ==============================================================================
// Tests
// ==============================================================================
