//! Adapter around a pre-trained binary CoinJoin classifier.
//!
//! The model is a logistic regression exported as a JSON weights file
//! (`{"weights": [...], "bias": ...}`). Features are derived exclusively
//! from the transaction body; inference performs no I/O.

use std::path::Path;

use crate::error::CoreError;
use crate::types::{Indicators, Transaction};

/// Number of features the model consumes. A weights file with a different
/// arity is rejected at load time.
pub const FEATURE_COUNT: usize = 8;

#[derive(serde::Deserialize)]
struct ModelFile {
    weights: Vec<f64>,
    bias: f64,
}

/// A loaded model plus the configured decision threshold.
#[derive(Debug)]
pub struct MlDetector {
    weights: [f64; FEATURE_COUNT],
    bias: f64,
    threshold: f64,
}

impl MlDetector {
    /// Load a weights file. The threshold comes from configuration, not
    /// from the file, so operators can tune it without re-exporting.
    pub fn load(path: &Path, threshold: f64) -> Result<Self, CoreError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(CoreError::InvalidConfig(format!(
                "ml_threshold must be in [0, 1], got {threshold}"
            )));
        }

        let raw = std::fs::read_to_string(path)?;
        let model: ModelFile = serde_json::from_str(&raw)
            .map_err(|e| CoreError::InvalidConfig(format!("ml model {}: {e}", path.display())))?;
        let weights: [f64; FEATURE_COUNT] = model.weights.try_into().map_err(|v: Vec<f64>| {
            CoreError::InvalidConfig(format!(
                "ml model {} expects {FEATURE_COUNT} weights, got {}",
                path.display(),
                v.len()
            ))
        })?;

        Ok(Self {
            weights,
            bias: model.bias,
            threshold,
        })
    }

    /// Construct a model directly from its parameters.
    pub fn from_parts(weights: [f64; FEATURE_COUNT], bias: f64, threshold: f64) -> Self {
        Self {
            weights,
            bias,
            threshold,
        }
    }

    /// Feature vector for a transaction body. Count features stay raw;
    /// the uniformity and diversity scalars are already in [0, 1].
    pub fn features(tx: &Transaction, indicators: &Indicators) -> [f64; FEATURE_COUNT] {
        [
            indicators.input_count as f64,
            indicators.output_count as f64,
            indicators.unique_input_addresses as f64,
            indicators.unique_output_addresses as f64,
            indicators.distinct_output_values as f64,
            indicators.output_uniformity,
            indicators.input_diversity,
            tx.size as f64,
        ]
    }

    /// Probability in [0, 1] that the transaction is a CoinJoin.
    #[must_use]
    pub fn predict(&self, features: &[f64; FEATURE_COUNT]) -> f64 {
        let z: f64 = self
            .weights
            .iter()
            .zip(features)
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.bias;
        sigmoid(z)
    }

    pub fn is_positive(&self, probability: f64) -> bool {
        probability >= self.threshold
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

// ==============================================================================
// Tests
// ==============================================================================
