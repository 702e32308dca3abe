//! CoinJoin classification.
//!
//! [`HeuristicDetector`] accumulates structural indicators, [`MlDetector`]
//! wraps an optional pre-trained model, and [`Classifier`] composes the
//! two into a single verdict. The classifier is pure given the inputs and
//! the loaded model; callers may memoise by txid.

pub mod heuristic;
pub mod ml;

pub use heuristic::HeuristicDetector;
pub use ml::MlDetector;

use tracing::info;

use crate::config::ClassifierConfig;
use crate::error::CoreError;
use crate::types::{DetectionMethod, MlAssessment, Transaction, Verdict};

/// Composes the heuristic and ML detectors.
///
/// Policy: a specialised pattern (Wasabi, Samourai) wins outright.
/// Otherwise, when a model is loaded, the verdict is positive iff the
/// heuristic base score clears its threshold or the ML probability clears
/// its own; `detection_method` is `combined` when both detectors agree,
/// else whichever fired. Without a model the heuristic verdict stands.
pub struct Classifier {
    config: ClassifierConfig,
    heuristic: HeuristicDetector,
    ml: Option<MlDetector>,
}

impl Classifier {
    /// Build a classifier from configuration, loading the ML model when
    /// one is configured.
    pub fn from_config(config: &ClassifierConfig) -> Result<Self, CoreError> {
        let ml = match &config.ml_model_path {
            Some(path) => {
                let model = MlDetector::load(path, config.ml_threshold)?;
                info!(path = %path.display(), threshold = config.ml_threshold, "loaded ml model");
                Some(model)
            }
            None => None,
        };
        Ok(Self::new(config.clone(), ml))
    }

    pub fn new(config: ClassifierConfig, ml: Option<MlDetector>) -> Self {
        Self {
            heuristic: HeuristicDetector::new(config.clone()),
            config,
            ml,
        }
    }

    pub fn ml_available(&self) -> bool {
        self.ml.is_some()
    }

    #[must_use]
    pub fn classify(&self, tx: &Transaction) -> Verdict {
        let mut verdict = self.heuristic.classify(tx);

        // A specialised detector is decisive on its own.
        if matches!(
            verdict.detection_method,
            DetectionMethod::Wasabi | DetectionMethod::Samourai
        ) {
            return verdict;
        }

        let Some(ml) = &self.ml else {
            return verdict;
        };

        let features = MlDetector::features(tx, &verdict.indicators);
        let probability = ml.predict(&features);
        let ml_positive = ml.is_positive(probability);
        let heuristic_positive = verdict.score > self.config.score_threshold;

        verdict.is_coinjoin = heuristic_positive || ml_positive;
        match (heuristic_positive, ml_positive) {
            // The heuristic alone carried the verdict; the ml assessment
            // is dropped so the method and the attached evidence agree.
            (true, false) => {
                verdict.detection_method = DetectionMethod::Heuristic;
            }
            (false, true) => {
                verdict.detection_method = DetectionMethod::Ml;
                verdict.reasons.push(format!(
                    "ml probability {probability:.3} >= threshold {}",
                    ml.threshold()
                ));
                verdict.ml = Some(MlAssessment {
                    probability,
                    threshold: ml.threshold(),
                });
            }
            (true, true) => {
                verdict.detection_method = DetectionMethod::Combined;
                verdict.reasons.push(format!(
                    "ml probability {probability:.3} >= threshold {}",
                    ml.threshold()
                ));
                verdict.ml = Some(MlAssessment {
                    probability,
                    threshold: ml.threshold(),
                });
            }
            // Both ran and both agree the transaction is ordinary.
            (false, false) => {
                verdict.detection_method = DetectionMethod::Combined;
                verdict.ml = Some(MlAssessment {
                    probability,
                    threshold: ml.threshold(),
                });
            }
        }

        verdict
    }
}

// ==============================================================================
// Tests
// ==============================================================================
