//! Trained regime model.
//!
//! A model bundle is four JSON artifacts in one version directory:
//!
//! - `model.json` — multinomial logistic weights and intercepts per class
//! - `scaler.json` — per-feature mean and scale for standardization
//! - `features.json` — ordered feature names the weights expect
//! - `metadata.json` — version string and training provenance
//!
//! Inputs are clipped to each feature's safe domain before scaling, so
//! drift in upstream values cannot push the model into extrapolation.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};

use super::ladder::LadderClassifier;
use super::{clip, component_scores, Classification, RegimeClassifier};
use crate::types::{clamp_unit, ComponentScores, IndicatorSnapshot, Regime, RegimeError, Strategy};

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub classes: Vec<Regime>,
    /// One row per class, one column per feature.
    pub weights: Vec<Vec<f64>>,
    pub intercepts: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub version: String,
    #[serde(default)]
    pub trained_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub training_samples: Option<u64>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Model inputs, named as they appear in `features.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    MarketScore,
    TrendScore,
    MomentumScore,
    VolatilityScore,
    BreadthScore,
    Breadth20,
    Breadth50,
    LogRatio,
}

impl Feature {
    /// Raw value for this feature, clipped to its safe domain.
    fn extract(self, snapshot: &IndicatorSnapshot, scores: &ComponentScores, max_ratio: f64) -> f64 {
        let log_cap = max_ratio.ln();
        match self {
            Feature::MarketScore => clip(scores.market, -1.0, 1.0, 0.0),
            Feature::TrendScore => clip(scores.trend, -1.0, 1.0, 0.0),
            Feature::MomentumScore => clip(scores.momentum, -1.0, 1.0, 0.0),
            Feature::VolatilityScore => clip(scores.volatility, 0.0, 1.0, 0.5),
            Feature::BreadthScore => clip(scores.breadth, -1.0, 1.0, 0.0),
            Feature::Breadth20 => clip(snapshot.breadth_20, 0.0, 100.0, 50.0),
            Feature::Breadth50 => clip(snapshot.breadth_50, 0.0, 100.0, 50.0),
            Feature::LogRatio => {
                let ratio = if snapshot.reversal_ratio > 0.0 { snapshot.reversal_ratio } else { 1.0 };
                clip(ratio.ln(), -log_cap, log_cap, 0.0)
            }
        }
    }
}

/// A complete, validated model version.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelBundle {
    pub model: LogisticModel,
    pub scaler: Scaler,
    pub features: Vec<Feature>,
    pub metadata: ModelMetadata,
}

fn read_artifact<T: DeserializeOwned>(dir: &Path, file: &str, version: &str) -> Result<T, RegimeError> {
    let path = dir.join(file);
    let raw = std::fs::read_to_string(&path).map_err(|e| RegimeError::ModelLoad {
        version: version.to_string(),
        message: format!("cannot read {}: {e}", path.display()),
    })?;
    serde_json::from_str(&raw).map_err(|e| RegimeError::ModelLoad {
        version: version.to_string(),
        message: format!("cannot parse {}: {e}", path.display()),
    })
}

impl ModelBundle {
    /// Load and validate the bundle stored in `dir`.
    pub fn load(dir: &Path, version: &str) -> Result<Self, RegimeError> {
        let bundle = Self {
            model: read_artifact(dir, "model.json", version)?,
            scaler: read_artifact(dir, "scaler.json", version)?,
            features: read_artifact(dir, "features.json", version)?,
            metadata: read_artifact(dir, "metadata.json", version)?,
        };
        bundle.validate()?;
        debug!(version, features = bundle.features.len(), "Model bundle loaded");
        Ok(bundle)
    }

    /// Write the bundle's artifacts into `dir`.
    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        use anyhow::Context;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let write = |file: &str, json: String| {
            std::fs::write(dir.join(file), json)
                .with_context(|| format!("Failed to write {file}"))
        };
        write("model.json", serde_json::to_string_pretty(&self.model)?)?;
        write("scaler.json", serde_json::to_string_pretty(&self.scaler)?)?;
        write("features.json", serde_json::to_string_pretty(&self.features)?)?;
        write("metadata.json", serde_json::to_string_pretty(&self.metadata)?)?;
        Ok(())
    }

    /// Check shapes and finiteness.
    pub fn validate(&self) -> Result<(), RegimeError> {
        let fail = |message: String| RegimeError::ModelLoad {
            version: self.metadata.version.clone(),
            message,
        };
        let n_features = self.features.len();
        let n_classes = self.model.classes.len();

        if n_features == 0 || n_classes < 2 {
            return Err(fail(format!("need features and ≥2 classes, got {n_features} features / {n_classes} classes")));
        }
        if self.model.classes.iter().collect::<HashSet<_>>().len() != n_classes {
            return Err(fail("duplicate classes".into()));
        }
        if self.features.iter().collect::<HashSet<_>>().len() != n_features {
            return Err(fail("duplicate features".into()));
        }
        if self.model.weights.len() != n_classes || self.model.intercepts.len() != n_classes {
            return Err(fail("weights/intercepts do not match class count".into()));
        }
        if self.model.weights.iter().any(|row| row.len() != n_features) {
            return Err(fail("weight row length does not match feature count".into()));
        }
        if self.scaler.mean.len() != n_features || self.scaler.scale.len() != n_features {
            return Err(fail("scaler does not match feature count".into()));
        }
        let all_finite = self.model.weights.iter().flatten()
            .chain(&self.model.intercepts)
            .chain(&self.scaler.mean)
            .chain(&self.scaler.scale)
            .all(|v| v.is_finite());
        if !all_finite {
            return Err(fail("non-finite parameter".into()));
        }
        Ok(())
    }

    /// Class probabilities for a snapshot, in `model.classes` order.
    pub fn predict_proba(
        &self,
        snapshot: &IndicatorSnapshot,
        scores: &ComponentScores,
        max_ratio: f64,
    ) -> Result<Vec<(Regime, f64)>, RegimeError> {
        let x: Vec<f64> = self.features.iter().enumerate()
            .map(|(i, f)| {
                let raw = f.extract(snapshot, scores, max_ratio);
                let scale = if self.scaler.scale[i].abs() < f64::EPSILON { 1.0 } else { self.scaler.scale[i] };
                (raw - self.scaler.mean[i]) / scale
            })
            .collect();

        let logits: Vec<f64> = self.model.weights.iter()
            .zip(&self.model.intercepts)
            .map(|(row, b)| row.iter().zip(&x).map(|(w, v)| w * v).sum::<f64>() + b)
            .collect();

        let max_logit = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = logits.iter().map(|l| (l - max_logit).exp()).collect();
        let total: f64 = exps.iter().sum();

        if !total.is_finite() || total <= 0.0 {
            return Err(RegimeError::ModelLoad {
                version: self.metadata.version.clone(),
                message: "non-finite model output".into(),
            });
        }

        Ok(self.model.classes.iter().copied()
            .zip(exps.into_iter().map(|e| e / total))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

pub struct ModelClassifier {
    bundle: ModelBundle,
    max_ratio: f64,
    fallback: LadderClassifier,
}

impl ModelClassifier {
    pub fn new(bundle: ModelBundle, max_ratio: f64) -> Self {
        Self {
            bundle,
            max_ratio,
            fallback: LadderClassifier::fallback(max_ratio),
        }
    }

    pub fn version(&self) -> &str {
        &self.bundle.metadata.version
    }
}

impl RegimeClassifier for ModelClassifier {
    fn classify(&self, snapshot: &IndicatorSnapshot) -> Classification {
        let scores = component_scores(snapshot, self.max_ratio);

        let probs = match self.bundle.predict_proba(snapshot, &scores, self.max_ratio) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Model scoring failed, using ladder");
                return self.fallback.classify(snapshot);
            }
        };

        let Some((regime, p_max)) = probs.iter().copied()
            .max_by(|a, b| a.1.total_cmp(&b.1))
        else {
            return self.fallback.classify(snapshot);
        };

        let confidence = clamp_unit(p_max * snapshot.quality.confidence_penalty());

        let mut ranked = probs.clone();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        let top: Vec<String> = ranked.iter().take(3)
            .map(|(r, p)| format!("{r} {:.0}%", p * 100.0))
            .collect();

        let reasoning = format!(
            "Model {} → {} (p={:.2}); top: {}; ratio {:.2}, breadth {:+.2}, trend {:+.2}; data {}",
            self.version(),
            regime,
            p_max,
            top.join(", "),
            snapshot.reversal_ratio,
            scores.breadth,
            scores.trend,
            snapshot.quality,
        );

        Classification {
            regime,
            confidence,
            scores,
            reasoning,
            strategy: Strategy::Model,
            model_version: Some(self.version().to_string()),
        }
    }

    fn name(&self) -> &str {
        "model"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// A small bundle that leans on the market score: bullish ratios favour
/// `uptrend`, bearish ones `downtrend`.
#[cfg(test)]
pub(crate) fn sample_bundle(version: &str) -> ModelBundle {
    ModelBundle {
        model: LogisticModel {
            classes: vec![Regime::Downtrend, Regime::Choppy, Regime::Uptrend],
            weights: vec![
                vec![-4.0, -1.0],
                vec![0.0, 0.0],
                vec![4.0, 1.0],
            ],
            intercepts: vec![0.0, 0.5, 0.0],
        },
        scaler: Scaler { mean: vec![0.0, 0.0], scale: vec![1.0, 1.0] },
        features: vec![Feature::MarketScore, Feature::BreadthScore],
        metadata: ModelMetadata {
            version: version.to_string(),
            trained_at: None,
            training_samples: Some(1000),
            notes: None,
        },
    }
}
