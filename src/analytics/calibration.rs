//! Calibration module.
//!
//! Measures how well prediction confidence matches realized outcome
//! scores. Computes accuracy per regime and strategy, a calibration curve
//! over confidence bins, and a diagnosis.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::types::{Regime, RegimePrediction, Strategy};

// ---------------------------------------------------------------------------
// Calibration data
// ---------------------------------------------------------------------------

/// A single resolved prediction.
#[derive(Debug, Clone)]
pub struct CalibrationPoint {
    pub predicted: Regime,
    pub actual: Regime,
    pub confidence: f64,
    pub outcome_score: f64,
    pub strategy: Strategy,
}

impl CalibrationPoint {
    /// `None` for predictions that are still pending.
    pub fn from_prediction(p: &RegimePrediction) -> Option<Self> {
        Some(Self {
            predicted: p.predicted_regime,
            actual: p.actual_regime?,
            confidence: p.confidence,
            outcome_score: p.outcome_score?,
            strategy: p.strategy,
        })
    }

    fn is_hit(&self) -> bool {
        self.predicted == self.actual
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccuracyStats {
    pub count: usize,
    pub mean_score: f64,
    pub hit_rate: f64,
}

impl AccuracyStats {
    fn from_points<'a>(points: impl IntoIterator<Item = &'a CalibrationPoint>) -> Self {
        let mut count = 0usize;
        let mut score = 0.0;
        let mut hits = 0usize;
        for p in points {
            count += 1;
            score += p.outcome_score;
            if p.is_hit() {
                hits += 1;
            }
        }
        if count == 0 {
            return Self::default();
        }
        Self {
            count,
            mean_score: score / count as f64,
            hit_rate: hits as f64 / count as f64,
        }
    }
}

/// Calibration analysis results.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationReport {
    pub total_predictions: usize,
    pub overall: AccuracyStats,
    /// Mean squared gap between confidence and outcome score.
    pub confidence_error: f64,
    /// Keyed by predicted regime.
    pub per_regime: BTreeMap<Regime, AccuracyStats>,
    pub per_strategy: BTreeMap<String, AccuracyStats>,
    /// For each 10% confidence bin, mean confidence vs mean outcome score.
    pub calibration_curve: Vec<CalibrationBucket>,
    pub diagnosis: CalibrationDiagnosis,
}

/// A bucket in the calibration curve (e.g. all predictions with
/// confidence between 0.60 and 0.70).
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationBucket {
    pub bin_start: f64,
    pub bin_end: f64,
    pub mean_confidence: f64,
    pub mean_score: f64,
    pub count: usize,
    /// |mean_confidence - mean_score|
    pub deviation: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationDiagnosis {
    WellCalibrated,
    /// Confidence runs ahead of realized scores
    OverConfident,
    UnderConfident,
    InsufficientData,
}

// ---------------------------------------------------------------------------
// Calibrator
// ---------------------------------------------------------------------------

pub struct Calibrator {
    points: Vec<CalibrationPoint>,
    num_bins: usize,
}

impl Default for Calibrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Calibrator {
    pub fn new() -> Self {
        Self {
            points: Vec::new(),
            num_bins: 10,
        }
    }

    /// Build from stored predictions, ignoring unresolved ones.
    pub fn from_predictions(predictions: &[RegimePrediction]) -> Self {
        let mut cal = Self::new();
        cal.points = predictions
            .iter()
            .filter_map(CalibrationPoint::from_prediction)
            .collect();
        cal
    }

    pub fn add_point(&mut self, point: CalibrationPoint) {
        self.points.push(point);
    }

    pub fn count(&self) -> usize {
        self.points.len()
    }

    /// Generate a full calibration report.
    pub fn report(&self) -> CalibrationReport {
        let mut per_regime: BTreeMap<Regime, Vec<&CalibrationPoint>> = BTreeMap::new();
        let mut per_strategy: BTreeMap<String, Vec<&CalibrationPoint>> = BTreeMap::new();
        for p in &self.points {
            per_regime.entry(p.predicted).or_default().push(p);
            per_strategy.entry(p.strategy.to_string()).or_default().push(p);
        }

        let confidence_error = if self.points.is_empty() {
            0.0
        } else {
            self.points
                .iter()
                .map(|p| (p.confidence - p.outcome_score).powi(2))
                .sum::<f64>()
                / self.points.len() as f64
        };

        let calibration_curve = self.compute_calibration_curve();
        let diagnosis = self.diagnose(&calibration_curve);

        CalibrationReport {
            total_predictions: self.points.len(),
            overall: AccuracyStats::from_points(&self.points),
            confidence_error,
            per_regime: per_regime
                .into_iter()
                .map(|(r, pts)| (r, AccuracyStats::from_points(pts)))
                .collect(),
            per_strategy: per_strategy
                .into_iter()
                .map(|(s, pts)| (s, AccuracyStats::from_points(pts)))
                .collect(),
            calibration_curve,
            diagnosis,
        }
    }

    fn compute_calibration_curve(&self) -> Vec<CalibrationBucket> {
        let bin_width = 1.0 / self.num_bins as f64;
        let mut buckets = Vec::with_capacity(self.num_bins);

        for i in 0..self.num_bins {
            let bin_start = i as f64 * bin_width;
            let bin_end = bin_start + bin_width;
            let last = i == self.num_bins - 1;

            let in_bin: Vec<&CalibrationPoint> = self
                .points
                .iter()
                .filter(|p| p.confidence >= bin_start && (last || p.confidence < bin_end))
                .collect();

            let count = in_bin.len();
            if count == 0 {
                buckets.push(CalibrationBucket {
                    bin_start,
                    bin_end,
                    mean_confidence: (bin_start + bin_end) / 2.0,
                    mean_score: 0.0,
                    count: 0,
                    deviation: 0.0,
                });
                continue;
            }

            let mean_confidence = in_bin.iter().map(|p| p.confidence).sum::<f64>() / count as f64;
            let mean_score = in_bin.iter().map(|p| p.outcome_score).sum::<f64>() / count as f64;

            buckets.push(CalibrationBucket {
                bin_start,
                bin_end,
                mean_confidence,
                mean_score,
                count,
                deviation: (mean_confidence - mean_score).abs(),
            });
        }

        buckets
    }

    fn diagnose(&self, curve: &[CalibrationBucket]) -> CalibrationDiagnosis {
        let populated: Vec<&CalibrationBucket> = curve.iter().filter(|b| b.count >= 3).collect();

        if populated.len() < 2 || self.points.len() < 20 {
            return CalibrationDiagnosis::InsufficientData;
        }

        let mut over = 0;
        let mut under = 0;
        for bucket in &populated {
            if bucket.deviation < 0.05 {
                continue;
            }
            if bucket.mean_confidence > bucket.mean_score {
                over += 1;
            } else {
                under += 1;
            }
        }

        if over > under + 1 {
            CalibrationDiagnosis::OverConfident
        } else if under > over + 1 {
            CalibrationDiagnosis::UnderConfident
        } else {
            CalibrationDiagnosis::WellCalibrated
        }
    }

    /// Human-readable summary for the `status` command.
    pub fn summary(&self) -> String {
        let report = self.report();
        let mut parts = vec![format!(
            "ACCURACY ({} resolved predictions): mean score {:.2}, exact hits {:.0}%",
            report.total_predictions,
            report.overall.mean_score,
            report.overall.hit_rate * 100.0
        )];

        for (regime, stats) in &report.per_regime {
            parts.push(format!(
                "  {regime:<16} n={:<4} score={:.2} hits={:.0}%",
                stats.count,
                stats.mean_score,
                stats.hit_rate * 100.0
            ));
        }

        parts.push(match report.diagnosis {
            CalibrationDiagnosis::OverConfident => "DIAGNOSIS: over-confident, confidence exceeds realized scores.".into(),
            CalibrationDiagnosis::UnderConfident => "DIAGNOSIS: under-confident, realized scores exceed confidence.".into(),
            CalibrationDiagnosis::WellCalibrated => "DIAGNOSIS: well calibrated.".into(),
            CalibrationDiagnosis::InsufficientData => "DIAGNOSIS: not enough resolved predictions yet.".to_string(),
        });

        parts.join("\n")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
