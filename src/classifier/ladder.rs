//! Deterministic ratio ladder.
//!
//! Maps the long/short reversal ratio straight onto the regime ladder.
//! Confidence grows with the distance from the nearest ladder boundary
//! and with agreement between breadth/trend and the ratio's direction.

use super::{component_scores, Classification, RegimeClassifier};
use crate::types::{clamp_unit, ComponentScores, IndicatorSnapshot, Regime, Strategy};

/// Lower bound of each regime, highest first. Anything below the last
/// rung is `StrongDowntrend`.
pub const LADDER: [(f64, Regime); 6] = [
    (2.0, Regime::StrongUptrend),
    (1.5, Regime::Uptrend),
    (1.2, Regime::ChoppyBullish),
    (0.8, Regime::Choppy),
    (0.67, Regime::ChoppyBearish),
    (0.5, Regime::Downtrend),
];

/// Log-distance from a boundary at which the margin term saturates.
const MARGIN_SATURATION: f64 = 0.223; // ln(1.25)

/// Confidence multiplier when the ladder stands in for a failed model.
pub const FALLBACK_PENALTY: f64 = 0.85;

pub struct LadderClassifier {
    max_ratio: f64,
    fallback: bool,
}

impl LadderClassifier {
    pub fn new(max_ratio: f64) -> Self {
        Self { max_ratio, fallback: false }
    }

    /// Ladder used in place of a model that failed to load.
    pub fn fallback(max_ratio: f64) -> Self {
        Self { max_ratio, fallback: true }
    }

    /// Regime for a reversal ratio. Non-finite ratios are neutral.
    pub fn regime_for_ratio(ratio: f64) -> Regime {
        if !ratio.is_finite() {
            return Regime::NEUTRAL;
        }
        LADDER
            .iter()
            .find(|(threshold, _)| ratio >= *threshold)
            .map(|(_, regime)| *regime)
            .unwrap_or(Regime::StrongDowntrend)
    }

    /// Confidence before data-quality penalties, in [0.5, 1.0].
    fn base_confidence(ratio: f64, regime: Regime, scores: &ComponentScores) -> f64 {
        let margin = if ratio.is_finite() && ratio > 0.0 {
            LADDER
                .iter()
                .map(|(t, _)| (ratio.ln() - t.ln()).abs())
                .fold(f64::INFINITY, f64::min)
        } else {
            0.0
        };
        let margin_score = (margin / MARGIN_SATURATION).min(1.0);

        let evidence = (scores.breadth + scores.trend) / 2.0;
        let agreement = match i16::from(regime.rank()) - i16::from(Regime::NEUTRAL.rank()) {
            d if d > 0 => (evidence + 1.0) / 2.0,
            d if d < 0 => (1.0 - evidence) / 2.0,
            _ => 1.0 - evidence.abs(),
        };

        0.5 + 0.35 * margin_score + 0.15 * clamp_unit(agreement)
    }
}

impl RegimeClassifier for LadderClassifier {
    fn classify(&self, snapshot: &IndicatorSnapshot) -> Classification {
        let scores = component_scores(snapshot, self.max_ratio);
        let ratio = snapshot.reversal_ratio;
        let regime = Self::regime_for_ratio(ratio);

        let mut confidence = Self::base_confidence(ratio, regime, &scores)
            * snapshot.quality.confidence_penalty();
        if self.fallback {
            confidence *= FALLBACK_PENALTY;
        }
        let confidence = clamp_unit(confidence);

        let rung = LADDER
            .iter()
            .find(|(_, r)| *r == regime)
            .map(|(t, _)| format!("≥ {t:.2}"))
            .unwrap_or_else(|| "< 0.50".to_string());

        let mut reasoning = format!(
            "Reversal ratio {:.2} ({} long / {} short) {} → {}; breadth {:+.2}, trend {:+.2}, momentum {:+.2}; data {}",
            ratio,
            snapshot.long_count,
            snapshot.short_count,
            rung,
            regime,
            scores.breadth,
            scores.trend,
            scores.momentum,
            snapshot.quality,
        );
        if self.fallback {
            reasoning.push_str("; model unavailable, ladder fallback");
        }

        Classification {
            regime,
            confidence,
            scores,
            reasoning,
            strategy: if self.fallback { Strategy::LadderFallback } else { Strategy::Ladder },
            model_version: None,
        }
    }

    fn name(&self) -> &str {
        if self.fallback {
            "ladder_fallback"
        } else {
            "ladder"
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::aggregator::capped_ratio;
    use crate::types::DataQuality;
    use chrono::Utc;

    fn snapshot_from_counts(long: u32, short: u32) -> IndicatorSnapshot {
        IndicatorSnapshot {
            long_count: long,
            short_count: short,
            reversal_ratio: capped_ratio(long, short, 10.0),
            quality: DataQuality::Fresh,
            ..IndicatorSnapshot::neutral(Utc::now())
        }
    }

    #[test]
    fn test_ladder_thresholds() {
        let cases = [
            (2.0, Regime::StrongUptrend),
            (1.99, Regime::Uptrend),
            (1.5, Regime::Uptrend),
            (1.2, Regime::ChoppyBullish),
            (1.0, Regime::Choppy),
            (0.8, Regime::Choppy),
            (0.7, Regime::ChoppyBearish),
            (0.67, Regime::ChoppyBearish),
            (0.5, Regime::Downtrend),
            (0.49, Regime::StrongDowntrend),
            (0.0, Regime::StrongDowntrend),
        ];
        for (ratio, expected) in cases {
            assert_eq!(LadderClassifier::regime_for_ratio(ratio), expected, "ratio {ratio}");
        }
    }

    #[test]
    fn test_strong_uptrend_from_counts() {
        let c = LadderClassifier::new(10.0).classify(&snapshot_from_counts(45, 20));
        assert_eq!(c.regime, Regime::StrongUptrend);
        assert_eq!(c.strategy, Strategy::Ladder);
        assert!(c.reasoning.contains("strong_uptrend"));
    }

    #[test]
    fn test_strong_downtrend_from_counts() {
        let c = LadderClassifier::new(10.0).classify(&snapshot_from_counts(11, 46));
        assert_eq!(c.regime, Regime::StrongDowntrend);
    }

    #[test]
    fn test_total_over_ratio_grid() {
        let ladder = LadderClassifier::new(10.0);
        let mut ratio = 0.0;
        while ratio <= 12.0 {
            for quality in [DataQuality::Fresh, DataQuality::Stale, DataQuality::Unavailable] {
                let snap = IndicatorSnapshot {
                    reversal_ratio: ratio,
                    quality,
                    trend: -1.0,
                    breadth_20: 100.0,
                    ..IndicatorSnapshot::neutral(Utc::now())
                };
                let c = ladder.classify(&snap);
                assert!((0.0..=1.0).contains(&c.confidence), "ratio {ratio}");
                assert!(Regime::ALL.contains(&c.regime));
            }
            ratio += 0.05;
        }
    }

    #[test]
    fn test_non_finite_ratio_is_neutral() {
        let snap = IndicatorSnapshot {
            reversal_ratio: f64::INFINITY,
            ..IndicatorSnapshot::neutral(Utc::now())
        };
        let c = LadderClassifier::new(10.0).classify(&snap);
        assert_eq!(c.regime, Regime::Choppy);
        assert!((0.0..=1.0).contains(&c.confidence));
    }

    #[test]
    fn test_confidence_higher_away_from_boundary() {
        let ladder = LadderClassifier::new(10.0);
        let near = ladder.classify(&IndicatorSnapshot {
            reversal_ratio: 2.01,
            quality: DataQuality::Fresh,
            ..IndicatorSnapshot::neutral(Utc::now())
        });
        let far = ladder.classify(&IndicatorSnapshot {
            reversal_ratio: 4.0,
            quality: DataQuality::Fresh,
            ..IndicatorSnapshot::neutral(Utc::now())
        });
        assert_eq!(near.regime, far.regime);
        assert!(far.confidence > near.confidence);
    }

    #[test]
    fn test_stale_data_lowers_confidence() {
        let ladder = LadderClassifier::new(10.0);
        let mut snap = snapshot_from_counts(45, 20);
        let fresh = ladder.classify(&snap);
        snap.quality = DataQuality::Stale;
        let stale = ladder.classify(&snap);
        assert!(stale.confidence < fresh.confidence);
        assert_eq!(stale.regime, fresh.regime);
    }

    #[test]
    fn test_fallback_marks_reduced_confidence() {
        let snap = snapshot_from_counts(45, 20);
        let normal = LadderClassifier::new(10.0).classify(&snap);
        let fallback = LadderClassifier::fallback(10.0).classify(&snap);
        assert_eq!(fallback.strategy, Strategy::LadderFallback);
        assert!(fallback.confidence < normal.confidence);
        assert!(fallback.reasoning.contains("fallback"));
    }

    #[test]
    fn test_unavailable_data_is_neutral_low_confidence() {
        let c = LadderClassifier::new(10.0).classify(&IndicatorSnapshot::neutral(Utc::now()));
        assert_eq!(c.regime, Regime::Choppy);
        assert!(c.confidence <= 0.4);
    }
}
