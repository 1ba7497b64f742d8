//! Indicator aggregator — one sanitized snapshot per cycle.
//!
//! Collects long/short reversal counts from the two scanners and the
//! breadth/momentum/volatility composites from the breadth service,
//! substitutes last-known-good values for missing sources, caps ratios and
//! replaces non-finite values so nothing non-finite is ever persisted.

use chrono::{DateTime, Duration, Utc};
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

use crate::config::AggregatorConfig;
use crate::data::{read_source, BreadthReading, IndicatorFeed, ReadLimits, ReversalCount, SourceReading};
use crate::types::{DataQuality, IndicatorSnapshot, RegimeError, SourceTimes};

// ---------------------------------------------------------------------------
// Domains and sentinels
// ---------------------------------------------------------------------------

const BREADTH_RANGE: (f64, f64) = (0.0, 100.0);
const BREADTH_SENTINEL: f64 = 50.0;
const COMPOSITE_RANGE: (f64, f64) = (-1.0, 1.0);
const COMPOSITE_SENTINEL: f64 = 0.0;
const VOLATILITY_RANGE: (f64, f64) = (0.0, 1.0);
const VOLATILITY_SENTINEL: f64 = 0.5;

pub const LONG_SOURCE: &str = "long_scanner";
pub const SHORT_SOURCE: &str = "short_scanner";
pub const BREADTH_SOURCE: &str = "breadth";

/// The three readings gathered for one cycle.
#[derive(Debug, Clone)]
pub struct RawIndicators {
    pub long: SourceReading<ReversalCount>,
    pub short: SourceReading<ReversalCount>,
    pub breadth: SourceReading<BreadthReading>,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

pub struct Aggregator {
    config: AggregatorConfig,
    long_feed: Box<dyn IndicatorFeed<ReversalCount>>,
    short_feed: Box<dyn IndicatorFeed<ReversalCount>>,
    breadth_feed: Box<dyn IndicatorFeed<BreadthReading>>,
}

impl Aggregator {
    pub fn new(
        config: AggregatorConfig,
        long_feed: Box<dyn IndicatorFeed<ReversalCount>>,
        short_feed: Box<dyn IndicatorFeed<ReversalCount>>,
        breadth_feed: Box<dyn IndicatorFeed<BreadthReading>>,
    ) -> Self {
        Self {
            config,
            long_feed,
            short_feed,
            breadth_feed,
        }
    }

    pub fn max_ratio(&self) -> f64 {
        self.config.max_ratio
    }

    /// Fetch all sources concurrently and build the cycle snapshot.
    ///
    /// `last` is the snapshot of the most recent persisted prediction and
    /// serves as the last-known-good value for every source.
    pub async fn collect(
        &self,
        last: Option<&IndicatorSnapshot>,
        timestamp: DateTime<Utc>,
    ) -> IndicatorSnapshot {
        let limits = ReadLimits {
            timeout: StdDuration::from_secs(self.config.fetch_timeout_secs),
            max_staleness: Duration::minutes(self.config.max_staleness_minutes),
            max_fallback_age: Duration::minutes(self.config.max_fallback_minutes),
        };
        let (last_long, last_short, last_breadth) = last_known(last);

        let (long, short, breadth) = futures::join!(
            read_source(self.long_feed.as_ref(), limits, last_long, timestamp),
            read_source(self.short_feed.as_ref(), limits, last_short, timestamp),
            read_source(self.breadth_feed.as_ref(), limits, last_breadth, timestamp),
        );

        self.build(RawIndicators { long, short, breadth }, timestamp)
    }

    /// Combine readings into a sanitized snapshot. Pure; never fails.
    pub fn build(&self, raw: RawIndicators, timestamp: DateTime<Utc>) -> IndicatorSnapshot {
        let mut sanitized = Vec::new();
        let mut stale_sources = Vec::new();

        for (name, stale) in [
            (LONG_SOURCE, raw.long.is_stale()),
            (SHORT_SOURCE, raw.short.is_stale()),
            (BREADTH_SOURCE, raw.breadth.is_stale() || raw.breadth.is_unavailable()),
        ] {
            if stale {
                stale_sources.push(name.to_string());
            }
        }

        let counts_missing = raw.long.is_unavailable() || raw.short.is_unavailable();
        let (long_count, short_count) = if counts_missing {
            let missing: Vec<&str> = [(LONG_SOURCE, &raw.long), (SHORT_SOURCE, &raw.short)]
                .iter()
                .filter(|(_, r)| r.is_unavailable())
                .map(|(n, _)| *n)
                .collect();
            let err = RegimeError::DataUnavailable {
                source_name: missing.join(","),
                message: "reversal counts missing, degrading to neutral".into(),
            };
            warn!(error = %err, "Degraded snapshot");
            (0, 0)
        } else {
            (
                sanitize_count("long_count", raw.long.value().map(|c| c.count), &mut sanitized),
                sanitize_count("short_count", raw.short.value().map(|c| c.count), &mut sanitized),
            )
        };

        let reversal_ratio = capped_ratio(long_count, short_count, self.config.max_ratio);

        let (breadth_20, breadth_50, momentum, trend, volatility) = match raw.breadth.value() {
            Some(b) => (
                sanitize("breadth_20", b.breadth_20, BREADTH_RANGE, BREADTH_SENTINEL, &mut sanitized),
                sanitize("breadth_50", b.breadth_50, BREADTH_RANGE, BREADTH_SENTINEL, &mut sanitized),
                sanitize("momentum", b.momentum, COMPOSITE_RANGE, COMPOSITE_SENTINEL, &mut sanitized),
                sanitize("trend", b.trend, COMPOSITE_RANGE, COMPOSITE_SENTINEL, &mut sanitized),
                sanitize("volatility", b.volatility, VOLATILITY_RANGE, VOLATILITY_SENTINEL, &mut sanitized),
            ),
            None => (
                BREADTH_SENTINEL,
                BREADTH_SENTINEL,
                COMPOSITE_SENTINEL,
                COMPOSITE_SENTINEL,
                VOLATILITY_SENTINEL,
            ),
        };

        let quality = if counts_missing {
            DataQuality::Unavailable
        } else if !stale_sources.is_empty() {
            DataQuality::Stale
        } else {
            DataQuality::Fresh
        };

        let source_as_of = SourceTimes {
            long: raw.long.value().filter(|_| !counts_missing).map(|c| c.as_of),
            short: raw.short.value().filter(|_| !counts_missing).map(|c| c.as_of),
            breadth: raw.breadth.value().map(|b| b.as_of),
        };

        let snapshot = IndicatorSnapshot {
            timestamp,
            long_count,
            short_count,
            reversal_ratio,
            breadth_20,
            breadth_50,
            momentum,
            trend,
            volatility,
            quality,
            stale_sources,
            sanitized_fields: sanitized,
            source_as_of,
        };

        info!(
            long = snapshot.long_count,
            short = snapshot.short_count,
            ratio = format!("{:.3}", snapshot.reversal_ratio),
            quality = %snapshot.quality,
            stale = ?snapshot.stale_sources,
            "Indicator snapshot built"
        );

        snapshot
    }
}

/// Split a previous snapshot back into per-source last-known-good values.
///
/// Each value keeps the production time of the reading it came from, so a
/// value recycled across an outage ages instead of being re-stamped.
fn last_known(
    last: Option<&IndicatorSnapshot>,
) -> (Option<ReversalCount>, Option<ReversalCount>, Option<BreadthReading>) {
    let Some(snap) = last else {
        return (None, None, None);
    };

    let times = snap.source_as_of;
    let counts = if snap.quality == DataQuality::Unavailable {
        (None, None)
    } else {
        (
            Some(ReversalCount {
                count: snap.long_count as f64,
                as_of: times.long.unwrap_or(snap.timestamp),
            }),
            Some(ReversalCount {
                count: snap.short_count as f64,
                as_of: times.short.unwrap_or(snap.timestamp),
            }),
        )
    };

    // Sentinel breadth carries no production time and is never recycled
    let breadth = times.breadth.map(|as_of| BreadthReading {
        breadth_20: snap.breadth_20,
        breadth_50: snap.breadth_50,
        momentum: snap.momentum,
        trend: snap.trend,
        volatility: snap.volatility,
        as_of,
    });

    (counts.0, counts.1, breadth)
}

// ---------------------------------------------------------------------------
// Sanitization
// ---------------------------------------------------------------------------

/// Long/short ratio capped to `[1/max_ratio, max_ratio]`.
///
/// short=0 with long>0 gives `max_ratio`; long=short=0 is neutral (1.0).
pub fn capped_ratio(long: u32, short: u32, max_ratio: f64) -> f64 {
    let min_ratio = 1.0 / max_ratio;
    match (long, short) {
        (0, 0) => 1.0,
        (_, 0) => max_ratio,
        (0, _) => min_ratio,
        (l, s) => (l as f64 / s as f64).clamp(min_ratio, max_ratio),
    }
}

/// Replace non-finite values with `sentinel` and clamp finite ones into
/// `range`, recording the field name when anything changed.
fn sanitize(
    field: &str,
    value: f64,
    range: (f64, f64),
    sentinel: f64,
    sanitized: &mut Vec<String>,
) -> f64 {
    let (lo, hi) = range;
    let clean = if !value.is_finite() {
        sentinel
    } else {
        value.clamp(lo, hi)
    };

    if clean != value {
        let err = RegimeError::MalformedValue {
            field: field.to_string(),
            detail: format!("{value} replaced with {clean}"),
        };
        warn!(error = %err, "Sanitized indicator");
        sanitized.push(field.to_string());
    }
    clean
}

fn sanitize_count(field: &str, value: Option<f64>, sanitized: &mut Vec<String>) -> u32 {
    let raw = value.unwrap_or(0.0);
    if raw.is_finite() && raw >= 0.0 && raw.fract() == 0.0 && raw <= u32::MAX as f64 {
        return raw as u32;
    }

    let clean = if raw.is_finite() && raw > 0.0 {
        raw.round().min(u32::MAX as f64) as u32
    } else {
        0
    };
    debug!(field, raw, clean, "Count sanitized");
    let err = RegimeError::MalformedValue {
        field: field.to_string(),
        detail: format!("{raw} replaced with {clean}"),
    };
    warn!(error = %err, "Sanitized indicator");
    sanitized.push(field.to_string());
    clean
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    struct NoFeed;

    #[async_trait]
    impl IndicatorFeed<ReversalCount> for NoFeed {
        fn name(&self) -> &str {
            "none"
        }
        async fn fetch(&self) -> Result<ReversalCount> {
            Err(anyhow!("offline"))
        }
    }

    #[async_trait]
    impl IndicatorFeed<BreadthReading> for NoFeed {
        fn name(&self) -> &str {
            "none"
        }
        async fn fetch(&self) -> Result<BreadthReading> {
            Err(anyhow!("offline"))
        }
    }

    fn aggregator() -> Aggregator {
        Aggregator::new(
            AggregatorConfig::default(),
            Box::new(NoFeed),
            Box::new(NoFeed),
            Box::new(NoFeed),
        )
    }

    fn count(n: f64) -> SourceReading<ReversalCount> {
        SourceReading::Fresh(ReversalCount { count: n, as_of: Utc::now() })
    }

    fn breadth(b20: f64, b50: f64, mom: f64, trend: f64, vol: f64) -> SourceReading<BreadthReading> {
        SourceReading::Fresh(BreadthReading {
            breadth_20: b20,
            breadth_50: b50,
            momentum: mom,
            trend,
            volatility: vol,
            as_of: Utc::now(),
        })
    }

    fn raw(long: f64, short: f64) -> RawIndicators {
        RawIndicators {
            long: count(long),
            short: count(short),
            breadth: breadth(55.0, 52.0, 0.1, 0.2, 0.3),
        }
    }

    #[test]
    fn test_ratio_caps() {
        assert_eq!(capped_ratio(10, 0, 10.0), 10.0);
        assert!((capped_ratio(0, 10, 10.0) - 0.1).abs() < 1e-12);
        assert_eq!(capped_ratio(0, 0, 10.0), 1.0);
        assert!((capped_ratio(45, 20, 10.0) - 2.25).abs() < 1e-12);
        assert_eq!(capped_ratio(500, 1, 10.0), 10.0);
    }

    #[test]
    fn test_fresh_snapshot() {
        let snap = aggregator().build(raw(45.0, 20.0), Utc::now());
        assert_eq!(snap.long_count, 45);
        assert_eq!(snap.short_count, 20);
        assert!((snap.reversal_ratio - 2.25).abs() < 1e-12);
        assert_eq!(snap.quality, DataQuality::Fresh);
        assert!(snap.stale_sources.is_empty());
        assert!(snap.sanitized_fields.is_empty());
    }

    #[test]
    fn test_non_finite_values_sanitized() {
        let raw = RawIndicators {
            long: count(f64::NAN),
            short: count(f64::INFINITY),
            breadth: breadth(f64::NAN, f64::NEG_INFINITY, f64::INFINITY, f64::NAN, f64::NAN),
        };
        let snap = aggregator().build(raw, Utc::now());
        assert!(snap.is_finite());
        assert_eq!(snap.long_count, 0);
        assert_eq!(snap.short_count, 0);
        assert_eq!(snap.reversal_ratio, 1.0);
        assert_eq!(snap.breadth_20, BREADTH_SENTINEL);
        assert_eq!(snap.momentum, COMPOSITE_SENTINEL);
        assert_eq!(snap.volatility, VOLATILITY_SENTINEL);
        assert_eq!(snap.sanitized_fields.len(), 7);
    }

    #[test]
    fn test_out_of_range_values_clamped() {
        let raw = RawIndicators {
            long: count(-4.0),
            short: count(12.6),
            breadth: breadth(140.0, -3.0, 2.5, -9.0, 3.0),
        };
        let snap = aggregator().build(raw, Utc::now());
        assert_eq!(snap.long_count, 0);
        assert_eq!(snap.short_count, 13);
        assert_eq!(snap.breadth_20, 100.0);
        assert_eq!(snap.breadth_50, 0.0);
        assert_eq!(snap.momentum, 1.0);
        assert_eq!(snap.trend, -1.0);
        assert_eq!(snap.volatility, 1.0);
        assert!((snap.reversal_ratio - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_ratio_never_infinite() {
        let agg = aggregator();
        for (l, s) in [(10.0, 0.0), (0.0, 10.0), (0.0, 0.0), (1e9, 1.0), (1.0, 1e9)] {
            let snap = agg.build(raw(l, s), Utc::now());
            assert!(snap.reversal_ratio.is_finite());
            assert!(snap.reversal_ratio <= 10.0 && snap.reversal_ratio >= 0.1);
        }
    }

    #[test]
    fn test_missing_counts_degrade_to_neutral() {
        let raw = RawIndicators {
            long: SourceReading::Unavailable,
            short: count(30.0),
            breadth: breadth(55.0, 52.0, 0.1, 0.2, 0.3),
        };
        let snap = aggregator().build(raw, Utc::now());
        assert_eq!(snap.quality, DataQuality::Unavailable);
        assert_eq!(snap.reversal_ratio, 1.0);
        assert_eq!(snap.long_count, 0);
        assert_eq!(snap.short_count, 0);
    }

    #[test]
    fn test_missing_breadth_is_stale_and_neutral() {
        let raw = RawIndicators {
            long: count(20.0),
            short: count(10.0),
            breadth: SourceReading::Unavailable,
        };
        let snap = aggregator().build(raw, Utc::now());
        assert_eq!(snap.quality, DataQuality::Stale);
        assert_eq!(snap.stale_sources, vec![BREADTH_SOURCE.to_string()]);
        assert_eq!(snap.breadth_20, BREADTH_SENTINEL);
        assert_eq!(snap.trend, 0.0);
    }

    #[tokio::test]
    async fn test_collect_falls_back_to_last_snapshot() {
        let agg = aggregator();
        let now = Utc::now();
        let mut last = agg.build(raw(30.0, 12.0), now - Duration::minutes(15));
        last.breadth_20 = 61.0;

        let snap = agg.collect(Some(&last), now).await;
        assert_eq!(snap.quality, DataQuality::Stale);
        assert_eq!(snap.long_count, 30);
        assert_eq!(snap.short_count, 12);
        assert_eq!(snap.breadth_20, 61.0);
        assert_eq!(snap.stale_sources.len(), 3);
    }

    #[tokio::test]
    async fn test_fallback_keeps_original_reading_time() {
        let agg = aggregator();
        let now = Utc::now();
        let produced = now - Duration::minutes(15);
        let last = agg.build(
            RawIndicators {
                long: SourceReading::Fresh(ReversalCount { count: 30.0, as_of: produced }),
                short: SourceReading::Fresh(ReversalCount { count: 12.0, as_of: produced }),
                breadth: breadth(55.0, 52.0, 0.1, 0.2, 0.3),
            },
            now - Duration::minutes(15),
        );

        // Recycled through a second outage cycle, the reading keeps its age
        let second = agg.collect(Some(&last), now).await;
        assert_eq!(second.source_as_of.long, Some(produced));
        assert_eq!(second.quality, DataQuality::Stale);
    }

    #[tokio::test]
    async fn test_long_outage_expires_last_known() {
        let agg = aggregator();
        let now = Utc::now();
        let produced = now - Duration::hours(6);
        let last = agg.build(
            RawIndicators {
                long: SourceReading::Fresh(ReversalCount { count: 30.0, as_of: produced }),
                short: SourceReading::Fresh(ReversalCount { count: 12.0, as_of: produced }),
                breadth: SourceReading::Unavailable,
            },
            now - Duration::minutes(15),
        );

        let snap = agg.collect(Some(&last), now).await;
        assert_eq!(snap.quality, DataQuality::Unavailable);
        assert_eq!(snap.reversal_ratio, 1.0);
        assert_eq!(snap.source_as_of, SourceTimes::default());
    }

    #[tokio::test]
    async fn test_collect_without_history_is_unavailable() {
        let snap = aggregator().collect(None, Utc::now()).await;
        assert_eq!(snap.quality, DataQuality::Unavailable);
        assert!(snap.is_finite());
    }
}
