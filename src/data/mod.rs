//! Indicator feeds.
//!
//! Defines the `IndicatorFeed` trait for the upstream producers (the long
//! and short reversal scanners and the breadth service) and the explicit
//! `SourceReading` result the aggregator consumes.

pub mod json_feed;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration as StdDuration;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Latest count published by a reversal scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReversalCount {
    /// Number of symbols showing the reversal pattern. Kept as a float so
    /// malformed producer output can be sanitized instead of rejected.
    pub count: f64,
    pub as_of: DateTime<Utc>,
}

/// Latest reading from the breadth service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreadthReading {
    pub breadth_20: f64,
    pub breadth_50: f64,
    pub momentum: f64,
    pub trend: f64,
    pub volatility: f64,
    pub as_of: DateTime<Utc>,
}

/// Payloads that carry their own production time.
pub trait Timestamped {
    fn as_of(&self) -> DateTime<Utc>;
}

impl Timestamped for ReversalCount {
    fn as_of(&self) -> DateTime<Utc> {
        self.as_of
    }
}

impl Timestamped for BreadthReading {
    fn as_of(&self) -> DateTime<Utc> {
        self.as_of
    }
}

// ---------------------------------------------------------------------------
// Source reading
// ---------------------------------------------------------------------------

/// Outcome of asking one upstream source for data this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceReading<T> {
    /// Current data.
    Fresh(T),
    /// Old data: either the source answered with an outdated reading or it
    /// failed and the last-known-good value was substituted.
    Stale(T),
    /// Nothing current and nothing remembered.
    Unavailable,
}

impl<T> SourceReading<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            SourceReading::Fresh(v) | SourceReading::Stale(v) => Some(v),
            SourceReading::Unavailable => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, SourceReading::Fresh(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, SourceReading::Stale(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, SourceReading::Unavailable)
    }
}

/// Abstraction over an upstream indicator producer.
#[async_trait]
pub trait IndicatorFeed<T: Send>: Send + Sync {
    /// Source name for logging and staleness reporting.
    fn name(&self) -> &str;

    /// Fetch the latest published reading.
    async fn fetch(&self) -> Result<T>;
}

/// How long a source may be read and how old its data may get.
#[derive(Debug, Clone, Copy)]
pub struct ReadLimits {
    pub timeout: StdDuration,
    /// Readings older than this are stale.
    pub max_staleness: Duration,
    /// A last-known-good value older than this is not substituted.
    pub max_fallback_age: Duration,
}

/// Fetch from a feed with a timeout and classify the result.
///
/// A failed or timed-out fetch falls back to `last_known` while it is
/// younger than `max_fallback_age`; a reading older than `max_staleness`
/// is returned as stale.
pub async fn read_source<T, F>(
    feed: &F,
    limits: ReadLimits,
    last_known: Option<T>,
    now: DateTime<Utc>,
) -> SourceReading<T>
where
    T: Timestamped + Send,
    F: IndicatorFeed<T> + ?Sized,
{
    let fetched = match tokio::time::timeout(limits.timeout, feed.fetch()).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(source = feed.name(), error = %e, "Indicator fetch failed");
            None
        }
        Err(_) => {
            warn!(source = feed.name(), timeout_secs = limits.timeout.as_secs(), "Indicator fetch timed out");
            None
        }
    };

    match fetched {
        Some(value) if now - value.as_of() <= limits.max_staleness => {
            debug!(source = feed.name(), "Fresh reading");
            SourceReading::Fresh(value)
        }
        Some(value) => {
            warn!(
                source = feed.name(),
                as_of = %value.as_of(),
                "Reading is older than the staleness window"
            );
            SourceReading::Stale(value)
        }
        None => match last_known {
            Some(value) if now - value.as_of() <= limits.max_fallback_age => {
                warn!(source = feed.name(), as_of = %value.as_of(), "Using last-known-good value");
                SourceReading::Stale(value)
            }
            Some(value) => {
                warn!(
                    source = feed.name(),
                    as_of = %value.as_of(),
                    "Last-known-good value too old to substitute"
                );
                SourceReading::Unavailable
            }
            None => {
                warn!(source = feed.name(), "No data and no last-known-good value");
                SourceReading::Unavailable
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
