//! JSON indicator feed.
//!
//! Upstream scanners publish their latest reading either behind an HTTP
//! endpoint or as a JSON file next to their scan output. `JsonFeed` reads
//! either and deserializes into the requested payload type.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::IndicatorFeed;
use crate::config::FeedLocation;

pub struct JsonFeed {
    name: String,
    location: FeedLocation,
    http: Client,
}

impl JsonFeed {
    pub fn new(name: &str, location: FeedLocation, timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .user_agent("regime-monitor/0.1.0")
            .build()
            .context("Failed to build feed HTTP client")?;
        Ok(Self {
            name: name.to_string(),
            location,
            http,
        })
    }

    pub fn location(&self) -> &FeedLocation {
        &self.location
    }
}

#[async_trait]
impl<T> IndicatorFeed<T> for JsonFeed
where
    T: DeserializeOwned + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<T> {
        match &self.location {
            FeedLocation::Http { url } => {
                let resp = self.http.get(url).send().await
                    .with_context(|| format!("{} request failed", self.name))?;

                if !resp.status().is_success() {
                    bail!("{} returned HTTP {}", self.name, resp.status());
                }

                let value = resp.json::<T>().await
                    .with_context(|| format!("{} returned malformed JSON", self.name))?;
                debug!(source = %self.name, url = %url, "Fetched indicator over HTTP");
                Ok(value)
            }
            FeedLocation::File { path } => {
                let raw = tokio::fs::read_to_string(path).await
                    .with_context(|| format!("{} could not read {path}", self.name))?;
                let value = serde_json::from_str::<T>(&raw)
                    .with_context(|| format!("{} file {path} is malformed", self.name))?;
                debug!(source = %self.name, path = %path, "Read indicator file");
                Ok(value)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BreadthReading, ReversalCount};

    fn temp_path() -> String {
        let mut p = std::env::temp_dir();
        p.push(format!("regime_feed_{}.json", uuid::Uuid::new_v4()));
        p.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn test_reads_count_file() {
        let path = temp_path();
        std::fs::write(&path, r#"{"count": 45, "as_of": "2026-10-19T04:30:00Z"}"#).unwrap();

        let feed = JsonFeed::new("long_scanner", FeedLocation::File { path: path.clone() }, 5).unwrap();
        let reading: ReversalCount = feed.fetch().await.unwrap();
        assert_eq!(reading.count, 45.0);
        assert_eq!(IndicatorFeed::<ReversalCount>::name(&feed), "long_scanner");

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_reads_breadth_file() {
        let path = temp_path();
        std::fs::write(
            &path,
            r#"{"breadth_20": 62.5, "breadth_50": 55.0, "momentum": 0.3, "trend": 0.2, "volatility": 0.4, "as_of": "2026-10-19T04:30:00Z"}"#,
        )
        .unwrap();

        let feed = JsonFeed::new("breadth", FeedLocation::File { path: path.clone() }, 5).unwrap();
        let reading: BreadthReading = feed.fetch().await.unwrap();
        assert_eq!(reading.breadth_20, 62.5);
        assert_eq!(reading.trend, 0.2);

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_errors() {
        let feed = JsonFeed::new(
            "short_scanner",
            FeedLocation::File { path: "/tmp/regime_feed_does_not_exist.json".into() },
            5,
        )
        .unwrap();
        let result: Result<ReversalCount> = feed.fetch().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_malformed_file_errors() {
        let path = temp_path();
        std::fs::write(&path, "not json").unwrap();
        let feed = JsonFeed::new("short_scanner", FeedLocation::File { path: path.clone() }, 5).unwrap();
        let result: Result<ReversalCount> = feed.fetch().await;
        assert!(result.is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
