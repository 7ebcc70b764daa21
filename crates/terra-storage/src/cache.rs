//! Per-source, per-region persisted result cache.
//!
//! `get` never filters on age. Freshness is the caller's decision: the live
//! path only trusts entries younger than the source TTL, while the fallback
//! path accepts anything that is present.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

use crate::{normalize_key, write_atomic};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRecord<T> {
    source_id: String,
    region: String,
    written_at: DateTime<Utc>,
    value: T,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit<T> {
    pub value: T,
    pub written_at: DateTime<Utc>,
    pub age: Duration,
}

impl<T> CacheHit<T> {
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age < ttl
    }

    pub fn age_hours(&self) -> f64 {
        self.age.num_seconds() as f64 / 3600.0
    }
}

#[derive(Debug, Clone)]
pub struct ResultCache {
    root: PathBuf,
}

impl ResultCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, source_id: &str, region: &str) -> PathBuf {
        self.root
            .join(normalize_key(source_id))
            .join(format!("{}.json", normalize_key(region)))
    }

    pub async fn get<T: DeserializeOwned>(&self, source_id: &str, region: &str) -> Option<CacheHit<T>> {
        self.get_at(source_id, region, Utc::now()).await
    }

    /// Returns whatever is stored, however old, with its age relative to `now`.
    pub async fn get_at<T: DeserializeOwned>(
        &self,
        source_id: &str,
        region: &str,
        now: DateTime<Utc>,
    ) -> Option<CacheHit<T>> {
        let path = self.path_for(source_id, region);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable cache entry");
                return None;
            }
        };
        match serde_json::from_str::<CacheRecord<T>>(&text) {
            Ok(record) => Some(CacheHit {
                value: record.value,
                written_at: record.written_at,
                age: (now - record.written_at).max(Duration::zero()),
            }),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "corrupt cache entry treated as miss");
                None
            }
        }
    }

    pub async fn put<T: Serialize>(&self, source_id: &str, region: &str, value: &T) -> anyhow::Result<()> {
        self.put_at(source_id, region, value, Utc::now()).await
    }

    pub async fn put_at<T: Serialize>(
        &self,
        source_id: &str,
        region: &str,
        value: &T,
        written_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let record = CacheRecord {
            source_id: source_id.to_string(),
            region: region.to_string(),
            written_at,
            value,
        };
        let bytes = serde_json::to_vec_pretty(&record).context("serializing cache record")?;
        let path = self.path_for(source_id, region);
        write_atomic(&path, &bytes)
            .await
            .with_context(|| format!("writing cache entry {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        median: f64,
        listings: Vec<String>,
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn get_returns_exact_value_regardless_of_age() {
        let dir = tempdir().unwrap();
        let cache = ResultCache::new(dir.path());
        let value = Sample {
            median: 8_250_000.0,
            listings: vec!["a".into(), "b".into()],
        };
        cache
            .put_at("lamudi", "Kota Yogyakarta", &value, ts("2025-01-01T00:00:00Z"))
            .await
            .unwrap();

        let hit: CacheHit<Sample> = cache
            .get_at("lamudi", "kota  yogyakarta", ts("2026-01-01T00:00:00Z"))
            .await
            .expect("stale entry still returned");
        assert_eq!(hit.value, value);
        assert_eq!(hit.age, Duration::days(365));
        assert!(!hit.is_fresh(Duration::days(7)));
        assert!(hit.is_fresh(Duration::days(400)));
    }

    #[tokio::test]
    async fn missing_and_corrupt_entries_read_as_miss() {
        let dir = tempdir().unwrap();
        let cache = ResultCache::new(dir.path());
        assert!(cache.get::<Sample>("lamudi", "Sleman").await.is_none());

        let path = cache.path_for("lamudi", "Sleman");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(cache.get::<Sample>("lamudi", "Sleman").await.is_none());
    }

    #[tokio::test]
    async fn entries_are_partitioned_by_source() {
        let dir = tempdir().unwrap();
        let cache = ResultCache::new(dir.path());
        let value = Sample {
            median: 1.0,
            listings: vec![],
        };
        cache.put("rumah123", "Bantul", &value).await.unwrap();
        assert!(cache.get::<Sample>("lamudi", "Bantul").await.is_none());
        let hit = cache.get::<Sample>("rumah123", "Bantul").await.unwrap();
        assert!(hit.age < Duration::minutes(1));
    }
}
