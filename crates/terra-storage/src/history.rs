//! Append-only per-region drift history with a rolling retention window.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use terra_core::DriftSnapshot;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::{normalize_key, write_atomic};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("reading history {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt history file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot for {region} at {attempted} is older than latest recorded {latest}")]
    OutOfOrder {
        region: String,
        attempted: DateTime<Utc>,
        latest: DateTime<Utc>,
    },
    #[error(transparent)]
    Write(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub retention_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { retention_days: 180 }
    }
}

impl RetentionPolicy {
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.retention_days)
    }

    /// Drops every snapshot recorded before the cutoff; returns how many went.
    pub fn prune(&self, snapshots: &mut Vec<DriftSnapshot>, now: DateTime<Utc>) -> usize {
        let cutoff = self.cutoff(now);
        let before = snapshots.len();
        snapshots.retain(|s| s.recorded_at >= cutoff);
        before - snapshots.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryFile {
    region: String,
    snapshots: Vec<DriftSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub retained: usize,
    pub pruned: usize,
}

/// One JSON file per region. Each region has a single writer per run, so no
/// cross-region locking is needed.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    root: PathBuf,
    retention: RetentionPolicy,
}

impl HistoryStore {
    pub fn new(root: impl Into<PathBuf>, retention: RetentionPolicy) -> Self {
        Self {
            root: root.into(),
            retention,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    pub fn path_for(&self, region: &str) -> PathBuf {
        self.root.join(format!("{}.json", normalize_key(region)))
    }

    async fn read_file(path: &Path) -> Result<Option<HistoryFile>, HistoryError> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(HistoryError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| HistoryError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn write_file(&self, region: &str, snapshots: Vec<DriftSnapshot>) -> Result<(), HistoryError> {
        let path = self.path_for(region);
        let file = HistoryFile {
            region: region.to_string(),
            snapshots,
        };
        let bytes = serde_json::to_vec_pretty(&file).context("serializing drift history")?;
        write_atomic(&path, &bytes)
            .await
            .with_context(|| format!("writing drift history {}", path.display()))?;
        Ok(())
    }

    /// Snapshots in recorded order, oldest first. Unknown regions yield an empty history.
    pub async fn load(&self, region: &str) -> Result<Vec<DriftSnapshot>, HistoryError> {
        Ok(Self::read_file(&self.path_for(region))
            .await?
            .map(|f| f.snapshots)
            .unwrap_or_default())
    }

    /// Appends in run order and prunes relative to the new snapshot's timestamp.
    pub async fn append(&self, snapshot: &DriftSnapshot) -> Result<AppendOutcome, HistoryError> {
        let mut snapshots = self.load(&snapshot.region).await?;
        if let Some(latest) = snapshots.last() {
            if snapshot.recorded_at < latest.recorded_at {
                return Err(HistoryError::OutOfOrder {
                    region: snapshot.region.clone(),
                    attempted: snapshot.recorded_at,
                    latest: latest.recorded_at,
                });
            }
        }
        snapshots.push(snapshot.clone());
        let pruned = self.retention.prune(&mut snapshots, snapshot.recorded_at);
        let retained = snapshots.len();
        self.write_file(&snapshot.region, snapshots).await?;
        debug!(region = %snapshot.region, retained, pruned, "appended drift snapshot");
        Ok(AppendOutcome { retained, pruned })
    }

    pub async fn prune(&self, region: &str, now: DateTime<Utc>) -> Result<usize, HistoryError> {
        let mut snapshots = self.load(region).await?;
        let pruned = self.retention.prune(&mut snapshots, now);
        if pruned > 0 {
            self.write_file(region, snapshots).await?;
        }
        Ok(pruned)
    }

    /// Every region's history keyed by region name. Fails on the first corrupt file.
    pub async fn load_all(&self) -> Result<BTreeMap<String, Vec<DriftSnapshot>>, HistoryError> {
        let mut out = BTreeMap::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(source) => {
                return Err(HistoryError::Io {
                    path: self.root.clone(),
                    source,
                })
            }
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(HistoryError::Io {
                        path: self.root.clone(),
                        source,
                    })
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(file) = Self::read_file(&path).await? {
                out.insert(file.region, file.snapshots);
            }
        }
        Ok(out)
    }
}
