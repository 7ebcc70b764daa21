//! Per-tier benchmark table plus the backup ring used by apply/rollback.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use terra_core::Tier;
use terra_storage::write_atomic;
use tokio::fs;
use tracing::info;

use crate::ConfigError;

const BACKUP_PREFIX: &str = "benchmarks-";
const BACKUP_SUFFIX: &str = ".yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkTable {
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Reference price per m² for each tier.
    pub tiers: BTreeMap<Tier, f64>,
}

impl BenchmarkTable {
    pub fn get(&self, tier: Tier) -> Option<f64> {
        self.tiers
            .get(&tier)
            .copied()
            .filter(|price| *price > 0.0 && price.is_finite())
    }

    pub fn validate(&self) -> Result<(), String> {
        for tier in Tier::ALL {
            match self.tiers.get(&tier) {
                None => return Err(format!("missing benchmark for tier {tier}")),
                Some(price) if !(*price > 0.0 && price.is_finite()) => {
                    return Err(format!("benchmark for tier {tier} must be positive, got {price}"))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub fn from_yaml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let table: Self = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        table.validate().map_err(|message| ConfigError::Invalid {
            path: path.to_path_buf(),
            message,
        })?;
        Ok(table)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub restored_from: PathBuf,
    pub restored_sha256: String,
}

/// The benchmark YAML file and its `backups/` directory.
#[derive(Debug, Clone)]
pub struct BenchmarkStore {
    path: PathBuf,
    backup_dir: PathBuf,
}

impl BenchmarkStore {
    pub fn new(path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_dir: backup_dir.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Startup load. A missing or invalid table is fatal for the caller.
    pub fn load(&self) -> Result<BenchmarkTable, ConfigError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;
        BenchmarkTable::from_yaml(&text, &self.path)
    }

    pub async fn current_sha256(&self) -> Result<String> {
        let bytes = fs::read(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        Ok(sha256_hex(&bytes))
    }

    pub async fn save(&self, table: &BenchmarkTable) -> Result<()> {
        table
            .validate()
            .map_err(|message| anyhow::anyhow!("refusing to save benchmarks: {message}"))?;
        let yaml = serde_yaml::to_string(table).context("serializing benchmark table")?;
        write_atomic(&self.path, yaml.as_bytes())
            .await
            .with_context(|| format!("writing {}", self.path.display()))
    }

    fn backup_name(at: DateTime<Utc>) -> String {
        format!("{BACKUP_PREFIX}{}{BACKUP_SUFFIX}", at.format("%Y%m%dT%H%M%S%.6fZ"))
    }

    /// Copies the current file byte-for-byte into `backups/`. Names sort chronologically.
    pub async fn backup(&self, at: DateTime<Utc>) -> Result<PathBuf> {
        let bytes = fs::read(&self.path)
            .await
            .with_context(|| format!("reading {} for backup", self.path.display()))?;
        fs::create_dir_all(&self.backup_dir)
            .await
            .with_context(|| format!("creating {}", self.backup_dir.display()))?;

        let mut stamp = at;
        let mut target = self.backup_dir.join(Self::backup_name(stamp));
        while fs::try_exists(&target).await.unwrap_or(false) {
            stamp += Duration::microseconds(1);
            target = self.backup_dir.join(Self::backup_name(stamp));
        }
        write_atomic(&target, &bytes)
            .await
            .with_context(|| format!("writing backup {}", target.display()))?;
        info!(backup = %target.display(), sha256 = %sha256_hex(&bytes), "backed up benchmark table");
        Ok(target)
    }

    pub async fn backups(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(&self.backup_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("listing {}", self.backup_dir.display()))
            }
        };
        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.backup_dir.display()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(BACKUP_PREFIX) && name.ends_with(BACKUP_SUFFIX) {
                out.push(entry.path());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Restores the newest backup verbatim and removes it, so a second call
    /// walks one step further back. `None` when there is nothing to restore.
    pub async fn rollback(&self) -> Result<Option<RollbackOutcome>> {
        let Some(latest) = self.backups().await?.pop() else {
            return Ok(None);
        };
        let bytes = fs::read(&latest)
            .await
            .with_context(|| format!("reading backup {}", latest.display()))?;
        BenchmarkTable::from_yaml(&String::from_utf8_lossy(&bytes), &latest)
            .with_context(|| format!("backup {} is not a valid benchmark table", latest.display()))?;
        write_atomic(&self.path, &bytes)
            .await
            .with_context(|| format!("restoring {}", self.path.display()))?;
        fs::remove_file(&latest)
            .await
            .with_context(|| format!("removing consumed backup {}", latest.display()))?;
        let restored_sha256 = sha256_hex(&bytes);
        info!(backup = %latest.display(), sha256 = %restored_sha256, "restored benchmark table");
        Ok(Some(RollbackOutcome {
            restored_from: latest,
            restored_sha256,
        }))
    }
}
