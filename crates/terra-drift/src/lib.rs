//! Benchmark drift monitoring: recording, alerting, tier roll-ups and recalibration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use terra_core::{DriftAlert, DriftSnapshot, Tier, TierStatus};
use terra_storage::{HistoryError, HistoryStore, RetentionPolicy};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub mod alerts;
pub mod benchmarks;
pub mod config;
pub mod recalibration;
pub mod recorder;
pub mod regions;
pub mod tiers;

pub use alerts::AlertEngine;
pub use benchmarks::{sha256_hex, BenchmarkStore, BenchmarkTable, RollbackOutcome};
pub use config::DriftConfig;
pub use recalibration::{
    ApplyOutcome, AppliedChange, ArtifactPaths, RecalibrationAdvisor, RecommendationSet,
    TierSelection,
};
pub use recorder::{classify_drift, drift_pct, DriftRecorder};
pub use regions::{Classification, MatchKind, RegionCatalog, RegionClassifier, RegionEntry};
pub use tiers::TierAggregator;

pub const CRATE_NAME: &str = "terra-drift";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid {path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

/// Where the monitor finds its configuration and keeps its state.
#[derive(Debug, Clone)]
pub struct DriftPaths {
    pub benchmarks_file: PathBuf,
    pub regions_file: PathBuf,
    pub drift_config_file: PathBuf,
    pub history_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub recalibration_dir: PathBuf,
}

/// The benchmark table as currently loaded, shared between the monitor and
/// the price acquirer so a reload is seen by both.
pub type SharedBenchmarks = Arc<RwLock<BenchmarkTable>>;

/// Region → benchmark lookup for the last-resort price. Regions outside the
/// catalog use the configured fallback tier.
#[derive(Debug, Clone)]
pub struct StaticBenchmarks {
    classifier: RegionClassifier,
    table: SharedBenchmarks,
    fallback_tier: Tier,
}

impl StaticBenchmarks {
    pub fn new(classifier: RegionClassifier, table: BenchmarkTable, fallback_tier: Tier) -> Self {
        Self {
            classifier,
            table: Arc::new(RwLock::new(table)),
            fallback_tier,
        }
    }

    pub async fn lookup(&self, region: &str) -> (Tier, Option<f64>) {
        let tier = self.classifier.tier_of(region).unwrap_or(self.fallback_tier);
        (tier, self.table.read().await.get(tier))
    }
}

/// Owns the loaded configuration and the history store.
pub struct DriftMonitor {
    config: DriftConfig,
    benchmarks: BenchmarkStore,
    table: SharedBenchmarks,
    catalog: RegionCatalog,
    classifier: RegionClassifier,
    history: HistoryStore,
    recalibration_dir: PathBuf,
}

impl DriftMonitor {
    /// Loads every config file and validates every history file. Any failure
    /// here is a startup error.
    pub async fn open(paths: DriftPaths) -> Result<Self> {
        let config = DriftConfig::load(&paths.drift_config_file)?;
        let benchmarks = BenchmarkStore::new(&paths.benchmarks_file, &paths.backups_dir);
        let table = benchmarks.load()?;
        let catalog = RegionCatalog::load(&paths.regions_file)?;
        let classifier = RegionClassifier::new(&catalog, config.fuzzy_match_threshold);
        let history = HistoryStore::new(
            &paths.history_dir,
            RetentionPolicy {
                retention_days: config.retention_days,
            },
        );
        let existing = history
            .load_all()
            .await
            .context("validating drift history at startup")?;
        info!(
            regions = catalog.regions.len(),
            histories = existing.len(),
            currency = %table.currency,
            "drift monitor ready"
        );
        Ok(Self {
            config,
            benchmarks,
            table: Arc::new(RwLock::new(table)),
            catalog,
            classifier,
            history,
            recalibration_dir: paths.recalibration_dir,
        })
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    pub fn catalog(&self) -> &RegionCatalog {
        &self.catalog
    }

    /// A copy of the table as last loaded.
    pub async fn benchmarks(&self) -> BenchmarkTable {
        self.table.read().await.clone()
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn classify(&self, region: &str) -> Option<Classification> {
        self.classifier.classify(region)
    }

    pub fn static_benchmarks(&self) -> StaticBenchmarks {
        StaticBenchmarks {
            classifier: self.classifier.clone(),
            table: Arc::clone(&self.table),
            fallback_tier: self.config.fallback_tier,
        }
    }

    /// Records one observation and appends it to the region's history.
    pub async fn record_and_append(
        &self,
        region: &str,
        live_price: f64,
        data_source: &str,
        confidence: f64,
        at: DateTime<Utc>,
    ) -> Result<Option<DriftSnapshot>, HistoryError> {
        let recorded = {
            let table = self.table.read().await;
            DriftRecorder::new(&self.classifier, &table, &self.config)
                .record(region, live_price, data_source, confidence, at)
        };
        let Some(snapshot) = recorded else {
            return Ok(None);
        };
        let outcome = self.history.append(&snapshot).await?;
        if outcome.pruned > 0 {
            info!(
                region = %snapshot.region,
                pruned = outcome.pruned,
                "pruned expired drift snapshots"
            );
        }
        Ok(Some(snapshot))
    }

    async fn histories(&self) -> Result<BTreeMap<String, Vec<DriftSnapshot>>, HistoryError> {
        self.history.load_all().await
    }

    pub async fn scan_all_regions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DriftAlert>, HistoryError> {
        let histories = self.histories().await?;
        Ok(AlertEngine::new(self.config.clone()).scan(&histories, now))
    }

    pub async fn summarize(
        &self,
        tier: Tier,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<TierStatus, HistoryError> {
        let histories = self.histories().await?;
        Ok(TierAggregator::new(self.config.smoothing_days).summarize(tier, days, &histories, now))
    }

    /// Every tier over the configured review window.
    pub async fn review(&self, now: DateTime<Utc>) -> Result<Vec<TierStatus>, HistoryError> {
        let histories = self.histories().await?;
        Ok(TierAggregator::new(self.config.smoothing_days).summarize_all(
            self.config.review_window_days,
            &histories,
            now,
        ))
    }

    /// Computes recommendations without persisting anything.
    pub async fn recommendations(&self, now: DateTime<Utc>) -> Result<RecommendationSet> {
        let summaries = self.review(now).await?;
        let table = self.benchmarks().await;
        let recommendations = RecalibrationAdvisor::new(&self.config).propose(&summaries, &table);
        Ok(RecommendationSet {
            generated_at: now,
            currency: table.currency,
            benchmark_sha256: self.benchmarks.current_sha256().await?,
            recommendations,
        })
    }

    /// Computes recommendations and saves the markdown + JSON artifact.
    pub async fn propose(&self, now: DateTime<Utc>) -> Result<(RecommendationSet, ArtifactPaths)> {
        let set = self.recommendations(now).await?;
        let paths = recalibration::write_artifacts(&self.recalibration_dir, &set).await?;
        info!(
            recommendations = set.recommendations.len(),
            artifact = %paths.json.display(),
            "wrote recalibration proposal"
        );
        Ok((set, paths))
    }

    pub async fn latest_proposal(&self) -> Result<Option<RecommendationSet>> {
        Ok(recalibration::latest_artifact(&self.recalibration_dir)
            .await?
            .map(|(_, set)| set))
    }

    /// Re-reads the benchmark file. Another process may have applied or
    /// rolled back benchmarks since this monitor was opened.
    pub async fn reload_benchmarks(&self) -> Result<()> {
        let fresh = self.benchmarks.load()?;
        let mut table = self.table.write().await;
        if *table != fresh {
            info!(
                benchmarks = %self.benchmarks.path().display(),
                "benchmark table changed on disk; reloaded"
            );
            *table = fresh;
        }
        Ok(())
    }

    /// Applies part or all of `set`, then reloads the in-memory table.
    pub async fn apply(
        &self,
        set: &RecommendationSet,
        selection: TierSelection,
        at: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        let outcome = recalibration::apply(&self.benchmarks, set, selection, at).await?;
        let fresh = self.benchmarks.load()?;
        *self.table.write().await = fresh;
        Ok(outcome)
    }

    pub async fn rollback(&self) -> Result<Option<RollbackOutcome>> {
        let outcome = self.benchmarks.rollback().await?;
        if outcome.is_some() {
            let fresh = self.benchmarks.load()?;
            *self.table.write().await = fresh;
        } else {
            warn!(
                backups = %self.benchmarks.backup_dir().display(),
                "no benchmark backup to roll back to"
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::{tempdir, TempDir};
    use terra_core::AlertLevel;

    fn workspace() -> (TempDir, DriftPaths) {
        let dir = tempdir().unwrap();
        let config_dir = dir.path().join("config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("benchmarks.yaml"),
            "currency: IDR\ntiers:\n  metro: 8000000\n  secondary: 3500000\n  emerging: 1200000\n  frontier: 350000\n",
        )
        .unwrap();
        std::fs::write(
            config_dir.join("regions.yaml"),
            "regions:\n  - {name: Jakarta Selatan, tier: metro}\n  - {name: Sleman, tier: secondary}\n",
        )
        .unwrap();
        let paths = DriftPaths {
            benchmarks_file: config_dir.join("benchmarks.yaml"),
            regions_file: config_dir.join("regions.yaml"),
            drift_config_file: config_dir.join("drift.yaml"),
            history_dir: dir.path().join("data/history"),
            backups_dir: dir.path().join("data/backups"),
            recalibration_dir: dir.path().join("reports/recalibration"),
        };
        (dir, paths)
    }

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-08-03T06:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn weekly_critical_drift_flows_into_alerts_and_a_proposal() {
        let (_dir, paths) = workspace();
        let monitor = DriftMonitor::open(paths.clone()).await.unwrap();

        let now = start() + Duration::weeks(2);
        for week in 0..3 {
            let at = start() + Duration::weeks(week);
            let snapshot = monitor
                .record_and_append("Jakarta Selatan", 11_000_000.0, "source_live[0]", 0.85, at)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(snapshot.alert_level, AlertLevel::Critical);
        }
        assert!(monitor
            .record_and_append("Atlantis", 1.0, "source_live[0]", 0.85, now)
            .await
            .unwrap()
            .is_none());

        let alerts = monitor.scan_all_regions(now).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Critical);
        assert_eq!(alerts[0].consecutive_periods, 3);

        let (set, artifacts) = monitor.propose(now).await.unwrap();
        assert!(artifacts.json.exists());
        assert_eq!(set.recommendations.len(), 1);
        assert_eq!(set.recommendations[0].proposed_benchmark, 11_000_000.0);

        let original = std::fs::read(&paths.benchmarks_file).unwrap();
        let latest = monitor.latest_proposal().await.unwrap().unwrap();
        monitor.apply(&latest, TierSelection::One(Tier::Metro), now).await.unwrap();
        assert_eq!(monitor.benchmarks().await.get(Tier::Metro), Some(11_000_000.0));

        monitor.rollback().await.unwrap().unwrap();
        assert_eq!(std::fs::read(&paths.benchmarks_file).unwrap(), original);
        assert_eq!(monitor.benchmarks().await.get(Tier::Metro), Some(8_000_000.0));
        assert!(monitor.rollback().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_history_is_fatal_at_open() {
        let (_dir, paths) = workspace();
        std::fs::create_dir_all(&paths.history_dir).unwrap();
        std::fs::write(paths.history_dir.join("sleman.json"), b"{not json").unwrap();
        assert!(DriftMonitor::open(paths).await.is_err());
    }

    #[tokio::test]
    async fn missing_benchmarks_are_fatal_at_open() {
        let (_dir, paths) = workspace();
        std::fs::remove_file(&paths.benchmarks_file).unwrap();
        let err = DriftMonitor::open(paths).await.err().unwrap();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }

    #[tokio::test]
    async fn unclassified_regions_fall_back_to_the_configured_tier() {
        let (_dir, paths) = workspace();
        let benchmarks = DriftMonitor::open(paths).await.unwrap().static_benchmarks();
        assert_eq!(benchmarks.lookup("Sleman").await, (Tier::Secondary, Some(3_500_000.0)));
        assert_eq!(benchmarks.lookup("Atlantis").await, (Tier::Emerging, Some(1_200_000.0)));
    }

    #[tokio::test]
    async fn reload_picks_up_benchmarks_changed_by_another_process() {
        let (_dir, paths) = workspace();
        let monitor = DriftMonitor::open(paths.clone()).await.unwrap();
        let fallback = monitor.static_benchmarks();

        std::fs::write(
            &paths.benchmarks_file,
            "currency: IDR\ntiers:\n  metro: 8000000\n  secondary: 4200000\n  emerging: 1200000\n  frontier: 350000\n",
        )
        .unwrap();
        assert_eq!(fallback.lookup("Sleman").await.1, Some(3_500_000.0));

        monitor.reload_benchmarks().await.unwrap();
        assert_eq!(monitor.benchmarks().await.get(Tier::Secondary), Some(4_200_000.0));
        assert_eq!(fallback.lookup("Sleman").await.1, Some(4_200_000.0));

        let snapshot = monitor
            .record_and_append("Sleman", 4_200_000.0, "source_live[0]", 0.85, start())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.benchmark_price, 4_200_000.0);
        assert_eq!(snapshot.drift_pct, 0.0);
    }
}
