use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use terra_core::{AlertLevel, Provenance};
use terra_drift::DriftMonitor;
use terra_storage::ResultCache;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::acquire::{AcquirerSettings, PriceAcquirer};
use crate::config::TerraConfig;
use crate::registry::{build_slots, SourceRegistry};
use crate::report::{export_parquet_snapshots, write_reports, RegionFailure, RunReport};

#[derive(Debug, Clone, Serialize)]
pub struct WeeklyRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub regions: usize,
    pub live_prices: usize,
    pub cached_prices: usize,
    pub benchmark_prices: usize,
    pub snapshots_recorded: usize,
    pub region_failures: usize,
    pub active_alerts: usize,
    pub recommendations: usize,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

/// The weekly batch: price every catalogued region, record drift, analyze, report.
pub struct SyncPipeline {
    config: TerraConfig,
    monitor: DriftMonitor,
    acquirer: PriceAcquirer,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub async fn new(config: TerraConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_file())?;
        let slots = build_slots(&registry, &config.fetcher_config())
            .context("building source slots")?;
        let monitor = DriftMonitor::open(config.drift_paths())
            .await
            .context("opening drift monitor")?;
        let acquirer = PriceAcquirer::new(
            slots,
            ResultCache::new(config.cache_dir()),
            monitor.static_benchmarks(),
            AcquirerSettings {
                live_fetch: config.live_fetch,
                source_deadline: config.source_deadline,
            },
        );
        Ok(Self::from_parts(config, monitor, acquirer))
    }

    pub fn from_parts(config: TerraConfig, monitor: DriftMonitor, acquirer: PriceAcquirer) -> Self {
        Self {
            config,
            monitor,
            acquirer,
            run_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &TerraConfig {
        &self.config
    }

    pub fn monitor(&self) -> &DriftMonitor {
        &self.monitor
    }

    pub fn acquirer(&self) -> &PriceAcquirer {
        &self.acquirer
    }

    pub async fn run_once(&self) -> Result<WeeklyRunSummary> {
        self.run_once_at(Utc::now()).await
    }

    /// Every snapshot of one run carries `started_at`, so a run is a single
    /// point on each region's history.
    pub async fn run_once_at(&self, started_at: DateTime<Utc>) -> Result<WeeklyRunSummary> {
        let _guard = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("weekly_run", %run_id);
        self.run_locked(run_id, started_at).instrument(span).await
    }

    async fn run_locked(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<WeeklyRunSummary> {
        self.monitor
            .reload_benchmarks()
            .await
            .context("reloading benchmarks")?;
        let regions: Vec<String> = self
            .monitor
            .catalog()
            .names()
            .map(ToString::to_string)
            .collect();
        info!(regions = regions.len(), sources = ?self.acquirer.source_ids(), "weekly run started");

        let mut prices = Vec::with_capacity(regions.len());
        let mut snapshots = Vec::new();
        let mut failures = Vec::new();

        for region in &regions {
            let price = self
                .acquirer
                .get_price_at(region, self.config.max_listings, started_at)
                .await;

            if price.provenance.is_benchmark() {
                debug!(region = %region, "benchmark fallback is not recorded as drift");
            } else {
                match self
                    .monitor
                    .record_and_append(
                        region,
                        price.price(),
                        &price.provenance.tag(),
                        price.confidence,
                        started_at,
                    )
                    .await
                {
                    Ok(Some(snapshot)) => snapshots.push(snapshot),
                    Ok(None) => {
                        info!(region = %region, "region has no usable benchmark; drift not recorded")
                    }
                    Err(err) => {
                        warn!(region = %region, error = %err, "recording drift failed; continuing");
                        failures.push(RegionFailure {
                            region: region.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            }
            prices.push(price);
        }

        let alerts = self
            .monitor
            .scan_all_regions(started_at)
            .await
            .context("scanning drift alerts")?;
        let tiers = self.monitor.review(started_at).await.context("summarizing tiers")?;
        let recommendations = self
            .monitor
            .recommendations(started_at)
            .await
            .context("computing recalibration recommendations")?;

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources: self.acquirer.source_ids().into_iter().map(ToString::to_string).collect(),
            prices,
            snapshots,
            failures,
            alerts,
            tiers,
            recommendations,
        };

        let reports_dir = write_reports(&self.config.reports_dir(), &report).await?;
        let manifest_path = export_parquet_snapshots(&reports_dir, &report).await?;
        let summary = summarize(&report, reports_dir, manifest_path);
        info!(
            snapshots = summary.snapshots_recorded,
            failures = summary.region_failures,
            alerts = summary.active_alerts,
            reports_dir = %summary.reports_dir,
            "weekly run finished"
        );
        Ok(summary)
    }
}

fn summarize(report: &RunReport, reports_dir: PathBuf, manifest_path: PathBuf) -> WeeklyRunSummary {
    let count = |pred: fn(&Provenance) -> bool| {
        report
            .prices
            .iter()
            .filter(|p| pred(&p.provenance))
            .count()
    };
    WeeklyRunSummary {
        run_id: report.run_id,
        started_at: report.started_at,
        finished_at: report.finished_at,
        regions: report.prices.len(),
        live_prices: count(|p| matches!(p, Provenance::SourceLive { .. })),
        cached_prices: count(|p| matches!(p, Provenance::SourceCached { .. })),
        benchmark_prices: count(Provenance::is_benchmark),
        snapshots_recorded: report.snapshots.len(),
        region_failures: report.failures.len(),
        active_alerts: report
            .alerts
            .iter()
            .filter(|a| a.level != AlertLevel::None)
            .count(),
        recommendations: report.recommendations.recommendations.len(),
        reports_dir: reports_dir.display().to_string(),
        parquet_manifest: manifest_path.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::tests::{slot, Behaviour, FakeSource};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use terra_core::{DriftSnapshot, Tier};

    fn workspace() -> (TempDir, TerraConfig) {
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
            "regions:\n  - {name: Sleman, tier: secondary}\n  - {name: Bantul, tier: emerging}\n",
        )
        .unwrap();
        let env: HashMap<String, String> = [(
            "TERRA_WORKSPACE_ROOT".to_string(),
            dir.path().display().to_string(),
        )]
        .into_iter()
        .collect();
        let config = TerraConfig::from_lookup(|key| env.get(key).cloned());
        (dir, config)
    }

    async fn pipeline(
        config: TerraConfig,
        behaviour: Option<Behaviour>,
    ) -> (SyncPipeline, Option<Arc<AtomicUsize>>) {
        let monitor = DriftMonitor::open(config.drift_paths()).await.unwrap();
        let (slots, calls) = match behaviour {
            Some(behaviour) => {
                let (source, calls) = FakeSource::boxed("lamudi", behaviour);
                (vec![slot(source)], Some(calls))
            }
            None => (Vec::new(), None),
        };
        let acquirer = PriceAcquirer::new(
            slots,
            ResultCache::new(config.cache_dir()),
            monitor.static_benchmarks(),
            AcquirerSettings {
                live_fetch: true,
                source_deadline: Duration::from_secs(5),
            },
        );
        (SyncPipeline::from_parts(config, monitor, acquirer), calls)
    }

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-10-12T06:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn without_time(snapshot: &DriftSnapshot) -> DriftSnapshot {
        DriftSnapshot {
            recorded_at: DateTime::<Utc>::MIN_UTC,
            ..snapshot.clone()
        }
    }

    #[tokio::test]
    async fn rerun_inside_cache_ttl_reproduces_snapshots() {
        let (_dir, config) = workspace();
        let (pipeline, calls) =
            pipeline(config, Some(Behaviour::Listings(vec![4_200_000.0]))).await;
        let calls = calls.unwrap();

        let first = pipeline.run_once_at(start()).await.unwrap();
        let second = pipeline
            .run_once_at(start() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(first.snapshots_recorded, 2);
        assert_eq!(second.snapshots_recorded, 2);
        assert_eq!(second.live_prices, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        for region in ["Sleman", "Bantul"] {
            let history = pipeline.monitor().history().load(region).await.unwrap();
            assert_eq!(history.len(), 2);
            assert_eq!(without_time(&history[0]), without_time(&history[1]));
            assert_eq!(history[0].data_source, "source_live[0]");
        }
        let sleman = pipeline.monitor().history().load("Sleman").await.unwrap();
        assert!((sleman[0].drift_pct - 20.0).abs() < 1e-9);

        let reports_dir = PathBuf::from(&second.reports_dir);
        assert!(reports_dir.join("weekly_brief.md").exists());
        assert!(reports_dir.join("drift_delta.json").exists());
        assert!(PathBuf::from(&second.parquet_manifest).exists());
    }

    #[tokio::test]
    async fn benchmark_fallbacks_price_every_region_without_recording_drift() {
        let (_dir, config) = workspace();
        let (pipeline, _) = pipeline(config, None).await;

        let summary = pipeline.run_once_at(start()).await.unwrap();
        assert_eq!(summary.regions, 2);
        assert_eq!(summary.benchmark_prices, 2);
        assert_eq!(summary.snapshots_recorded, 0);
        assert!(pipeline.monitor().history().load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn benchmarks_changed_between_runs_are_picked_up() {
        let (dir, config) = workspace();
        let (pipeline, _) = pipeline(config, Some(Behaviour::Listings(vec![4_200_000.0]))).await;

        pipeline.run_once_at(start()).await.unwrap();
        std::fs::write(
            dir.path().join("config/benchmarks.yaml"),
            "currency: IDR\ntiers:\n  metro: 8000000\n  secondary: 4200000\n  emerging: 1200000\n  frontier: 350000\n",
        )
        .unwrap();
        pipeline
            .run_once_at(start() + chrono::Duration::weeks(1))
            .await
            .unwrap();

        let sleman = pipeline.monitor().history().load("Sleman").await.unwrap();
        assert_eq!(sleman.len(), 2);
        assert_eq!(sleman[0].benchmark_price, 3_500_000.0);
        assert!((sleman[0].drift_pct - 20.0).abs() < 1e-9);
        assert_eq!(sleman[1].benchmark_price, 4_200_000.0);
        assert!(sleman[1].drift_pct.abs() < 1e-9);
    }

    #[tokio::test]
    async fn one_failing_region_does_not_stop_the_batch() {
        let (_dir, config) = workspace();
        let (pipeline, _) = pipeline(config, Some(Behaviour::Listings(vec![1_500_000.0]))).await;
        let future = DriftSnapshot {
            recorded_at: start() + chrono::Duration::days(7),
            region: "Bantul".into(),
            tier: Tier::Emerging,
            benchmark_price: 1_200_000.0,
            live_price: 1_200_000.0,
            drift_pct: 0.0,
            data_source: "source_live[0]".into(),
            confidence: 0.85,
            alert_level: AlertLevel::None,
        };
        pipeline.monitor().history().append(&future).await.unwrap();

        let summary = pipeline.run_once_at(start()).await.unwrap();
        assert_eq!(summary.region_failures, 1);
        assert_eq!(summary.snapshots_recorded, 1);
        let sleman = pipeline.monitor().history().load("Sleman").await.unwrap();
        assert_eq!(sleman.len(), 1);
    }
}
