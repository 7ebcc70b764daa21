use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::pipeline::SyncPipeline;

/// Builds the weekly cron job when `TERRA_SCHEDULER_ENABLED` is set. The
/// returned scheduler is not started.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(pipeline).await.map(Some)
}

pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<JobScheduler> {
    let cron = pipeline.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            info!("scheduled weekly run triggered");
            match pipeline.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, snapshots = summary.snapshots_recorded, "scheduled weekly run done"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled weekly run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::tests::benchmarks;
    use crate::acquire::{AcquirerSettings, PriceAcquirer};
    use crate::config::TerraConfig;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::tempdir;
    use terra_drift::DriftMonitor;
    use terra_storage::ResultCache;

    async fn pipeline(pairs: &[(&str, &str)]) -> (tempfile::TempDir, Arc<SyncPipeline>) {
        let dir = tempdir().unwrap();
        let config_dir = dir.path().join("config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("benchmarks.yaml"),
            "currency: IDR\ntiers:\n  metro: 8000000\n  secondary: 3500000\n  emerging: 1200000\n  frontier: 350000\n",
        )
        .unwrap();
        std::fs::write(config_dir.join("regions.yaml"), "regions:\n  - {name: Sleman, tier: secondary}\n").unwrap();

        let mut env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.insert("TERRA_WORKSPACE_ROOT".into(), dir.path().display().to_string());
        let config = TerraConfig::from_lookup(|key| env.get(key).cloned());
        let monitor = DriftMonitor::open(config.drift_paths()).await.unwrap();
        let acquirer = PriceAcquirer::new(
            Vec::new(),
            ResultCache::new(config.cache_dir()),
            benchmarks(),
            AcquirerSettings {
                live_fetch: false,
                source_deadline: Duration::from_secs(1),
            },
        );
        (dir, Arc::new(SyncPipeline::from_parts(config, monitor, acquirer)))
    }

    #[tokio::test]
    async fn scheduler_is_off_unless_enabled() {
        let (_dir, pipeline) = pipeline(&[]).await;
        assert!(maybe_build_scheduler(pipeline).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn enabled_scheduler_accepts_the_weekly_cron() {
        let (_dir, pipeline) = pipeline(&[("TERRA_SCHEDULER_ENABLED", "true")]).await;
        assert!(maybe_build_scheduler(pipeline).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_cron_is_a_startup_error() {
        let (_dir, pipeline) = pipeline(&[
            ("TERRA_SCHEDULER_ENABLED", "true"),
            ("TERRA_SYNC_CRON", "every monday please"),
        ])
        .await;
        assert!(maybe_build_scheduler(pipeline).await.is_err());
    }
}
