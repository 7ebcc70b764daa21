//! Weekly land-price sync: configuration, price acquisition, batch pipeline and reports.

use anyhow::Result;

pub mod acquire;
pub mod config;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod schedule;

pub use acquire::{cached_confidence, AcquirerSettings, PriceAcquirer, BENCHMARK_CONFIDENCE, LIVE_CONFIDENCE};
pub use config::{TerraConfig, DEFAULT_SYNC_CRON};
pub use pipeline::{SyncPipeline, WeeklyRunSummary};
pub use registry::{build_slots, SourceRegistry, SourceSlot};
pub use report::{ParquetManifest, ParquetManifestFile, RegionFailure, RunReport};
pub use schedule::{build_scheduler, maybe_build_scheduler};

pub const CRATE_NAME: &str = "terra-sync";

pub async fn run_sync_once_from_env() -> Result<WeeklyRunSummary> {
    let config = TerraConfig::from_env();
    let pipeline = SyncPipeline::new(config).await?;
    pipeline.run_once().await
}
