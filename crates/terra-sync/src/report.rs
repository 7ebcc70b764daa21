//! Per-run report directory: markdown brief, JSON delta and Parquet snapshots.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use terra_core::{AlertLevel, DriftAlert, DriftSnapshot, PriceResult, TierStatus};
use terra_drift::RecommendationSet;
use tokio::fs;
use uuid::Uuid;

pub const PARQUET_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionFailure {
    pub region: String,
    pub error: String,
}

/// Everything one weekly run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<String>,
    pub prices: Vec<PriceResult>,
    pub snapshots: Vec<DriftSnapshot>,
    pub failures: Vec<RegionFailure>,
    pub alerts: Vec<DriftAlert>,
    pub tiers: Vec<TierStatus>,
    pub recommendations: RecommendationSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub async fn write_reports(reports_root: &Path, report: &RunReport) -> Result<PathBuf> {
    let reports_dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join("weekly_brief.md"), render_brief(report))
        .await
        .context("writing weekly_brief.md")?;

    let delta_json = serde_json::to_vec_pretty(report).context("serializing drift delta")?;
    fs::write(reports_dir.join("drift_delta.json"), delta_json)
        .await
        .context("writing drift_delta.json")?;

    Ok(reports_dir)
}

pub fn render_brief(report: &RunReport) -> String {
    let mut out = format!(
        "# Terra Weekly Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Sources: {}\n- Regions priced: {}\n- Snapshots recorded: {}\n- Region failures: {}\n",
        report.run_id,
        report.started_at,
        report.finished_at,
        if report.sources.is_empty() {
            "none".to_string()
        } else {
            report.sources.join(", ")
        },
        report.prices.len(),
        report.snapshots.len(),
        report.failures.len(),
    );

    out.push_str("\n## Prices\n\n| region | price/m² | provenance | confidence |\n|---|---:|---|---:|\n");
    for price in &report.prices {
        out.push_str(&format!(
            "| {} | {:.0} | {} | {:.2} |\n",
            price.region,
            price.price(),
            price.provenance.tag(),
            price.confidence
        ));
    }

    out.push_str("\n## Alerts\n\n");
    let active: Vec<&DriftAlert> = report
        .alerts
        .iter()
        .filter(|a| a.level != AlertLevel::None)
        .collect();
    if active.is_empty() {
        out.push_str("No persistent drift.\n");
    }
    for alert in active {
        out.push_str(&format!(
            "- **{}** {} ({}): {:+.1}% for {} periods. {}\n",
            alert.level,
            alert.region,
            alert.tier,
            alert.current_drift_pct,
            alert.consecutive_periods,
            alert.recommendation
        ));
    }

    out.push_str("\n## Tiers\n\n");
    for status in &report.tiers {
        match status.summary() {
            Some(summary) => out.push_str(&format!(
                "- {}: weighted {:+.1}% over {} regions, {} snapshots\n",
                summary.tier, summary.weighted_avg_drift_pct, summary.region_count, summary.snapshot_count
            )),
            None => out.push_str(&format!("- {}: no data\n", status.tier())),
        }
    }

    out.push_str("\n## Recalibration\n\n");
    if report.recommendations.recommendations.is_empty() {
        out.push_str("No benchmark changes suggested.\n");
    }
    for rec in &report.recommendations.recommendations {
        out.push_str(&format!(
            "- [{}] {}: {:.0} -> {:.0} {}\n",
            rec.urgency, rec.tier, rec.current_benchmark, rec.proposed_benchmark, report.recommendations.currency
        ));
    }

    if !report.failures.is_empty() {
        out.push_str("\n## Failures\n\n");
        for failure in &report.failures {
            out.push_str(&format!("- {}: {}\n", failure.region, failure.error));
        }
    }
    out
}

pub async fn export_parquet_snapshots(reports_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let drift_path = snapshot_dir.join("drift_snapshots.parquet");
    let prices_path = snapshot_dir.join("prices.parquet");

    write_drift_snapshots_parquet(&drift_path, &report.snapshots)?;
    write_prices_parquet(&prices_path, &report.prices)?;

    let manifest = ParquetManifest {
        schema_version: PARQUET_SCHEMA_VERSION,
        files: vec![
            manifest_entry("drift_snapshots", reports_dir, &drift_path)?,
            manifest_entry("prices", reports_dir, &prices_path)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_drift_snapshots_parquet(path: &Path, snapshots: &[DriftSnapshot]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("region", DataType::Utf8, false),
        ArrowField::new("tier", DataType::Utf8, false),
        ArrowField::new("recorded_at", DataType::Utf8, false),
        ArrowField::new("benchmark_price", DataType::Float64, false),
        ArrowField::new("live_price", DataType::Float64, false),
        ArrowField::new("drift_pct", DataType::Float64, false),
        ArrowField::new("data_source", DataType::Utf8, false),
        ArrowField::new("confidence", DataType::Float64, false),
        ArrowField::new("alert_level", DataType::Utf8, false),
    ]));

    let regions = StringArray::from(snapshots.iter().map(|s| s.region.as_str()).collect::<Vec<_>>());
    let tiers = StringArray::from(snapshots.iter().map(|s| s.tier.as_str()).collect::<Vec<_>>());
    let recorded = StringArray::from(
        snapshots
            .iter()
            .map(|s| s.recorded_at.to_rfc3339())
            .collect::<Vec<_>>(),
    );
    let benchmarks = Float64Array::from(snapshots.iter().map(|s| s.benchmark_price).collect::<Vec<_>>());
    let live = Float64Array::from(snapshots.iter().map(|s| s.live_price).collect::<Vec<_>>());
    let drift = Float64Array::from(snapshots.iter().map(|s| s.drift_pct).collect::<Vec<_>>());
    let data_sources = StringArray::from(snapshots.iter().map(|s| s.data_source.as_str()).collect::<Vec<_>>());
    let confidences = Float64Array::from(snapshots.iter().map(|s| s.confidence).collect::<Vec<_>>());
    let levels = StringArray::from(
        snapshots
            .iter()
            .map(|s| s.alert_level.to_string())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(regions),
            Arc::new(tiers),
            Arc::new(recorded),
            Arc::new(benchmarks),
            Arc::new(live),
            Arc::new(drift),
            Arc::new(data_sources),
            Arc::new(confidences),
            Arc::new(levels),
        ],
    )
    .context("building drift snapshot record batch")?;
    write_parquet(path, batch)
}

fn write_prices_parquet(path: &Path, prices: &[PriceResult]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("region", DataType::Utf8, false),
        ArrowField::new("provenance", DataType::Utf8, false),
        ArrowField::new("source_id", DataType::Utf8, true),
        ArrowField::new("success", DataType::Boolean, false),
        ArrowField::new("median_price_per_m2", DataType::Float64, false),
        ArrowField::new("mean_price_per_m2", DataType::Float64, false),
        ArrowField::new("listing_count", DataType::UInt32, false),
        ArrowField::new("confidence", DataType::Float64, false),
        ArrowField::new("cache_age_hours", DataType::Float64, true),
    ]));

    let regions = StringArray::from(prices.iter().map(|p| p.region.as_str()).collect::<Vec<_>>());
    let provenance = StringArray::from(prices.iter().map(|p| p.provenance.tag()).collect::<Vec<_>>());
    let source_ids = StringArray::from(prices.iter().map(|p| p.provenance.source_id()).collect::<Vec<_>>());
    let success = BooleanArray::from(prices.iter().map(|p| p.success).collect::<Vec<_>>());
    let medians = Float64Array::from(prices.iter().map(|p| p.median_price_per_m2).collect::<Vec<_>>());
    let means = Float64Array::from(prices.iter().map(|p| p.mean_price_per_m2).collect::<Vec<_>>());
    let counts = UInt32Array::from(
        prices
            .iter()
            .map(|p| u32::try_from(p.listing_count).unwrap_or(u32::MAX))
            .collect::<Vec<_>>(),
    );
    let confidences = Float64Array::from(prices.iter().map(|p| p.confidence).collect::<Vec<_>>());
    let ages = Float64Array::from(prices.iter().map(|p| p.cache_age_hours).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(regions),
            Arc::new(provenance),
            Arc::new(source_ids),
            Arc::new(success),
            Arc::new(medians),
            Arc::new(means),
            Arc::new(counts),
            Arc::new(confidences),
            Arc::new(ages),
        ],
    )
    .context("building prices record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
