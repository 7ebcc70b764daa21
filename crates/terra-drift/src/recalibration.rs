//! Benchmark recalibration proposals and the operator-approved apply step.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use terra_core::{Recommendation, RecommendationStatus, Tier, TierStatus, Urgency};
use terra_storage::write_atomic;
use tokio::fs;
use tracing::info;

use crate::benchmarks::{BenchmarkStore, BenchmarkTable};
use crate::config::DriftConfig;

/// One `propose` run, as saved under `reports/recalibration/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationSet {
    pub generated_at: DateTime<Utc>,
    pub currency: String,
    /// Digest of the benchmark file the proposals were computed against.
    pub benchmark_sha256: String,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactPaths {
    pub markdown: PathBuf,
    pub json: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierSelection {
    One(Tier),
    All,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    pub tier: Tier,
    pub previous: f64,
    pub new: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    pub backup: PathBuf,
    pub applied: Vec<AppliedChange>,
}

#[derive(Debug, Clone, Copy)]
pub struct RecalibrationAdvisor {
    threshold_pct: f64,
    high_urgency_pct: f64,
}

impl RecalibrationAdvisor {
    pub fn new(config: &DriftConfig) -> Self {
        Self {
            threshold_pct: config.recalibration_threshold_pct,
            high_urgency_pct: config.high_urgency_threshold_pct,
        }
    }

    pub fn propose(&self, summaries: &[TierStatus], table: &BenchmarkTable) -> Vec<Recommendation> {
        summaries
            .iter()
            .filter_map(TierStatus::summary)
            .filter_map(|summary| {
                let smoothed = summary.smoothed_drift_30d_pct?;
                if smoothed.abs() <= self.threshold_pct {
                    return None;
                }
                let current = table.get(summary.tier)?;
                let proposed = (current * (1.0 + smoothed / 100.0)).round();
                let urgency = if smoothed.abs() > self.high_urgency_pct {
                    Urgency::High
                } else {
                    Urgency::Medium
                };
                Some(Recommendation {
                    tier: summary.tier,
                    current_benchmark: current,
                    proposed_benchmark: proposed,
                    smoothed_drift_pct: smoothed,
                    urgency,
                    region_count: summary.region_count,
                    rationale: format!(
                        "30-day smoothed drift of {smoothed:+.2}% across {} region(s) exceeds the {:.0}% recalibration band",
                        summary.region_count, self.threshold_pct
                    ),
                    status: RecommendationStatus::PendingApproval,
                })
            })
            .collect()
    }
}

pub fn render_markdown(set: &RecommendationSet) -> String {
    let mut lines = vec![
        "# Benchmark Recalibration Proposal".to_string(),
        String::new(),
        format!("- Generated: {}", set.generated_at.to_rfc3339()),
        format!("- Currency: {}", set.currency),
        format!("- Benchmark file sha256: `{}`", set.benchmark_sha256),
        String::new(),
    ];
    if set.recommendations.is_empty() {
        lines.push("No tier exceeds the recalibration band. Nothing to apply.".to_string());
    } else {
        lines.push("| Tier | Current | Proposed | Smoothed drift | Urgency | Regions |".to_string());
        lines.push("|------|--------:|---------:|---------------:|---------|--------:|".to_string());
        for rec in &set.recommendations {
            lines.push(format!(
                "| {} | {:.0} | {:.0} | {:+.2}% | {} | {} |",
                rec.tier,
                rec.current_benchmark,
                rec.proposed_benchmark,
                rec.smoothed_drift_pct,
                rec.urgency,
                rec.region_count
            ));
        }
        lines.push(String::new());
        lines.push("## Rationale".to_string());
        for rec in &set.recommendations {
            lines.push(format!("- **{}**: {}", rec.tier, rec.rationale));
        }
        lines.push(String::new());
        lines.push("Status: pending operator approval (`terra-cli apply`).".to_string());
    }
    lines.push(String::new());
    lines.join("\n")
}

fn artifact_stem(at: DateTime<Utc>) -> String {
    format!("recommendations-{}", at.format("%Y%m%dT%H%M%SZ"))
}

pub async fn write_artifacts(dir: &Path, set: &RecommendationSet) -> Result<ArtifactPaths> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let stem = artifact_stem(set.generated_at);
    let markdown = dir.join(format!("{stem}.md"));
    let json = dir.join(format!("{stem}.json"));

    write_atomic(&markdown, render_markdown(set).as_bytes())
        .await
        .with_context(|| format!("writing {}", markdown.display()))?;
    let bytes = serde_json::to_vec_pretty(set).context("serializing recommendations")?;
    write_atomic(&json, &bytes)
        .await
        .with_context(|| format!("writing {}", json.display()))?;
    Ok(ArtifactPaths { markdown, json })
}

/// Most recent saved proposal, by file name.
pub async fn latest_artifact(dir: &Path) -> Result<Option<(PathBuf, RecommendationSet)>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("listing {}", dir.display())),
    };
    let mut latest: Option<PathBuf> = None;
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", dir.display()))?
    {
        let path = entry.path();
        let is_artifact = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("recommendations-") && n.ends_with(".json"))
            .unwrap_or(false);
        if is_artifact && latest.as_ref().map_or(true, |l| path > *l) {
            latest = Some(path);
        }
    }
    let Some(path) = latest else {
        return Ok(None);
    };
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let set = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some((path, set)))
}

/// Applies the selected recommendations after backing up the current file.
///
/// Refuses when the benchmark file changed since the proposal was computed,
/// so a proposal is never applied twice or on top of a manual edit.
pub async fn apply(
    store: &BenchmarkStore,
    set: &RecommendationSet,
    selection: TierSelection,
    at: DateTime<Utc>,
) -> Result<ApplyOutcome> {
    let selected: Vec<&Recommendation> = set
        .recommendations
        .iter()
        .filter(|rec| match selection {
            TierSelection::All => true,
            TierSelection::One(tier) => rec.tier == tier,
        })
        .collect();
    if selected.is_empty() {
        match selection {
            TierSelection::All => bail!("no pending recommendations to apply"),
            TierSelection::One(tier) => bail!("no pending recommendation for tier {tier}"),
        }
    }

    let current_sha = store.current_sha256().await?;
    if current_sha != set.benchmark_sha256 {
        bail!(
            "benchmark file changed since the proposal was generated ({} != {}); run propose again",
            current_sha,
            set.benchmark_sha256
        );
    }

    let backup = store.backup(at).await.context("backing up benchmarks before apply")?;

    let mut table = store.load().context("loading benchmarks for apply")?;
    let mut applied = Vec::new();
    for rec in selected {
        let previous = table.get(rec.tier).unwrap_or(rec.current_benchmark);
        table.tiers.insert(rec.tier, rec.proposed_benchmark);
        applied.push(AppliedChange {
            tier: rec.tier,
            previous,
            new: rec.proposed_benchmark,
        });
    }
    table.updated_at = Some(at);
    store.save(&table).await?;

    for change in &applied {
        info!(tier = %change.tier, previous = change.previous, new = change.new, "applied benchmark recalibration");
    }
    Ok(ApplyOutcome { backup, applied })
}
