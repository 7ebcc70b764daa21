use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use terra_core::{DriftSnapshot, Tier, TierStatus, TierSummary};

/// Tier-level drift across every region classified into that tier.
#[derive(Debug, Clone, Copy)]
pub struct TierAggregator {
    smoothing_days: i64,
}

impl TierAggregator {
    pub fn new(smoothing_days: i64) -> Self {
        Self { smoothing_days }
    }

    pub fn summarize(
        &self,
        tier: Tier,
        days: i64,
        histories: &BTreeMap<String, Vec<DriftSnapshot>>,
        now: DateTime<Utc>,
    ) -> TierStatus {
        let in_tier = || {
            histories
                .values()
                .flatten()
                .filter(move |s| s.tier == tier && s.recorded_at <= now)
        };
        let window_start = now - Duration::days(days);
        let window: Vec<&DriftSnapshot> = in_tier().filter(|s| s.recorded_at >= window_start).collect();
        if window.is_empty() {
            return TierStatus::NoData { tier };
        }

        let total_confidence: f64 = window.iter().map(|s| s.confidence).sum();
        let weighted_avg_drift_pct = if total_confidence > 0.0 {
            window.iter().map(|s| s.drift_pct * s.confidence).sum::<f64>() / total_confidence
        } else {
            mean(window.iter().map(|s| s.drift_pct))
        };

        let smoothing_start = now - Duration::days(self.smoothing_days);
        let recent: Vec<f64> = in_tier()
            .filter(|s| s.recorded_at >= smoothing_start)
            .map(|s| s.drift_pct)
            .collect();
        let smoothed_drift_30d_pct = (!recent.is_empty()).then(|| mean(recent.iter().copied()));

        let regions: BTreeSet<&str> = window.iter().map(|s| s.region.as_str()).collect();
        let min_drift_pct = window.iter().map(|s| s.drift_pct).fold(f64::INFINITY, f64::min);
        let max_drift_pct = window.iter().map(|s| s.drift_pct).fold(f64::NEG_INFINITY, f64::max);

        TierStatus::Summary(TierSummary {
            tier,
            window_days: days,
            region_count: regions.len(),
            snapshot_count: window.len(),
            weighted_avg_drift_pct,
            smoothed_drift_30d_pct,
            min_drift_pct,
            max_drift_pct,
        })
    }

    pub fn summarize_all(
        &self,
        days: i64,
        histories: &BTreeMap<String, Vec<DriftSnapshot>>,
        now: DateTime<Utc>,
    ) -> Vec<TierStatus> {
        Tier::ALL
            .iter()
            .map(|tier| self.summarize(*tier, days, histories, now))
            .collect()
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
