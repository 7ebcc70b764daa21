//! Core domain model and provenance types for Terra.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "terra-core";

/// Coarse economic-development bucket carrying one static reference price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Metro,
    Secondary,
    Emerging,
    Frontier,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Metro, Tier::Secondary, Tier::Emerging, Tier::Frontier];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Metro => "metro",
            Tier::Secondary => "secondary",
            Tier::Emerging => "emerging",
            Tier::Frontier => "frontier",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "metro" => Ok(Tier::Metro),
            "secondary" => Ok(Tier::Secondary),
            "emerging" => Ok(Tier::Emerging),
            "frontier" => Ok(Tier::Frontier),
            other => Err(format!("unknown tier `{other}`")),
        }
    }
}

/// One scraped land ad, normalized to a price per square metre.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub source_id: String,
    pub price_per_m2: f64,
    pub total_price: Option<f64>,
    pub area_m2: Option<f64>,
    pub location: String,
    pub posted_on: Option<NaiveDate>,
    pub source_url: String,
    pub category: String,
}

/// Which acquisition stage produced a [`PriceResult`].
///
/// `priority` is the zero-based position of the source in the configured
/// priority order, so `SourceLive { priority: 0, .. }` renders as `source_live[0]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Provenance {
    SourceLive { priority: usize, source_id: String },
    SourceCached { priority: usize, source_id: String },
    StaticBenchmark,
}

impl Provenance {
    pub fn tag(&self) -> String {
        match self {
            Provenance::SourceLive { priority, .. } => format!("source_live[{priority}]"),
            Provenance::SourceCached { priority, .. } => format!("source_cached[{priority}]"),
            Provenance::StaticBenchmark => "static_benchmark".to_string(),
        }
    }

    pub fn source_id(&self) -> Option<&str> {
        match self {
            Provenance::SourceLive { source_id, .. } | Provenance::SourceCached { source_id, .. } => {
                Some(source_id)
            }
            Provenance::StaticBenchmark => None,
        }
    }

    pub fn is_benchmark(&self) -> bool {
        matches!(self, Provenance::StaticBenchmark)
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source_id() {
            Some(source_id) => write!(f, "{} ({source_id})", self.tag()),
            None => f.write_str(&self.tag()),
        }
    }
}

/// Orchestrator output. Always carries a price and a provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceResult {
    pub region: String,
    pub success: bool,
    pub mean_price_per_m2: f64,
    pub median_price_per_m2: f64,
    pub listing_count: usize,
    pub provenance: Provenance,
    pub confidence: f64,
    pub cache_age_hours: Option<f64>,
    pub resolved_at: DateTime<Utc>,
}

impl PriceResult {
    /// Headline price handed to downstream consumers.
    pub fn price(&self) -> f64 {
        self.median_price_per_m2
    }
}

/// Mean and median of listing unit prices; `None` for an empty slice.
pub fn price_stats(listings: &[Listing]) -> Option<(f64, f64)> {
    if listings.is_empty() {
        return None;
    }
    let mut prices: Vec<f64> = listings.iter().map(|l| l.price_per_m2).collect();
    prices.sort_by(|a, b| a.total_cmp(b));
    let mean = prices.iter().sum::<f64>() / prices.len() as f64;
    let mid = prices.len() / 2;
    let median = if prices.len() % 2 == 0 {
        (prices[mid - 1] + prices[mid]) / 2.0
    } else {
        prices[mid]
    };
    Some((mean, median))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    None,
    Warning,
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlertLevel::None => "NONE",
            AlertLevel::Warning => "WARNING",
            AlertLevel::Critical => "CRITICAL",
        })
    }
}

/// One region's live price compared against its tier benchmark at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftSnapshot {
    pub recorded_at: DateTime<Utc>,
    pub region: String,
    pub tier: Tier,
    pub benchmark_price: f64,
    pub live_price: f64,
    pub drift_pct: f64,
    pub data_source: String,
    pub confidence: f64,
    pub alert_level: AlertLevel,
}

/// Persistence-based alert, recomputed on every scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftAlert {
    pub region: String,
    pub tier: Tier,
    pub current_drift_pct: f64,
    pub consecutive_periods: usize,
    pub level: AlertLevel,
    pub first_detected: DateTime<Utc>,
    pub smoothed_drift_pct: f64,
    pub recommendation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierSummary {
    pub tier: Tier,
    pub window_days: i64,
    pub region_count: usize,
    pub snapshot_count: usize,
    pub weighted_avg_drift_pct: f64,
    pub smoothed_drift_30d_pct: Option<f64>,
    pub min_drift_pct: f64,
    pub max_drift_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TierStatus {
    Summary(TierSummary),
    NoData { tier: Tier },
}

impl TierStatus {
    pub fn tier(&self) -> Tier {
        match self {
            TierStatus::Summary(summary) => summary.tier,
            TierStatus::NoData { tier } => *tier,
        }
    }

    pub fn summary(&self) -> Option<&TierSummary> {
        match self {
            TierStatus::Summary(summary) => Some(summary),
            TierStatus::NoData { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Urgency {
    Medium,
    High,
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Urgency::Medium => "MEDIUM",
            Urgency::High => "HIGH",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationStatus {
    PendingApproval,
}

/// Advisory benchmark change. Applying it is a separate operator action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub tier: Tier,
    pub current_benchmark: f64,
    pub proposed_benchmark: f64,
    pub smoothed_drift_pct: f64,
    pub urgency: Urgency,
    pub region_count: usize,
    pub rationale: String,
    pub status: RecommendationStatus,
}
