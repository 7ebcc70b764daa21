//! Live → cache → static benchmark price acquisition.

use std::time::Duration;

use chrono::{DateTime, Utc};
use terra_core::{price_stats, Listing, PriceResult, Provenance};
use terra_drift::StaticBenchmarks;
use terra_storage::ResultCache;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::registry::SourceSlot;

pub const LIVE_CONFIDENCE: f64 = 0.85;
pub const BENCHMARK_CONFIDENCE: f64 = 0.5;

/// Confidence for a stale cache hit: starts at 0.75 and loses 0.02 per day,
/// never dropping below 0.55.
pub fn cached_confidence(age_days: f64) -> f64 {
    (0.75 - 0.02 * age_days.max(0.0)).max(0.55)
}

#[derive(Debug, Clone, Copy)]
pub struct AcquirerSettings {
    pub live_fetch: bool,
    pub source_deadline: Duration,
}

/// Never fails: every call ends in a live, cached or benchmark price.
pub struct PriceAcquirer {
    slots: Vec<SourceSlot>,
    cache: ResultCache,
    benchmarks: StaticBenchmarks,
    settings: AcquirerSettings,
}

impl PriceAcquirer {
    pub fn new(
        slots: Vec<SourceSlot>,
        cache: ResultCache,
        benchmarks: StaticBenchmarks,
        settings: AcquirerSettings,
    ) -> Self {
        Self {
            slots,
            cache,
            benchmarks,
            settings,
        }
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.slots.iter().map(SourceSlot::source_id).collect()
    }

    pub async fn get_price(&self, region: &str, max_listings: usize) -> PriceResult {
        self.get_price_at(region, max_listings, Utc::now()).await
    }

    pub async fn get_price_at(
        &self,
        region: &str,
        max_listings: usize,
        now: DateTime<Utc>,
    ) -> PriceResult {
        if self.settings.live_fetch {
            for (priority, slot) in self.slots.iter().enumerate() {
                if let Some(result) = self
                    .try_live(priority, slot, region, max_listings, now)
                    .await
                {
                    return result;
                }
            }
            info!(region, "all live sources failed; falling back to cache");
        } else {
            debug!(region, "live fetching disabled");
        }

        if let Some(result) = self.from_any_cache(region, now).await {
            return result;
        }
        self.from_benchmark(region, now).await
    }

    async fn try_live(
        &self,
        priority: usize,
        slot: &SourceSlot,
        region: &str,
        max_listings: usize,
        now: DateTime<Utc>,
    ) -> Option<PriceResult> {
        let source_id = slot.source_id();
        let provenance = Provenance::SourceLive {
            priority,
            source_id: source_id.to_string(),
        };

        if let Some(hit) = self.cache.get_at::<Vec<Listing>>(source_id, region, now).await {
            if hit.is_fresh(slot.cache_ttl) {
                if let Some(result) = listing_result(
                    region,
                    &hit.value,
                    provenance.clone(),
                    LIVE_CONFIDENCE,
                    Some(hit.age_hours()),
                    now,
                ) {
                    debug!(
                        region,
                        source_id,
                        age_hours = hit.age_hours(),
                        "answered from fresh cache"
                    );
                    return Some(result);
                }
            }
        }

        let span = info_span!("source_attempt", source_id, region, priority);
        let attempt = tokio::time::timeout(
            self.settings.source_deadline,
            slot.source.scrape(&slot.http, region, max_listings),
        )
        .instrument(span)
        .await;

        let listings = match attempt {
            Err(_) => {
                warn!(
                    region,
                    source_id,
                    deadline = ?self.settings.source_deadline,
                    "source attempt hit its deadline"
                );
                return None;
            }
            Ok(Err(err)) => {
                warn!(region, source_id, error = %err, "source attempt failed");
                return None;
            }
            Ok(Ok(listings)) if listings.is_empty() => {
                info!(region, source_id, "source returned no listings");
                return None;
            }
            Ok(Ok(listings)) => listings,
        };

        if let Err(err) = self.cache.put_at(source_id, region, &listings, now).await {
            warn!(region, source_id, error = %err, "could not write listings through to cache");
        }
        let result = listing_result(region, &listings, provenance, LIVE_CONFIDENCE, None, now)?;
        info!(region, source_id, listings = listings.len(), price = result.price(), "live price");
        Some(result)
    }

    async fn from_any_cache(&self, region: &str, now: DateTime<Utc>) -> Option<PriceResult> {
        for (priority, slot) in self.slots.iter().enumerate() {
            let source_id = slot.source_id();
            let Some(hit) = self.cache.get_at::<Vec<Listing>>(source_id, region, now).await else {
                continue;
            };
            let age_days = hit.age_hours() / 24.0;
            let provenance = Provenance::SourceCached {
                priority,
                source_id: source_id.to_string(),
            };
            if let Some(result) = listing_result(
                region,
                &hit.value,
                provenance,
                cached_confidence(age_days),
                Some(hit.age_hours()),
                now,
            ) {
                info!(region, source_id, age_days, "using cached price");
                return Some(result);
            }
        }
        None
    }

    async fn from_benchmark(&self, region: &str, now: DateTime<Utc>) -> PriceResult {
        let (tier, price) = self.benchmarks.lookup(region).await;
        let price = price.unwrap_or_else(|| {
            warn!(region, %tier, "no benchmark for fallback tier; reporting zero");
            0.0
        });
        info!(region, %tier, price, "using static benchmark");
        PriceResult {
            region: region.to_string(),
            success: false,
            mean_price_per_m2: price,
            median_price_per_m2: price,
            listing_count: 0,
            provenance: Provenance::StaticBenchmark,
            confidence: BENCHMARK_CONFIDENCE,
            cache_age_hours: None,
            resolved_at: now,
        }
    }
}

fn listing_result(
    region: &str,
    listings: &[Listing],
    provenance: Provenance,
    confidence: f64,
    cache_age_hours: Option<f64>,
    now: DateTime<Utc>,
) -> Option<PriceResult> {
    let (mean, median) = price_stats(listings)?;
    Some(PriceResult {
        region: region.to_string(),
        success: true,
        mean_price_per_m2: mean,
        median_price_per_m2: median,
        listing_count: listings.len(),
        provenance,
        confidence,
        cache_age_hours,
        resolved_at: now,
    })
}
