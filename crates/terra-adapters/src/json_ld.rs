//! Scraper for pages that embed schema.org listings as `application/ld+json`.

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use terra_core::Listing;
use tracing::debug;

use crate::parse::{normalize_ad, text_or_none, AdContext, RawAd, RawValue};
use crate::{render_search_url, AdapterError, ListingSource};

const LD_JSON_SELECTOR: &str = r#"script[type="application/ld+json"]"#;

#[derive(Debug, Clone)]
pub struct JsonLdSource {
    source_id: String,
    search_url: String,
    max_pages: u32,
    category: String,
}

impl JsonLdSource {
    pub fn new(source_id: &str, search_url: &str, max_pages: u32, category: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            search_url: search_url.to_string(),
            max_pages,
            category: category.to_string(),
        }
    }
}

fn first_offer(node: &JsonValue) -> Option<&JsonValue> {
    match node.get("offers")? {
        JsonValue::Array(items) => items.first(),
        other => Some(other),
    }
}

fn looks_like_listing(node: &JsonValue) -> bool {
    node.get("offers").is_some() || node.get("price").is_some()
}

fn quantity_m2(node: &JsonValue) -> Option<RawValue> {
    let value = node.get("value")?;
    let raw = RawValue::from_json(value)?;
    match (node.get("unitCode").and_then(JsonValue::as_str), raw) {
        (Some("HAR"), RawValue::Number(n)) => Some(RawValue::Number(n * 10_000.0)),
        (_, raw) => Some(raw),
    }
}

fn land_area(node: &JsonValue) -> Option<RawValue> {
    for key in ["lotSize", "landSize", "floorSize"] {
        if let Some(area) = node.get(key).and_then(quantity_m2) {
            return Some(area);
        }
    }
    node.get("additionalProperty")?
        .as_array()?
        .iter()
        .find(|p| {
            p.get("name")
                .and_then(JsonValue::as_str)
                .map(|n| {
                    let n = n.to_lowercase();
                    n.contains("luas tanah") || n.contains("land")
                })
                .unwrap_or(false)
        })
        .and_then(|p| p.get("value"))
        .and_then(RawValue::from_json)
}

fn location(node: &JsonValue) -> Option<String> {
    let address = node
        .get("address")
        .or_else(|| node.get("itemOffered").and_then(|i| i.get("address")))?;
    if let Some(text) = address.as_str() {
        return text_or_none(text.to_string());
    }
    let parts: Vec<&str> = ["addressLocality", "addressRegion"]
        .iter()
        .filter_map(|k| address.get(*k).and_then(JsonValue::as_str))
        .collect();
    text_or_none(parts.join(", "))
}

fn raw_ad(node: &JsonValue) -> RawAd {
    let offer = first_offer(node);
    let price = offer
        .and_then(|o| o.get("price"))
        .or_else(|| node.get("price"))
        .and_then(RawValue::from_json);
    let unit_price = offer
        .and_then(|o| o.get("priceSpecification"))
        .filter(|spec| {
            spec.get("unitText")
                .and_then(JsonValue::as_str)
                .map(|u| u.to_lowercase().contains('m'))
                .unwrap_or(false)
        })
        .and_then(|spec| spec.get("price"))
        .and_then(RawValue::from_json);
    let href = node
        .get("url")
        .or_else(|| offer.and_then(|o| o.get("url")))
        .and_then(JsonValue::as_str)
        .map(ToString::to_string);
    let posted = node
        .get("datePosted")
        .or_else(|| offer.and_then(|o| o.get("validFrom")))
        .and_then(JsonValue::as_str)
        .map(ToString::to_string);

    RawAd {
        price,
        unit_price,
        area: land_area(node).or_else(|| node.get("itemOffered").and_then(land_area)),
        location: location(node),
        href,
        posted,
    }
}

/// Depth-first walk collecting listing-shaped objects. A matched object is not descended into.
fn collect_listing_nodes<'a>(node: &'a JsonValue, out: &mut Vec<&'a JsonValue>) {
    match node {
        JsonValue::Object(map) => {
            if looks_like_listing(node) {
                out.push(node);
                return;
            }
            for value in map.values() {
                collect_listing_nodes(value, out);
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                collect_listing_nodes(item, out);
            }
        }
        _ => {}
    }
}

#[async_trait]
impl ListingSource for JsonLdSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn max_pages(&self) -> u32 {
        self.max_pages
    }

    fn search_url(&self, region: &str, page: u32) -> String {
        render_search_url(&self.search_url, region, page)
    }

    fn parse_listings(&self, body: &str, page_url: &str) -> Result<Vec<Listing>, AdapterError> {
        let selector = Selector::parse(LD_JSON_SELECTOR).map_err(|e| AdapterError::Selector {
            selector: LD_JSON_SELECTOR.to_string(),
            message: e.to_string(),
        })?;
        let document = Html::parse_document(body);
        let ctx = AdContext {
            source_id: &self.source_id,
            page_url,
            category: &self.category,
        };

        let mut blocks = Vec::new();
        for script in document.select(&selector) {
            let text = script.text().collect::<String>();
            match serde_json::from_str::<JsonValue>(&text) {
                Ok(value) => blocks.push(value),
                Err(err) => debug!(source_id = %self.source_id, error = %err, "skipping malformed ld+json block"),
            }
        }

        let mut nodes = Vec::new();
        for block in &blocks {
            collect_listing_nodes(block, &mut nodes);
        }

        let listings: Vec<Listing> = nodes
            .into_iter()
            .filter_map(|node| normalize_ad(&raw_ad(node), &ctx))
            .collect();
        debug!(source_id = %self.source_id, blocks = blocks.len(), parsed = listings.len(), "ld+json page");
        Ok(listings)
    }
}
