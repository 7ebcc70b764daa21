//! Scraper for Next.js pages that ship their search results in `script#__NEXT_DATA__`.

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use terra_core::Listing;
use tracing::debug;

use crate::parse::{normalize_ad, text_or_none, AdContext, RawAd, RawValue};
use crate::{render_search_url, AdapterError, ListingSource};

const NEXT_DATA_SELECTOR: &str = "script#__NEXT_DATA__";

/// JSON pointers, relative to one listing object, for each field we read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NextDataFields {
    pub price: String,
    pub unit_price: Option<String>,
    pub area: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub posted: Option<String>,
}

impl Default for NextDataFields {
    fn default() -> Self {
        Self {
            price: "/price".to_string(),
            unit_price: None,
            area: Some("/landSize".to_string()),
            location: Some("/location".to_string()),
            url: Some("/url".to_string()),
            posted: Some("/postedAt".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NextDataSource {
    source_id: String,
    search_url: String,
    max_pages: u32,
    category: String,
    listings_pointer: String,
    fields: NextDataFields,
}

impl NextDataSource {
    pub fn new(
        source_id: &str,
        search_url: &str,
        max_pages: u32,
        category: &str,
        listings_pointer: String,
        fields: NextDataFields,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            search_url: search_url.to_string(),
            max_pages,
            category: category.to_string(),
            listings_pointer,
            fields,
        }
    }

    fn raw_ad(&self, item: &JsonValue) -> RawAd {
        let at = |pointer: Option<&String>| pointer.and_then(|p| item.pointer(p));
        let string_at = |pointer: Option<&String>| {
            at(pointer)
                .and_then(JsonValue::as_str)
                .and_then(|s| text_or_none(s.to_string()))
        };
        // Locations come either as a plain string or as `{ "name": ... }`.
        let location = at(self.fields.location.as_ref()).and_then(|value| match value {
            JsonValue::String(s) => text_or_none(s.clone()),
            JsonValue::Object(_) => value
                .get("name")
                .and_then(JsonValue::as_str)
                .and_then(|s| text_or_none(s.to_string())),
            _ => None,
        });

        RawAd {
            price: item.pointer(&self.fields.price).and_then(RawValue::from_json),
            unit_price: at(self.fields.unit_price.as_ref()).and_then(RawValue::from_json),
            area: at(self.fields.area.as_ref()).and_then(RawValue::from_json),
            location,
            href: string_at(self.fields.url.as_ref()),
            posted: string_at(self.fields.posted.as_ref()),
        }
    }
}

#[async_trait]
impl ListingSource for NextDataSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn max_pages(&self) -> u32 {
        self.max_pages
    }

    fn search_url(&self, region: &str, page: u32) -> String {
        render_search_url(&self.search_url, region, page)
    }

    /// A page without the payload is empty, but a payload that does not parse is an error.
    fn parse_listings(&self, body: &str, page_url: &str) -> Result<Vec<Listing>, AdapterError> {
        let selector = Selector::parse(NEXT_DATA_SELECTOR).map_err(|e| AdapterError::Selector {
            selector: NEXT_DATA_SELECTOR.to_string(),
            message: e.to_string(),
        })?;
        let document = Html::parse_document(body);
        let Some(script) = document.select(&selector).next() else {
            debug!(source_id = %self.source_id, "no __NEXT_DATA__ payload on page");
            return Ok(Vec::new());
        };
        let payload: JsonValue = serde_json::from_str(&script.text().collect::<String>())
            .map_err(|e| {
                AdapterError::Message(format!("{}: malformed __NEXT_DATA__: {e}", self.source_id))
            })?;

        let items = match payload.pointer(&self.listings_pointer) {
            Some(JsonValue::Array(items)) => items.as_slice(),
            Some(_) => {
                return Err(AdapterError::Message(format!(
                    "{}: {} is not an array",
                    self.source_id, self.listings_pointer
                )))
            }
            None => &[],
        };

        let ctx = AdContext {
            source_id: &self.source_id,
            page_url,
            category: &self.category,
        };
        let listings: Vec<Listing> = items
            .iter()
            .filter_map(|item| normalize_ad(&self.raw_ad(item), &ctx))
            .collect();
        debug!(
            source_id = %self.source_id,
            items = items.len(),
            parsed = listings.len(),
            "next data page"
        );
        Ok(listings)
    }
}
