//! CSS-selector scraper for result pages that render one card per ad.

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use terra_core::Listing;
use tracing::debug;

use crate::parse::{normalize_ad, text_or_none, AdContext, RawAd, RawValue};
use crate::{render_search_url, AdapterError, ListingSource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardSelectors {
    pub card: String,
    pub price: String,
    #[serde(default)]
    pub unit_price: Option<String>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub posted: Option<String>,
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn compile_opt(selector: Option<&String>) -> Result<Option<Selector>, AdapterError> {
    selector.map(|s| compile(s)).transpose()
}

fn first_text(card: &ElementRef<'_>, selector: Option<&Selector>) -> Option<String> {
    let selector = selector?;
    card.select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn first_attr(card: &ElementRef<'_>, selector: Option<&Selector>, attr: &str) -> Option<String> {
    let value = match selector {
        Some(selector) => card.select(selector).next().and_then(|n| n.value().attr(attr)),
        None => card.value().attr(attr),
    };
    value.and_then(|s| text_or_none(s.to_string()))
}

struct CompiledSelectors {
    card: Selector,
    price: Selector,
    unit_price: Option<Selector>,
    area: Option<Selector>,
    location: Option<Selector>,
    link: Option<Selector>,
    posted: Option<Selector>,
}

impl CompiledSelectors {
    fn compile(selectors: &CardSelectors) -> Result<Self, AdapterError> {
        Ok(Self {
            card: compile(&selectors.card)?,
            price: compile(&selectors.price)?,
            unit_price: compile_opt(selectors.unit_price.as_ref())?,
            area: compile_opt(selectors.area.as_ref())?,
            location: compile_opt(selectors.location.as_ref())?,
            link: compile_opt(selectors.link.as_ref())?,
            posted: compile_opt(selectors.posted.as_ref())?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HtmlCardSource {
    source_id: String,
    search_url: String,
    max_pages: u32,
    category: String,
    selectors: CardSelectors,
}

impl HtmlCardSource {
    /// Fails on selectors that do not parse, so a broken config is caught at startup.
    pub fn new(
        source_id: &str,
        search_url: &str,
        max_pages: u32,
        category: &str,
        selectors: CardSelectors,
    ) -> Result<Self, AdapterError> {
        CompiledSelectors::compile(&selectors)?;
        Ok(Self {
            source_id: source_id.to_string(),
            search_url: search_url.to_string(),
            max_pages,
            category: category.to_string(),
            selectors,
        })
    }
}

#[async_trait]
impl ListingSource for HtmlCardSource {
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
        let selectors = CompiledSelectors::compile(&self.selectors)?;
        let document = Html::parse_document(body);
        let ctx = AdContext {
            source_id: &self.source_id,
            page_url,
            category: &self.category,
        };

        let mut listings = Vec::new();
        let mut skipped = 0usize;
        for card in document.select(&selectors.card) {
            let raw = RawAd {
                price: first_text(&card, Some(&selectors.price)).map(RawValue::Text),
                unit_price: first_text(&card, selectors.unit_price.as_ref()).map(RawValue::Text),
                area: first_text(&card, selectors.area.as_ref()).map(RawValue::Text),
                location: first_text(&card, selectors.location.as_ref()),
                href: first_attr(&card, selectors.link.as_ref(), "href"),
                posted: first_attr(&card, selectors.posted.as_ref(), "datetime")
                    .or_else(|| first_text(&card, selectors.posted.as_ref())),
            };
            match normalize_ad(&raw, &ctx) {
                Some(listing) => listings.push(listing),
                None => skipped += 1,
            }
        }
        debug!(source_id = %self.source_id, parsed = listings.len(), skipped, "html card page");
        Ok(listings)
    }
}
