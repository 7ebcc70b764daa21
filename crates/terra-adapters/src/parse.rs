//! Text normalization for Indonesian listing prices, land areas and dates.

use chrono::NaiveDate;
use serde_json::Value as JsonValue;
use terra_core::Listing;
use url::Url;

/// A scraped field before normalization: free text from HTML or a JSON number.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Text(String),
    Number(f64),
}

impl RawValue {
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Number(n) => n.as_f64().map(RawValue::Number),
            JsonValue::String(s) => text_or_none(s.clone()).map(RawValue::Text),
            _ => None,
        }
    }

    fn as_price(&self) -> Option<ParsedPrice> {
        match self {
            RawValue::Number(n) => (*n > 0.0 && n.is_finite()).then_some(ParsedPrice {
                amount: *n,
                per_area: false,
            }),
            RawValue::Text(text) => parse_price(text),
        }
    }

    fn as_area_m2(&self) -> Option<f64> {
        match self {
            RawValue::Number(n) => Some(*n),
            RawValue::Text(text) => parse_area_m2(text),
        }
    }
}

/// Fields lifted out of one ad card or JSON object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawAd {
    pub price: Option<RawValue>,
    pub unit_price: Option<RawValue>,
    pub area: Option<RawValue>,
    pub location: Option<String>,
    pub href: Option<String>,
    pub posted: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct AdContext<'a> {
    pub source_id: &'a str,
    pub page_url: &'a str,
    pub category: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedPrice {
    pub amount: f64,
    pub per_area: bool,
}

pub fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// First numeric token in `text` plus whatever follows it.
fn first_number(text: &str) -> Option<(f64, &str)> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let rest = &text[start..];
    let mut end = 0;
    let mut chars = rest.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c.is_ascii_digit() {
            end = i + 1;
            continue;
        }
        let separator_then_digit =
            (c == '.' || c == ',') && chars.peek().is_some_and(|(_, next)| next.is_ascii_digit());
        if !separator_then_digit {
            break;
        }
    }
    let value = parse_grouped_number(&rest[..end])?;
    Some((value, &rest[end..]))
}

/// Reads `2.500.000`, `1,5`, `2.500.000,75` and `2,500,000.75`.
///
/// A lone comma is a decimal mark (Indonesian convention); a lone dot is a
/// thousands mark only when exactly three digits follow it.
pub fn parse_grouped_number(token: &str) -> Option<f64> {
    let dots = token.matches('.').count();
    let commas = token.matches(',').count();
    let normalized = match (dots, commas) {
        (0, 0) => token.to_string(),
        (1, 0) => {
            let after = token.len() - token.rfind('.').unwrap_or(0) - 1;
            if after == 3 {
                token.replace('.', "")
            } else {
                token.to_string()
            }
        }
        (_, 0) => token.replace('.', ""),
        (0, 1) => token.replace(',', "."),
        (0, _) => token.replace(',', ""),
        _ => {
            if token.rfind(',') > token.rfind('.') {
                token.replace('.', "").replace(',', ".")
            } else {
                token.replace(',', "")
            }
        }
    };
    normalized.parse().ok()
}

fn leading_word(rest: &str) -> String {
    rest.trim_start()
        .chars()
        .take_while(|c| c.is_alphabetic())
        .collect::<String>()
        .to_lowercase()
}

fn magnitude(word: &str) -> f64 {
    match word {
        "t" | "triliun" => 1e12,
        "m" | "miliar" | "milyar" | "b" | "bn" => 1e9,
        "jt" | "juta" | "mio" => 1e6,
        "rb" | "ribu" | "k" => 1e3,
        _ => 1.0,
    }
}

/// `m²` right after the number is a unit, not the `M` of miliar.
fn area_unit_follows(rest: &str) -> bool {
    let lower = rest.trim_start().to_lowercase();
    ["m²", "m2", "m^2", "meter"].iter().any(|unit| lower.starts_with(unit))
}

/// `Rp 1,5 M` → 1.5e9, `Rp 850 Jt` → 8.5e8, `Rp 2.500.000/m²` → 2.5e6 per area.
pub fn parse_price(text: &str) -> Option<ParsedPrice> {
    let (value, rest) = first_number(text)?;
    let area_unit = area_unit_follows(rest);
    let amount = if area_unit {
        value
    } else {
        value * magnitude(&leading_word(rest))
    };
    let lower = text.to_lowercase();
    let per_area = area_unit
        || lower.contains("/m")
        || lower.contains("/ m")
        || lower.contains("per m");
    (amount > 0.0 && amount.is_finite()).then_some(ParsedPrice { amount, per_area })
}

/// `300 m²` → 300, `1,5 ha` → 15000.
pub fn parse_area_m2(text: &str) -> Option<f64> {
    let (value, rest) = first_number(text)?;
    let factor = match leading_word(rest).as_str() {
        "ha" | "hektar" | "hektare" | "hectare" => 10_000.0,
        "are" => 100.0,
        _ => 1.0,
    };
    let area = value * factor;
    (area > 0.0 && area.is_finite()).then_some(area)
}

pub fn parse_posted_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    let iso_head: String = text.chars().take(10).collect();
    NaiveDate::parse_from_str(&iso_head, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            let last = text.split_whitespace().last()?;
            NaiveDate::parse_from_str(last, "%d/%m/%Y")
                .or_else(|_| NaiveDate::parse_from_str(last, "%d-%m-%Y"))
                .or_else(|_| NaiveDate::parse_from_str(last, "%Y-%m-%d"))
                .ok()
        })
}

pub fn absolutize(href: &str, page_url: &str) -> String {
    match Url::parse(page_url).and_then(|base| base.join(href)) {
        Ok(url) => url.to_string(),
        Err(_) => href.to_string(),
    }
}

/// Turns a raw ad into a [`Listing`], or `None` when no unit price can be read or derived.
pub fn normalize_ad(raw: &RawAd, ctx: &AdContext<'_>) -> Option<Listing> {
    let headline = raw.price.as_ref().and_then(RawValue::as_price);
    let explicit_unit = raw.unit_price.as_ref().and_then(RawValue::as_price).map(|p| p.amount);
    let area_m2 = raw
        .area
        .as_ref()
        .and_then(RawValue::as_area_m2)
        .filter(|a| *a > 0.0 && a.is_finite());

    let (total_price, headline_unit) = match headline {
        Some(p) if p.per_area => (None, Some(p.amount)),
        Some(p) => (Some(p.amount), None),
        None => (None, None),
    };
    let derived_unit = match (total_price, area_m2) {
        (Some(total), Some(area)) => Some(total / area),
        _ => None,
    };
    let price_per_m2 = explicit_unit.or(headline_unit).or(derived_unit)?;
    if !(price_per_m2 > 0.0 && price_per_m2.is_finite()) {
        return None;
    }

    Some(Listing {
        source_id: ctx.source_id.to_string(),
        price_per_m2,
        total_price,
        area_m2,
        location: raw.location.clone().unwrap_or_default(),
        posted_on: raw.posted.as_deref().and_then(parse_posted_date),
        source_url: raw
            .href
            .as_deref()
            .map(|href| absolutize(href, ctx.page_url))
            .unwrap_or_else(|| ctx.page_url.to_string()),
        category: ctx.category.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouped_numbers_follow_indonesian_conventions() {
        assert_eq!(parse_grouped_number("2.500.000"), Some(2_500_000.0));
        assert_eq!(parse_grouped_number("850.000"), Some(850_000.0));
        assert_eq!(parse_grouped_number("1,5"), Some(1.5));
        assert_eq!(parse_grouped_number("1.5"), Some(1.5));
        assert_eq!(parse_grouped_number("2.500.000,5"), Some(2_500_000.5));
        assert_eq!(parse_grouped_number("2,500,000.5"), Some(2_500_000.5));
        assert_eq!(parse_grouped_number("12"), Some(12.0));
    }

    #[test]
    fn prices_understand_magnitude_words_and_unit_markers() {
        assert_eq!(
            parse_price("Rp 1,5 M"),
            Some(ParsedPrice { amount: 1_500_000_000.0, per_area: false })
        );
        assert_eq!(parse_price("Rp 850 Jt").map(|p| p.amount), Some(850_000_000.0));
        assert_eq!(parse_price("Rp 12 Miliar").map(|p| p.amount), Some(12_000_000_000.0));
        assert_eq!(
            parse_price("Rp 2.500.000/m²"),
            Some(ParsedPrice { amount: 2_500_000.0, per_area: true })
        );
        assert_eq!(
            parse_price("Rp 750 rb per m2"),
            Some(ParsedPrice { amount: 750_000.0, per_area: true })
        );
        assert_eq!(
            parse_price("Rp 750.000 m²"),
            Some(ParsedPrice { amount: 750_000.0, per_area: true })
        );
        assert_eq!(
            parse_price("Rp 1.200.000 M2"),
            Some(ParsedPrice { amount: 1_200_000.0, per_area: true })
        );
        assert_eq!(parse_price("Rp 3 M").map(|p| p.amount), Some(3_000_000_000.0));
        assert_eq!(parse_price("Hubungi agen"), None);
        assert_eq!(parse_price("Rp 0"), None);
    }

    #[test]
    fn areas_convert_hectares() {
        assert_eq!(parse_area_m2("LT: 300 m²"), Some(300.0));
        assert_eq!(parse_area_m2("1.250 m2"), Some(1250.0));
        assert_eq!(parse_area_m2("1,5 ha"), Some(15_000.0));
        assert_eq!(parse_area_m2("luas tanah"), None);
    }

    #[test]
    fn posted_dates_accept_common_formats() {
        let expected = NaiveDate::from_ymd_opt(2026, 9, 30);
        assert_eq!(parse_posted_date("2026-09-30T08:00:00Z"), expected);
        assert_eq!(parse_posted_date("Tayang 30/09/2026"), expected);
        assert_eq!(parse_posted_date("3 hari yang lalu"), None);
    }

    #[test]
    fn unit_price_is_derived_from_total_and_area() {
        let ctx = AdContext {
            source_id: "lamudi",
            page_url: "https://www.lamudi.co.id/tanah/buy/?q=sleman",
            category: "land",
        };
        let raw = RawAd {
            price: Some(RawValue::Text("Rp 1,5 M".into())),
            area: Some(RawValue::Text("300 m²".into())),
            location: Some("Ngaglik, Sleman".into()),
            href: Some("/tanah/ngaglik-300m".into()),
            ..RawAd::default()
        };
        let listing = normalize_ad(&raw, &ctx).expect("listing");
        assert_eq!(listing.price_per_m2, 5_000_000.0);
        assert_eq!(listing.total_price, Some(1_500_000_000.0));
        assert_eq!(listing.source_url, "https://www.lamudi.co.id/tanah/ngaglik-300m");

        let no_area = RawAd {
            price: Some(RawValue::Text("Rp 1,5 M".into())),
            ..RawAd::default()
        };
        assert_eq!(normalize_ad(&no_area, &ctx), None);

        let per_area = RawAd {
            price: Some(RawValue::Text("Rp 3,5 Jt/m²".into())),
            ..RawAd::default()
        };
        let listing = normalize_ad(&per_area, &ctx).expect("unit price listing");
        assert_eq!(listing.price_per_m2, 3_500_000.0);
        assert_eq!(listing.total_price, None);
    }
}
