//! Map-listing fast tier for clinics.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use provsync_core::{EnrichmentTarget, EvidenceRef, ExtractedField, FieldValue, ScrapeResult};
use regex::Regex;
use scraper::Html;
use strsim::jaro_winkler;
use url::Url;

use crate::{select_first_attr, select_first_text, AdapterError, ListingScraper};

pub const PROVIDER_ID: &str = "google-maps";
pub const EXTRACTOR_VERSION: &str = "maps-listing-v1";

const SEARCH_ENDPOINT: &str = "https://www.google.com/maps/search/";
const UNVERIFIED_NAME_FACTOR: f64 = 0.6;

const COORDINATE_SOURCES: &[(&str, &str)] = &[
    ("link[rel=\"canonical\"]", "href"),
    ("meta[property=\"og:url\"]", "content"),
    ("meta[itemprop=\"image\"]", "content"),
];

const RATING_SELECTORS: &[&str] = &["div.F7nice span", "span.F7nice span", "span.ceNzKf"];

fn coordinate_patterns() -> &'static [Regex; 2] {
    static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"@(-?\d+\.?\d*),(-?\d+\.?\d*)").expect("static regex"),
            Regex::new(r"!3d(-?\d+\.?\d*)!4d(-?\d+\.?\d*)").expect("static regex"),
        ]
    })
}

fn place_id_patterns() -> &'static [Regex; 2] {
    static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"!1s(0x[0-9a-f]+:0x[0-9a-f]+)").expect("static regex"),
            Regex::new(r"(ChIJ[A-Za-z0-9_-]+)").expect("static regex"),
        ]
    })
}

pub fn parse_coordinates(text: &str) -> Option<(f64, f64)> {
    coordinate_patterns().iter().find_map(|re| {
        let caps = re.captures(text)?;
        let lat = caps.get(1)?.as_str().parse::<f64>().ok()?;
        let lng = caps.get(2)?.as_str().parse::<f64>().ok()?;
        ((-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng)).then_some((lat, lng))
    })
}

pub fn parse_place_id(text: &str) -> Option<String> {
    place_id_patterns()
        .iter()
        .find_map(|re| re.captures(text)?.get(1).map(|m| m.as_str().to_string()))
}

/// Keeps digits, `+`, `-`, spaces and parentheses.
pub fn clean_phone(raw: &str) -> Option<String> {
    let stripped = raw
        .trim()
        .trim_start_matches("phone:tel:")
        .trim_start_matches("Phone:");
    let cleaned: String = stripped
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | ' ' | '(' | ')'))
        .collect();
    let cleaned = cleaned.trim().to_string();
    cleaned.chars().any(|c| c.is_ascii_digit()).then_some(cleaned)
}

pub fn parse_rating(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let number: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    number.parse().ok()
}

pub fn parse_review_count(text: &str) -> Option<i64> {
    let compact: String = text
        .chars()
        .filter(|c| !matches!(c, ',' | '.' | ' '))
        .collect();
    let start = compact.find(|c: char| c.is_ascii_digit())?;
    compact[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()
}

fn normalized_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone)]
pub struct MapsListingScraper {
    country: String,
    base_confidence: BTreeMap<&'static str, f64>,
}

impl Default for MapsListingScraper {
    fn default() -> Self {
        let base_confidence = [
            ("coordinates", 0.95),
            ("place_id", 0.95),
            ("phone", 0.9),
            ("rating", 0.9),
            ("review_count", 0.9),
            ("website", 0.85),
        ]
        .into_iter()
        .collect();
        Self {
            country: "Malaysia".to_string(),
            base_confidence,
        }
    }
}

impl MapsListingScraper {
    /// Similarity between the listed and expected names, used to scale every field.
    fn name_factor(&self, listed: Option<&str>, expected: Option<&str>) -> f64 {
        match (listed, expected) {
            (_, None) => 1.0,
            (None, Some(_)) => UNVERIFIED_NAME_FACTOR,
            (Some(listed), Some(expected)) => {
                jaro_winkler(&normalized_name(listed), &normalized_name(expected))
            }
        }
    }

    fn search_query(&self, target: &EnrichmentTarget) -> Option<String> {
        let name = target.context.get("name").filter(|n| !n.trim().is_empty())?;
        let mut parts = vec![name.trim().to_string()];
        for key in ["address", "city", "state"] {
            if let Some(value) = target.context.get(key).map(|v| v.trim()) {
                if !value.is_empty() {
                    parts.push(value.to_string());
                }
            }
        }
        parts.push(self.country.clone());
        Some(parts.join(", "))
    }
}

impl ListingScraper for MapsListingScraper {
    fn target_url(&self, target: &EnrichmentTarget) -> Option<String> {
        let query = self.search_query(target)?;
        Url::parse_with_params(SEARCH_ENDPOINT, &[("api", "1"), ("query", query.as_str())])
            .ok()
            .map(String::from)
    }

    fn recognizes(&self, content: &str) -> bool {
        content.contains("/maps/") || content.contains("data-item-id=")
    }

    fn parse(
        &self,
        scrape: &ScrapeResult,
        target: &EnrichmentTarget,
    ) -> Result<BTreeMap<String, ExtractedField>, AdapterError> {
        let document = Html::parse_document(&scrape.content);

        let listed_name = match select_first_text(&document, "h1")? {
            Some(name) => Some(name),
            None => select_first_attr(&document, "meta[property=\"og:title\"]", "content")?,
        };
        let factor = self.name_factor(
            listed_name.as_deref(),
            target.context.get("name").map(String::as_str),
        );

        let mut raw: Vec<(&'static str, FieldValue, String, String)> = Vec::new();

        let mut coordinate_hit = None;
        for (selector, attr) in COORDINATE_SOURCES {
            if let Some(value) = select_first_attr(&document, selector, attr)? {
                if let Some(coords) = parse_coordinates(&value) {
                    coordinate_hit = Some((coords, format!("{selector}@{attr}"), value));
                    break;
                }
            }
        }
        if coordinate_hit.is_none() {
            coordinate_hit = parse_coordinates(&scrape.url)
                .map(|c| (c, "request-url".to_string(), scrape.url.clone()));
        }
        if let Some(((lat, lng), pointer, snippet)) = coordinate_hit {
            raw.push(("coordinates", FieldValue::Coordinates { lat, lng }, pointer, snippet));
        }

        let place_source = select_first_attr(&document, "link[rel=\"canonical\"]", "href")?
            .unwrap_or_else(|| scrape.content.clone());
        if let Some(place_id) = parse_place_id(&place_source) {
            raw.push((
                "place_id",
                FieldValue::Text(place_id.clone()),
                "link[rel=\"canonical\"]@href".into(),
                place_id,
            ));
        }

        let phone_attr = select_first_attr(&document, "button[data-item-id^=\"phone:tel\"]", "data-item-id")?;
        let phone = match phone_attr.as_deref().and_then(clean_phone) {
            Some(p) => Some((p, "button[data-item-id^=\"phone:tel\"]@data-item-id")),
            None => select_first_attr(&document, "button[aria-label^=\"Phone:\"]", "aria-label")?
                .as_deref()
                .and_then(clean_phone)
                .map(|p| (p, "button[aria-label^=\"Phone:\"]@aria-label")),
        };
        if let Some((phone, pointer)) = phone {
            raw.push(("phone", FieldValue::Text(phone.clone()), pointer.into(), phone));
        }

        let website = match select_first_attr(&document, "a[data-item-id^=\"authority\"]", "href")? {
            Some(href) => Some((href, "a[data-item-id^=\"authority\"]@href")),
            None => select_first_attr(&document, "a[aria-label^=\"Website\"]", "href")?
                .map(|href| (href, "a[aria-label^=\"Website\"]@href")),
        };
        if let Some((href, pointer)) = website {
            raw.push(("website", FieldValue::Text(href.clone()), pointer.into(), href));
        }

        for selector in RATING_SELECTORS {
            if let Some(text) = select_first_text(&document, selector)? {
                if let Some(rating) = parse_rating(&text) {
                    raw.push(("rating", FieldValue::Number(rating), selector.to_string(), text));
                    break;
                }
            }
        }

        if let Some(label) = select_first_attr(&document, "span[aria-label$=\"reviews\"]", "aria-label")? {
            if let Some(count) = parse_review_count(&label) {
                raw.push((
                    "review_count",
                    FieldValue::Integer(count),
                    "span[aria-label$=\"reviews\"]@aria-label".into(),
                    label,
                ));
            }
        }

        Ok(raw
            .into_iter()
            .map(|(name, value, pointer, snippet)| {
                let base = self.base_confidence.get(name).copied().unwrap_or(0.8);
                let field = ExtractedField::new(value, base * factor).with_evidence(EvidenceRef {
                    source_url: scrape.url.clone(),
                    selector_or_pointer: pointer,
                    snippet,
                    retrieved_at: scrape.retrieved_at,
                    extractor_version: EXTRACTOR_VERSION.to_string(),
                });
                (name.to_string(), field)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use provsync_core::{FetchOutcome, RecordKind};

    fn target(name: &str) -> EnrichmentTarget {
        let mut context = BTreeMap::new();
        context.insert("name".to_string(), name.to_string());
        context.insert("address".to_string(), "Jalan Merdeka".to_string());
        context.insert("city".to_string(), "Ampang".to_string());
        context.insert("state".to_string(), "Selangor".to_string());
        EnrichmentTarget {
            external_id: "clinic-1".into(),
            record_kind: RecordKind::Clinic,
            provider_id: PROVIDER_ID.into(),
            missing_fields: vec!["phone".into(), "coordinates".into()],
            context,
            last_attempt_at: None,
            consecutive_failures: 0,
        }
    }

    fn scrape(content: &str) -> ScrapeResult {
        ScrapeResult {
            target_id: "clinic-1".into(),
            provider_id: PROVIDER_ID.into(),
            url: "https://www.google.com/maps/search/?api=1&query=x".into(),
            fingerprint: "x".into(),
            content: content.to_string(),
            content_type: Some("text/html".into()),
            outcome: FetchOutcome::Success,
            attempts: 1,
            error: None,
            retrieved_at: Utc.with_ymd_and_hms(2026, 4, 1, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn coordinates_parse_from_both_url_shapes_and_respect_bounds() {
        assert_eq!(
            parse_coordinates("https://www.google.com/maps/place/X/@3.1569,101.7123,17z"),
            Some((3.1569, 101.7123))
        );
        assert_eq!(
            parse_coordinates("data=!4m6!3m5!1s0x0:0x0!8m2!3d3.1412!4d101.6865"),
            Some((3.1412, 101.6865))
        );
        assert_eq!(parse_coordinates("@95.0,101.0"), None);
    }

    #[test]
    fn phone_rating_and_reviews_are_cleaned() {
        assert_eq!(clean_phone("phone:tel:+60342511234"), Some("+60342511234".into()));
        assert_eq!(clean_phone("Phone: 03-4251 1234 "), Some("03-4251 1234".into()));
        assert_eq!(clean_phone("phone:tel:"), None);
        assert_eq!(parse_rating("4,6"), Some(4.6));
        assert_eq!(parse_review_count("1,287 reviews"), Some(1287));
    }

    #[test]
    fn search_url_encodes_name_address_and_country() {
        let url = MapsListingScraper::default()
            .target_url(&target("Klinik Mediviron"))
            .expect("url");
        assert!(url.starts_with("https://www.google.com/maps/search/?api=1&query="));
        assert!(url.contains("Klinik+Mediviron%2C+Jalan+Merdeka%2C+Ampang%2C+Selangor%2C+Malaysia"));
    }

    #[test]
    fn mismatched_listing_name_lowers_confidence() {
        let html = r#"<html><head>
            <link rel="canonical" href="https://www.google.com/maps/place/Other/@3.15,101.71,17z">
            </head><body><h1>Kedai Runcit Ali</h1></body></html>"#;
        let scraper = MapsListingScraper::default();
        let fields = scraper
            .parse(&scrape(html), &target("Klinik Mediviron Ampang"))
            .expect("parse");
        let coords = &fields["coordinates"];
        assert!(coords.confidence < 0.8, "{}", coords.confidence);
        assert!(!fields.contains_key("phone"));
    }

    #[test]
    fn missing_listing_name_uses_unverified_factor() {
        let html = r#"<html><body><a data-item-id="authority" href="https://klinik.example">site</a></body></html>"#;
        let fields = MapsListingScraper::default()
            .parse(&scrape(html), &target("Klinik A"))
            .expect("parse");
        let expected = 0.85 * UNVERIFIED_NAME_FACTOR;
        assert!((fields["website"].confidence - expected).abs() < 1e-9);
    }
}
