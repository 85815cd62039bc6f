//! Insurance provider sites: plan discovery on listing pages and the product-page fast tier.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use provsync_core::{
    EnrichmentTarget, EvidenceRef, ExtractedField, ExtractionSchema, FieldValue, ScrapeResult,
};
use regex::Regex;
use scraper::{ElementRef, Html};
use url::Url;

use crate::schema::{insurance_plan_schema, NAVIGATION_TEXT};
use crate::{
    html_to_text, looks_like_html, parse_selector, select_first_attr, select_first_text,
    text_or_none, AdapterError, DocumentScraper, ListingScraper,
};

pub const EXTRACTOR_VERSION: &str = "insurance-site-v1";

#[derive(Debug)]
pub struct InsuranceProfile {
    pub provider_id: &'static str,
    pub name: &'static str,
    pub base_url: &'static str,
    pub products_url: &'static str,
    pub contact_phone: &'static str,
    pub website: &'static str,
    /// Selectors whose text is a candidate plan name on the listing page.
    pub name_selectors: &'static [&'static str],
    /// Provider-specific product naming patterns searched in listing text.
    pub name_patterns: &'static [&'static str],
}

const CARD_SELECTORS: &[&str] = &[
    ".product-card h2",
    ".product-card h3",
    ".product-card .title",
    ".product-item h2",
    ".product-item h3",
    "article h2",
    "article h3",
    ".card-title",
];

const TITLE_SELECTORS: &[&str] = &["h1", ".product-title", ".hero h2"];

pub const PROFILES: &[InsuranceProfile] = &[
    InsuranceProfile {
        provider_id: "aia",
        name: "AIA Malaysia",
        base_url: "https://www.aia.com.my",
        products_url: "https://www.aia.com.my/en/our-products/health-protection/medical-protection.html",
        contact_phone: "1300-88-1318",
        website: "https://www.aia.com.my",
        name_selectors: &["a[href*='health'] span", "a[href*='medical'] span", ".grid-item h3"],
        name_patterns: &[
            r"A-(?:Plus|Life)\s+[A-Za-z]+(?:\s+[A-Za-z]+)?",
            r"AIA\s+(?:Medical|Health|Critical|Voluntary)[A-Za-z ]*",
        ],
    },
    InsuranceProfile {
        provider_id: "prudential",
        name: "Prudential Malaysia",
        base_url: "https://www.prudential.com.my",
        products_url: "https://www.prudential.com.my/en/products-health-insurance/medical-plans/",
        contact_phone: "1300-88-7288",
        website: "https://www.prudential.com.my",
        name_selectors: &[".card h3", ".card h2"],
        name_patterns: &[r"PRU[A-Za-z]+(?:\s+[A-Za-z]+)?"],
    },
    InsuranceProfile {
        provider_id: "allianz",
        name: "Allianz Malaysia",
        base_url: "https://www.allianz.com.my",
        products_url: "https://www.allianz.com.my/personal/life-health-and-savings/medical-and-hospitalisation.html",
        contact_phone: "1300-22-5542",
        website: "https://www.allianz.com.my",
        name_selectors: &[".card h3", ".card h2", "[data-product] h3", "[data-product] h2"],
        name_patterns: &[r"Allianz\s+(?:Care|Med|Medical|Hospital)[A-Za-z ]*"],
    },
    InsuranceProfile {
        provider_id: "great-eastern",
        name: "Great Eastern Life",
        base_url: "https://www.greateasternlife.com",
        products_url: "https://www.greateasternlife.com/my/en/personal-insurance/our-products.html?category=corp-site%3Amy%2Fproduct-category%2Flife-and-health%2Fhealth-insurance",
        contact_phone: "1300-13-8338",
        website: "https://www.greateasternlife.com/my",
        name_selectors: &[".card h3", ".card h2"],
        name_patterns: &[r"(?:Great|GREAT)\s+[A-Z][A-Za-z]+(?:\s+[A-Z][A-Za-z]+)?", r"Smart\s+[A-Z][A-Za-z]+(?:\s+[A-Z][A-Za-z]+)?"],
    },
    InsuranceProfile {
        provider_id: "etiqa",
        name: "Etiqa Insurance",
        base_url: "https://www.etiqa.com.my",
        products_url: "https://www.etiqa.com.my/health",
        contact_phone: "1300-13-8888",
        website: "https://www.etiqa.com.my",
        name_selectors: &[".card h3", ".card h2"],
        name_patterns: &[r"(?:i-Medik|Medical EZ|Etiqa\s+[A-Z][A-Za-z]+)(?:\s+[A-Z][A-Za-z]+)?"],
    },
];

pub const PROVIDER_IDS: &[&str] = &["aia", "prudential", "allianz", "great-eastern", "etiqa"];

pub fn profile(provider_id: &str) -> Option<&'static InsuranceProfile> {
    PROFILES.iter().find(|p| p.provider_id == provider_id)
}

const GOOD_PREFIXES: &[&str] = &[
    "pru", "aia ", "aia med", "allianz", "great ", "etiqa", "takaful", "medisafe", "supreme",
    "smart", "a-plus", "a-life", "critical", "hospital", "i-medik", "medical ez", "mediplus",
    "med ", "onemedical", "one medical", "i-med", "ezy", "healthassured",
];

/// Rejects navigation text, fragments and names that are too short to be a product.
pub fn is_valid_plan_name(name: &str) -> bool {
    let name = name.trim();
    let len = name.chars().count();
    if !(4..=80).contains(&len) {
        return false;
    }
    let lower = name.to_lowercase();
    if NAVIGATION_TEXT.iter().any(|p| lower.contains(p)) {
        return false;
    }
    if !name.chars().next().is_some_and(char::is_alphabetic) {
        return false;
    }
    if name.chars().filter(|c| c.is_alphabetic()).count() < 3 {
        return false;
    }
    len >= 12 || GOOD_PREFIXES.iter().any(|p| lower.starts_with(p))
}

const NON_MEDICAL_MARKERS: &[&str] = &[
    "critical illness", "critical care", "critical relief", "early payout", "multi cancer",
    "cancer care", "savings", "wealth", "investment", "retirement", "education", "legacy",
    "term life", "whole life", "life insurance", "personal accident",
];

/// Whether a discovered plan name reads as hospitalisation or medical cover. Lump-sum
/// illness, savings and life products are excluded; anything unclear is kept.
pub fn is_medical_plan(name: &str) -> bool {
    let lower = name.to_lowercase();
    !NON_MEDICAL_MARKERS.iter().any(|m| lower.contains(m))
}

/// Monetary amount: strips `RM`, `$`, commas and spaces; a `million` suffix multiplies.
pub fn parse_money(raw: &str) -> Option<f64> {
    let lower = raw.trim().to_lowercase();
    let millions = lower.contains("million");
    let stripped = lower.replace("million", "").replace("rm", "");
    if stripped.chars().any(char::is_alphabetic) {
        return None;
    }
    let cleaned: String = stripped
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let cleaned = cleaned.trim_end_matches('.');
    if cleaned.is_empty() {
        return None;
    }
    let value: f64 = cleaned.parse().ok()?;
    Some(if millions { value * 1_000_000.0 } else { value })
}

pub fn parse_percentage(raw: &str) -> Option<f64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)").expect("static regex"));
    re.captures(raw)?.get(1)?.as_str().parse().ok()
}

pub fn parse_int(raw: &str) -> Option<i64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(\d+)").expect("static regex"));
    re.captures(raw)?.get(1)?.as_str().parse().ok()
}

struct LimitPattern {
    field: &'static str,
    patterns: [&'static str; 2],
}

const LIMIT_PATTERNS: &[LimitPattern] = &[
    LimitPattern {
        field: "annual_limit",
        patterns: [
            r"annual\s+limit[:\s]+(?:rm\s*)?([0-9][0-9,.]*(?:\s*million)?)",
            r"yearly\s+limit[:\s]+(?:rm\s*)?([0-9][0-9,.]*(?:\s*million)?)",
        ],
    },
    LimitPattern {
        field: "lifetime_limit",
        patterns: [
            r"lifetime\s+limit[:\s]+(?:rm\s*)?([0-9][0-9,.]*(?:\s*million)?)",
            r"overall\s+limit[:\s]+(?:rm\s*)?([0-9][0-9,.]*(?:\s*million)?)",
        ],
    },
    LimitPattern {
        field: "room_board_limit",
        patterns: [
            r"room\s*(?:&|and)?\s*board[:\s]+(?:rm\s*)?([0-9][0-9,.]*)",
            r"daily\s+room[:\s]+(?:rm\s*)?([0-9][0-9,.]*)",
        ],
    },
];

fn compiled_limits() -> &'static Vec<(&'static str, Vec<Regex>)> {
    static COMPILED: OnceLock<Vec<(&'static str, Vec<Regex>)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        LIMIT_PATTERNS
            .iter()
            .map(|lp| {
                let res = lp
                    .patterns
                    .iter()
                    .filter_map(|p| Regex::new(p).ok())
                    .collect();
                (lp.field, res)
            })
            .collect()
    })
}

fn co_payment_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"co-?\s?pay(?:ment)?[^%\n]{0,40}?(\d{1,3}(?:\.\d+)?)\s*%").expect("static regex")
    })
}

fn entry_age_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"entry\s+age[:\s]+(\d{1,3})\s*(?:-|to|–)\s*(\d{1,3})").expect("static regex")
    })
}

const COVERAGE_KEYWORDS: &[(&str, &[&str])] = &[
    ("outpatient_covered", &["outpatient", "out-patient", "clinic visit"]),
    ("maternity_covered", &["maternity", "pregnancy", "childbirth"]),
    ("dental_covered", &["dental", "orthodontic"]),
    ("optical_covered", &["optical", "vision care", "spectacles"]),
    ("mental_health_covered", &["mental health", "psychiatric"]),
];

fn infer_plan_type(lower: &str) -> Option<&'static str> {
    if lower.contains("critical illness") {
        Some("Critical Illness")
    } else if lower.contains("personal accident") || lower.contains("accident plan") {
        Some("Accident")
    } else if lower.contains("medical") || lower.contains("hospital") {
        Some("Medical")
    } else if lower.contains("life insurance") || lower.contains("life plan") {
        Some("Life")
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanLead {
    pub plan_name: String,
    pub detail_url: Option<String>,
}

#[derive(Debug)]
pub struct InsuranceSiteScraper {
    profile: &'static InsuranceProfile,
    schema: ExtractionSchema,
}

impl InsuranceSiteScraper {
    pub fn new(profile: &'static InsuranceProfile) -> Self {
        Self {
            profile,
            schema: insurance_plan_schema(),
        }
    }

    pub fn profile(&self) -> &'static InsuranceProfile {
        self.profile
    }

    fn resolve(&self, href: &str) -> Option<String> {
        let base = Url::parse(self.profile.base_url).ok()?;
        base.join(href).ok().map(String::from)
    }

    fn page_title(&self, document: &Html) -> Result<Option<(String, &'static str)>, AdapterError> {
        for selector in TITLE_SELECTORS {
            if let Some(title) = select_first_text(document, selector)? {
                if is_valid_plan_name(&title) {
                    return Ok(Some((title, *selector)));
                }
            }
        }
        Ok(select_first_attr(document, "meta[property=\"og:title\"]", "content")?
            .filter(|t| is_valid_plan_name(t))
            .map(|t| (t, "meta[property=\"og:title\"]")))
    }
}

impl ListingScraper for InsuranceSiteScraper {
    fn target_url(&self, target: &EnrichmentTarget) -> Option<String> {
        target
            .context
            .get("detail_url")
            .or_else(|| target.context.get("source_url"))
            .cloned()
    }

    fn recognizes(&self, content: &str) -> bool {
        looks_like_html(content)
            && self
                .page_title(&Html::parse_document(content))
                .ok()
                .flatten()
                .is_some()
    }

    fn parse(
        &self,
        scrape: &ScrapeResult,
        target: &EnrichmentTarget,
    ) -> Result<BTreeMap<String, ExtractedField>, AdapterError> {
        let document = Html::parse_document(&scrape.content);
        let text = html_to_text(&scrape.content);
        let lower = text.to_lowercase();
        let evidence = |pointer: &str, snippet: &str| EvidenceRef {
            source_url: scrape.url.clone(),
            selector_or_pointer: pointer.to_string(),
            snippet: snippet.chars().take(200).collect(),
            retrieved_at: scrape.retrieved_at,
            extractor_version: EXTRACTOR_VERSION.to_string(),
        };

        let mut fields = BTreeMap::new();
        let mut put = |name: &str, value: FieldValue, confidence: f64, ev: EvidenceRef| {
            fields.insert(
                name.to_string(),
                ExtractedField::new(value, confidence).with_evidence(ev),
            );
        };

        match self.page_title(&document)? {
            Some((title, selector)) => {
                put("plan_name", FieldValue::text(title.clone()), 0.9, evidence(selector, &title))
            }
            None => {
                if let Some(name) = target.context.get("plan_name").filter(|n| is_valid_plan_name(n)) {
                    put("plan_name", FieldValue::text(name.clone()), 0.75, evidence("listing", name));
                }
            }
        }

        if let Some(description) = select_first_attr(&document, "meta[name=\"description\"]", "content")? {
            put(
                "description",
                FieldValue::text(description.clone()),
                0.85,
                evidence("meta[name=\"description\"]@content", &description),
            );
        }

        for (field, patterns) in compiled_limits() {
            let hit = patterns.iter().find_map(|re| {
                let caps = re.captures(&lower)?;
                let raw = caps.get(1)?.as_str();
                Some((parse_money(raw)?, caps.get(0)?.as_str().to_string()))
            });
            if let Some((amount, snippet)) = hit {
                put(field, FieldValue::Number(amount), 0.85, evidence("text-pattern", &snippet));
            }
        }

        for (field, keywords) in COVERAGE_KEYWORDS {
            if let Some(keyword) = keywords.iter().find(|k| lower.contains(*k)) {
                put(field, FieldValue::Bool(true), 0.6, evidence("keyword", keyword));
            }
        }

        if let Some(plan_type) = infer_plan_type(&lower) {
            put("plan_type", FieldValue::text(plan_type), 0.7, evidence("keyword", plan_type));
        }

        if let Some(caps) = co_payment_pattern().captures(&lower) {
            let snippet = caps.get(0).map(|m| m.as_str()).unwrap_or_default().to_string();
            if let Some(pct) = caps.get(1).and_then(|m| parse_percentage(m.as_str())) {
                put("co_payment_percentage", FieldValue::Number(pct), 0.8, evidence("text-pattern", &snippet));
            }
        }

        if let Some(caps) = entry_age_pattern().captures(&lower) {
            let snippet = caps.get(0).map(|m| m.as_str()).unwrap_or_default().to_string();
            if let (Some(min), Some(max)) = (
                caps.get(1).and_then(|m| m.as_str().parse::<i64>().ok()),
                caps.get(2).and_then(|m| m.as_str().parse::<i64>().ok()),
            ) {
                put("min_age", FieldValue::Integer(min), 0.8, evidence("text-pattern", &snippet));
                put("max_age", FieldValue::Integer(max), 0.8, evidence("text-pattern", &snippet));
            }
        }

        Ok(fields)
    }

    fn discover(&self, content: &str) -> Result<Vec<PlanLead>, AdapterError> {
        let document = Html::parse_document(content);
        let mut leads: Vec<PlanLead> = Vec::new();
        let mut push = |name: String, detail_url: Option<String>| {
            if !is_valid_plan_name(&name) {
                return;
            }
            match leads
                .iter_mut()
                .find(|l| l.plan_name.to_lowercase() == name.to_lowercase())
            {
                Some(existing) => {
                    if existing.detail_url.is_none() {
                        existing.detail_url = detail_url;
                    }
                }
                None => leads.push(PlanLead {
                    plan_name: name,
                    detail_url,
                }),
            }
        };

        let anchors = parse_selector("a[href]")?;
        for anchor in document.select(&anchors) {
            let Some(name) = text_or_none(anchor.text().collect::<String>()) else {
                continue;
            };
            let href = anchor.value().attr("href").and_then(|h| self.resolve(h));
            push(name, href);
        }

        for selector in CARD_SELECTORS.iter().chain(self.profile.name_selectors) {
            let sel = parse_selector(selector)?;
            for node in document.select(&sel) {
                let Some(name) = text_or_none(node.text().collect::<String>()) else {
                    continue;
                };
                // the card's own link, if any, is the detail page
                let href = node
                    .parent()
                    .and_then(ElementRef::wrap)
                    .and_then(|card| card.select(&anchors).next())
                    .and_then(|a| a.value().attr("href"))
                    .and_then(|h| self.resolve(h));
                push(name, href);
            }
        }

        let patterns = self
            .profile
            .name_patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| AdapterError::Message(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        for text in document.root_element().text() {
            for re in &patterns {
                for m in re.find_iter(text) {
                    push(m.as_str().trim().to_string(), None);
                }
            }
        }

        Ok(leads)
    }
}

impl DocumentScraper for InsuranceSiteScraper {
    fn schema(&self) -> &ExtractionSchema {
        &self.schema
    }

    /// First linked PDF, preferring ones named as a brochure. Deposit-insurance
    /// notices (PIDM) are linked from most product pages and skipped.
    fn brochure_url(&self, content: &str, page_url: &str) -> Option<String> {
        let document = Html::parse_document(content);
        let anchors = parse_selector("a[href]").ok()?;
        let base = Url::parse(page_url)
            .or_else(|_| Url::parse(self.profile.base_url))
            .ok()?;

        let mut fallback = None;
        for anchor in document.select(&anchors) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let lower = href.to_lowercase();
            if !lower.split(['?', '#']).next().is_some_and(|p| p.ends_with(".pdf")) || lower.contains("pidm") {
                continue;
            }
            let Ok(url) = base.join(href.trim()) else {
                continue;
            };
            let text = anchor.text().collect::<String>().to_lowercase();
            if lower.contains("brochure") || text.contains("brochure") {
                return Some(url.into());
            }
            if fallback.is_none() {
                fallback = Some(String::from(url));
            }
        }
        fallback
    }
}
