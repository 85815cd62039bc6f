//! Extraction schemas for the two record kinds.

use provsync_core::{ExtractionSchema, FieldKind, FieldSpec, PlausibilityRule};

/// Enrichment fields a clinic may still be missing after the sheet sync.
pub const CLINIC_ENRICHMENT_FIELDS: &[&str] = &[
    "coordinates",
    "phone",
    "website",
    "rating",
    "review_count",
    "place_id",
];

/// Columns owned by the clinic sheet.
pub const CLINIC_SHEET_FIELDS: &[&str] = &[
    "name",
    "facility_type",
    "address",
    "postcode",
    "city",
    "state",
    "is_24_hours",
];

pub const PLAN_DETAIL_FIELDS: &[&str] = &[
    "plan_type",
    "coverage_type",
    "annual_limit",
    "lifetime_limit",
    "room_board_limit",
    "outpatient_covered",
    "maternity_covered",
    "dental_covered",
    "optical_covered",
    "mental_health_covered",
    "covered_conditions",
    "excluded_conditions",
    "monthly_premium_min",
    "monthly_premium_max",
    "deductible",
    "co_payment_percentage",
    "min_age",
    "max_age",
    "claim_process",
];

/// Text fragments that mark a "plan name" as site navigation rather than a product.
pub const NAVIGATION_TEXT: &[&str] = &[
    "health protection",
    "medical protection",
    "life protection",
    "click",
    "read more",
    "learn more",
    "find out",
    "explore",
    "contact us",
    "about us",
    "home",
    "menu",
    "login",
    "register",
    "cookie",
    "privacy",
    "terms",
    "copyright",
    "navigation",
    "search",
    "loading",
    "subscribe",
    "welcome",
    "customer support",
    "knowledge hub",
    "sign up",
    "sign in",
    "log in",
    "get quote",
    "view more",
    "view all",
    "download",
    "brochure",
    "follow us",
    "sdn bhd",
    "berhad",
    "promotion",
];

pub fn clinic_schema() -> ExtractionSchema {
    ExtractionSchema {
        name: "clinic".to_string(),
        fields: vec![
            FieldSpec::optional(
                "coordinates",
                FieldKind::Coordinates,
                "Latitude/longitude of the clinic",
            ),
            FieldSpec::optional("phone", FieldKind::Text, "Primary phone number")
                .with_rule(PlausibilityRule::Length { min: 6, max: 32 }),
            FieldSpec::optional("website", FieldKind::Text, "Clinic website URL")
                .with_rule(PlausibilityRule::Length { min: 8, max: 512 }),
            FieldSpec::optional("rating", FieldKind::Number, "Listing star rating")
                .with_rule(PlausibilityRule::Range { min: 0.0, max: 5.0 }),
            FieldSpec::optional("review_count", FieldKind::Integer, "Number of listing reviews")
                .with_rule(PlausibilityRule::Range {
                    min: 0.0,
                    max: 10_000_000.0,
                }),
            FieldSpec::optional("place_id", FieldKind::Text, "Maps place identifier"),
        ],
    }
}

fn money(name: &str, description: &str) -> FieldSpec {
    FieldSpec::optional(name, FieldKind::Number, description).with_rule(PlausibilityRule::Range {
        min: 0.0,
        max: 1.0e10,
    })
}

fn covered(name: &str, description: &str) -> FieldSpec {
    FieldSpec::optional(name, FieldKind::Bool, description)
}

pub fn insurance_plan_schema() -> ExtractionSchema {
    let age = PlausibilityRule::Range {
        min: 0.0,
        max: 100.0,
    };
    ExtractionSchema {
        name: "insurance_plan".to_string(),
        fields: vec![
            FieldSpec::required("plan_name", FieldKind::Text, "The official name of the insurance plan")
                .with_rule(PlausibilityRule::Excludes {
                    patterns: NAVIGATION_TEXT.iter().map(|s| s.to_string()).collect(),
                }),
            FieldSpec::optional("plan_type", FieldKind::Text, "Medical, Life, Critical Illness or Accident")
                .with_rule(PlausibilityRule::OneOf {
                    values: ["Medical", "Life", "Critical Illness", "Accident"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                }),
            FieldSpec::optional("coverage_type", FieldKind::Text, "Individual, Family or Group")
                .with_rule(PlausibilityRule::OneOf {
                    values: ["Individual", "Family", "Group"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                }),
            money("annual_limit", "Maximum annual coverage limit in RM"),
            money("lifetime_limit", "Maximum lifetime coverage limit in RM"),
            money("room_board_limit", "Daily room and board limit in RM"),
            covered("outpatient_covered", "Whether outpatient treatment is covered"),
            covered("maternity_covered", "Whether maternity benefits are covered"),
            covered("dental_covered", "Whether dental treatment is covered"),
            covered("optical_covered", "Whether optical/vision care is covered"),
            covered("mental_health_covered", "Whether mental health treatment is covered"),
            FieldSpec::optional("covered_conditions", FieldKind::List, "Covered conditions/benefits"),
            FieldSpec::optional("excluded_conditions", FieldKind::List, "Excluded conditions"),
            money("monthly_premium_min", "Minimum monthly premium in RM"),
            money("monthly_premium_max", "Maximum monthly premium in RM"),
            money("deductible", "Deductible amount in RM"),
            FieldSpec::optional("co_payment_percentage", FieldKind::Number, "Co-payment percentage")
                .with_rule(PlausibilityRule::Range {
                    min: 0.0,
                    max: 100.0,
                }),
            FieldSpec::optional("min_age", FieldKind::Integer, "Minimum entry age in years")
                .with_rule(age.clone()),
            FieldSpec::optional("max_age", FieldKind::Integer, "Maximum entry age in years")
                .with_rule(age),
            FieldSpec::optional("claim_process", FieldKind::Text, "Description of the claim process"),
            FieldSpec::optional("description", FieldKind::Text, "Short product description"),
        ],
    }
}
