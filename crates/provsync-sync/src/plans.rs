//! Provider listing pages as the source of truth for which insurance plans exist.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use provsync_adapters::insurance;
use provsync_adapters::{is_medical_plan, AdapterError, PlanLead, ProviderAdapter, SourceOfTruth};
use provsync_core::{deterministic_id, FieldValue, RecordKind, Row};
use provsync_storage::ArtifactStore;
use tracing::debug;

/// Plans discovered on one provider's listing pages, in page order.
#[derive(Debug, Clone)]
pub struct PlanListingSource {
    source_id: String,
    rows: Vec<Row>,
    fingerprint: String,
}

impl PlanListingSource {
    /// `pages` pairs each listing URL with the leads found on it. Plans listed on more
    /// than one page keep their first occurrence; non-medical products are left out.
    pub fn new(adapter: &ProviderAdapter, pages: &[(String, Vec<PlanLead>)]) -> Self {
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for (listing_url, leads) in pages {
            for lead in leads {
                if !is_medical_plan(&lead.plan_name) {
                    debug!(provider_id = %adapter.provider_id, plan = %lead.plan_name, "skipping non-medical plan");
                    continue;
                }
                let row = lead_row(adapter, listing_url, lead);
                if seen.insert(row.external_id.clone()) {
                    rows.push(row);
                }
            }
        }

        let canonical = rows
            .iter()
            .map(|row| {
                let detail = row
                    .fields
                    .get("detail_url")
                    .and_then(FieldValue::as_text)
                    .unwrap_or_default();
                format!("{}|{}", row.external_id, detail)
            })
            .collect::<Vec<_>>()
            .join("\n");

        Self {
            source_id: format!("plans:{}", adapter.provider_id),
            fingerprint: ArtifactStore::sha256_hex(canonical.as_bytes()),
            rows,
        }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub fn lead_row(adapter: &ProviderAdapter, listing_url: &str, lead: &PlanLead) -> Row {
    let mut fields = BTreeMap::new();
    fields.insert("plan_name".to_string(), FieldValue::text(lead.plan_name.clone()));
    fields.insert("provider_id".to_string(), FieldValue::text(adapter.provider_id.clone()));
    fields.insert(
        "provider_name".to_string(),
        FieldValue::text(adapter.display_name.clone()),
    );
    fields.insert("source_url".to_string(), FieldValue::text(listing_url));
    if let Some(detail_url) = &lead.detail_url {
        fields.insert("detail_url".to_string(), FieldValue::text(detail_url.clone()));
    }
    if let Some(profile) = insurance::profile(&adapter.provider_id) {
        fields.insert("contact_phone".to_string(), FieldValue::text(profile.contact_phone));
        fields.insert("website".to_string(), FieldValue::text(profile.website));
    }
    Row {
        external_id: deterministic_id(&[&adapter.provider_id, &lead.plan_name]),
        fields,
    }
}

#[async_trait]
impl SourceOfTruth for PlanListingSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn record_kind(&self) -> RecordKind {
        RecordKind::InsurancePlan
    }

    async fn current_fingerprint(&self) -> Result<String, AdapterError> {
        Ok(self.fingerprint.clone())
    }

    async fn export_rows(&self) -> Result<Vec<Row>, AdapterError> {
        Ok(self.rows.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provsync_adapters::adapter_for_provider;

    fn lead(name: &str, url: Option<&str>) -> PlanLead {
        PlanLead {
            plan_name: name.to_string(),
            detail_url: url.map(str::to_string),
        }
    }

    #[test]
    fn plans_are_keyed_by_provider_and_name() {
        let adapter = adapter_for_provider("aia").expect("aia");
        let pages = vec![
            (
                "https://www.aia.com.my/a".to_string(),
                vec![lead("A-Plus Med", Some("https://www.aia.com.my/a-plus-med.html"))],
            ),
            (
                "https://www.aia.com.my/b".to_string(),
                vec![lead("a-plus med", None), lead("A-Life Med Regular", None)],
            ),
        ];
        let source = PlanListingSource::new(&adapter, &pages);
        assert_eq!(source.rows().len(), 2);
        assert_eq!(
            source.rows()[0].external_id,
            deterministic_id(&["aia", "A-Plus Med"])
        );
        assert_eq!(source.source_id(), "plans:aia");

        let again = PlanListingSource::new(&adapter, &pages);
        assert_eq!(source.fingerprint, again.fingerprint);
        let fewer = PlanListingSource::new(&adapter, &pages[..1]);
        assert_ne!(source.fingerprint, fewer.fingerprint);
    }

    #[test]
    fn rows_carry_provider_contact_details() {
        let adapter = adapter_for_provider("prudential").expect("prudential");
        let row = lead_row(&adapter, "https://www.prudential.com.my/medical", &lead("PRUValue Med", None));
        assert_eq!(row.fields["contact_phone"], FieldValue::text("1300-88-7288"));
        assert_eq!(row.fields["website"], FieldValue::text("https://www.prudential.com.my"));
    }

    #[test]
    fn non_medical_leads_are_left_out() {
        let adapter = adapter_for_provider("aia").expect("aia");
        let pages = vec![(
            "https://www.aia.com.my/a".to_string(),
            vec![
                lead("A-Plus Med", None),
                lead("Life Saver Savings", None),
                lead("AIA Critical Care", None),
            ],
        )];
        let source = PlanListingSource::new(&adapter, &pages);
        let names: Vec<_> = source
            .rows()
            .iter()
            .filter_map(|row| row.fields["plan_name"].as_text())
            .collect();
        assert_eq!(names, vec!["A-Plus Med"]);
    }
}
