mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    clinic_row, fixture, maps_page_with_coordinates, memory_store, test_config, FixedSource,
    ScriptedBrowser, ScriptedModel,
};
use provsync_adapters::{ClinicSheetExport, ProviderEntry, ProviderRegistry};
use provsync_core::{deterministic_id, FailureClass, FieldValue, RecordKind};
use provsync_storage::{MemoryRecordStore, RecordStore};
use provsync_sync::{
    report_recent_markdown, write_run_report, EnrichmentScheduler, RunAborted, RunConfig,
    RunKind, SyncPipeline,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const MEDIVIRON: (&str, &str, &str) = ("Klinik Mediviron Ampang", "12 Jalan Mamanda 9", "Ampang");
const DR_TAN: (&str, &str, &str) = ("Klinik Dr Tan", "3 Jalan Pasar", "Klang");

fn clinics() -> Vec<provsync_core::Row> {
    vec![
        clinic_row(MEDIVIRON.0, MEDIVIRON.1, MEDIVIRON.2),
        clinic_row(DR_TAN.0, DR_TAN.1, DR_TAN.2),
    ]
}

fn mediviron_id() -> String {
    deterministic_id(&[MEDIVIRON.0, MEDIVIRON.1])
}

fn dr_tan_id() -> String {
    deterministic_id(&[DR_TAN.0, DR_TAN.1])
}

fn registry() -> Arc<ProviderRegistry> {
    let entries = vec![
        ProviderEntry {
            provider_id: "google-maps".into(),
            display_name: "Google Maps".into(),
            enabled: true,
            kind: RecordKind::Clinic,
            listing_urls: Vec::new(),
        },
        ProviderEntry {
            provider_id: "aia".into(),
            display_name: "AIA Malaysia".into(),
            enabled: true,
            kind: RecordKind::InsurancePlan,
            listing_urls: Vec::new(),
        },
    ];
    Arc::new(ProviderRegistry::from_entries(&entries).expect("registry"))
}

fn pipeline(config: RunConfig, store: &Arc<MemoryRecordStore>, browser: &ScriptedBrowser) -> SyncPipeline {
    SyncPipeline::new(config, store.clone(), registry(), browser.driver())
}

#[tokio::test]
async fn unchanged_fingerprint_triggers_no_export_and_no_merge() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = memory_store();
    let browser = ScriptedBrowser::new();
    let pipeline = pipeline(test_config(dir.path()), &store, &browser);
    let source = FixedSource::clinics(clinics(), "v1");

    let first = pipeline
        .run_sheet_sync(&pipeline.new_run(), &source)
        .await
        .expect("first sync");
    assert_eq!(first.kind, RunKind::SheetSync);
    assert_eq!(first.merge.inserted, 2);
    assert_eq!(first.detected_changes, 2);
    assert_eq!(source.exports(), 1);
    assert_eq!(store.apply_calls(), 1);

    let second = pipeline
        .run_sheet_sync(&pipeline.new_run(), &source)
        .await
        .expect("second sync");
    assert_eq!(second.unchanged_sources, 1);
    assert_eq!(second.detected_changes, 0);
    assert_eq!(second.merge, Default::default());
    assert_eq!(source.exports(), 1);
    assert_eq!(store.apply_calls(), 1);
}

#[tokio::test]
async fn crash_mid_merge_leaves_storage_and_snapshot_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = memory_store();
    let browser = ScriptedBrowser::new();
    let pipeline = pipeline(test_config(dir.path()), &store, &browser);
    let mut rows = clinics();
    rows.push(clinic_row("Poliklinik Sri Muda", "8 Jalan Sri Muda", "Shah Alam"));
    let source = FixedSource::clinics(rows, "v1");

    store.fail_next_apply_after(1).await;
    let err = pipeline
        .run_sheet_sync(&pipeline.new_run(), &source)
        .await
        .expect_err("injected failure");
    assert!(format!("{err:#}").contains("injected failure"));
    assert!(store.all_records().await.is_empty());
    assert!(store.last_snapshot("clinic-sheet").await.expect("snapshot").is_none());

    let retry = pipeline
        .run_sheet_sync(&pipeline.new_run(), &source)
        .await
        .expect("retry");
    assert_eq!(retry.merge.inserted, 3);
    assert_eq!(store.all_records().await.len(), 3);
    assert!(store.last_snapshot("clinic-sheet").await.expect("snapshot").is_some());
}

#[tokio::test]
async fn unreachable_source_or_storage_aborts_the_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = memory_store();
    let browser = ScriptedBrowser::new();
    let pipeline = pipeline(test_config(dir.path()), &store, &browser);
    let source = FixedSource::clinics(clinics(), "v1");

    source.set_unreachable(true);
    assert!(pipeline.run_sheet_sync(&pipeline.new_run(), &source).await.is_err());
    assert_eq!(store.apply_calls(), 0);

    source.set_unreachable(false);
    store.set_unavailable(true);
    assert!(pipeline.run_sheet_sync(&pipeline.new_run(), &source).await.is_err());
    assert_eq!(source.exports(), 0);
    store.set_unavailable(false);
    assert!(store.all_records().await.is_empty());
}

#[tokio::test]
async fn enrichment_merges_confident_coordinates_and_leaves_phone_for_later() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = memory_store();
    let browser = ScriptedBrowser::new().page(
        "Klinik+Mediviron+Ampang",
        &maps_page_with_coordinates(MEDIVIRON.0, 3.1569, 101.7123),
    );
    let model = ScriptedModel::answering(json!({"phone": "03-4251 1234"}), 1.0);
    let pipeline = pipeline(test_config(dir.path()), &store, &browser).with_model(model.clone());
    let source = FixedSource::clinics(clinics(), "v1");
    pipeline
        .run_sheet_sync(&pipeline.new_run(), &source)
        .await
        .expect("seed");

    let summary = pipeline
        .run_enrichment(&pipeline.new_run(), RecordKind::Clinic)
        .await
        .expect("enrichment");
    assert_eq!(summary.kind, RunKind::Enrichment);
    assert_eq!(summary.targets_selected, 2);
    assert_eq!(summary.fetch_failures, 1);
    assert_eq!(summary.deep_calls, 0);
    assert_eq!(summary.merge.updated, 1);
    assert_eq!(model.calls(), 0);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].target_id, dr_tan_id());
    assert_eq!(summary.failures[0].class, FailureClass::Permanent);

    let records = store.get_records(&[mediviron_id()]).await.expect("records");
    let record = &records[0];
    assert_eq!(
        record.value("coordinates"),
        Some(&FieldValue::Coordinates {
            lat: 3.1569,
            lng: 101.7123
        })
    );
    assert!(record.value("phone").is_none());
    assert_eq!(record.value("name"), Some(&FieldValue::text(MEDIVIRON.0)));

    let ok = store.attempt(&mediviron_id()).await.expect("attempt");
    assert_eq!(ok.consecutive_failures, 0);
    assert!(ok.last_attempt_at.is_some());
    let failed = store.attempt(&dr_tan_id()).await.expect("attempt");
    assert_eq!(failed.consecutive_failures, 1);

    let scheduler = EnrichmentScheduler::new(store.clone(), registry(), pipeline.config());
    let next = scheduler
        .select_batch(RecordKind::Clinic, 10)
        .await
        .expect("next batch");
    let mediviron = next
        .iter()
        .find(|t| t.external_id == mediviron_id())
        .expect("still missing phone");
    assert!(mediviron.missing_fields.contains(&"phone".to_string()));
    assert!(!mediviron.missing_fields.contains(&"coordinates".to_string()));
}

#[tokio::test]
async fn sheet_updates_keep_enrichment_fields() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = memory_store();
    let browser = ScriptedBrowser::new().page(
        "Klinik+Mediviron+Ampang",
        &maps_page_with_coordinates(MEDIVIRON.0, 3.1569, 101.7123),
    );
    let pipeline = pipeline(test_config(dir.path()), &store, &browser);
    let source = FixedSource::clinics(clinics(), "v1");
    pipeline
        .run_sheet_sync(&pipeline.new_run(), &source)
        .await
        .expect("seed");
    pipeline
        .run_enrichment(&pipeline.new_run(), RecordKind::Clinic)
        .await
        .expect("enrichment");

    let mut rows = clinics();
    rows[0]
        .fields
        .insert("city".to_string(), FieldValue::text("Ampang Jaya"));
    rows.pop();
    source.replace(rows, "v2");

    let summary = pipeline
        .run_sheet_sync(&pipeline.new_run(), &source)
        .await
        .expect("resync");
    assert_eq!(summary.merge.updated, 1);
    assert_eq!(summary.merge.removed, 1);

    let records = store
        .get_records(&[mediviron_id(), dr_tan_id()])
        .await
        .expect("records");
    let mediviron = records.iter().find(|r| r.external_id == mediviron_id()).expect("mediviron");
    assert_eq!(mediviron.value("city"), Some(&FieldValue::text("Ampang Jaya")));
    assert!(mediviron.value("coordinates").is_some());
    let dr_tan = records.iter().find(|r| r.external_id == dr_tan_id()).expect("dr tan");
    assert!(!dr_tan.active);
}

#[tokio::test]
async fn clinic_sheet_export_syncs_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("clinics.json");
    let export = r#"{"values": [
        ["SENARAI KLINIK PANEL"],
        ["BIL", "JENIS_FASILITI", "NAMA_PENUH_FASILITI", "ALAMAT", "POSKOD", "BANDAR", "NEGERI"],
        ["1", "KLINIK AM", "Klinik Mediviron Ampang", "12 Jalan Mamanda 9", "68000", "Ampang", "Selangor"],
        ["2", "KLINIK 24 JAM", "Klinik Dr Lim 24 Jam", "5 Jalan Pasar", "50000", "Kuala Lumpur", "WP Kuala Lumpur"]
    ]}"#;
    tokio::fs::write(&path, export).await.expect("write export");

    let store = memory_store();
    let browser = ScriptedBrowser::new();
    let pipeline = pipeline(test_config(dir.path()), &store, &browser);
    let source = ClinicSheetExport::new("clinic-sheet", &path);

    let first = pipeline
        .run_sheet_sync(&pipeline.new_run(), &source)
        .await
        .expect("first");
    assert_eq!(first.merge.inserted, 2);
    let second = pipeline
        .run_sheet_sync(&pipeline.new_run(), &source)
        .await
        .expect("second");
    assert_eq!(second.unchanged_sources, 1);

    tokio::fs::write(&path, export.replace("\"68000\"", "\"68100\""))
        .await
        .expect("rewrite");
    let third = pipeline
        .run_sheet_sync(&pipeline.new_run(), &source)
        .await
        .expect("third");
    assert_eq!(third.merge.updated, 1);
    assert_eq!(third.merge.inserted, 0);

    let records = store.get_records(&[mediviron_id()]).await.expect("records");
    assert_eq!(records[0].value("postcode"), Some(&FieldValue::text("68100")));
    let lim = store
        .get_records(&[deterministic_id(&["Klinik Dr Lim 24 Jam", "5 Jalan Pasar"])])
        .await
        .expect("records");
    assert_eq!(lim[0].value("is_24_hours"), Some(&FieldValue::Bool(true)));
}

#[tokio::test]
async fn insurance_plans_are_discovered_synced_and_enriched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = memory_store();
    let browser = ScriptedBrowser::new()
        .page("medical-protection.html", &fixture("aia", "listing.html"))
        .page("a-plus-med.html", &fixture("aia", "page.html"));
    let pipeline = pipeline(test_config(dir.path()), &store, &browser);

    let summary = pipeline
        .run_insurance_plans(&pipeline.new_run())
        .await
        .expect("plans run");
    assert_eq!(summary.kind, RunKind::InsurancePlans);
    assert_eq!(summary.merge.inserted, 3);
    assert_eq!(summary.targets_selected, 3);
    assert_eq!(summary.merge.updated, 1);

    let a_plus = deterministic_id(&["aia", "A-Plus Med"]);
    let records = store.get_records(&[a_plus.clone()]).await.expect("records");
    let record = &records[0];
    assert_eq!(record.record_kind, RecordKind::InsurancePlan);
    assert_eq!(record.value("provider_id"), Some(&FieldValue::text("aia")));
    assert_eq!(record.value("annual_limit"), Some(&FieldValue::Number(2_000_000.0)));
    assert!(record.fields["annual_limit"].low_confidence);
    assert_eq!(store.attempt(&a_plus).await.expect("attempt").consecutive_failures, 0);

    let a_life = deterministic_id(&["aia", "A-Life Med Regular"]);
    assert_eq!(store.attempt(&a_life).await.expect("attempt").consecutive_failures, 1);
    assert!(summary
        .failures
        .iter()
        .any(|f| f.target_id == a_life && f.class == FailureClass::Permanent));

    let again = pipeline
        .run_insurance_plans(&pipeline.new_run())
        .await
        .expect("second plans run");
    assert_eq!(again.unchanged_sources, 1);
    assert_eq!(again.merge.inserted, 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_run_commits_nothing_and_returns_sessions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = memory_store();
    let browser = ScriptedBrowser::new()
        .with_latency(Duration::from_secs(60))
        .page("google.com/maps", &maps_page_with_coordinates(MEDIVIRON.0, 3.1569, 101.7123));
    let pipeline = pipeline(test_config(dir.path()), &store, &browser);
    let source = FixedSource::clinics(clinics(), "v1");
    pipeline
        .run_sheet_sync(&pipeline.new_run(), &source)
        .await
        .expect("seed");
    let applied = store.apply_calls();
    let before = store.all_records().await;

    let cancel = CancellationToken::new();
    let ctx = pipeline.new_run().with_cancel(cancel.clone());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
    });

    let err = pipeline
        .run_enrichment(&ctx, RecordKind::Clinic)
        .await
        .expect_err("cancelled");
    assert_eq!(err.downcast_ref::<RunAborted>(), Some(&RunAborted::Cancelled));
    assert_eq!(store.apply_calls(), applied);
    assert_eq!(store.all_records().await, before);
    assert!(store.attempt(&mediviron_id()).await.is_none());

    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert!(browser.opened() > 0);
    assert_eq!(browser.closed(), browser.opened());
}

#[tokio::test(start_paused = true)]
async fn run_deadline_aborts_the_batch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = memory_store();
    let browser = ScriptedBrowser::new()
        .with_latency(Duration::from_secs(600))
        .page("google.com/maps", &maps_page_with_coordinates(MEDIVIRON.0, 3.1569, 101.7123));
    let config = RunConfig {
        run_deadline: Duration::from_secs(5),
        ..test_config(dir.path())
    };
    let pipeline = pipeline(config, &store, &browser);
    let source = FixedSource::clinics(clinics(), "v1");
    pipeline
        .run_sheet_sync(&pipeline.new_run(), &source)
        .await
        .expect("seed");
    let applied = store.apply_calls();

    let err = pipeline
        .run_enrichment(&pipeline.new_run(), RecordKind::Clinic)
        .await
        .expect_err("deadline");
    assert_eq!(
        err.downcast_ref::<RunAborted>(),
        Some(&RunAborted::DeadlineExceeded)
    );
    assert_eq!(store.apply_calls(), applied);
}

#[tokio::test]
async fn run_reports_are_written_and_summarised() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = memory_store();
    let browser = ScriptedBrowser::new();
    let pipeline = pipeline(test_config(dir.path()), &store, &browser);
    let source = FixedSource::clinics(clinics(), "v1");

    let summary = pipeline
        .run_sheet_sync(&pipeline.new_run(), &source)
        .await
        .expect("sync");
    let report_dir = write_run_report(&pipeline.config().reports_dir(), &summary)
        .await
        .expect("write report");
    assert!(report_dir.join("run_report.json").exists());
    let brief = std::fs::read_to_string(report_dir.join("brief.md")).expect("brief");
    assert!(brief.contains(&summary.run_id.to_string()));
    assert!(brief.contains("- inserted: 2"));

    let markdown = report_recent_markdown(5, dir.path()).expect("markdown");
    assert!(markdown.starts_with("# Provider Sync Report"));
    assert!(markdown.contains(&format!("## Run `{}` (SheetSync)", summary.run_id)));
    assert!(markdown.contains("2 inserted"));
}
