//! Change detection, budgeted enrichment and reconciliation of provider records.

pub mod change;
pub mod config;
pub mod context;
pub mod cost;
pub mod extraction;
pub mod plans;
pub mod reconcile;
pub mod run;
pub mod scheduler;
pub mod scraper;
pub mod validation;

pub use change::{diff_rows, ChangeDetector, Detection, PendingChanges};
pub use config::{load_provider_registry, parse_provider_entries, RunConfig};
pub use context::{RunAborted, RunContext};
pub use cost::{CostGuard, Reservation, SpendLedger};
pub use extraction::{coerce_deep_output, schema_for, Extraction, ExtractionPipeline};
pub use plans::PlanListingSource;
pub use reconcile::{merge_field, FieldMerge, SyncReconciler};
pub use run::{report_recent_markdown, write_run_report, RunKind, RunSummary, SyncPipeline};
pub use scheduler::{prioritize, EnrichmentScheduler};
pub use scraper::{fingerprint_url, EngineConfig, FetchState, ScraperEngine, SessionLease, SessionPool};
pub use validation::{canonicalize, check_field, drop_implausible, validate};

pub const CRATE_NAME: &str = "provsync-sync";
