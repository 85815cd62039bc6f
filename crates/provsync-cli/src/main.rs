use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use provsync_adapters::{ClinicSheetExport, HttpSheetExport, SourceOfTruth};
use provsync_core::RecordKind;
use provsync_storage::PgRecordStore;
use provsync_sync::{report_recent_markdown, write_run_report, RunConfig, RunSummary, SyncPipeline};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "provsync")]
#[command(about = "Healthcare provider sync and enrichment")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync clinics from the sheet export (a saved file or a URL).
    SyncSheet {
        #[arg(long, conflicts_with = "url", required_unless_present = "url")]
        file: Option<PathBuf>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long, default_value = "clinic-sheet")]
        source_id: String,
    },
    /// Enrich stored records that are missing fields.
    Enrich {
        #[arg(long, value_enum, default_value_t = KindArg::Clinic)]
        kind: KindArg,
    },
    /// Discover insurance plans on provider sites, then enrich them.
    Plans,
    /// Print a markdown digest of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    Migrate,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Clinic,
    InsurancePlan,
}

impl From<KindArg> for RecordKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Clinic => RecordKind::Clinic,
            KindArg::InsurancePlan => RecordKind::InsurancePlan,
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,provsync_sync=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            on_signal.cancel();
        }
    });
    token
}

async fn finish(config: &RunConfig, summary: RunSummary) -> Result<()> {
    let dir = write_run_report(&config.reports_dir(), &summary).await?;
    println!(
        "run complete: run_id={} kind={:?} inserted={} updated={} removed={} flagged={} failures={} spent={:.2} report={}",
        summary.run_id,
        summary.kind,
        summary.merge.inserted,
        summary.merge.updated,
        summary.merge.removed,
        summary.merge.flagged_for_review,
        summary.failures.len(),
        summary.spent,
        dir.display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = RunConfig::from_env();

    match cli.command {
        Commands::SyncSheet { file, url, source_id } => {
            let source: Box<dyn SourceOfTruth> = match (file, url) {
                (Some(path), _) => Box::new(ClinicSheetExport::new(source_id, path)),
                (None, Some(url)) => Box::new(HttpSheetExport::new(source_id, url)?),
                (None, None) => anyhow::bail!("either --file or --url is required"),
            };
            let pipeline = SyncPipeline::from_config(config.clone()).await?;
            let ctx = pipeline.new_run().with_cancel(cancel_on_interrupt());
            info!(run_id = %ctx.run_id, source_id = source.source_id(), "sheet sync started");
            let summary = pipeline.run_sheet_sync(&ctx, source.as_ref()).await?;
            finish(&config, summary).await?;
        }
        Commands::Enrich { kind } => {
            let pipeline = SyncPipeline::from_config(config.clone()).await?;
            let ctx = pipeline.new_run().with_cancel(cancel_on_interrupt());
            let summary = pipeline.run_enrichment(&ctx, kind.into()).await?;
            finish(&config, summary).await?;
        }
        Commands::Plans => {
            let pipeline = SyncPipeline::from_config(config.clone()).await?;
            let ctx = pipeline.new_run().with_cancel(cancel_on_interrupt());
            let summary = pipeline.run_insurance_plans(&ctx).await?;
            finish(&config, summary).await?;
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_markdown(runs, &config.workspace_root)?);
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            let store = PgRecordStore::connect(url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
