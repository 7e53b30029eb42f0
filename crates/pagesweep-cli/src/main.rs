use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use pagesweep_adapters::{CursorMode, PageShape};
use pagesweep_core::Cursor;
use pagesweep_sync::{cancel_on_ctrl_c, RunOverrides, SweepConfig, SweepOutcome, SweepPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pagesweep")]
#[command(about = "Replay a cursor-paginated JSON endpoint and export deduplicated records")]
struct Cli {
    /// Directory for exported snapshots (overrides PAGESWEEP_OUTPUT_DIR)
    #[arg(long, global = true)]
    out: Option<PathBuf>,

    /// Endpoint registry file (overrides PAGESWEEP_ENDPOINTS)
    #[arg(long, global = true)]
    endpoints: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Args)]
struct WalkArgs {
    /// Cursor for the first request; defaults to the endpoint's initial_cursor
    #[arg(long)]
    initial_cursor: Option<String>,
    /// Delay between pages in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,
    /// Stop after this many page requests
    #[arg(long)]
    max_pages: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Walk a registered endpoint and export the result
    Fetch {
        endpoint_id: String,
        #[command(flatten)]
        walk: WalkArgs,
        /// Skip per-record detail enrichment
        #[arg(long)]
        no_detail: bool,
    },
    /// Walk captured page_*.json files offline
    Replay {
        fixture_dir: PathBuf,
        #[arg(long, default_value = "replay")]
        label: String,
        #[arg(long, default_value = "")]
        records_pointer: String,
        #[arg(long, default_value = "id")]
        id_field: String,
        #[arg(long, default_value = "updated")]
        cursor_field: String,
        /// Treat cursors as page numbers instead of record fields
        #[arg(long)]
        page_number: bool,
        #[command(flatten)]
        walk: WalkArgs,
    },
    /// List registered endpoints
    Endpoints,
}

impl WalkArgs {
    fn overrides(&self, skip_detail: bool) -> RunOverrides {
        RunOverrides {
            initial_cursor: self.initial_cursor.as_deref().map(parse_cursor),
            page_delay: self.delay_ms.map(Duration::from_millis),
            max_pages: self.max_pages,
            skip_detail,
        }
    }
}

fn parse_cursor(raw: &str) -> Cursor {
    raw.parse::<i64>()
        .map(Cursor::Number)
        .unwrap_or_else(|_| Cursor::Text(raw.to_string()))
}

fn report(outcome: &SweepOutcome) -> ExitCode {
    let summary = &outcome.summary;
    println!(
        "sweep {}: endpoint={} termination={} requests={} duplicates={} records={} export={}",
        if outcome.succeeded() { "complete" } else { "failed" },
        summary.endpoint_id,
        summary.termination,
        summary.total_requests,
        summary.duplicates_found,
        summary.unique_records,
        outcome.manifest.directory.display()
    );
    if let Some(enrichment) = &summary.enrichment {
        println!(
            "details: enriched={} failed={} skipped={}",
            enrichment.enriched,
            enrichment.failures.len(),
            enrichment.skipped
        );
    }
    match &outcome.failure {
        Some(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
        None => ExitCode::SUCCESS,
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = SweepConfig::from_env();
    if let Some(out) = cli.out {
        config.output_dir = out;
    }
    if let Some(endpoints) = cli.endpoints {
        config.endpoints_path = endpoints;
    }

    let pipeline = SweepPipeline::new(config)?;
    cancel_on_ctrl_c(pipeline.cancellation().clone());

    match cli.command {
        Commands::Fetch {
            endpoint_id,
            walk,
            no_detail,
        } => {
            let outcome = pipeline
                .run_endpoint(&endpoint_id, walk.overrides(no_detail))
                .await?;
            Ok(report(&outcome))
        }
        Commands::Replay {
            fixture_dir,
            label,
            records_pointer,
            id_field,
            cursor_field,
            page_number,
            walk,
        } => {
            let shape = PageShape {
                records_pointer,
                id_field,
                cursor_mode: if page_number {
                    CursorMode::PageNumber
                } else {
                    CursorMode::RecordField
                },
                cursor_field: Some(cursor_field),
            };
            let outcome = pipeline
                .replay_fixture(&label, &fixture_dir, shape, walk.overrides(true))
                .await?;
            Ok(report(&outcome))
        }
        Commands::Endpoints => {
            let registry = pipeline.load_registry()?;
            for endpoint in &registry.endpoints {
                println!(
                    "{}\t{}\t{:?}\t{}\t{}",
                    endpoint.endpoint_id,
                    if endpoint.enabled { "enabled" } else { "disabled" },
                    endpoint.method,
                    endpoint.url,
                    endpoint.display_name
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
