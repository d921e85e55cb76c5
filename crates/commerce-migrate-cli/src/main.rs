//! commerce-migrate CLI - resumable collection and migration of storefront data.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use commerce_migrate::audit::DEFAULT_GAP_THRESHOLD;
use commerce_migrate::{
    open_store, Auditor, Collector, Config, DestinationApi, EntityKind, IdGapReport,
    MapperSettings, MigrateError, MigrationRunSummary, Migrator, RestDestinationClient,
    RestSourceClient, RetryPolicy, SourceApi, StagingStore, StopReason,
};
use dialoguer::Confirm;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code when a run finished but some records failed.
const EXIT_PARTIAL_FAILURE: u8 = 4;

#[derive(Parser)]
#[command(name = "commerce-migrate")]
#[command(about = "Resumable two-phase migration of customers, orders and subscriptions")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Timeout in seconds for graceful shutdown (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the staging schema
    InitDb,

    /// Collect one entity kind from the source into staging (Phase 1)
    Collect {
        /// Entity kind: customer, order or subscription
        #[arg(long, value_parser = parse_kind)]
        kind: EntityKind,

        /// Records requested per page [default: collection.batch_size]
        #[arg(long)]
        batch_size: Option<usize>,

        /// Stop after this many pages
        #[arg(long)]
        page_limit: Option<u32>,
    },

    /// Migrate staged customers with their orders and subscriptions (Phase 2)
    Migrate {
        /// Customers per batch [default: migration.batch_size]
        #[arg(long)]
        batch_size: Option<usize>,

        /// Stop after this many batches
        #[arg(long)]
        max_batches: Option<usize>,

        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Dry run: report what would be migrated without writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Retry orders or subscriptions whose customer is already migrated
    MigrateDependents {
        /// Entity kind: order or subscription
        #[arg(long, value_parser = parse_kind)]
        kind: EntityKind,

        /// Records per batch [default: migration.batch_size]
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Show staged, migrated, linked and failed counts per entity kind
    Status,

    /// Compare staging against the source
    Audit {
        /// Entity kind: customer, order or subscription
        #[arg(long, value_parser = parse_kind)]
        kind: EntityKind,

        /// Re-read a page interval, e.g. 118..119
        #[arg(long, value_parser = parse_pages)]
        pages: Option<(i64, i64)>,

        /// Records per page for --pages [default: collection.batch_size]
        #[arg(long)]
        page_size: Option<usize>,

        /// Stage records found missing by --pages (progress is not changed)
        #[arg(long)]
        restage: bool,

        /// Scan staged ids for wide jumps instead of querying the source
        #[arg(long, conflicts_with_all = ["pages", "restage"])]
        id_gaps: bool,

        /// Smallest jump between consecutive staged ids reported by --id-gaps
        #[arg(long, default_value_t = DEFAULT_GAP_THRESHOLD, requires = "id_gaps")]
        gap_threshold: i64,
    },

    /// Override the collection checkpoint of one entity kind
    ResetProgress {
        /// Entity kind: customer, order or subscription
        #[arg(long, value_parser = parse_kind)]
        kind: EntityKind,

        /// New last completed page; collection resumes at page + 1
        #[arg(long)]
        page: i64,

        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },

    /// Securely delete staged data and collection progress
    Purge {
        /// Also delete identity links (re-migration will rely on reconciliation lookups)
        #[arg(long)]
        include_links: bool,

        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },

    /// Test source, destination and staging connectivity
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
    let cancel_token = setup_signal_handler(cli.shutdown_timeout).await?;
    let retry = RetryPolicy::from_config(&config.retry);

    match cli.command {
        Commands::InitDb => {
            let store = open_staging(&config).await?;
            println!("Staging schema ready ({})", store.backend_type());
        }

        Commands::Collect {
            kind,
            batch_size,
            page_limit,
        } => {
            let store = open_staging(&config).await?;
            let source: Arc<dyn SourceApi> =
                Arc::new(RestSourceClient::new(&config.source, &config.retry)?);
            let collector = Collector::new(source, store, retry).with_cancel(cancel_token);

            let batch_size = batch_size.unwrap_or(config.collection.batch_size);
            let page_limit = page_limit.or(config.collection.page_limit);
            let summary = collector.collect(kind, batch_size, page_limit).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                let status_msg = if summary.exhausted {
                    "Collection completed!"
                } else {
                    "Collection stopped."
                };
                println!("\n{}", status_msg);
                println!("  Kind: {}", summary.entity_kind);
                println!(
                    "  Pages: {}..{} ({} fetched)",
                    summary.start_page, summary.last_completed_page, summary.pages_fetched
                );
                println!("  Records: {} this run", summary.records_collected);
                println!("  Total staged by collection: {}", summary.total_collected);
                if summary.records_rejected > 0 {
                    println!("  Rejected (no id): {}", summary.records_rejected);
                }
                println!("  Duration: {:.2}s", summary.duration_seconds);
            }
        }

        Commands::Migrate {
            batch_size,
            max_batches,
            workers,
            dry_run,
        } => {
            let store = open_staging(&config).await?;
            let destination: Arc<dyn DestinationApi> = Arc::new(RestDestinationClient::new(
                &config.destination,
                &config.retry,
            )?);
            let migrator = Migrator::new(
                store,
                destination,
                MapperSettings::from_config(&config.migration),
                retry,
            )
            .with_workers(workers.unwrap_or(config.migration.workers))
            .with_dry_run(dry_run)
            .with_skip_inactive(config.migration.skip_inactive_customers)
            .with_max_failure_ratio(config.migration.max_failure_ratio)
            .with_cancel(cancel_token);

            let batch_size = batch_size.unwrap_or(config.migration.batch_size);
            return finish_run(migrator.run(batch_size, max_batches).await, cli.output_json);
        }

        Commands::MigrateDependents { kind, batch_size } => {
            let store = open_staging(&config).await?;
            let destination: Arc<dyn DestinationApi> = Arc::new(RestDestinationClient::new(
                &config.destination,
                &config.retry,
            )?);
            let migrator = Migrator::new(
                store,
                destination,
                MapperSettings::from_config(&config.migration),
                retry,
            )
            .with_cancel(cancel_token);

            let batch_size = batch_size.unwrap_or(config.migration.batch_size);
            return finish_run(
                migrator.run_dependents(kind, batch_size, None).await,
                cli.output_json,
            );
        }

        Commands::Status => {
            let store = open_staging(&config).await?;
            let stats = store.stats().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Staging ({}):", stats.backend);
                println!(
                    "  {:<14} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
                    "kind", "staged", "migrated", "pending", "linked", "failed", "last page"
                );
                for k in &stats.kinds {
                    let last_page = k
                        .progress
                        .as_ref()
                        .map(|p| p.last_completed_page.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "  {:<14} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
                        k.kind.plural(),
                        k.staged,
                        k.migrated,
                        k.pending,
                        k.linked,
                        k.failed,
                        last_page
                    );
                }
                for k in &stats.kinds {
                    if let Some(f) = &k.last_failure {
                        println!(
                            "\n  Last {} failure: {} [{}] at {}: {}",
                            k.kind,
                            f.source_id,
                            f.class,
                            f.failed_at.format("%Y-%m-%d %H:%M:%S UTC"),
                            f.message
                        );
                    }
                }
            }
        }

        Commands::Audit {
            kind,
            id_gaps: true,
            gap_threshold,
            ..
        } => {
            let store = open_staging(&config).await?;
            let source: Arc<dyn SourceApi> =
                Arc::new(RestSourceClient::new(&config.source, &config.retry)?);
            let report = Auditor::new(source, store, retry)
                .id_gaps(kind, gap_threshold)
                .await?;
            print_gap_report(&report, cli.output_json)?;
            if report.has_gaps() {
                return Ok(ExitCode::from(EXIT_PARTIAL_FAILURE));
            }
        }

        Commands::Audit {
            kind,
            pages,
            page_size,
            restage,
            ..
        } => {
            let store = open_staging(&config).await?;
            let source: Arc<dyn SourceApi> =
                Arc::new(RestSourceClient::new(&config.source, &config.retry)?);
            let auditor = Auditor::new(source.clone(), store.clone(), retry.clone());

            let reconciliation = auditor.reconcile(kind).await?;
            let page_report = match pages {
                Some((start, end)) => {
                    let size = page_size.unwrap_or(config.collection.batch_size);
                    Some(auditor.audit_pages(kind, start, end, size).await?)
                }
                None => None,
            };

            let mut restaged = 0;
            if restage {
                if let Some(report) = &page_report {
                    let collector = Collector::new(source, store, retry);
                    restaged = collector
                        .restage(kind, report.missing_records.clone())
                        .await?;
                }
            }

            if cli.output_json {
                let mut output = serde_json::Map::new();
                output.insert("reconciliation".into(), serde_json::to_value(&reconciliation)?);
                output.insert("pages".into(), serde_json::to_value(&page_report)?);
                output.insert("restaged".into(), restaged.into());
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("Audit of {}:", kind.plural());
                match reconciliation.source_reported {
                    Some(total) => println!("  Source reports: {}", total),
                    None => println!("  Source reports: (no total)"),
                }
                println!("  Staged: {}", reconciliation.staged);
                if let Some(diff) = reconciliation.difference {
                    println!("  Difference: {}", diff);
                }
                if let Some(report) = &page_report {
                    println!(
                        "\n  Pages {}..{}:",
                        report.start_page, report.end_page
                    );
                    for page in &report.pages {
                        println!(
                            "    page {}: {} records, {} not staged",
                            page.page, page.api_count, page.missing
                        );
                    }
                    for err in &report.api_errors {
                        println!("    error: {}", err);
                    }
                    if !report.missing_ids.is_empty() {
                        println!("  Missing ids: {:?}", report.missing_ids);
                    }
                    if restage {
                        println!("  Restaged: {}", restaged);
                    }
                }
            }

            if reconciliation.difference.map_or(false, |d| d > 0) && restaged == 0 {
                return Ok(ExitCode::from(EXIT_PARTIAL_FAILURE));
            }
        }

        Commands::ResetProgress { kind, page, yes } => {
            let store = open_staging(&config).await?;
            let current = store
                .load_progress(kind)
                .await?
                .map(|p| p.last_completed_page)
                .unwrap_or(0);
            let prompt = format!(
                "Move {} collection progress from page {} to page {}?",
                kind, current, page
            );
            if !confirm(&prompt, yes)? {
                println!("Aborted; progress unchanged.");
                return Ok(ExitCode::SUCCESS);
            }
            let progress = store.reset_progress(kind, page).await?;
            println!(
                "{} progress set to page {}; next collection starts at page {}",
                kind,
                progress.last_completed_page,
                progress.next_page()
            );
        }

        Commands::Purge { include_links, yes } => {
            let store = open_staging(&config).await?;
            let what = if include_links {
                "all staged records, collection progress AND identity links"
            } else {
                "all staged records and collection progress"
            };
            if !confirm(&format!("Permanently delete {}?", what), yes)? {
                println!("Aborted; nothing deleted.");
                return Ok(ExitCode::SUCCESS);
            }
            store.purge(include_links).await?;
            println!("Purged {}.", what);
        }

        Commands::HealthCheck => {
            let source = RestSourceClient::new(&config.source, &config.retry)?;
            let destination = RestDestinationClient::new(&config.destination, &config.retry)?;

            let started = Instant::now();
            let source_error = source.health_check().await.err();
            let source_ms = started.elapsed().as_millis() as u64;

            let started = Instant::now();
            let destination_error = destination.health_check().await.err();
            let destination_ms = started.elapsed().as_millis() as u64;

            let started = Instant::now();
            let staging_error = match open_store(&config.staging).await {
                Ok(store) => store.stats().await.err(),
                Err(e) => Some(e),
            };
            let staging_ms = started.elapsed().as_millis() as u64;

            let checks = [
                ("source", source_error.map(|e| e.to_string()), source_ms),
                ("destination", destination_error.map(|e| e.to_string()), destination_ms),
                ("staging", staging_error.map(|e| e.to_string()), staging_ms),
            ];
            let healthy = checks.iter().all(|(_, error, _)| error.is_none());

            if cli.output_json {
                let mut output = serde_json::Map::new();
                for (name, error, ms) in &checks {
                    let mut check = serde_json::Map::new();
                    check.insert("connected".into(), error.is_none().into());
                    check.insert("latency_ms".into(), (*ms).into());
                    check.insert("error".into(), error.clone().into());
                    output.insert(name.to_string(), check.into());
                }
                output.insert("healthy".into(), healthy.into());
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("Health Check Results:");
                for (name, error, ms) in &checks {
                    println!(
                        "  {}: {} ({}ms)",
                        name,
                        if error.is_none() { "OK" } else { "FAILED" },
                        ms
                    );
                    if let Some(e) = error {
                        println!("    Error: {}", e);
                    }
                }
                println!(
                    "\n  Overall: {}",
                    if healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !healthy {
                return Err(MigrateError::Config("Health check failed".to_string()));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Open the configured staging store and make sure its schema exists.
async fn open_staging(config: &Config) -> Result<Arc<dyn StagingStore>, MigrateError> {
    let store = open_store(&config.staging).await?;
    store.init_schema().await?;
    Ok(store)
}

/// Print the summary of a finished or aborted run and pick the exit code.
fn finish_run(
    outcome: Result<MigrationRunSummary, MigrateError>,
    json: bool,
) -> Result<ExitCode, MigrateError> {
    match outcome {
        Ok(summary) => {
            print_run_summary(&summary, json)?;
            Ok(exit_for(&summary))
        }
        Err(MigrateError::Aborted { summary, source }) => {
            print_run_summary(&summary, json)?;
            Err(*source)
        }
        Err(e) => Err(e),
    }
}

fn print_run_summary(summary: &MigrationRunSummary, json: bool) -> Result<(), MigrateError> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    let status_msg = if summary.stop_reason == StopReason::Aborted {
        "Migration aborted."
    } else if summary.dry_run {
        "Dry run completed!"
    } else {
        "Migration finished."
    };
    println!("\n{}", status_msg);
    println!("  Run ID: {}", summary.run_id);
    println!("  Stopped: {:?}", summary.stop_reason);
    println!("  Batches: {} ({} records fetched)", summary.batches, summary.fetched);
    for (label, counts) in [
        ("Customers", &summary.customers),
        ("Orders", &summary.orders),
        ("Subscriptions", &summary.subscriptions),
    ] {
        if counts.total() == 0 {
            continue;
        }
        println!(
            "  {}: {} created, {} updated, {} skipped, {} failed",
            label, counts.created, counts.updated, counts.skipped, counts.failed
        );
    }
    println!("  Duration: {:.2}s", summary.duration_seconds);
    if let Some(last) = summary.failures.last() {
        println!(
            "  Failed records: {} (last: {} {} [{}] {})",
            summary.failures.len(),
            last.kind,
            last.source_id,
            last.class,
            last.message
        );
    }
    Ok(())
}

fn print_gap_report(report: &IdGapReport, json: bool) -> Result<(), MigrateError> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Id gaps in staged {}:", report.kind.plural());
    println!("  Staged: {}", report.staged);
    if let (Some(min), Some(max)) = (report.min_id, report.max_id) {
        println!(
            "  Id span: {}..{} ({} ids not staged)",
            min, max, report.missing_in_span
        );
    }
    if !report.has_gaps() {
        println!("  No id jumps above {}", report.threshold);
        return Ok(());
    }
    println!("  Jumps above {}:", report.threshold);
    for gap in &report.gaps {
        println!(
            "    {}..{}: {} ids missing",
            gap.after, gap.before, gap.missing
        );
    }
    Ok(())
}

fn exit_for(summary: &MigrationRunSummary) -> ExitCode {
    if summary.failed() > 0 {
        ExitCode::from(EXIT_PARTIAL_FAILURE)
    } else {
        ExitCode::SUCCESS
    }
}

fn confirm(prompt: &str, assume_yes: bool) -> Result<bool, MigrateError> {
    if assume_yes {
        return Ok(true);
    }
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .map_err(|e| MigrateError::Config(format!("confirmation required (use --yes): {}", e)))
}

fn parse_kind(s: &str) -> Result<EntityKind, String> {
    s.parse::<EntityKind>().map_err(|e| e.to_string())
}

/// Parse `START..END` (or `START-END`) into an inclusive page interval.
fn parse_pages(s: &str) -> Result<(i64, i64), String> {
    let (start, end) = s
        .split_once("..")
        .or_else(|| s.split_once('-'))
        .ok_or_else(|| format!("expected START..END, got '{}'", s))?;
    let start: i64 = start
        .trim()
        .parse()
        .map_err(|_| format!("invalid start page '{}'", start))?;
    let end: i64 = end
        .trim()
        .trim_start_matches('=')
        .parse()
        .map_err(|_| format!("invalid end page '{}'", end))?;
    if start < 1 || end < start {
        return Err(format!("invalid page interval {}..{}", start, end));
    }
    Ok((start, end))
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Runs stop at the next page or batch boundary once the token is cancelled.
#[cfg(unix)]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. Stopping at the next page/batch boundary (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();

        // A second signal, or the timeout, ends the process.
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
            _ = tokio::time::sleep(std::time::Duration::from_secs(shutdown_timeout)) => {}
        }
        eprintln!("Shutdown timeout reached; exiting.");
        std::process::exit(i32::from(MigrateError::Cancelled.exit_code()));
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only SIGINT/Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!(
            "\nReceived Ctrl-C. Stopping at the next page/batch boundary (timeout: {}s)...",
            shutdown_timeout
        );
        token.cancel();
        tokio::time::sleep(std::time::Duration::from_secs(shutdown_timeout)).await;
        std::process::exit(i32::from(MigrateError::Cancelled.exit_code()));
    });

    Ok(cancel_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pages() {
        assert_eq!(parse_pages("118..119").unwrap(), (118, 119));
        assert_eq!(parse_pages("118..=119").unwrap(), (118, 119));
        assert_eq!(parse_pages("5-5").unwrap(), (5, 5));
        assert!(parse_pages("119..118").is_err());
        assert!(parse_pages("0..3").is_err());
        assert!(parse_pages("abc").is_err());
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!(parse_kind("orders").unwrap(), EntityKind::Order);
        assert!(parse_kind("products").is_err());
    }
}
