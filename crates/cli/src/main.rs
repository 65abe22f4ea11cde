use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::ArgAction;
use clap::{Args, Parser, Subcommand};
use catalog_sync_core::{
    collect_doctor_info, render_markdown_summary, Collection, FixOptions, MemoryCatalog,
    SyncConfig, SyncEngine, SyncReport, SyncRequest,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "catalog-sync",
    version,
    about = "Reconcile a dataset catalog with the files on disk."
)]
struct Cli {
    /// Operator configuration file.
    #[arg(long, global = true, default_value = "catalog-sync.json", value_name = "FILE")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Compare catalog and disk for one or more collections, optionally fixing mismatches.
    Sync(SyncArgs),
    /// Apply fixes to mismatches recorded by an earlier run.
    Fix(FixArgs),
    /// List registered collections.
    Collections,
    /// Check base directories, cache directory and cached path sets.
    Doctor,
}

#[derive(Debug, Args)]
struct CatalogArgs {
    /// Catalog snapshot (JSON); rewritten in place when fixes change it.
    #[arg(long, value_name = "FILE")]
    catalog: PathBuf,
}

#[derive(Debug, Args)]
struct FixFlags {
    /// Add datasets found on disk but unknown to the catalog.
    #[arg(long)]
    index_missing: bool,

    /// Trash data on disk that no catalog record claims.
    #[arg(long, conflicts_with = "index_missing")]
    trash_missing: bool,

    /// Add and remove catalog locations to match the disk.
    #[arg(long)]
    update_locations: bool,

    /// Trash data whose catalog records are all archived.
    #[arg(long)]
    trash_archived: bool,

    /// Minimum hours since archival before --trash-archived acts.
    #[arg(long, default_value_t = 72, value_name = "HOURS")]
    min_trash_age_hours: u32,
}

impl FixFlags {
    fn options(&self) -> FixOptions {
        FixOptions {
            index_missing: self.index_missing,
            trash_missing: self.trash_missing,
            update_locations: self.update_locations,
            trash_archived: self.trash_archived.then_some(self.min_trash_age_hours),
        }
    }
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[command(flatten)]
    catalog: CatalogArgs,

    /// Collection to sync (repeatable). Defaults to every registered collection.
    #[arg(long = "collection", value_name = "NAME", action = ArgAction::Append)]
    collections: Vec<String>,

    /// Worker threads for detection; overrides the config file.
    #[arg(long)]
    jobs: Option<usize>,

    /// Append every mismatch to this JSON-lines file.
    #[arg(long, value_name = "FILE")]
    mismatch_log: Option<PathBuf>,

    #[command(flatten)]
    fix: FixFlags,

    /// Ignore any cached path set.
    #[arg(long)]
    force_rebuild: bool,

    /// JSON report output file.
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Optional markdown summary output file.
    #[arg(long, value_name = "FILE")]
    md: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct FixArgs {
    #[command(flatten)]
    catalog: CatalogArgs,

    /// Mismatch log written by an earlier `sync --mismatch-log`.
    #[arg(long, value_name = "FILE")]
    mismatch_log: PathBuf,

    #[command(flatten)]
    fix: FixFlags,

    /// JSON report output file.
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync(args) => run_sync_command(&cli.config, args),
        Commands::Fix(args) => run_fix_command(&cli.config, args),
        Commands::Collections => run_collections_command(&cli.config),
        Commands::Doctor => run_doctor_command(&cli.config),
    }
}

fn load_config(path: &Path) -> Result<SyncConfig> {
    SyncConfig::load(path).with_context(|| format!("failed to load config {}", path.display()))
}

fn load_catalog(path: &Path) -> Result<MemoryCatalog> {
    MemoryCatalog::load_snapshot(path)
        .with_context(|| format!("failed to load catalog snapshot {}", path.display()))
}

fn run_sync_command(config_path: &Path, args: SyncArgs) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(jobs) = args.jobs {
        config.jobs = jobs;
    }
    let registry = config.registry()?;
    let fix = args.fix.options();
    fix.validate()?;

    let selected: Vec<&Collection> = if args.collections.is_empty() {
        registry.iter().collect()
    } else {
        args.collections
            .iter()
            .map(|name| registry.get(name))
            .collect::<Result<_, _>>()?
    };
    if selected.is_empty() {
        anyhow::bail!("no collections configured in {}", config_path.display());
    }

    let catalog = load_catalog(&args.catalog.catalog)?;
    let engine = SyncEngine::from_config(&config, Arc::new(catalog.clone()))?;
    let request = SyncRequest {
        fix,
        mismatch_log: args.mismatch_log.clone(),
        force_rebuild: args.force_rebuild,
        ..SyncRequest::default()
    };

    let reports = sync_collections(&engine, &selected, &request, &catalog, &args.catalog.catalog)?;
    write_outputs(&reports, args.report.as_deref(), args.md.as_deref())
}

/// Runs each collection in turn, saving the catalog after every run that may have changed it.
fn sync_collections(
    engine: &SyncEngine,
    collections: &[&Collection],
    request: &SyncRequest,
    catalog: &MemoryCatalog,
    snapshot: &Path,
) -> Result<Vec<SyncReport>> {
    let mut reports = Vec::new();
    for collection in collections {
        println!("Syncing collection {} (trust {:?})", collection.name, collection.trust);
        let result = engine
            .run_with_callbacks(
                collection,
                request,
                |mismatch| println!("- {mismatch}"),
                |event| tracing::debug!("{:?} seq={} mismatches={}", event.phase, event.seq, event.mismatches),
            )
            .with_context(|| format!("sync of collection {} failed", collection.name));
        if !request.fix.is_empty() {
            persist_catalog(catalog, snapshot, result.is_err())?;
        }
        let report = result?;
        print_report_summary(&report);
        reports.push(report);
    }
    Ok(reports)
}

fn run_fix_command(config_path: &Path, args: FixArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let fix = args.fix.options();
    if fix.is_empty() {
        anyhow::bail!("no fix flag given; nothing to do");
    }

    let catalog = load_catalog(&args.catalog.catalog)?;
    let engine = SyncEngine::from_config(&config, Arc::new(catalog.clone()))?;
    let result = engine
        .fix_from_log(&args.mismatch_log, &fix)
        .with_context(|| format!("replay of {} failed", args.mismatch_log.display()));
    persist_catalog(&catalog, &args.catalog.catalog, result.is_err())?;
    let report = result?;
    print_report_summary(&report);
    write_outputs(&[report], args.report.as_deref(), None)
}

/// On a failed run the save is best effort so the run's own error is the one reported.
fn persist_catalog(catalog: &MemoryCatalog, path: &Path, run_failed: bool) -> Result<()> {
    let saved = catalog
        .save_snapshot(path)
        .with_context(|| format!("failed to save catalog snapshot {}", path.display()));
    match saved {
        Ok(()) => {
            println!("Catalog snapshot updated at {}", path.display());
            Ok(())
        }
        Err(err) if run_failed => {
            tracing::error!("{err:#}");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn run_collections_command(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let registry = config.registry()?;
    if registry.is_empty() {
        println!("No collections configured.");
        return Ok(());
    }
    for collection in registry.iter() {
        println!(
            "- {} [trust {:?}] query={} cache={}",
            collection.name,
            collection.trust,
            collection.query.slug(),
            collection.cache_key()
        );
        for pattern in &collection.file_patterns {
            println!("    {pattern}");
        }
    }
    Ok(())
}

fn run_doctor_command(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let info = collect_doctor_info(&config);
    println!("OS: {} ({})", info.os, info.arch);
    if let Some(current_dir) = info.current_dir {
        println!("Current directory: {}", current_dir);
    }
    println!(
        "Cache directory: {} (writable: {})",
        info.cache_dir, info.cache_writable
    );
    println!("Base directories: {}", info.base_dirs.len());
    for base in info.base_dirs {
        println!("- {} exists={} trash={}", base.path, base.exists, base.has_trash);
    }
    println!("Collections: {}", info.collections.len());
    for collection in info.collections {
        let age = collection
            .cache_age_minutes
            .map(|minutes| format!("{minutes} min"))
            .unwrap_or_else(|| "none".to_string());
        println!(
            "- {} cache={} age={} fresh={}",
            collection.name, collection.cache_path, age, collection.fresh
        );
    }
    for note in info.notes {
        println!("Note: {}", note);
    }
    Ok(())
}

fn print_report_summary(report: &SyncReport) {
    println!(
        "{}: {} location(s), {} mismatch(es), {} fix(es) applied, {} warning(s), {} ms.",
        report.collection,
        report.metrics.locations,
        report.total_mismatches(),
        report.applied_count(),
        report.warnings.len(),
        report.metrics.elapsed_ms
    );
    for count in report.mismatch_counts.iter().filter(|count| count.mismatches > 0) {
        println!("  {}: {}", count.kind, count.mismatches);
    }
}

fn write_outputs(reports: &[SyncReport], report: Option<&Path>, md: Option<&Path>) -> Result<()> {
    if let Some(output) = report {
        let payload =
            serde_json::to_string_pretty(reports).context("failed to serialize report")?;
        fs::write(output, payload)
            .with_context(|| format!("failed to write report to {}", output.display()))?;
        println!("Report written to {}", output.display());
    }

    if let Some(md_path) = md {
        let markdown = reports
            .iter()
            .map(render_markdown_summary)
            .collect::<Vec<_>>()
            .join("\n");
        fs::write(md_path, markdown).with_context(|| {
            format!("failed to write markdown summary to {}", md_path.display())
        })?;
        println!("Markdown summary written to {}", md_path.display());
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
