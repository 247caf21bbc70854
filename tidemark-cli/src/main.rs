//! Tidemark CLI: seed, record, status and export commands.
//!
//! Commands:
//! - `seed`: load an entity universe (TOML) into a provider's catalog
//! - `record`: run the recorder described by a run file against a CSV drop directory
//! - `status`: report rows, entities and latest timestamp per namespace table
//! - `export`: write one table (optionally one entity) to Parquet

use anyhow::{bail, Context, Result};
use chrono::SecondsFormat;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tidemark_core::domain::EntityId;
use tidemark_core::frame::export_parquet;
use tidemark_core::{
    CsvSource, EntityUniverse, Recorder, RecordQuery, Registry, RunFile, RunSummary, StorageRoot,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tidemark",
    about = "Tidemark CLI: incremental recorder for financial time series"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load entities from a universe file into the entity provider's catalog.
    Seed {
        /// Path to the TOML run file.
        #[arg(long)]
        run: PathBuf,

        /// Path to the TOML universe file.
        #[arg(long)]
        universe: PathBuf,
    },
    /// Record the run file's dataset until every entity is caught up.
    Record {
        /// Path to the TOML run file.
        #[arg(long)]
        run: PathBuf,

        /// Directory holding `{entity_id}.csv` files. Defaults to `{data_dir}/source`.
        #[arg(long)]
        source_dir: Option<PathBuf>,
    },
    /// Report every registered namespace and table.
    Status {
        /// Path to the TOML run file.
        #[arg(long)]
        run: PathBuf,
    },
    /// Export a table to Parquet.
    Export {
        /// Path to the TOML run file.
        #[arg(long)]
        run: PathBuf,

        /// Table to export.
        #[arg(long)]
        table: String,

        /// Output Parquet file.
        #[arg(long)]
        out: PathBuf,

        /// Provider namespace to read. Defaults to the recorder's provider.
        #[arg(long)]
        provider: Option<String>,

        /// Only rows of this entity id.
        #[arg(long)]
        entity: Option<String>,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Seed { run, universe } => run_seed(&run, &universe),
        Commands::Record { run, source_dir } => run_record(&run, source_dir),
        Commands::Status { run } => run_status(&run),
        Commands::Export {
            run,
            table,
            out,
            provider,
            entity,
        } => run_export(&run, &table, &out, provider, entity),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_run(path: &Path) -> Result<RunFile> {
    let mut run = RunFile::from_file(path)
        .with_context(|| format!("loading run file {}", path.display()))?;
    run.resolve_data_dir(path);
    Ok(run)
}

/// Registry over the run file's data directory with every dataset registered.
fn open_registry(run: &RunFile) -> Result<Registry> {
    let mut registry = Registry::new(StorageRoot::Directory(run.data_dir.clone()));
    for dataset in &run.datasets {
        registry
            .register_spec(dataset)
            .with_context(|| format!("registering dataset '{}'", dataset.name))?;
    }
    Ok(registry)
}

fn run_seed(run_path: &Path, universe_path: &Path) -> Result<()> {
    let run = load_run(run_path)?;
    let universe = EntityUniverse::from_file(universe_path).map_err(anyhow::Error::msg)?;
    let entities = universe.entities().map_err(anyhow::Error::msg)?;

    let registry = Registry::new(StorageRoot::Directory(run.data_dir.clone()));
    let provider = run.recorder.entity_provider();
    let catalog = registry.catalog(provider)?;
    let written = catalog.upsert(&entities)?;

    println!(
        "Seeded {written} {} entities into '{provider}' ({} total)",
        universe.entity_type,
        catalog.count()?
    );
    Ok(())
}

fn run_record(run_path: &Path, source_dir: Option<PathBuf>) -> Result<()> {
    let run = load_run(run_path)?;
    let source_dir = source_dir.unwrap_or_else(|| run.data_dir.join("source"));
    if !source_dir.is_dir() {
        bail!("source directory does not exist: {}", source_dir.display());
    }

    let registry = open_registry(&run)?;
    let source = CsvSource::new(&source_dir).named(run.recorder.provider.clone());
    let recorder = Recorder::builder(&registry, run.recorder.clone(), Arc::new(source))
        .calendar(run.calendar.clone())
        .build()?;

    if recorder.entities().is_empty() {
        println!(
            "No entities in catalog '{}' match the recorder filters; run `seed` first",
            run.recorder.entity_provider()
        );
        return Ok(());
    }

    let summary = recorder.run()?;
    print_summary(&summary);

    ensure_no_failures(&summary)
}

/// Turn given-up entities into an error so the process exits non-zero after
/// the registry has been dropped.
fn ensure_no_failures(summary: &RunSummary) -> Result<()> {
    if !summary.failed.is_empty() {
        let ids: Vec<String> = summary.failed.iter().map(ToString::to_string).collect();
        bail!("{} entities failed: {}", ids.len(), ids.join(", "));
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("=== Recorder Summary ===");
    println!("Entities:    {}", summary.entities);
    println!("Passes:      {}", summary.passes);
    println!("Finished:    {}", summary.finished);
    println!("Failed:      {}", summary.failed.len());
    println!("Fetched:     {}", summary.fetched);
    println!("Inserted:    {}", summary.inserted);
    println!("Updated:     {}", summary.updated);
    println!("Skipped:     {}", summary.skipped);
    println!("Collisions:  {}", summary.collisions);
    println!("Unfinished:  {} (dropped)", summary.dropped_unfinished);
}

fn run_status(run_path: &Path) -> Result<()> {
    let run = load_run(run_path)?;
    let registry = open_registry(&run)?;

    println!("Data dir: {}", run.data_dir.display());
    let catalog = registry.catalog(run.recorder.entity_provider())?;
    println!(
        "Catalog '{}': {} entities",
        run.recorder.entity_provider(),
        catalog.count()?
    );
    println!();
    println!(
        "{:<24} {:<28} {:>10} {:>9}  {:<20}",
        "Namespace", "Table", "Rows", "Entities", "Latest"
    );
    println!("{}", "-".repeat(95));

    for key in registry.namespaces() {
        let store = registry.store(&key.provider, &key.dataset)?;
        for table in store.tables()? {
            let stats = store.table_stats(&table)?;
            let latest = stats
                .latest
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_else(|| "-".into());
            println!(
                "{:<24} {:<28} {:>10} {:>9}  {:<20}",
                key.to_string(),
                table,
                stats.rows,
                stats.entities,
                latest
            );
        }
    }
    Ok(())
}

fn run_export(
    run_path: &Path,
    table: &str,
    out: &Path,
    provider: Option<String>,
    entity: Option<String>,
) -> Result<()> {
    let run = load_run(run_path)?;
    let registry = open_registry(&run)?;

    let dataset = run
        .datasets
        .iter()
        .find(|d| d.schemas.iter().any(|s| s.table == table))
        .map(|d| d.name.clone())
        .with_context(|| format!("no dataset in the run file declares table '{table}'"))?;
    let schema = registry
        .find_schema(&dataset, table)
        .with_context(|| format!("table '{table}' not registered"))?;

    let provider = provider.unwrap_or_else(|| run.recorder.provider.clone());
    let store = registry.store(&provider, &dataset)?;
    let query = RecordQuery {
        entity_id: entity.map(EntityId::new),
        ..RecordQuery::default()
    };

    let rows = export_parquet(&store, schema, &query, out)?;
    println!("Exported {rows} rows of {provider}/{table} to {}", out.display());
    Ok(())
}
