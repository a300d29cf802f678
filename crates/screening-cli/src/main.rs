use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use screening_api::ScreeningConfig;
use screening_core::{
    EntitySource, IndexSnapshot, ScreeningOutcome, ScreeningSubject, SubjectInput,
};
use screening_sources::{ListFetcher, LoadOrigin, LoadedEntities};
use screening_store_sqlite::{parse_database_url, SqliteStore};
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "sscli")]
#[command(about = "Sanctions screening CLI")]
struct Cli {
    /// Screening settings; built-in defaults apply when the file is absent.
    #[arg(long, env = "CONFIG_PATH", default_value = "config.yaml")]
    config: PathBuf,

    #[arg(long, env = "DATA_DIR", default_value = "sanctions_data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Store {
        #[command(subcommand)]
        command: Box<StoreCommand>,
    },
    Lists {
        #[command(subcommand)]
        command: ListsCommand,
    },
    Screen(ScreenArgs),
}

#[derive(Debug, Subcommand)]
enum StoreCommand {
    Migrate(DbArgs),
    Import(DbArgs),
    Count(DbArgs),
}

#[derive(Debug, Args)]
struct DbArgs {
    #[arg(long = "db", env = "DATABASE_URL")]
    url: String,
}

#[derive(Debug, Subcommand)]
enum ListsCommand {
    /// Download every configured list into the data directory.
    Fetch,
    /// Parse the cached lists and report counts and warnings.
    Validate,
}

#[derive(Debug, Args)]
struct ScreenArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    document: Option<String>,
    #[arg(long)]
    country: Option<String>,
    /// Screen against the persistent store instead of the cached lists.
    #[arg(long = "db")]
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListsSummary<'a> {
    total_entities: usize,
    source_counts: &'a BTreeMap<EntitySource, usize>,
    origins: &'a BTreeMap<EntitySource, LoadOrigin>,
    published: &'a BTreeMap<EntitySource, String>,
    errors: &'a [String],
    warnings: &'a [String],
}

impl<'a> ListsSummary<'a> {
    fn of(loaded: &'a LoadedEntities) -> Self {
        Self {
            total_entities: loaded.total(),
            source_counts: &loaded.source_counts,
            origins: &loaded.origins,
            published: &loaded.published,
            errors: &loaded.report.errors,
            warnings: &loaded.report.warnings,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let fetcher =
        ListFetcher::new(config.sources.clone(), cli.data_dir.clone(), config.download.clone());
    match cli.command {
        Command::Store { command } => run_store(*command, &fetcher),
        Command::Lists { command } => run_lists(&command, &fetcher),
        Command::Screen(args) => run_screen(args, &config, &fetcher),
    }
}

fn load_config(path: &Path) -> Result<ScreeningConfig> {
    if !path.exists() {
        info!(path = %path.display(), "config file absent; using defaults");
        return Ok(ScreeningConfig::default());
    }
    ScreeningConfig::load(path).with_context(|| format!("failed to load {}", path.display()))
}

fn run_store(command: StoreCommand, fetcher: &ListFetcher) -> Result<()> {
    match command {
        StoreCommand::Migrate(args) => run_store_migrate(&args),
        StoreCommand::Import(args) => run_store_import(&args, fetcher),
        StoreCommand::Count(args) => run_store_count(&args),
    }
}

fn run_store_migrate(args: &DbArgs) -> Result<()> {
    let path = parse_database_url(&args.url)?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut store = SqliteStore::open(&path)?;
    store.migrate()?;
    emit_json(serde_json::json!({
        "database": path.display().to_string(),
        "schema_version": store.schema_version()?
    }))
}

fn run_store_import(args: &DbArgs, fetcher: &ListFetcher) -> Result<()> {
    let loaded = fetcher.load_cached();
    if loaded.total() == 0 {
        bail!("no cached lists in {}; run `sscli lists fetch` first", fetcher.data_dir().display());
    }
    let mut store = SqliteStore::connect(&args.url)?;
    store.health_check()?;
    let summary = store.replace_entities(&loaded.entities)?;
    info!(imported = summary.imported_entities, "store import finished");
    emit_json(serde_json::json!({
        "imported_entities": summary.imported_entities,
        "by_source": summary.by_source,
        "warnings": loaded.report.warnings
    }))
}

fn run_store_count(args: &DbArgs) -> Result<()> {
    let store = SqliteStore::connect(&args.url)?;
    store.health_check()?;
    emit_json(serde_json::json!({
        "total": store.entity_count()?,
        "by_source": store.entity_count_by_source()?
    }))
}

fn run_lists(command: &ListsCommand, fetcher: &ListFetcher) -> Result<()> {
    let loaded = match command {
        ListsCommand::Fetch => fetcher.fetch_latest()?,
        ListsCommand::Validate => fetcher.load_cached(),
    };
    emit_json(serde_json::to_value(ListsSummary::of(&loaded))?)?;
    if loaded.total() == 0 {
        bail!("no entities loaded from {}", fetcher.data_dir().display());
    }
    Ok(())
}

fn run_screen(args: ScreenArgs, config: &ScreeningConfig, fetcher: &ListFetcher) -> Result<()> {
    let started = Instant::now();
    let subject = ScreeningSubject::new(SubjectInput {
        name: args.name,
        document_number: args.document,
        country: args.country,
        ..SubjectInput::default()
    })?;

    let outcome = match args.url {
        Some(url) => {
            let mut store = SqliteStore::connect(&url)?;
            store.health_check()?;
            let session = store.session()?;
            let matches = session.screen(&subject, &config.algorithm)?;
            session.finish()?;
            ScreeningOutcome::from_matches(
                matches,
                &config.algorithm.version,
                None,
                started.elapsed(),
            )
        }
        None => {
            let loaded = fetcher.load_cached();
            if loaded.total() == 0 {
                bail!("no cached lists in {}", fetcher.data_dir().display());
            }
            let snapshot = IndexSnapshot::build(1, loaded.entities);
            let matches = snapshot.screen(&subject, &config.algorithm);
            ScreeningOutcome::from_matches(
                matches,
                &config.algorithm.version,
                Some(snapshot.generation()),
                started.elapsed(),
            )
        }
    };
    emit_json(serde_json::to_value(outcome)?)
}
