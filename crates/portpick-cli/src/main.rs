use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use portpick_core::{
    commit_batch, export, export_json, generate, import, parse_count, select_records, BatchId,
    PortRange, PortStore, RecordFilter, RecordId, RecordSort, SelectionStrategy, SortDirection,
    SortField, MAX_PORT, MIN_PORT,
};
use portpick_store_sqlite::SqliteStore;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

mod settings;

use settings::{FileSettings, Settings, SettingsStore};

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV_VAR: &str = "PORTPICK_LOG";
const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Parser)]
#[command(name = "portpick")]
#[command(about = "Random port allocator backed by a persistent exclusion ledger")]
struct Cli {
    #[arg(long, default_value = "./portpick.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = "./portpick.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Propose unused ports, optionally committing them.
    Generate(GenerateArgs),
    /// Commit an explicit list of ports as one batch.
    Commit(CommitArgs),
    List(ListArgs),
    Check(CheckArgs),
    Release(ReleaseArgs),
    Note(NoteArgs),
    /// Delete every committed record.
    Clear,
    Export(ExportArgs),
    Import(ImportArgs),
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long, allow_negative_numbers = true)]
    min: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    max: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    count: Option<i64>,
    #[arg(long, default_value_t = false)]
    commit: bool,
    #[arg(long)]
    note: Option<String>,
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Args)]
struct CommitArgs {
    #[arg(long)]
    batch_id: Option<String>,
    #[arg(long = "port", required = true)]
    ports: Vec<u16>,
    #[arg(long)]
    note: Option<String>,
}

#[derive(Debug, Args)]
struct FilterArgs {
    #[arg(long)]
    min: Option<i64>,
    #[arg(long)]
    max: Option<i64>,
    #[arg(long)]
    keyword: Option<String>,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    until: Option<String>,
}

impl FilterArgs {
    fn to_filter(&self) -> Result<RecordFilter> {
        let port_range = match (self.min, self.max) {
            (None, None) => None,
            (min, max) => Some(PortRange::new(
                min.unwrap_or(i64::from(MIN_PORT)),
                max.unwrap_or(i64::from(MAX_PORT)),
            )?),
        };
        Ok(RecordFilter {
            port_range,
            keyword: self.keyword.clone(),
            used_from: self.from.as_deref().map(parse_rfc3339).transpose()?,
            used_until: self.until.as_deref().map(parse_rfc3339).transpose()?,
        })
    }
}

#[derive(Debug, Args)]
struct ListArgs {
    #[command(flatten)]
    filter: FilterArgs,
    #[arg(long, value_enum, default_value_t = SortArg::UsedAt)]
    sort: SortArg,
    #[arg(long, value_enum, default_value_t = DirectionArg::Desc)]
    direction: DirectionArg,
}

#[derive(Debug, Args)]
struct CheckArgs {
    #[arg(long)]
    port: u16,
}

#[derive(Debug, Args)]
struct ReleaseArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct NoteArgs {
    #[arg(long)]
    id: String,
    /// Omit to clear the note.
    #[arg(long)]
    text: Option<String>,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[command(flatten)]
    filter: FilterArgs,
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show,
    Set(ConfigSetArgs),
    Reset,
}

#[derive(Debug, Args)]
struct ConfigSetArgs {
    #[arg(long, allow_negative_numbers = true)]
    min: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    max: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    count: Option<i64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SortArg {
    Port,
    UsedAt,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DirectionArg {
    Asc,
    Desc,
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

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = FileSettings::new(&cli.config);

    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
        Command::Config { command } => run_config(command, &settings),
        command => {
            let mut store = open_ready_store(&cli.db)?;
            run_ledger(command, &mut store, &settings)
        }
    }
}

fn open_ready_store(path: &Path) -> Result<SqliteStore> {
    let mut store = SqliteStore::open(path)?;
    store
        .init()
        .with_context(|| format!("failed to initialize port ledger at {}", path.display()))?;
    Ok(store)
}

fn run_ledger(command: Command, store: &mut SqliteStore, settings: &FileSettings) -> Result<()> {
    match command {
        Command::Generate(args) => run_generate(&args, store, settings),
        Command::Commit(args) => run_commit(&args, store),
        Command::List(args) => run_list(&args, store),
        Command::Check(args) => run_check(&args, store),
        Command::Release(args) => run_release(&args, store),
        Command::Note(args) => run_note(&args, store),
        Command::Clear => run_clear(store),
        Command::Export(args) => run_export(&args, store),
        Command::Import(args) => run_import(&args, store),
        Command::Db { .. } | Command::Config { .. } => {
            Err(anyhow!("db and config commands are dispatched before the ledger opens"))
        }
    }
}

fn run_generate(args: &GenerateArgs, store: &mut SqliteStore, settings: &FileSettings) -> Result<()> {
    let stored = settings.load()?;
    let min = args.min.unwrap_or(i64::from(stored.min));
    let max = args.max.unwrap_or(i64::from(stored.max));
    let raw_count = args.count.unwrap_or_else(|| i64::try_from(stored.count).unwrap_or(1));

    let range = PortRange::new(min, max)?;
    let count = parse_count(raw_count)?;
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let batch = generate(&*store, range, count, &mut rng)?;

    match Settings::checked(min, max, raw_count) {
        Ok(chosen) => settings.save(&chosen)?,
        Err(err) => tracing::debug!(error = %err, "generation parameters not remembered"),
    }

    let mut response = serde_json::json!({
        "batch_id": batch.batch_id,
        "range": batch.range,
        "requested": count,
        "strategy": SelectionStrategy::for_request(range, count).as_str(),
        "ports": batch.ports,
        "committed": false
    });

    if args.commit {
        let result = commit_batch(store, &batch.ports, &batch.batch_id, args.note.as_deref())?;
        response["committed"] = Value::Bool(true);
        response["records"] = serde_json::to_value(&result.committed)
            .context("failed to serialize committed records")?;
        response["conflicts"] = serde_json::to_value(&result.conflicts)?;
    }

    emit_json(response)
}

fn run_commit(args: &CommitArgs, store: &mut SqliteStore) -> Result<()> {
    let batch_id = match args.batch_id.as_deref() {
        Some(raw) => BatchId::parse(raw)?,
        None => BatchId::new(),
    };
    let result = commit_batch(store, &args.ports, &batch_id, args.note.as_deref())?;
    emit_json(serde_json::json!({
        "batch_id": result.batch_id,
        "complete": result.is_complete(),
        "records": result.committed,
        "conflicts": result.conflicts
    }))
}

fn run_list(args: &ListArgs, store: &SqliteStore) -> Result<()> {
    let filter = args.filter.to_filter()?;
    let sort = RecordSort {
        field: args.sort.into_sort_field(),
        direction: args.direction.into_direction(),
    };

    let records = select_records(&store.list_all()?, &filter, sort);
    emit_json(serde_json::json!({
        "count": records.len(),
        "records": records
    }))
}

fn run_check(args: &CheckArgs, store: &SqliteStore) -> Result<()> {
    let in_use = store.is_used(args.port)?;
    emit_json(serde_json::json!({
        "port": args.port,
        "in_use": in_use
    }))
}

fn run_release(args: &ReleaseArgs, store: &mut SqliteStore) -> Result<()> {
    let id = RecordId::parse(&args.id)?;
    store.release(&id)?;
    emit_json(serde_json::json!({
        "released": id,
        "status": "ok"
    }))
}

fn run_note(args: &NoteArgs, store: &mut SqliteStore) -> Result<()> {
    let id = RecordId::parse(&args.id)?;
    store.update_note(&id, args.text.as_deref())?;
    let record = store
        .find_record(&id)?
        .ok_or_else(|| anyhow!("record {id} vanished after note update"))?;
    emit_json(serde_json::json!({ "record": record }))
}

fn run_clear(store: &mut SqliteStore) -> Result<()> {
    let removed = store.clear_all()?;
    emit_json(serde_json::json!({ "removed": removed }))
}

fn run_export(args: &ExportArgs, store: &SqliteStore) -> Result<()> {
    let filter = args.filter.to_filter()?;
    let mut records = export(store)?;
    records.retain(|record| filter.matches(record));
    let Some(out) = args.out.as_ref() else {
        return emit_json(serde_json::json!({
            "count": records.len(),
            "records": records
        }));
    };

    if let Some(parent) = out.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create parent directory for export file {}", out.display())
        })?;
    }
    fs::write(out, export_json(&records)?)
        .with_context(|| format!("failed to write export file {}", out.display()))?;
    emit_json(serde_json::json!({
        "out_file": out,
        "count": records.len()
    }))
}

fn run_import(args: &ImportArgs, store: &mut SqliteStore) -> Result<()> {
    let payload = fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read import file {}", args.input.display()))?;
    let summary = import(store, &payload)?;
    emit_json(serde_json::json!({
        "in_file": args.input,
        "summary": summary
    }))
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Restore(args) => run_db_restore(&args, store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }));
    }

    store.init()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.init()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &mut SqliteStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions
    }))
}

fn run_config(command: ConfigCommand, settings: &FileSettings) -> Result<()> {
    match command {
        ConfigCommand::Show => emit_settings(settings, &settings.load()?),
        ConfigCommand::Set(args) => {
            let current = settings.load()?;
            let updated = Settings::checked(
                args.min.unwrap_or(i64::from(current.min)),
                args.max.unwrap_or(i64::from(current.max)),
                args.count.unwrap_or_else(|| i64::try_from(current.count).unwrap_or(1)),
            )?;
            settings.save(&updated)?;
            emit_settings(settings, &updated)
        }
        ConfigCommand::Reset => {
            settings.reset()?;
            emit_settings(settings, &Settings::default())
        }
    }
}

fn emit_settings(store: &FileSettings, settings: &Settings) -> Result<()> {
    emit_json(serde_json::json!({
        "config_path": store.path(),
        "settings": settings
    }))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

impl SortArg {
    fn into_sort_field(self) -> SortField {
        match self {
            Self::Port => SortField::Port,
            Self::UsedAt => SortField::UsedAt,
        }
    }
}

impl DirectionArg {
    fn into_direction(self) -> SortDirection {
        match self {
            Self::Asc => SortDirection::Asc,
            Self::Desc => SortDirection::Desc,
        }
    }
}
