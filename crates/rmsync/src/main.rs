use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use rmsync_core::config::{SyncConfig, load_config};
use rmsync_core::ingest::{Ingestor, RefreshOutcome, RefreshReport};
use rmsync_core::migrate::{pending_migration_count, run_migrations};
use rmsync_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, ensure_runtime_ready_for_sync,
    init_layout, inspect_runtime, normalize_for_display, resolve_paths,
};
use rmsync_core::store::{CharacterRow, list_locations, load_character, open_store, store_stats};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(
    name = "rmsync",
    version,
    about = "Mirror Rick and Morty API locations and characters into a local SQLite store"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create the .rmsync layout, default config and database")]
    Init(InitArgs),
    #[command(about = "Run one synchronization pass")]
    Refresh,
    #[command(about = "Refresh on a fixed interval until interrupted")]
    Watch(WatchArgs),
    #[command(about = "List stored locations with their residents")]
    Locations(LocationsArgs),
    #[command(about = "Show one stored character")]
    Character(CharacterArgs),
    Db(DbArgs),
    Status,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config.toml")]
    force: bool,
}

#[derive(Debug, Args)]
struct WatchArgs {
    #[arg(long, value_name = "SECS", help = "Seconds between refreshes")]
    interval_secs: Option<u64>,
    #[arg(long, value_name = "SECS", help = "Seconds between the startup refresh and the first scheduled one")]
    initial_delay_secs: Option<u64>,
    #[arg(long, help = "Run the startup refresh only and exit")]
    once: bool,
}

#[derive(Debug, Args)]
struct LocationsArgs {
    #[arg(long, help = "Print JSON instead of text")]
    json: bool,
}

#[derive(Debug, Args)]
struct CharacterArgs {
    id: i64,
    #[arg(long, help = "Fetch the character upstream and store it first")]
    fetch: bool,
    #[arg(long, help = "Print JSON instead of text")]
    json: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Migrate,
    Stats,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Refresh) => run_refresh(&runtime),
        Some(Commands::Watch(args)) => run_watch(&runtime, args),
        Some(Commands::Locations(args)) => run_locations(&runtime, args),
        Some(Commands::Character(args)) => run_character(&runtime, args),
        Some(Commands::Db(DbArgs {
            command: DbSubcommand::Migrate,
        })) => run_db_migrate(&runtime),
        Some(Commands::Db(DbArgs {
            command: DbSubcommand::Stats,
        })) => run_db_stats(&runtime),
        Some(Commands::Status) => run_status(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rmsync=info,rmsync_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, &InitOptions { force: args.force })?;
    let migrations = run_migrations(&paths)?;

    println!("Initialized rmsync runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("data_dir: {}", normalize_for_display(&paths.data_dir));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("migrations_applied: {}", migrations.applied.len());
    println!("schema_version: {}", migrations.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_refresh(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config) = load_sync_runtime(runtime)?;
    let ingestor = Ingestor::from_config(&paths, &config)?;

    match ingestor.refresh()? {
        RefreshOutcome::Completed(report) => {
            println!("refresh");
            print_refresh_report(&report);
        }
        RefreshOutcome::AlreadyRunning => println!("refresh: already running; skipped"),
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_watch(runtime: &RuntimeOptions, args: WatchArgs) -> Result<()> {
    let (paths, config) = load_sync_runtime(runtime)?;
    if !config.ingestion_enabled() {
        println!("ingestion is disabled (ingestion.enabled = false); nothing to schedule");
        return Ok(());
    }

    let initial_delay_secs = args
        .initial_delay_secs
        .unwrap_or_else(|| config.initial_delay_secs());
    let interval_secs = args
        .interval_secs
        .unwrap_or_else(|| config.refresh_interval_secs())
        .max(1);
    let ingestor = Ingestor::from_config(&paths, &config)?;

    info!(initial_delay_secs, interval_secs, once = args.once, "watch started");
    let delays = watch_delays(
        Duration::from_secs(initial_delay_secs),
        Duration::from_secs(interval_secs),
    );
    for delay in delays {
        thread::sleep(delay);
        match ingestor.refresh() {
            Ok(RefreshOutcome::Completed(report)) => {
                println!("refresh");
                print_refresh_report(&report);
            }
            Ok(RefreshOutcome::AlreadyRunning) => {}
            Err(err) if args.once => return Err(err),
            // Logged by the ingestor; the next tick retries.
            Err(_) => {}
        }
        if args.once {
            break;
        }
    }
    Ok(())
}

/// Sleep before each watch refresh: none for the startup refresh, then the
/// initial delay, then the interval between every later run.
fn watch_delays(initial_delay: Duration, interval: Duration) -> impl Iterator<Item = Duration> {
    [Duration::ZERO, initial_delay]
        .into_iter()
        .chain(std::iter::repeat(interval))
}

fn run_locations(runtime: &RuntimeOptions, args: LocationsArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let connection = open_store(&paths.db_path)?;
    let locations = list_locations(&connection)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&locations)?);
        return Ok(());
    }

    println!("locations.count: {}", locations.len());
    for location in &locations {
        println!(
            "location: {} {} [{}] ({})",
            location.id,
            location.name.as_deref().unwrap_or("<unnamed>"),
            location.location_type.as_deref().unwrap_or("-"),
            location.dimension.as_deref().unwrap_or("-"),
        );
        for resident in &location.residents {
            println!(
                "  resident: {} {} ({}, {})",
                resident.id,
                resident.name.as_deref().unwrap_or("<unnamed>"),
                resident.status.as_deref().unwrap_or("-"),
                resident.species.as_deref().unwrap_or("-"),
            );
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_character(runtime: &RuntimeOptions, args: CharacterArgs) -> Result<()> {
    let character = if args.fetch {
        let (paths, config) = load_sync_runtime(runtime)?;
        let ingestor = Ingestor::from_config(&paths, &config)?;
        Some(ingestor.fetch_character(args.id)?)
    } else {
        let paths = resolve_runtime_paths(runtime)?;
        let connection = open_store(&paths.db_path)?;
        load_character(&connection, args.id)?
    };

    let Some(character) = character else {
        bail!(
            "character {} is not stored locally (run `rmsync refresh` or pass --fetch)",
            args.id
        );
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&character)?);
    } else {
        print_character(&character);
    }
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = run_migrations(&paths)?;
    println!("db migrate");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    if report.applied.is_empty() {
        println!("applied: <none>");
    }
    for migration in &report.applied {
        println!("applied: v{:03}_{}", migration.version, migration.name);
    }
    println!("schema_version: {}", report.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    if !paths.db_path.exists() {
        println!("db stats");
        println!("db_path: {} (missing)", normalize_for_display(&paths.db_path));
        return Ok(());
    }
    let connection = open_store(&paths.db_path)?;
    let stats = store_stats(&connection)?;
    println!("db stats");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("locations: {}", stats.locations);
    println!("characters: {}", stats.characters);
    println!("location_residents: {}", stats.residents);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    let config = load_config(&paths.config_path)?;

    println!("runtime status");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!(
        "project_root_exists: {}",
        format_flag(status.project_root_exists)
    );
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|bytes| bytes.to_string())
            .unwrap_or_else(|| "<missing>".to_string())
    );
    println!("config_exists: {}", format_flag(status.config_exists));
    println!(
        "pending_migrations: {}",
        pending_migration_count(&paths)?
    );
    println!("api_base: {}", config.api_base());
    println!("ingestion_enabled: {}", format_flag(config.ingestion_enabled()));
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn print_refresh_report(report: &RefreshReport) {
    let totals = &report.totals;
    println!("pages: {}", report.pages);
    println!("locations_upserted: {}", totals.locations_upserted);
    println!("locations_skipped: {}", totals.locations_skipped);
    println!("malformed_records: {}", totals.malformed_records);
    println!("malformed_references: {}", totals.malformed_references);
    println!("characters_upserted: {}", totals.characters_upserted);
    println!("residents_cleared: {}", totals.residents_cleared);
    println!("residents_linked: {}", totals.residents_linked);
    println!("batch_requests: {}", totals.batches_fetched);
    println!("request_count: {}", report.request_count);
    println!("elapsed_ms: {}", report.elapsed_ms);
}

fn print_character(character: &CharacterRow) {
    println!("id: {}", character.id);
    println!("name: {}", character.name.as_deref().unwrap_or("<unnamed>"));
    println!("status: {}", character.status.as_deref().unwrap_or("-"));
    println!("species: {}", character.species.as_deref().unwrap_or("-"));
    println!("gender: {}", character.gender.as_deref().unwrap_or("-"));
    println!("origin: {}", character.origin);
    println!("location: {}", character.location);
    println!("image: {}", character.image.as_deref().unwrap_or("-"));
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

/// Paths plus config for commands that talk to upstream; requires `rmsync init`.
fn load_sync_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, SyncConfig)> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready_for_sync(&paths, &status)?;
    let config = load_config(&paths.config_path)?;
    Ok((paths, config))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
