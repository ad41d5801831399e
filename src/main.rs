// ABOUTME: CLI entry point for staging-sync
// ABOUTME: Resolves the environment chain, connects each database and runs the sync

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use staging_sync::config::{resolve_chain, Environment, SyncConfig, MIGRATION_FROM_VAR};
use staging_sync::postgres::{self, PostgresDatabase};
use staging_sync::{
    AccessError, DatabaseAccess, SourceConsistency, SyncError, SyncOrchestrator, UpsertStrategy,
};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "staging-sync")]
#[command(about = "Refresh staging and local databases from upstream with anonymized data", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct TuningArgs {
    /// Path to a sync config TOML file
    #[arg(long = "config", env = "SYNC_CONFIG")]
    config_path: Option<PathBuf>,
    /// Rows per chunk
    #[arg(long)]
    chunk_size: Option<u64>,
    /// Concurrent chunk workers per table (1 = sequential)
    #[arg(long)]
    workers: Option<usize>,
    /// Table to leave untouched (repeatable)
    #[arg(long = "skip-table")]
    skip_tables: Vec<String>,
    /// Schema to sync
    #[arg(long)]
    schema: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize every table along the environment chain
    Sync {
        /// Environments in order, e.g. production,staging,local (falls back to MIGRATION_FROM)
        #[arg(long, value_delimiter = ',', value_enum)]
        chain: Vec<Environment>,
        #[command(flatten)]
        tuning: TuningArgs,
        /// How existing destination rows are overwritten
        #[arg(long, value_enum)]
        strategy: Option<UpsertStrategy>,
        /// Whether the source takes writes during the run
        #[arg(long, value_enum)]
        source_consistency: Option<SourceConsistency>,
        /// Disable progress bars
        #[arg(long)]
        no_progress: bool,
    },
    /// Show the tables, row counts and chunks a sync out of one environment would process
    Plan {
        /// Source environment (falls back to MIGRATION_FROM)
        #[arg(long, value_enum)]
        from: Option<Environment>,
        #[command(flatten)]
        tuning: TuningArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before parsing so env-backed settings see it
    let dotenv = dotenvy::dotenv();

    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used otherwise
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    if let Ok(path) = dotenv {
        tracing::debug!("Loaded environment from {}", path.display());
    }

    postgres::init_tls_policy(cli.allow_self_signed_certs);

    match cli.command {
        Commands::Sync {
            chain,
            tuning,
            strategy,
            source_consistency,
            no_progress,
        } => {
            let mut config = load_config(&tuning)?;
            if let Some(strategy) = strategy {
                config.strategy = strategy;
            }
            if let Some(consistency) = source_consistency {
                config.source_consistency = consistency;
            }
            config.validate()?;

            let migration_from = std::env::var(MIGRATION_FROM_VAR).ok();
            let chain = resolve_chain(&chain, migration_from.as_deref())?;
            let show_progress = !no_progress && std::io::stderr().is_terminal();
            run_sync(&config, &chain, show_progress).await
        }
        Commands::Plan { from, tuning } => {
            let config = load_config(&tuning)?;
            config.validate()?;

            let from = match from {
                Some(env) => env,
                None => std::env::var(MIGRATION_FROM_VAR)
                    .with_context(|| {
                        format!("No source environment given; pass --from or set {}", MIGRATION_FROM_VAR)
                    })?
                    .parse()?,
            };
            run_plan(&config, from).await
        }
    }
}

/// Read the config file (if any) and layer CLI overrides on top.
fn load_config(tuning: &TuningArgs) -> anyhow::Result<SyncConfig> {
    let mut config = match &tuning.config_path {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };

    if let Some(chunk_size) = tuning.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(workers) = tuning.workers {
        config.workers = workers;
    }
    if let Some(schema) = &tuning.schema {
        config.schema = schema.clone();
    }
    for table in &tuning.skip_tables {
        if !config.skip_tables.contains(table) {
            config.skip_tables.push(table.clone());
        }
    }

    Ok(config)
}

async fn connect(
    env: Environment,
    url: &str,
    config: &SyncConfig,
) -> anyhow::Result<Arc<dyn DatabaseAccess>> {
    // One connection per chunk worker plus one for reconciliation and bookkeeping
    let db = PostgresDatabase::connect(env.as_str(), url, &config.schema, config.workers + 1).await?;
    Ok(Arc::new(db))
}

async fn run_sync(
    config: &SyncConfig,
    chain: &[Environment],
    show_progress: bool,
) -> anyhow::Result<()> {
    let names: Vec<&str> = chain.iter().map(|e| e.as_str()).collect();
    tracing::info!("Sync chain: {}", names.join(" → "));
    tracing::info!(
        "Chunk size {}, {} worker(s), strategy {:?}, {} skipped table(s)",
        config.chunk_size,
        config.workers,
        config.strategy,
        config.skip_tables.len()
    );

    // Resolve every URL up front so a missing variable fails before any hop runs
    let urls = chain
        .iter()
        .map(|env| env.database_url().map(|url| (*env, url)))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let orchestrator = SyncOrchestrator::new(
        config.to_options(show_progress),
        &config.skip_tables,
        config.policy(),
    );
    // Databases are opened as the chain reaches them
    let report = orchestrator
        .sync_chain_with(urls.len(), |position| {
            let (env, url) = urls[position].clone();
            async move {
                connect(env, &url, config)
                    .await
                    .map_err(|e| SyncError::Connection {
                        database: env.as_str().to_string(),
                        source: AccessError::Connection(e),
                    })
            }
        })
        .await?;
    report.print();

    if !report.is_success() {
        bail!("Sync finished with failures");
    }
    Ok(())
}

async fn run_plan(config: &SyncConfig, from: Environment) -> anyhow::Result<()> {
    let url = from.database_url()?;
    let source = connect(from, &url, config).await?;
    let orchestrator = SyncOrchestrator::new(
        config.to_options(false),
        &config.skip_tables,
        config.policy(),
    );
    let jobs = orchestrator.plan(source.as_ref()).await?;

    println!();
    println!("Sync Plan ({}, chunk size {})", from, config.chunk_size);
    println!("{}", "═".repeat(61));
    for job in &jobs {
        match job.row_count {
            Some(rows) if !job.skipped => println!(
                "  ✓ {}: {} rows, {} chunk(s)",
                job.table,
                rows,
                job.planned_chunks(config.chunk_size)
            ),
            _ => println!("  - {} (skipped)", job.table),
        }
    }
    println!("{}", "═".repeat(61));
    println!(
        "{} table(s), {} skipped",
        jobs.len(),
        jobs.iter().filter(|j| j.skipped).count()
    );
    println!();
    Ok(())
}
