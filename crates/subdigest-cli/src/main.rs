use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use subdigest_core::RunStatus;
use subdigest_storage::PgDedupStore;
use subdigest_sync::{DedupBackend, PipelineConfig};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "subdigest")]
#[command(about = "Summarize new forum threads into date-partitioned Parquet")]
struct Cli {
    /// YAML settings file; environment variables override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Perform one ingestion run and print its report as JSON.
    Run {
        /// Keep dedup markers in process memory instead of Postgres.
        #[arg(long)]
        memory_dedup: bool,
    },
    /// Resolve and validate settings without touching the network.
    CheckConfig,
    /// Apply the dedup-store schema migrations.
    Migrate,
}

fn load_config(path: Option<&PathBuf>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::from_yaml_file(path),
        None => PipelineConfig::from_env(),
    };
    config.context("loading configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run {
        memory_dedup: false,
    }) {
        Commands::Run { memory_dedup } => {
            let mut config = load_config(cli.config.as_ref())?;
            if memory_dedup {
                config.dedup = DedupBackend::Memory;
            }
            let report = subdigest_sync::run_once(&config).await?;
            if report.status() == RunStatus::Partial {
                warn!(
                    run_id = %report.run_id,
                    failures = report.failures.len(),
                    "run completed with item failures"
                );
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::CheckConfig => {
            let config = load_config(cli.config.as_ref())?;
            let dedup = match &config.dedup {
                DedupBackend::Postgres { .. } => "postgres",
                DedupBackend::Memory => "memory",
            };
            println!(
                "config ok: subreddit={} post_limit={} check_limit={} threshold={} model={} dedup={} store={}/{}",
                config.subreddit_name,
                config.post_limit,
                config.new_post_check_limit,
                config.reprocess_comment_threshold,
                config.model_id,
                dedup,
                config.object_store_root.display(),
                config.object_key_prefix,
            );
        }
        Commands::Migrate => {
            let config = load_config(cli.config.as_ref())?;
            let DedupBackend::Postgres { database_url } = &config.dedup else {
                bail!("migrate needs DEDUP_BACKEND=postgres and a DATABASE_URL");
            };
            let store = PgDedupStore::connect(database_url)
                .await
                .context("connecting to dedup database")?;
            store.migrate().await.context("running migrations")?;
            info!("dedup store migrations applied");
        }
    }

    Ok(())
}
