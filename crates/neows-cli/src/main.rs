use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use neows_sync::{bootstrap_schema, build_scheduler, NeowsConfig, NeowsPipeline};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "neows-cli")]
#[command(about = "NASA NeoWs feed ETL: fetch, archive, transform and load into Postgres")]
struct Cli {
    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once (default).
    Run {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Create tables and indexes, then exit.
    Migrate,
    /// Transform a saved feed document offline and report what would be loaded.
    Transform {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Run on the configured cron schedule until interrupted.
    Schedule,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = NeowsConfig::from_env();

    match cli.command.unwrap_or(Commands::Run { json: false }) {
        Commands::Run { json } => {
            let pipeline = NeowsPipeline::new(&config).await?;
            let summary = pipeline.run_once().await.context("pipeline run failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "run complete: run_id={} status={:?} objects={} approaches={} skipped={} archived={}",
                    summary.run_id,
                    summary.load.status,
                    summary.load.persisted.objects_upserted,
                    summary.load.persisted.approaches_inserted,
                    summary.load.persisted.approaches_skipped,
                    summary.archived_to.as_deref().unwrap_or("-"),
                );
            }
        }
        Commands::Migrate => {
            bootstrap_schema(&config.database)
                .await
                .context("bootstrapping schema")?;
            println!("migrate complete: schema={}", config.database.schema.as_deref().unwrap_or("public"));
        }
        Commands::Transform { file, json } => {
            let document = neows_transform::load_feed_document(&file)?;
            let extracted = neows_transform::transform_document(document.as_ref())
                .with_context(|| format!("transforming {}", file.display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&extracted)?);
            } else {
                println!(
                    "transform complete: objects={} close_approaches={}",
                    extracted.objects.len(),
                    extracted.close_approaches.len()
                );
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(NeowsPipeline::new(&config).await?);
            let mut sched = build_scheduler(pipeline, &config.schedule_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.schedule_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}
