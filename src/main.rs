use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use atelier::config::PipelineConfig;
use atelier::generation::db::{DbHandle, GenerationDb};
use atelier::generation::models::TriggerEvent;
use atelier::generation::quota::{Plan, QuotaLedger, SqliteQuotaLedger};
use atelier::generation::server::{ServerConfig, build_state, start_server};

#[derive(Parser)]
#[command(name = "atelier")]
#[command(version, about = "AI code-generation service")]
pub struct Cli {
    /// Path to an atelier.toml overriding pipeline defaults
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to serve on
        #[arg(short, long, default_value = "8420")]
        port: u16,

        /// Database path
        #[arg(long, default_value = ".atelier/atelier.db")]
        db_path: PathBuf,

        /// Enable dev mode (CORS permissive, bind on all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// Deliver a trigger for one job and wait for it to finish.
    /// Safe to re-run for stuck or already-terminal jobs.
    Run {
        job_id: i64,

        /// Database path
        #[arg(long, default_value = ".atelier/atelier.db")]
        db_path: PathBuf,
    },
    /// Show remaining quota for a principal
    Quota {
        principal: String,

        /// Billing plan (free or pro)
        #[arg(long, default_value = "free")]
        plan: String,

        /// Database path
        #[arg(long, default_value = ".atelier/atelier.db")]
        db_path: PathBuf,
    },
}

fn load_pipeline_config(path: Option<&PathBuf>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path),
        None => Ok(PipelineConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("atelier=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let pipeline = load_pipeline_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Serve { port, db_path, dev } => {
            start_server(ServerConfig {
                port,
                db_path,
                pipeline,
                dev_mode: dev,
            })
            .await?;
        }
        Commands::Run { job_id, db_path } => {
            let db = GenerationDb::new(&db_path).context("Failed to open database")?;
            let state = build_state(DbHandle::new(db), &pipeline);

            let (job, request) = state
                .db
                .call(move |db| db.get_job_context(job_id))
                .await?
                .with_context(|| format!("Job {} not found", job_id))?;

            let event = TriggerEvent {
                job_id: job.id,
                request_id: request.id,
                principal_id: request.principal_id,
            };
            let job = state.pipeline.run(event).await?;
            println!("job {} finished: {}", job.id, job.status);
        }
        Commands::Quota {
            principal,
            plan,
            db_path,
        } => {
            let plan: Plan = plan.parse()?;
            let db = GenerationDb::new(&db_path).context("Failed to open database")?;
            let ledger = SqliteQuotaLedger::new(DbHandle::new(db));
            let decision = ledger.peek(&principal, plan).await?;
            println!(
                "{} ({}): {} point(s) remaining this window",
                principal, plan, decision.remaining
            );
        }
    }

    Ok(())
}
